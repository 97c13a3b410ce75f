//! Resources: setup and teardown co-located in one definition.
//!
//! A resource body is an operation that acquires something, registers
//! its release with [`ensure`](crate::op::ensure), and hands the value
//! to its caller with [`provide`]. The body keeps running — parked at
//! the provide point — until the caller's scope begins teardown, at
//! which point it is halted and its cleanups run. Release therefore
//! happens at the caller's lifetime boundary, not the definition's.
//!
//! ```ignore
//! fn use_socket(addr: Addr) -> Op<Socket> {
//!     resource(call(move || {
//!         let socket = Socket::connect(addr);
//!         let handle = socket.clone();
//!         ensure(move || handle.close()).then(move |()| provide(socket))
//!     }))
//! }
//! ```

use crate::op::{BoxAny, Node, Op};

/// Acquires the resource described by `body`.
///
/// The body runs as a child frame of the caller's scope; the caller
/// parks until the body provides a value. A body that settles without
/// providing fails the acquisition instead of hanging it.
///
/// The provided value must have the type the caller acquires; a
/// mismatch between `resource::<T>` and the body's `provide` is a bug in
/// the calling code and panics when the value crosses back.
pub fn resource<T: 'static>(body: Op<()>) -> Op<T> {
    Op::from_node(Node::Acquire(Box::new(body.node)))
}

/// Hands `value` to the acquiring caller and parks until the owning
/// scope tears down.
///
/// Legal only inside a resource body; anywhere else it fails with a
/// protocol error.
pub fn provide<T: 'static>(value: T) -> Op<()> {
    Op::from_node(Node::Provide(Box::new(value) as BoxAny))
}
