//! Operations: reified cooperative computations.
//!
//! An [`Op<T>`] is a description of a computation that eventually settles
//! with `T`, fails, or is halted. Nothing runs until a frame executes the
//! operation; the runtime interprets the instruction tree one node at a
//! time, and control leaves the frame only at suspension points.
//!
//! Operations compose with [`Op::then`], [`Op::map`] and [`Op::or_else`],
//! and the primitives here ([`wait`], [`suspend`], [`ensure`], [`call`],
//! scope-local keys) cover the rest of the surface together with
//! `spawn`/`sleep`/`race`/`resource` from their own modules.
//!
//! Internally every value crossing a node boundary is type-erased; the
//! typed `Op<T>` wrapper restores the type at each composition point, the
//! same way the task handle restores it at the runtime boundary.

use crate::error::Error;
use crate::record::scope::ScopeView;
use crate::runtime::mailbox::{Command, Mailbox, Payload};
use crate::runtime::state::WaitCx;
use crate::types::{FrameId, Outcome};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type-erased value moving through an instruction tree.
pub(crate) type BoxAny = Box<dyn Any>;

/// Type-erased terminal outcome.
pub(crate) type RawOutcome = Outcome<BoxAny>;

pub(crate) type NodeThunk = Box<dyn FnOnce() -> Node>;
pub(crate) type ThenFn = Box<dyn FnOnce(BoxAny) -> Node>;
pub(crate) type RescueFn = Box<dyn FnOnce(Error) -> Node>;
pub(crate) type ScopeFn = Box<dyn FnOnce(&mut ScopeView<'_>) -> Result<BoxAny, Error>>;
pub(crate) type Registrar = Box<dyn FnOnce(&mut WaitCx<'_>) -> AbortAction>;

/// What to do if a parked wait is abandoned by a halt.
pub(crate) enum AbortAction {
    /// Nothing to undo.
    Forget,
    /// Cancel a pending timer entry.
    CancelTimer(u64),
    /// Run a user-supplied unregistration thunk.
    Invoke(Box<dyn FnOnce()>),
}

/// One instruction in a computation tree.
pub(crate) enum Node {
    /// Immediate value.
    Value(BoxAny),
    /// Immediate failure.
    Fail(Error),
    /// Deferred construction; evaluated when the frame reaches it.
    Lazy(NodeThunk),
    /// Sequencing: run `first`, feed its value to `then`.
    Then { first: Box<Node>, then: ThenFn },
    /// Error recovery: run `first`, feed its error to `rescue`.
    Rescue { first: Box<Node>, rescue: RescueFn },
    /// Park until an external resume, with an abort action for halts.
    Wait(Registrar),
    /// Admit a child frame into the current scope; resumes with its id.
    Spawn(Box<Node>),
    /// Start a resource body as a child frame and park until it provides.
    Acquire(Box<Node>),
    /// Resource-body side of `Acquire`: hand a value to the caller and
    /// park until the owning scope tears down.
    Provide(BoxAny),
    /// Push a cleanup onto the frame's cleanup stack.
    Ensure(NodeThunk),
    /// Synchronous access to the current scope (locals, teardown hooks).
    Scoped(ScopeFn),
    /// Park until the first of the listed frames settles; resumes with
    /// the settled frame's id.
    WatchSettle(Vec<FrameId>),
    /// Take the stored outcome of a settled frame.
    Claim(FrameId),
    /// Request halt of a frame and park until it settles.
    HaltFrame(FrameId),
}

/// A pending continuation on a frame's continuation stack.
pub(crate) enum Cont {
    Then(ThenFn),
    Rescue(RescueFn),
}

/// Unboxes a type-erased value produced by an operation this wrapper
/// itself erased. A mismatch here is a runtime bug, not a user error.
pub(crate) fn unbox<T: 'static>(any: BoxAny) -> T {
    *any.downcast::<T>()
        .expect("type-erased operation value did not match its Op<T> wrapper")
}

/// A cooperative computation that settles with `T`.
///
/// `Op` values are inert descriptions: building one performs no work and
/// registers nothing. They are consumed by a frame exactly once.
#[must_use = "operations do nothing until a frame runs them"]
pub struct Op<T> {
    pub(crate) node: Node,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> Op<T> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _result: PhantomData,
        }
    }

    /// An operation that immediately settles with `value`.
    pub fn value(value: T) -> Self {
        Self::from_node(Node::Value(Box::new(value)))
    }

    /// An operation that immediately fails with `error`.
    pub fn fail(error: Error) -> Self {
        Self::from_node(Node::Fail(error))
    }

    /// Sequences `f` after this operation.
    ///
    /// Errors and halts skip `f` and propagate.
    pub fn then<U, F>(self, f: F) -> Op<U>
    where
        U: 'static,
        F: FnOnce(T) -> Op<U> + 'static,
    {
        Op::from_node(Node::Then {
            first: Box::new(self.node),
            then: Box::new(move |any| f(unbox::<T>(any)).node),
        })
    }

    /// Maps the settled value.
    pub fn map<U, F>(self, f: F) -> Op<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |value| Op::value(f(value)))
    }

    /// Recovers from an error with `f`. Values and halts pass through.
    pub fn or_else<F>(self, f: F) -> Op<T>
    where
        F: FnOnce(Error) -> Op<T> + 'static,
    {
        Op::from_node(Node::Rescue {
            first: Box::new(self.node),
            rescue: Box::new(move |error| f(error).node),
        })
    }
}

/// Defers construction of an operation until a frame reaches it.
///
/// Useful for recursion and for capturing state lazily; this is the
/// operation form of calling a function.
pub fn call<T, F>(f: F) -> Op<T>
where
    T: 'static,
    F: FnOnce() -> Op<T> + 'static,
{
    Op::from_node(Node::Lazy(Box::new(move || f().node)))
}

/// What a [`wait`] registration wants done if the wait is abandoned.
pub struct AbortHook(Option<Box<dyn FnOnce()>>);

impl AbortHook {
    /// Nothing to undo on abort.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Run `f` if the wait is abandoned by a halt.
    #[must_use]
    pub fn call(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn into_action(self) -> AbortAction {
        match self.0 {
            Some(f) => AbortAction::Invoke(f),
            None => AbortAction::Forget,
        }
    }
}

/// Handle used by external event sources to resume a parked frame.
///
/// Resuming is idempotent: only the first `resume`/`fail` delivered for a
/// given suspension has any effect, and a resume arriving after the frame
/// was halted or moved on is dropped. The handle only enqueues onto the
/// runtime mailbox; it never re-enters frame code, so it is safe to call
/// from inside host callbacks.
pub struct Resumer<T> {
    mailbox: Mailbox,
    frame: FrameId,
    epoch: u64,
    _marker: PhantomData<fn(T)>,
}

impl<T: 'static> Resumer<T> {
    pub(crate) fn new(mailbox: Mailbox, frame: FrameId, epoch: u64) -> Self {
        Self {
            mailbox,
            frame,
            epoch,
            _marker: PhantomData,
        }
    }

    /// Resumes the waiting frame with a value.
    pub fn resume(&self, value: T) {
        self.mailbox.push(Command::Resume {
            frame: self.frame,
            epoch: self.epoch,
            payload: Payload::Value(Box::new(value)),
        });
    }

    /// Resumes the waiting frame with an error.
    pub fn fail(&self, error: Error) {
        self.mailbox.push(Command::Resume {
            frame: self.frame,
            epoch: self.epoch,
            payload: Payload::Failure(error),
        });
    }
}

impl<T> Clone for Resumer<T> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            frame: self.frame,
            epoch: self.epoch,
            _marker: PhantomData,
        }
    }
}

/// Parks the current frame until an external source resumes it.
///
/// `register` runs at the suspension point with a [`Resumer`] bound to
/// this exact suspension; it returns an [`AbortHook`] that runs if the
/// frame is halted before being resumed. Exactly one of resume and abort
/// takes effect.
pub fn wait<T, F>(register: F) -> Op<T>
where
    T: 'static,
    F: FnOnce(Resumer<T>) -> AbortHook + 'static,
{
    Op::from_node(Node::Wait(Box::new(move |cx: &mut WaitCx<'_>| {
        register(cx.resumer()).into_action()
    })))
}

/// Parks the current frame until it is halted.
pub fn suspend<T: 'static>() -> Op<T> {
    wait(|_resumer| AbortHook::none())
}

/// Registers a cleanup thunk on the current frame.
///
/// Cleanups run in reverse registration order once the frame reaches a
/// terminal outcome, before that outcome becomes observable.
pub fn ensure(f: impl FnOnce() + 'static) -> Op<()> {
    ensure_with(move || {
        f();
        Op::value(())
    })
}

/// Registers a cleanup that is itself an operation (it may suspend).
pub fn ensure_with<F>(f: F) -> Op<()>
where
    F: FnOnce() -> Op<()> + 'static,
{
    Op::from_node(Node::Ensure(Box::new(move || f().node)))
}

/// Scope-local key reserved for the scope's abort signal.
pub(crate) const ABORT_SIGNAL_KEY: u64 = 0;

static NEXT_SCOPE_KEY: AtomicU64 = AtomicU64::new(1);

/// A typed key for scope-local state.
///
/// `set` binds a value in the current scope; `get` walks the scope chain
/// upward until a binding is found, so bindings are visible to all
/// descendant frames and shadowable by nearer scopes.
pub struct ScopeKey<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ScopeKey<T> {}

impl<T: Clone + 'static> ScopeKey<T> {
    /// Allocates a fresh key. Two keys never collide, regardless of name;
    /// the name appears in diagnostics only.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_SCOPE_KEY.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    /// Reads the nearest binding for this key, if any.
    pub fn get(&self) -> Op<Option<T>> {
        let id = self.id;
        Op::from_node(Node::Scoped(Box::new(move |view| {
            let found = view
                .lookup(id)
                .and_then(|any| any.downcast_ref::<T>())
                .cloned();
            Ok(Box::new(found) as BoxAny)
        })))
    }

    /// Reads the nearest binding, failing if the key is unbound.
    pub fn require(&self) -> Op<T> {
        let name = self.name;
        self.get().then(move |found| match found {
            Some(value) => Op::value(value),
            None => Op::fail(Error::protocol(format!("scope key `{name}` is unbound"))),
        })
    }

    /// Binds `value` in the current scope.
    pub fn set(&self, value: T) -> Op<()> {
        let id = self.id;
        Op::from_node(Node::Scoped(Box::new(move |view| {
            view.bind(id, Box::new(value));
            Ok(Box::new(()) as BoxAny)
        })))
    }
}

impl<T> std::fmt::Debug for ScopeKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScopeKey({}#{})", self.name, self.id)
    }
}

// Raw building blocks for the handle/combinator layers.

pub(crate) fn spawn_node(node: Node) -> Op<FrameId> {
    Op::from_node(Node::Spawn(Box::new(node)))
}

pub(crate) fn watch_settle(targets: Vec<FrameId>) -> Op<FrameId> {
    Op::from_node(Node::WatchSettle(targets))
}

pub(crate) fn claim_outcome(target: FrameId) -> Op<RawOutcome> {
    Op::from_node(Node::Claim(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_keys_are_distinct_even_with_equal_names() {
        let a: ScopeKey<u32> = ScopeKey::new("shared");
        let b: ScopeKey<u32> = ScopeKey::new("shared");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn scope_keys_never_use_the_reserved_slot() {
        let key: ScopeKey<u32> = ScopeKey::new("k");
        assert_ne!(key.id, ABORT_SIGNAL_KEY);
    }

    #[test]
    fn unbox_round_trips() {
        let boxed: BoxAny = Box::new(17u8);
        assert_eq!(unbox::<u8>(boxed), 17);
    }
}
