//! Taproot: a structured concurrency runtime.
//!
//! Taproot executes cooperative computations ([`Op`]) arranged in a tree
//! of scopes. Structure is the guarantee: a child never outlives the
//! frame that spawned it, cancellation is delivered at suspension
//! boundaries and always runs cleanups, resources are released in
//! reverse acquisition order, and a sibling's failure halts the rest of
//! its scope before the error surfaces.
//!
//! # Core guarantees
//!
//! - **Lifetime containment**: every spawned frame is owned by a scope;
//!   a scope closes only after all of its frames have fully torn down.
//! - **Deterministic teardown**: children halt serially in reverse
//!   admission order; cleanups run LIFO; outcomes publish only after
//!   teardown completes.
//! - **Halt is not an error**: cancellation is a first-class terminal
//!   state, delivered cooperatively, never a silent drop.
//! - **Single-threaded**: one frame steps at a time; host callbacks feed
//!   the runtime through a mailbox and never re-enter frame code.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use taproot::{sleep, spawn, Runtime};
//!
//! let mut rt = Runtime::lab();
//! let task = rt.run(
//!     spawn(sleep(Duration::from_millis(10)).map(|()| 2u32))
//!         .then(|child| child.join())
//!         .map(|outcome| outcome.unwrap()),
//! );
//! rt.run_until_settled(&task).unwrap();
//! assert_eq!(task.take_outcome().unwrap().unwrap(), 2);
//! ```
//!
//! # Module structure
//!
//! - [`op`]: the operation type and base primitives (`wait`, `ensure`,
//!   `suspend`, scope-local keys)
//! - [`task`]: task and frame handles, `spawn`, detached scopes
//! - [`runtime`]: the runtime, its builder, and drive methods
//! - [`combinator`]: `race`
//! - [`time`]: `sleep`
//! - [`channel`]: channels, signals, subscriptions, `for_each`
//! - [`resource`]: `resource`/`provide`
//! - [`abort`]: scope-bound abort signals
//! - [`types`], [`error`]: identifiers, outcomes, and errors

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod abort;
pub mod channel;
pub mod combinator;
pub mod error;
mod interrupt;
pub mod op;
pub(crate) mod record;
pub mod resource;
pub mod runtime;
pub mod task;
pub mod time;
pub mod types;
pub(crate) mod util;

pub use abort::{use_abort_signal, AbortController, AbortListenerKey, AbortSignal};
pub use channel::{for_each, Channel, Next, Signal, Stream, Subscription};
pub use combinator::race;
pub use error::{Error, ErrorKind, Result};
pub use op::{call, ensure, ensure_with, suspend, wait, AbortHook, Op, Resumer, ScopeKey};
pub use resource::{provide, resource};
pub use runtime::{Runtime, RuntimeBuilder};
pub use task::{spawn, FrameHandle, ScopeDestroyer, ScopeHandle, Task};
pub use time::sleep;
pub use types::{FrameId, Outcome, ScopeId, Time};

use std::process::ExitCode;
use std::time::Duration;

/// Runs `op` to completion on a fresh monotonic-clock runtime.
pub fn run<T: 'static>(op: Op<T>) -> Outcome<T> {
    let mut rt = Runtime::new();
    rt.block_on(op)
}

/// Runs `op` as a program entry point.
///
/// Like [`run`], but SIGINT and SIGTERM halt the task (cleanups run,
/// children drain) instead of killing the process. An errored outcome is
/// reported on stderr with its suppressed errors and exits non-zero; a
/// halt caused by an interrupt exits with the conventional status 130.
pub fn main<T: 'static>(op: Op<T>) -> ExitCode {
    const INTERRUPT_POLL: Duration = Duration::from_millis(50);

    interrupt::install();
    let mut rt = Runtime::new();
    let task = rt.run(op);
    let mut halt_sent = false;

    loop {
        if interrupt::interrupted() && !halt_sent {
            halt_sent = true;
            task.halt();
        }
        if let Err(error) = rt.run_until_idle() {
            report_error(&error);
            return ExitCode::FAILURE;
        }
        if task.is_settled() {
            break;
        }
        // Sleep toward the next deadline, waking often enough to observe
        // an interrupt. With no timers pending, keep waiting: the task
        // may be parked on external events or the interrupt itself.
        let wait = match rt.next_deadline() {
            Some(deadline) => {
                Duration::from_nanos(deadline.saturating_since(rt.now())).min(INTERRUPT_POLL)
            }
            None => INTERRUPT_POLL,
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }

    match task.take_outcome() {
        Some(Outcome::Returned(_)) => ExitCode::SUCCESS,
        Some(Outcome::Errored(error)) => {
            report_error(&error);
            ExitCode::FAILURE
        }
        Some(Outcome::Halted) => {
            if halt_sent {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        None => ExitCode::FAILURE,
    }
}

fn report_error(error: &Error) {
    tracing::error!(%error, "root task failed");
    eprintln!("error: {error}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    for suppressed in error.suppressed() {
        eprintln!("  suppressed: {suppressed}");
    }
}
