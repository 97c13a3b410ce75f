//! Task handles: the external face of frames.
//!
//! A [`Task`] wraps a root frame submitted through the runtime. It is
//! the only place where the engine's type-erased outcomes become typed
//! again: the task installs a sink that downcasts at publication.
//!
//! Inside the tree, [`spawn`] admits a child computation into the
//! current frame's scope and yields a [`FrameHandle`] whose `join` and
//! `halt` are themselves operations.

use crate::error::{Error, ErrorKind, Result};
use crate::op::{claim_outcome, spawn_node, unbox, watch_settle, Node, Op, RawOutcome};
use crate::record::scope::ScopeDone;
use crate::runtime::mailbox::{Command, Mailbox};
use crate::runtime::state::RuntimeState;
use crate::runtime::Runtime;
use crate::types::{FrameId, Outcome, ScopeId};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

/// External handle to a root frame.
///
/// Settlement means the frame's entire tree is closed: cleanups drained,
/// children halted, outcome published. `halt` only enqueues the request;
/// the runtime must be driven for it to take effect.
pub struct Task<T> {
    frame: FrameId,
    mailbox: Mailbox,
    cell: Rc<RefCell<Option<Outcome<T>>>>,
}

impl<T: 'static> Task<T> {
    pub(crate) fn create(state: &mut RuntimeState, scope: ScopeId, op: Op<T>) -> Result<Self> {
        let frame = state.create_frame(scope, op.node)?;
        let cell: Rc<RefCell<Option<Outcome<T>>>> = Rc::new(RefCell::new(None));
        let sink_cell = cell.clone();
        if let Some(rec) = state.frames.get_mut(frame.slot()) {
            rec.sink = Some(Box::new(move |raw: RawOutcome| {
                let typed = match raw {
                    Outcome::Returned(any) => Outcome::Returned(unbox::<T>(any)),
                    Outcome::Errored(error) => Outcome::Errored(error),
                    Outcome::Halted => Outcome::Halted,
                };
                *sink_cell.borrow_mut() = Some(typed);
            }));
        }
        Ok(Self {
            frame,
            mailbox: state.mailbox.clone(),
            cell,
        })
    }

    /// Requests cooperative halt. Idempotent; delivery happens at the
    /// frame's next suspension boundary once the runtime is driven.
    pub fn halt(&self) {
        self.mailbox.push(Command::Halt { frame: self.frame });
    }

    /// True once the outcome has been published.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.cell.borrow().is_some()
    }

    /// Takes the outcome, if settled. Subsequent calls return `None`.
    #[must_use]
    pub fn take_outcome(&self) -> Option<Outcome<T>> {
        self.cell.borrow_mut().take()
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("frame", &self.frame)
            .field("settled", &self.cell.borrow().is_some())
            .finish()
    }
}

/// Handle to a child frame admitted with [`spawn`].
pub struct FrameHandle<T> {
    frame: FrameId,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for FrameHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FrameHandle<T> {}

impl<T: 'static> FrameHandle<T> {
    /// Waits for the child to settle and yields its outcome.
    ///
    /// A halted child is reported as `Outcome::Halted`, not as an error.
    /// The outcome can be claimed once; a second `join` of the same
    /// handle fails with a protocol error.
    pub fn join(self) -> Op<Outcome<T>> {
        let frame = self.frame;
        watch_settle(vec![frame])
            .then(move |_| claim_outcome(frame))
            .map(|raw| raw.map(unbox::<T>))
    }

    /// Halts the child individually and waits for its teardown to
    /// complete. Siblings are unaffected.
    pub fn halt(self) -> Op<()> {
        Op::from_node(Node::HaltFrame(self.frame))
    }
}

impl<T> std::fmt::Debug for FrameHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameHandle({})", self.frame)
    }
}

/// Admits `op` as a child of the current frame's scope.
///
/// The child starts immediately and runs independently; the spawning
/// frame is resumed with a handle right away. The child's lifetime is
/// bounded by the spawning frame: when that frame settles, its scope
/// halts remaining children in reverse admission order. A child error
/// collapses the scope and reaches the spawning frame at its next
/// suspension point.
pub fn spawn<T: 'static>(op: Op<T>) -> Op<FrameHandle<T>> {
    spawn_node(op.node).map(|frame| FrameHandle {
        frame,
        _result: PhantomData,
    })
}

/// Handle for scheduling computations into a detached scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopeHandle {
    scope: ScopeId,
}

impl ScopeHandle {
    pub(crate) fn new(scope: ScopeId) -> Self {
        Self { scope }
    }

    /// Schedules `op` into this scope, returning its task handle.
    ///
    /// Fails with a scope-closed error once the scope is closing.
    pub fn run<T: 'static>(&self, rt: &mut Runtime, op: Op<T>) -> Result<Task<T>> {
        Task::create(rt.state_mut(), self.scope, op)
    }
}

/// Tears down a detached scope.
///
/// Must be consumed before the runtime is dropped; `destroy` halts every
/// task still in the scope (reverse admission order) and drives the
/// runtime until the scope is fully closed.
pub struct ScopeDestroyer {
    scope: ScopeId,
    mailbox: Mailbox,
    done: Rc<RefCell<ScopeDone>>,
}

impl std::fmt::Debug for ScopeDestroyer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeDestroyer")
            .field("scope", &self.scope)
            .field("closed", &self.done.borrow().closed)
            .finish()
    }
}

impl ScopeDestroyer {
    pub(crate) fn new(scope: ScopeId, mailbox: Mailbox, done: Rc<RefCell<ScopeDone>>) -> Self {
        Self {
            scope,
            mailbox,
            done,
        }
    }

    /// Halts the scope and drives until it is closed.
    ///
    /// Returns the scope's recorded error, if any child failed while the
    /// scope was alive.
    pub fn destroy(self, rt: &mut Runtime) -> Result<()> {
        self.mailbox.push(Command::HaltScope { scope: self.scope });
        loop {
            rt.run_until_idle()?;
            if self.done.borrow().closed {
                break;
            }
            match rt.next_deadline() {
                Some(deadline) => rt.wait_until(deadline),
                None => {
                    return Err(Error::new(ErrorKind::Deadlock)
                        .with_context("scope cannot close: no runnable work and no timers"));
                }
            }
        }
        let error = self.done.borrow_mut().error.take();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
