//! Frame records: one running computation instance.
//!
//! A frame owns the live execution state of an operation: the current
//! instruction, the continuation stack, the cleanup stack, and the park
//! bookkeeping that makes external resumes idempotent. Records live in
//! the runtime arena and are mutated only by the engine.
//!
//! # Lifecycle
//!
//! ```text
//! fresh → ready ⇄ running ⇄ parked
//!                    │
//!                    ▼ (terminal outcome)
//!            tearing down (cleanup stack drains, in_teardown = true)
//!                    │
//!                    ▼
//!            closing scope (children halted reverse-order)
//!                    │
//!                    ▼
//!                 closed (outcome published)
//! ```
//!
//! Only a parked frame accepts an external resume, and only if the resume
//! carries the epoch of the current suspension; everything else is
//! dropped. Halts requested during teardown are no-ops.

use crate::error::Error;
use crate::op::{AbortAction, BoxAny, Cont, Node, NodeThunk, RawOutcome};
use crate::types::{FrameId, ScopeId};

/// Coarse lifecycle state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameState {
    /// Created and queued for its first step.
    Fresh,
    /// Queued with a pending input.
    Ready,
    /// Currently interpreting instructions.
    Running,
    /// Waiting for an external resume.
    Parked,
    /// Cleanups drained; waiting for the inner scope to close.
    ClosingScope,
    /// Outcome published.
    Closed,
}

/// What a frame is resumed with.
pub(crate) enum Injected {
    Value(BoxAny),
    Failure(Error),
    Halt,
}

/// How a settled frame should notify a waiting frame.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WatchPayload {
    /// Resume with the settled frame's id (`WatchSettle`).
    SettledId,
    /// Resume with unit (`HaltFrame`).
    Unit,
}

/// A frame waiting for another frame to settle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Watcher {
    pub frame: FrameId,
    pub epoch: u64,
    pub payload: WatchPayload,
}

/// Links a resource-body frame to the caller that acquired it.
pub(crate) struct ProviderLink {
    pub caller: FrameId,
    pub caller_epoch: u64,
    pub provided: bool,
}

/// Consumes a root frame's outcome at publication (task handles).
pub(crate) type OutcomeSink = Box<dyn FnOnce(RawOutcome)>;

pub(crate) struct FrameRecord {
    pub id: FrameId,
    /// Scope this frame lives in.
    pub owner: ScopeId,
    /// Scope this frame's children live in.
    pub inner: ScopeId,
    pub state: FrameState,
    /// True from the first terminal outcome until publication.
    pub in_teardown: bool,
    /// Instruction to run at the next step (absent while parked mid-tree).
    pub program: Option<Node>,
    pub conts: Vec<Cont>,
    /// Bumped at every park; resumes carrying an older epoch are stale.
    pub wait_epoch: u64,
    /// Undo action for the current park.
    pub abort: Option<AbortAction>,
    pub pending_input: Option<Injected>,
    pub pending_halt: bool,
    /// Error injected by the scope, delivered at the next boundary.
    pub pending_failure: Option<Error>,
    /// LIFO cleanup stack.
    pub cleanups: Vec<NodeThunk>,
    /// Terminal outcome recorded but not yet published.
    pub pending_outcome: Option<RawOutcome>,
    /// Published outcome, held until claimed.
    pub outcome: Option<RawOutcome>,
    /// True once the outcome has been published.
    pub settled: bool,
    pub watchers: Vec<Watcher>,
    pub sink: Option<OutcomeSink>,
    pub provider: Option<ProviderLink>,
}

impl FrameRecord {
    pub fn new(id: FrameId, owner: ScopeId, inner: ScopeId, program: Node) -> Self {
        Self {
            id,
            owner,
            inner,
            state: FrameState::Fresh,
            in_teardown: false,
            program: Some(program),
            conts: Vec::new(),
            wait_epoch: 0,
            abort: None,
            pending_input: None,
            pending_halt: false,
            pending_failure: None,
            cleanups: Vec::new(),
            pending_outcome: None,
            outcome: None,
            settled: false,
            watchers: Vec::new(),
            sink: None,
            provider: None,
        }
    }

    /// True if this frame still reacts to halt requests.
    pub fn is_haltable(&self) -> bool {
        !self.settled && !self.in_teardown && self.state != FrameState::Closed
    }

    /// True if an external resume for `epoch` should be delivered.
    pub fn accepts_resume(&self, epoch: u64) -> bool {
        self.state == FrameState::Parked && self.wait_epoch == epoch && !self.settled
    }

    /// Bumps the park epoch and returns the new value.
    pub fn next_epoch(&mut self) -> u64 {
        self.wait_epoch += 1;
        self.wait_epoch
    }
}

impl std::fmt::Debug for FrameRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRecord")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("in_teardown", &self.in_teardown)
            .field("wait_epoch", &self.wait_epoch)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}
