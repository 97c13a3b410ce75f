//! The step engine.
//!
//! `RuntimeState` owns every record and drives all execution: it drains
//! the command mailbox, fires due timers, and steps one frame at a time.
//! A step interprets instruction nodes until the frame parks, settles, or
//! hands control back. Nothing in this module is re-entrant; host code
//! only ever talks to the engine through the mailbox.
//!
//! Teardown sequencing lives here too. When a frame reaches a terminal
//! outcome it drains its cleanup stack (LIFO, each cleanup itself an
//! operation), then closes its inner scope (children halted serially in
//! reverse admission order), and only then publishes its outcome.

use crate::error::{Error, ErrorKind, Result};
use crate::op::{AbortAction, BoxAny, Cont, Node, RawOutcome, Resumer};
use crate::record::frame::{
    FrameRecord, FrameState, Injected, ProviderLink, WatchPayload, Watcher,
};
use crate::record::scope::{CloseDriver, CloseReason, ScopeRecord, ScopeState, ScopeView};
use crate::runtime::mailbox::{Command, Mailbox, Payload};
use crate::runtime::scheduler::RunQueue;
use crate::runtime::timer::TimerDriver;
use crate::types::{FrameId, Outcome, ScopeId, Time};
use crate::util::Arena;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Time source for the engine.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Clock {
    /// Advances only when the driver says so; used for deterministic tests.
    Virtual,
    /// Tracks wall time elapsed since the runtime started.
    Monotonic { origin: Instant },
}

/// Context handed to a `Wait` registrar at its suspension point.
pub(crate) struct WaitCx<'a> {
    pub(crate) timers: &'a mut TimerDriver,
    pub(crate) mailbox: Mailbox,
    pub(crate) now: Time,
    pub(crate) frame: FrameId,
    pub(crate) epoch: u64,
}

impl WaitCx<'_> {
    /// A resume handle bound to this exact suspension.
    pub(crate) fn resumer<T: 'static>(&self) -> Resumer<T> {
        Resumer::new(self.mailbox.clone(), self.frame, self.epoch)
    }

    /// Schedules a timer that resumes this suspension with `()`.
    pub(crate) fn schedule_timer(&mut self, after: Duration) -> u64 {
        self.timers.insert(self.now + after, self.frame, self.epoch)
    }
}

/// Where the interpreter is within a step.
enum Cursor {
    Node(Node),
    Feed(BoxAny),
    Unwind(Error),
    Halt,
}

pub(crate) struct RuntimeState {
    pub frames: Arena<FrameRecord>,
    pub scopes: Arena<ScopeRecord>,
    pub queue: RunQueue,
    pub mailbox: Mailbox,
    pub timers: TimerDriver,
    pub clock: Clock,
    pub now: Time,
    pub steps: u64,
    pub max_steps: Option<u64>,
}

impl RuntimeState {
    pub fn new(clock: Clock, max_steps: Option<u64>) -> Self {
        Self {
            frames: Arena::new(),
            scopes: Arena::new(),
            queue: RunQueue::new(),
            mailbox: Mailbox::new(),
            timers: TimerDriver::new(),
            clock,
            now: Time::ZERO,
            steps: 0,
            max_steps,
        }
    }

    pub fn refresh_now(&mut self) {
        if let Clock::Monotonic { origin } = self.clock {
            let nanos = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.now = Time::from_nanos(nanos);
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    pub fn create_scope_record(&mut self, parent: Option<ScopeId>, ephemeral: bool) -> ScopeId {
        let key = self
            .scopes
            .insert_with(|k| ScopeRecord::new(ScopeId::from_slot(k), parent, ephemeral));
        ScopeId::from_slot(key)
    }

    /// Admits a frame into `owner` and queues its first step.
    pub fn create_frame(&mut self, owner: ScopeId, program: Node) -> Result<FrameId> {
        let open = self
            .scopes
            .get(owner.slot())
            .map(ScopeRecord::is_open)
            .unwrap_or(false);
        if !open {
            return Err(Error::scope_closed());
        }

        let inner = self.create_scope_record(Some(owner), false);
        let key = self
            .frames
            .insert_with(|k| FrameRecord::new(FrameId::from_slot(k), owner, inner, program));
        let frame = FrameId::from_slot(key);

        if let Some(scope) = self.scopes.get_mut(inner.slot()) {
            scope.driver = Some(frame);
        }
        if let Some(scope) = self.scopes.get_mut(owner.slot()) {
            scope.children.push(frame);
            scope.admitted.push(frame);
        }
        self.queue.schedule(frame);
        trace!(%frame, scope = %owner, "frame admitted");
        Ok(frame)
    }

    // =========================================================================
    // External commands
    // =========================================================================

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Resume {
                frame,
                epoch,
                payload,
            } => self.deliver_resume(frame, epoch, payload),
            Command::Halt { frame } => self.request_halt(frame),
            Command::HaltScope { scope } => self.scope_begin_close(scope, CloseReason::External),
        }
    }

    /// Delivers an external resume if the frame is still parked on `epoch`.
    fn deliver_resume(&mut self, frame: FrameId, epoch: u64, payload: Payload) {
        let Some(rec) = self.frames.get_mut(frame.slot()) else {
            return;
        };
        if !rec.accepts_resume(epoch) {
            trace!(%frame, epoch, "stale resume dropped");
            return;
        }
        // The wait is consumed: its abort action is obsolete and must not run.
        rec.abort = None;
        rec.wait_epoch += 1;
        rec.pending_input = Some(match payload {
            Payload::Value(v) => Injected::Value(v),
            Payload::Failure(e) => Injected::Failure(e),
        });
        rec.state = FrameState::Ready;
        self.queue.schedule(frame);
    }

    /// Requests cooperative halt of a frame.
    pub fn request_halt(&mut self, frame: FrameId) {
        let Some(rec) = self.frames.get_mut(frame.slot()) else {
            return;
        };
        if !rec.is_haltable() {
            return;
        }
        trace!(%frame, state = ?rec.state, "halt requested");
        match rec.state {
            FrameState::Parked => {
                let action = rec.abort.take();
                rec.wait_epoch += 1;
                rec.pending_input = Some(Injected::Halt);
                rec.state = FrameState::Ready;
                self.run_abort_action(action);
                self.queue.schedule_halt(frame);
            }
            FrameState::Fresh | FrameState::Ready => {
                rec.pending_input = Some(Injected::Halt);
                self.queue.schedule_halt(frame);
            }
            FrameState::Running => rec.pending_halt = true,
            FrameState::ClosingScope | FrameState::Closed => {}
        }
    }

    /// Injects an error into a frame at its next suspension boundary.
    fn request_fail(&mut self, frame: FrameId, error: Error) {
        let Some(rec) = self.frames.get_mut(frame.slot()) else {
            return;
        };
        if rec.in_teardown || rec.settled {
            merge_error_into_pending(rec, error);
            return;
        }
        match rec.state {
            FrameState::Parked => {
                let action = rec.abort.take();
                rec.wait_epoch += 1;
                rec.pending_input = Some(Injected::Failure(error));
                rec.state = FrameState::Ready;
                self.run_abort_action(action);
                self.queue.schedule(frame);
            }
            FrameState::Fresh | FrameState::Ready => {
                // A pending halt still wins over an injected error.
                if !matches!(rec.pending_input, Some(Injected::Halt)) {
                    rec.pending_input = Some(Injected::Failure(error));
                }
                self.queue.schedule(frame);
            }
            FrameState::Running => match &mut rec.pending_failure {
                Some(first) => first.push_suppressed(error),
                slot @ None => *slot = Some(error),
            },
            FrameState::ClosingScope | FrameState::Closed => {}
        }
    }

    fn run_abort_action(&mut self, action: Option<AbortAction>) {
        match action {
            Some(AbortAction::CancelTimer(key)) => self.timers.cancel(key),
            Some(AbortAction::Invoke(f)) => f(),
            Some(AbortAction::Forget) | None => {}
        }
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    fn step_frame(&mut self, frame: FrameId) {
        let (input, mut conts, program) = {
            let Some(rec) = self.frames.get_mut(frame.slot()) else {
                return;
            };
            if rec.state == FrameState::Closed {
                return;
            }
            rec.state = FrameState::Running;
            (
                rec.pending_input.take(),
                std::mem::take(&mut rec.conts),
                rec.program.take(),
            )
        };

        let mut cursor = match input {
            Some(Injected::Halt) => Cursor::Halt,
            Some(Injected::Value(v)) => Cursor::Feed(v),
            Some(Injected::Failure(e)) => Cursor::Unwind(e),
            None => match program {
                Some(node) => Cursor::Node(node),
                None => return,
            },
        };

        loop {
            // Every instruction boundary is a delivery point for pending
            // halt or injected sibling failure.
            {
                let Some(rec) = self.frames.get_mut(frame.slot()) else {
                    return;
                };
                if !rec.in_teardown {
                    if rec.pending_halt {
                        rec.pending_halt = false;
                        cursor = Cursor::Halt;
                    } else if let Some(error) = rec.pending_failure.take() {
                        cursor = Cursor::Unwind(error);
                    }
                }
            }

            cursor = match cursor {
                Cursor::Halt => {
                    conts.clear();
                    self.settle_stepper(frame, Outcome::Halted);
                    return;
                }
                Cursor::Feed(value) => match conts.pop() {
                    Some(Cont::Then(f)) => Cursor::Node(f(value)),
                    Some(Cont::Rescue(_)) => Cursor::Feed(value),
                    None => {
                        self.settle_stepper(frame, Outcome::Returned(value));
                        return;
                    }
                },
                Cursor::Unwind(error) => match conts.pop() {
                    Some(Cont::Rescue(f)) => Cursor::Node(f(error)),
                    Some(Cont::Then(_)) => Cursor::Unwind(error),
                    None => {
                        self.settle_stepper(frame, Outcome::Errored(error));
                        return;
                    }
                },
                Cursor::Node(node) => match node {
                    Node::Value(v) => Cursor::Feed(v),
                    Node::Fail(e) => Cursor::Unwind(e),
                    Node::Lazy(f) => Cursor::Node(f()),
                    Node::Then { first, then } => {
                        conts.push(Cont::Then(then));
                        Cursor::Node(*first)
                    }
                    Node::Rescue { first, rescue } => {
                        conts.push(Cont::Rescue(rescue));
                        Cursor::Node(*first)
                    }
                    Node::Ensure(thunk) => {
                        if let Some(rec) = self.frames.get_mut(frame.slot()) {
                            rec.cleanups.push(thunk);
                        }
                        Cursor::Feed(Box::new(()))
                    }
                    Node::Scoped(f) => {
                        let current = match self.frames.get(frame.slot()) {
                            Some(rec) => rec.inner,
                            None => return,
                        };
                        let mut view = ScopeView {
                            scopes: &mut self.scopes,
                            current,
                        };
                        match f(&mut view) {
                            Ok(value) => Cursor::Feed(value),
                            Err(error) => Cursor::Unwind(error),
                        }
                    }
                    Node::Spawn(child) => {
                        let owner = match self.frames.get(frame.slot()) {
                            Some(rec) => rec.inner,
                            None => return,
                        };
                        match self.create_frame(owner, *child) {
                            Ok(id) => Cursor::Feed(Box::new(id)),
                            Err(error) => Cursor::Unwind(error),
                        }
                    }
                    Node::Acquire(body) => {
                        let (owner, epoch) = match self.frames.get_mut(frame.slot()) {
                            Some(rec) => (rec.inner, rec.next_epoch()),
                            None => return,
                        };
                        match self.create_frame(owner, *body) {
                            Ok(provider) => {
                                if let Some(rec) = self.frames.get_mut(provider.slot()) {
                                    rec.provider = Some(ProviderLink {
                                        caller: frame,
                                        caller_epoch: epoch,
                                        provided: false,
                                    });
                                }
                                self.park(frame, conts, None);
                                return;
                            }
                            Err(error) => Cursor::Unwind(error),
                        }
                    }
                    Node::Provide(value) => {
                        let link = match self.frames.get_mut(frame.slot()) {
                            Some(rec) => match rec.provider.as_mut() {
                                Some(link) if !link.provided => {
                                    link.provided = true;
                                    Some((link.caller, link.caller_epoch))
                                }
                                Some(_) => None,
                                None => {
                                    cursor = Cursor::Unwind(Error::protocol(
                                        "provide called outside a resource body",
                                    ));
                                    continue;
                                }
                            },
                            None => return,
                        };
                        if let Some((caller, caller_epoch)) = link {
                            self.deliver_resume(caller, caller_epoch, Payload::Value(value));
                            self.park(frame, conts, None);
                            return;
                        }
                        Cursor::Unwind(Error::protocol("value already provided"))
                    }
                    Node::Wait(registrar) => {
                        let epoch = match self.frames.get_mut(frame.slot()) {
                            Some(rec) => rec.next_epoch(),
                            None => return,
                        };
                        let mailbox = self.mailbox.clone();
                        let now = self.now;
                        let action = {
                            let mut cx = WaitCx {
                                timers: &mut self.timers,
                                mailbox,
                                now,
                                frame,
                                epoch,
                            };
                            registrar(&mut cx)
                        };
                        self.park(frame, conts, Some(action));
                        return;
                    }
                    Node::WatchSettle(targets) => {
                        let epoch = match self.frames.get_mut(frame.slot()) {
                            Some(rec) => rec.next_epoch(),
                            None => return,
                        };
                        if let Some(hit) = targets.iter().copied().find(|t| self.is_settled(*t)) {
                            self.mailbox.push(Command::Resume {
                                frame,
                                epoch,
                                payload: Payload::Value(Box::new(hit)),
                            });
                        } else {
                            for target in targets {
                                if let Some(rec) = self.frames.get_mut(target.slot()) {
                                    rec.watchers.push(Watcher {
                                        frame,
                                        epoch,
                                        payload: WatchPayload::SettledId,
                                    });
                                }
                            }
                        }
                        self.park(frame, conts, None);
                        return;
                    }
                    Node::Claim(target) => match self.frames.get_mut(target.slot()) {
                        Some(rec) if rec.settled => match rec.outcome.take() {
                            Some(outcome) => Cursor::Feed(Box::new(outcome)),
                            None => Cursor::Unwind(Error::protocol(
                                "frame outcome was already claimed",
                            )),
                        },
                        _ => Cursor::Unwind(Error::protocol("claim of an unsettled frame")),
                    },
                    Node::HaltFrame(target) => {
                        if target == frame {
                            // Halting yourself takes effect immediately.
                            if let Some(rec) = self.frames.get_mut(frame.slot()) {
                                rec.pending_halt = false;
                            }
                            cursor = Cursor::Halt;
                            continue;
                        }
                        self.request_halt(target);
                        if self.is_settled(target) {
                            Cursor::Feed(Box::new(()))
                        } else {
                            let epoch = match self.frames.get_mut(frame.slot()) {
                                Some(rec) => rec.next_epoch(),
                                None => return,
                            };
                            if let Some(rec) = self.frames.get_mut(target.slot()) {
                                rec.watchers.push(Watcher {
                                    frame,
                                    epoch,
                                    payload: WatchPayload::Unit,
                                });
                            }
                            self.park(frame, conts, None);
                            return;
                        }
                    }
                },
            };
        }
    }

    fn park(&mut self, frame: FrameId, conts: Vec<Cont>, action: Option<AbortAction>) {
        if let Some(rec) = self.frames.get_mut(frame.slot()) {
            rec.conts = conts;
            rec.abort = action;
            rec.state = FrameState::Parked;
        }
    }

    /// True if `frame` has published (or its record is already gone).
    fn is_settled(&self, frame: FrameId) -> bool {
        self.frames.get(frame.slot()).map_or(true, |rec| rec.settled)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Handles a terminal outcome from the interpreter: either the frame
    /// body finished, or one cleanup finished.
    fn settle_stepper(&mut self, frame: FrameId, outcome: RawOutcome) {
        let Some(rec) = self.frames.get_mut(frame.slot()) else {
            return;
        };
        if rec.in_teardown {
            match outcome {
                Outcome::Returned(_) => {}
                Outcome::Errored(error) => {
                    let wrapped = Error::new(ErrorKind::Cleanup)
                        .with_context("cleanup failed")
                        .with_source(error);
                    merge_error_into_pending(rec, wrapped);
                }
                Outcome::Halted => warn!(%frame, "cleanup evaluated to halted"),
            }
        } else {
            debug!(%frame, outcome = outcome.severity(), "frame reached terminal outcome");
            rec.in_teardown = true;
            rec.pending_halt = false;
            rec.pending_outcome = Some(outcome);
            if let Some(error) = rec.pending_failure.take() {
                merge_error_into_pending(rec, error);
            }
        }
        self.next_cleanup(frame);
    }

    fn next_cleanup(&mut self, frame: FrameId) {
        let thunk = match self.frames.get_mut(frame.slot()) {
            Some(rec) => rec.cleanups.pop(),
            None => return,
        };
        match thunk {
            Some(thunk) => {
                if let Some(rec) = self.frames.get_mut(frame.slot()) {
                    rec.program = Some(Node::Lazy(thunk));
                    rec.conts.clear();
                    rec.pending_input = None;
                    rec.state = FrameState::Ready;
                }
                self.queue.schedule(frame);
            }
            None => self.finish_cleanups(frame),
        }
    }

    /// Cleanup stack drained; close the inner scope, then publish.
    fn finish_cleanups(&mut self, frame: FrameId) {
        let inner = match self.frames.get_mut(frame.slot()) {
            Some(rec) => {
                rec.state = FrameState::ClosingScope;
                rec.inner
            }
            None => return,
        };
        let state = match self.scopes.get_mut(inner.slot()) {
            Some(scope) => {
                if scope.state != ScopeState::Closed {
                    scope.driver_waiting = true;
                }
                scope.state
            }
            None => ScopeState::Closed,
        };
        match state {
            ScopeState::Open => self.scope_begin_close(inner, CloseReason::DriverSettled),
            ScopeState::Closing => {} // already draining; publish happens at finish
            ScopeState::Closed => self.publish(frame),
        }
    }

    fn publish(&mut self, frame: FrameId) {
        let (outcome, watchers, sink, owner, inner, provider) =
            match self.frames.get_mut(frame.slot()) {
                Some(rec) => {
                    rec.state = FrameState::Closed;
                    rec.in_teardown = false;
                    rec.settled = true;
                    let outcome = rec.pending_outcome.take().unwrap_or_else(|| {
                        Outcome::Errored(
                            Error::new(ErrorKind::Internal)
                                .with_context("frame published without an outcome"),
                        )
                    });
                    (
                        outcome,
                        std::mem::take(&mut rec.watchers),
                        rec.sink.take(),
                        rec.owner,
                        rec.inner,
                        rec.provider.take(),
                    )
                }
                None => return,
            };

        debug!(%frame, outcome = ?outcome.severity(), "frame closed");

        // A resource body that finished without providing leaves its
        // acquirer parked; fail it rather than hanging it.
        if let Some(link) = provider {
            if !link.provided && outcome.is_returned() {
                self.deliver_resume(
                    link.caller,
                    link.caller_epoch,
                    Payload::Failure(Error::protocol(
                        "resource body finished without providing a value",
                    )),
                );
            }
        }

        let scope_error = match &outcome {
            Outcome::Errored(e) => Some(e.clone()),
            _ => None,
        };

        for watcher in watchers {
            let payload = match watcher.payload {
                WatchPayload::SettledId => Payload::Value(Box::new(frame)),
                WatchPayload::Unit => Payload::Value(Box::new(())),
            };
            self.mailbox.push(Command::Resume {
                frame: watcher.frame,
                epoch: watcher.epoch,
                payload,
            });
        }

        if let Some(sink) = sink {
            sink(outcome);
        } else if let Some(rec) = self.frames.get_mut(frame.slot()) {
            rec.outcome = Some(outcome);
        }

        // The inner scope closed during teardown; its records are dead.
        self.remove_scope_tree(inner);

        self.child_settled(owner, frame, scope_error);

        // Root scopes created by `run` evaporate with their only frame.
        let ephemeral_done = self
            .scopes
            .get(owner.slot())
            .map_or(false, |scope| {
                scope.ephemeral && scope.driver.is_none() && scope.children.is_empty()
            });
        if ephemeral_done {
            self.remove_scope_tree(owner);
        }
    }

    // =========================================================================
    // Scope close sequencing
    // =========================================================================

    pub fn scope_begin_close(&mut self, scope: ScopeId, reason: CloseReason) {
        let hooks = match self.scopes.get_mut(scope.slot()) {
            Some(rec) if rec.is_open() => {
                rec.state = ScopeState::Closing;
                let queue: Vec<FrameId> = rec.children.iter().rev().copied().collect();
                rec.close = Some(CloseDriver {
                    queue,
                    current: None,
                });
                std::mem::take(&mut rec.hooks)
            }
            _ => return,
        };
        debug!(%scope, ?reason, "scope closing");
        for hook in hooks.into_iter().rev() {
            hook();
        }
        self.advance_close(scope);
    }

    /// Halts the next not-yet-settled child, or finishes the close.
    fn advance_close(&mut self, scope: ScopeId) {
        loop {
            let next = match self.scopes.get_mut(scope.slot()) {
                Some(rec) => match rec.close.as_mut() {
                    Some(close) if close.current.is_none() => {
                        if close.queue.is_empty() {
                            None
                        } else {
                            Some(close.queue.remove(0))
                        }
                    }
                    _ => return,
                },
                None => return,
            };
            match next {
                None => {
                    self.scope_finish_close(scope);
                    return;
                }
                Some(child) if !self.is_settled(child) => {
                    if let Some(rec) = self.scopes.get_mut(scope.slot()) {
                        if let Some(close) = rec.close.as_mut() {
                            close.current = Some(child);
                        }
                    }
                    self.request_halt(child);
                    return;
                }
                Some(_) => {} // already settled on its own; skip
            }
        }
    }

    /// Records a child's settlement in its owning scope.
    fn child_settled(&mut self, scope: ScopeId, child: FrameId, error: Option<Error>) {
        let (state, was_current, had_error) = match self.scopes.get_mut(scope.slot()) {
            Some(rec) => {
                rec.children.retain(|c| *c != child);
                let had_error = error.is_some();
                if let Some(e) = error {
                    rec.record_child_error(e);
                }
                let was_current = rec
                    .close
                    .as_mut()
                    .map_or(false, |close| {
                        if close.current == Some(child) {
                            close.current = None;
                            true
                        } else {
                            false
                        }
                    });
                (rec.state, was_current, had_error)
            }
            None => return,
        };
        match state {
            ScopeState::Open if had_error => {
                self.scope_begin_close(scope, CloseReason::ChildFailed);
            }
            ScopeState::Closing if was_current => self.advance_close(scope),
            _ => {}
        }
    }

    fn scope_finish_close(&mut self, scope: ScopeId) {
        let (error, driver, waiting, flags) = match self.scopes.get_mut(scope.slot()) {
            Some(rec) => {
                rec.state = ScopeState::Closed;
                rec.close = None;
                (
                    rec.error.clone(),
                    rec.driver,
                    rec.driver_waiting,
                    std::mem::take(&mut rec.done_flags),
                )
            }
            None => return,
        };
        debug!(%scope, "scope closed");
        for flag in flags {
            let mut done = flag.borrow_mut();
            done.closed = true;
            done.error = error.clone();
        }
        match driver {
            Some(frame) if waiting => {
                if let Some(e) = error {
                    if let Some(rec) = self.frames.get_mut(frame.slot()) {
                        merge_error_into_pending(rec, e);
                    }
                }
                self.publish(frame);
            }
            Some(frame) => {
                // Children failed while the driver is still live: the
                // error reaches it only after the siblings drained.
                if let Some(e) = error {
                    self.request_fail(frame, e);
                }
            }
            None => self.remove_scope_tree(scope),
        }
    }

    /// Drops a closed scope's record tree: every frame ever admitted and,
    /// recursively, their inner scopes.
    fn remove_scope_tree(&mut self, scope: ScopeId) {
        let Some(rec) = self.scopes.remove(scope.slot()) else {
            return;
        };
        for frame in rec.admitted {
            if let Some(frec) = self.frames.remove(frame.slot()) {
                self.remove_scope_tree(frec.inner);
            }
        }
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Runs until the mailbox, timers (at the current instant), and run
    /// queue are all drained.
    pub fn run_until_idle(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            while let Some(command) = self.mailbox.pop() {
                self.apply_command(command);
                progressed = true;
            }
            self.refresh_now();
            while let Some((frame, epoch)) = self.timers.pop_due(self.now) {
                trace!(%frame, "timer fired");
                self.deliver_resume(frame, epoch, Payload::Value(Box::new(())));
                progressed = true;
            }
            if let Some(frame) = self.queue.pop() {
                self.steps += 1;
                if let Some(max) = self.max_steps {
                    if self.steps > max {
                        return Err(Error::new(ErrorKind::Deadlock)
                            .with_context(format!("step guard exceeded after {max} steps")));
                    }
                }
                self.step_frame(frame);
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    pub fn is_idle(&mut self) -> bool {
        self.queue.is_empty()
            && self.mailbox.is_empty()
            && self
                .timers
                .next_deadline()
                .map_or(true, |deadline| deadline > self.now)
    }
}

/// Folds a late error into a frame's recorded-but-unpublished outcome:
/// it replaces a success, suppresses behind an existing error, and never
/// displaces a halt.
fn merge_error_into_pending(rec: &mut FrameRecord, error: Error) {
    match rec.pending_outcome.as_mut() {
        Some(Outcome::Returned(_)) | None => {
            rec.pending_outcome = Some(Outcome::Errored(error));
        }
        Some(Outcome::Errored(first)) => first.push_suppressed(error),
        Some(Outcome::Halted) => {
            warn!(frame = %rec.id, %error, "error observed after halt; dropped");
        }
    }
}
