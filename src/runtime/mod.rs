//! Runtime front end: construction, configuration, and driving.
//!
//! The engine itself is single-threaded and inert; it only makes
//! progress while one of the drive methods here is running. Tests use
//! the virtual clock ([`Runtime::lab`]) and steer time explicitly with
//! [`Runtime::advance`]; production callers use the monotonic clock and
//! [`Runtime::run_until_settled`] or the crate-level `run`/`main`
//! helpers.

pub(crate) mod mailbox;
pub(crate) mod scheduler;
pub(crate) mod state;
pub(crate) mod timer;

use crate::error::{Error, ErrorKind, Result};
use crate::op::Op;
use crate::task::{ScopeDestroyer, ScopeHandle, Task};
use crate::types::{Outcome, Time};
use state::{Clock, RuntimeState};
use std::time::{Duration, Instant};

/// Environment variable overriding the step guard.
const MAX_STEPS_ENV: &str = "TAPROOT_MAX_STEPS";

/// Step guard applied to virtual-clock runtimes unless overridden.
const LAB_DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// Builder for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    virtual_clock: bool,
    max_steps: Option<u64>,
}

impl RuntimeBuilder {
    /// Creates a builder with the monotonic clock and the step guard
    /// taken from `TAPROOT_MAX_STEPS` if set.
    #[must_use]
    pub fn new() -> Self {
        let max_steps = std::env::var(MAX_STEPS_ENV)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok());
        Self {
            virtual_clock: false,
            max_steps,
        }
    }

    /// Uses the virtual clock: time advances only via [`Runtime::advance`]
    /// and the settle loop.
    #[must_use]
    pub fn virtual_clock(mut self) -> Self {
        self.virtual_clock = true;
        if self.max_steps.is_none() {
            self.max_steps = Some(LAB_DEFAULT_MAX_STEPS);
        }
        self
    }

    /// Caps the number of frame steps before the drive fails with a
    /// deadlock-kind error. `None` disables the guard.
    #[must_use]
    pub fn max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Builds the runtime.
    #[must_use]
    pub fn build(self) -> Runtime {
        let clock = if self.virtual_clock {
            Clock::Virtual
        } else {
            Clock::Monotonic {
                origin: Instant::now(),
            }
        };
        Runtime {
            state: RuntimeState::new(clock, self.max_steps),
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-threaded cooperative runtime.
pub struct Runtime {
    state: RuntimeState,
}

impl Runtime {
    /// A runtime on the monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    /// A deterministic runtime on the virtual clock, for tests.
    #[must_use]
    pub fn lab() -> Self {
        RuntimeBuilder::new().virtual_clock().build()
    }

    /// Starts building a runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn state_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }

    /// Submits a root computation and returns its task handle.
    ///
    /// The task makes no progress until the runtime is driven.
    pub fn run<T: 'static>(&mut self, op: Op<T>) -> Task<T> {
        let scope = self.state.create_scope_record(None, true);
        Task::create(&mut self.state, scope, op)
            .expect("fresh root scope rejected admission")
    }

    /// Creates a detached scope for external drivers.
    ///
    /// Computations are scheduled into it with [`ScopeHandle::run`]; the
    /// destroyer halts the scope and must be driven to completion before
    /// the runtime is dropped.
    pub fn create_scope(&mut self) -> (ScopeHandle, ScopeDestroyer) {
        let scope = self.state.create_scope_record(None, false);
        let done = std::rc::Rc::new(std::cell::RefCell::new(
            crate::record::scope::ScopeDone::default(),
        ));
        if let Some(rec) = self.state.scopes.get_mut(scope.slot()) {
            rec.done_flags.push(done.clone());
        }
        (
            ScopeHandle::new(scope),
            ScopeDestroyer::new(scope, self.state.mailbox.clone(), done),
        )
    }

    /// Runs until no more progress is possible at the current instant.
    pub fn run_until_idle(&mut self) -> Result<()> {
        self.state.run_until_idle()
    }

    /// Advances the virtual clock by `duration`, firing every timer on
    /// the way and running the frames it wakes.
    pub fn advance(&mut self, duration: Duration) -> Result<()> {
        let target = self.state.now + duration;
        self.advance_to(target)
    }

    fn advance_to(&mut self, target: Time) -> Result<()> {
        if !matches!(self.state.clock, Clock::Virtual) {
            return Err(Error::protocol("advance requires the virtual clock"));
        }
        self.state.run_until_idle()?;
        loop {
            let due = self
                .state
                .timers
                .next_deadline()
                .filter(|deadline| *deadline <= target);
            match due {
                Some(deadline) => {
                    if deadline > self.state.now {
                        self.state.now = deadline;
                    }
                    self.state.run_until_idle()?;
                }
                None => break,
            }
        }
        if target > self.state.now {
            self.state.now = target;
        }
        self.state.run_until_idle()
    }

    /// Drives until `task` settles, waiting on timers as needed.
    ///
    /// Fails with a deadlock-kind error if the runtime goes idle with no
    /// pending timers while the task is still unsettled.
    pub fn run_until_settled<T: 'static>(&mut self, task: &Task<T>) -> Result<()> {
        loop {
            self.state.run_until_idle()?;
            if task.is_settled() {
                return Ok(());
            }
            match self.state.timers.next_deadline() {
                Some(deadline) => match self.state.clock {
                    Clock::Virtual => {
                        if deadline > self.state.now {
                            self.state.now = deadline;
                        }
                    }
                    Clock::Monotonic { .. } => {
                        let wait = deadline.saturating_since(self.state.now);
                        if wait > 0 {
                            std::thread::sleep(Duration::from_nanos(wait));
                        }
                        self.state.refresh_now();
                    }
                },
                None => {
                    return Err(Error::new(ErrorKind::Deadlock).with_context(
                        "runtime is idle with no timers but the task has not settled",
                    ));
                }
            }
        }
    }

    /// Runs `op` to completion and returns its outcome.
    pub fn block_on<T: 'static>(&mut self, op: Op<T>) -> Outcome<T> {
        let task = self.run(op);
        if let Err(error) = self.run_until_settled(&task) {
            return Outcome::Errored(error);
        }
        task.take_outcome().unwrap_or_else(|| {
            Outcome::Errored(
                Error::new(ErrorKind::Internal).with_context("settled task had no outcome"),
            )
        })
    }

    /// Current logical time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.state.now
    }

    /// Total frame steps executed.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.state.steps
    }

    /// True if no work is runnable at the current instant.
    pub fn is_idle(&mut self) -> bool {
        self.state.is_idle()
    }

    /// Number of live frame records.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.state.frames.len()
    }

    /// Number of live scope records.
    #[must_use]
    pub fn live_scopes(&self) -> usize {
        self.state.scopes.len()
    }

    /// Earliest pending timer deadline.
    pub(crate) fn next_deadline(&mut self) -> Option<Time> {
        self.state.timers.next_deadline()
    }

    /// Blocks (or jumps, on the virtual clock) until `deadline`.
    pub(crate) fn wait_until(&mut self, deadline: Time) {
        match self.state.clock {
            Clock::Virtual => {
                if deadline > self.state.now {
                    self.state.now = deadline;
                }
            }
            Clock::Monotonic { .. } => {
                let wait = deadline.saturating_since(self.state.now);
                if wait > 0 {
                    std::thread::sleep(Duration::from_nanos(wait));
                }
                self.state.refresh_now();
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("now", &self.state.now)
            .field("steps", &self.state.steps)
            .field("frames", &self.state.frames.len())
            .field("scopes", &self.state.scopes.len())
            .finish()
    }
}
