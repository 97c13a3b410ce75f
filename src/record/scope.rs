//! Scope records: nodes in the task tree.
//!
//! A scope bounds the lifetimes of the frames admitted into it. Closing
//! is one-way: once a scope starts closing no new children are admitted,
//! its teardown hooks fire, and its remaining children are halted one at
//! a time in reverse admission order, each awaited to closed before the
//! next. The first child error observed is recorded; later errors attach
//! to it as suppressed.

use crate::error::Error;
use crate::op::BoxAny;
use crate::types::{FrameId, ScopeId};
use crate::util::Arena;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Scope lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeState {
    Open,
    Closing,
    Closed,
}

/// Why a scope began closing (diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The driving frame reached its terminal outcome.
    DriverSettled,
    /// A child errored; siblings are being halted.
    ChildFailed,
    /// An external halt (task halt cascading down, or scope destroy).
    External,
}

/// Serial close progress: remaining children in halt order.
#[derive(Debug, Default)]
pub(crate) struct CloseDriver {
    /// Children still to halt, reverse admission order.
    pub queue: Vec<FrameId>,
    /// Child currently being torn down.
    pub current: Option<FrameId>,
}

/// Externally observable completion of a detached scope.
#[derive(Debug, Default)]
pub(crate) struct ScopeDone {
    pub closed: bool,
    pub error: Option<Error>,
}

pub(crate) struct ScopeRecord {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    /// Frame whose termination closes this scope; `None` for root and
    /// detached scopes.
    pub driver: Option<FrameId>,
    /// Root scopes created by `run` are discarded once their only frame
    /// settles.
    pub ephemeral: bool,
    pub state: ScopeState,
    /// Live children, admission order.
    pub children: Vec<FrameId>,
    /// Every frame ever admitted; used to drop records when the scope
    /// record itself is removed.
    pub admitted: Vec<FrameId>,
    pub locals: HashMap<u64, BoxAny>,
    /// Run LIFO when closing begins (abort signals live here).
    pub hooks: Vec<Box<dyn FnOnce()>>,
    pub close: Option<CloseDriver>,
    /// First child error, with later errors suppressed into it.
    pub error: Option<Error>,
    /// True while the driver is parked waiting for this scope to close.
    pub driver_waiting: bool,
    pub done_flags: Vec<Rc<RefCell<ScopeDone>>>,
}

impl ScopeRecord {
    pub fn new(id: ScopeId, parent: Option<ScopeId>, ephemeral: bool) -> Self {
        Self {
            id,
            parent,
            driver: None,
            ephemeral,
            state: ScopeState::Open,
            children: Vec::new(),
            admitted: Vec::new(),
            locals: HashMap::new(),
            hooks: Vec::new(),
            close: None,
            error: None,
            driver_waiting: false,
            done_flags: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ScopeState::Open
    }

    /// Records a child failure; the first error wins, the rest suppress.
    pub fn record_child_error(&mut self, error: Error) {
        match &mut self.error {
            None => self.error = Some(error),
            Some(first) => first.push_suppressed(error),
        }
    }
}

impl std::fmt::Debug for ScopeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRecord")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("driver", &self.driver)
            .field("state", &self.state)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// Synchronous view of the scope chain, handed to `Scoped` instructions.
///
/// Reads walk the parent chain; writes bind in the current scope.
pub(crate) struct ScopeView<'a> {
    pub scopes: &'a mut Arena<ScopeRecord>,
    pub current: ScopeId,
}

impl ScopeView<'_> {
    /// Finds the nearest binding for `key`, walking up the parent chain.
    pub fn lookup(&self, key: u64) -> Option<&dyn Any> {
        let mut cursor = Some(self.current);
        while let Some(sid) = cursor {
            let scope = self.scopes.get(sid.slot())?;
            if let Some(value) = scope.locals.get(&key) {
                return Some(value.as_ref());
            }
            cursor = scope.parent;
        }
        None
    }

    /// Binds `key` in the current scope, shadowing outer bindings.
    pub fn bind(&mut self, key: u64, value: BoxAny) {
        if let Some(scope) = self.scopes.get_mut(self.current.slot()) {
            scope.locals.insert(key, value);
        }
    }

    /// Registers a hook that fires when the current scope begins closing.
    ///
    /// If the scope is already closing or closed the hook fires at once.
    pub fn on_teardown(&mut self, hook: Box<dyn FnOnce()>) {
        match self.scopes.get_mut(self.current.slot()) {
            Some(scope) if scope.is_open() => scope.hooks.push(hook),
            _ => hook(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: u32, parent: Option<ScopeId>) -> ScopeRecord {
        ScopeRecord::new(ScopeId::new_for_test(id, 0), parent, false)
    }

    #[test]
    fn first_child_error_wins() {
        let mut rec = scope(0, None);
        rec.record_child_error(Error::msg("first"));
        rec.record_child_error(Error::msg("second"));
        let err = rec.error.expect("error recorded");
        assert_eq!(err.context(), Some("first"));
        assert_eq!(err.suppressed().len(), 1);
    }

    #[test]
    fn lookup_walks_parent_chain() {
        let mut scopes = Arena::new();
        let parent_key = scopes.insert_with(|k| {
            let mut rec = ScopeRecord::new(ScopeId::from_slot(k), None, false);
            rec.locals.insert(7, Box::new(41u32) as BoxAny);
            rec
        });
        let parent = ScopeId::from_slot(parent_key);
        let child_key =
            scopes.insert_with(|k| ScopeRecord::new(ScopeId::from_slot(k), Some(parent), false));
        let child = ScopeId::from_slot(child_key);

        let view = ScopeView {
            scopes: &mut scopes,
            current: child,
        };
        let found = view.lookup(7).and_then(|any| any.downcast_ref::<u32>());
        assert_eq!(found, Some(&41));
        assert!(view.lookup(8).is_none());
    }

    #[test]
    fn bind_shadows_in_current_scope_only() {
        let mut scopes = Arena::new();
        let parent_key = scopes.insert_with(|k| {
            let mut rec = ScopeRecord::new(ScopeId::from_slot(k), None, false);
            rec.locals.insert(7, Box::new(1u32) as BoxAny);
            rec
        });
        let parent = ScopeId::from_slot(parent_key);
        let child_key =
            scopes.insert_with(|k| ScopeRecord::new(ScopeId::from_slot(k), Some(parent), false));
        let child = ScopeId::from_slot(child_key);

        let mut view = ScopeView {
            scopes: &mut scopes,
            current: child,
        };
        view.bind(7, Box::new(2u32));
        let seen = view.lookup(7).and_then(|any| any.downcast_ref::<u32>());
        assert_eq!(seen, Some(&2));

        let parent_value = scopes
            .get(parent.slot())
            .and_then(|s| s.locals.get(&7))
            .and_then(|any| any.downcast_ref::<u32>());
        assert_eq!(parent_value, Some(&1));
    }

    #[test]
    fn teardown_hook_on_closed_scope_fires_immediately() {
        let mut scopes = Arena::new();
        let key = scopes.insert_with(|k| {
            let mut rec = ScopeRecord::new(ScopeId::from_slot(k), None, false);
            rec.state = ScopeState::Closing;
            rec
        });
        let sid = ScopeId::from_slot(key);
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        let mut view = ScopeView {
            scopes: &mut scopes,
            current: sid,
        };
        view.on_teardown(Box::new(move || *flag.borrow_mut() = true));
        assert!(*fired.borrow());
    }
}
