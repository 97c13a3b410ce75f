//! Scope-bound abort signals: the external cancellation bridge.
//!
//! Host APIs that take an abort signal (HTTP clients, fetch-style
//! adapters) can be wired to a scope's lifetime: [`use_abort_signal`]
//! lazily installs an [`AbortController`] in the current scope whose
//! teardown hook fires the signal the moment the scope begins closing.
//! The signal shape mirrors the host convention — `aborted()` flag plus
//! add/remove listener — so adapters can both consume and produce it.

use crate::op::{BoxAny, Node, Op, ABORT_SIGNAL_KEY};
use std::cell::RefCell;
use std::rc::Rc;

struct AbortInner {
    aborted: bool,
    next_key: u64,
    listeners: Vec<(u64, Box<dyn FnOnce()>)>,
}

/// Fires an [`AbortSignal`]. One-shot and idempotent.
pub struct AbortController {
    inner: Rc<RefCell<AbortInner>>,
}

impl AbortController {
    /// Creates a controller in the non-aborted state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AbortInner {
                aborted: false,
                next_key: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// The signal side of this controller.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Fires the signal. Listeners run once, in registration order;
    /// later calls are no-ops.
    pub fn abort(&self) {
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            std::mem::take(&mut inner.listeners)
        };
        for (_, listener) in listeners {
            listener();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.inner.borrow().aborted)
            .finish()
    }
}

/// Key returned by [`AbortSignal::on_abort`], usable to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortListenerKey(u64);

/// Observable side of an [`AbortController`].
pub struct AbortSignal {
    inner: Rc<RefCell<AbortInner>>,
}

impl Clone for AbortSignal {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl AbortSignal {
    /// True once the controller has fired.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Registers a one-shot abort listener.
    ///
    /// If the signal already fired, the listener runs immediately.
    pub fn on_abort(&self, listener: impl FnOnce() + 'static) -> AbortListenerKey {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            drop(inner);
            listener();
            return AbortListenerKey(u64::MAX);
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.listeners.push((key, Box::new(listener)));
        AbortListenerKey(key)
    }

    /// Removes a listener registered with [`AbortSignal::on_abort`].
    pub fn remove_listener(&self, key: AbortListenerKey) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(k, _)| *k != key.0);
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.inner.borrow().aborted)
            .finish()
    }
}

/// Returns the current scope's abort signal, creating it on first use.
///
/// The signal is stored as a scope-local, so nested frames reuse the
/// nearest ancestor's signal; it fires when that scope begins teardown,
/// before any child is halted.
pub fn use_abort_signal() -> Op<AbortSignal> {
    Op::from_node(Node::Scoped(Box::new(|view| {
        if let Some(existing) = view
            .lookup(ABORT_SIGNAL_KEY)
            .and_then(|any| any.downcast_ref::<AbortSignal>())
        {
            return Ok(Box::new(existing.clone()) as BoxAny);
        }
        let controller = AbortController::new();
        let signal = controller.signal();
        view.bind(ABORT_SIGNAL_KEY, Box::new(signal.clone()));
        view.on_teardown(Box::new(move || controller.abort()));
        Ok(Box::new(signal) as BoxAny)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_fires_listeners_once_in_order() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        signal.on_abort(move || a.borrow_mut().push("a"));
        signal.on_abort(move || b.borrow_mut().push("b"));
        controller.abort();
        controller.abort();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(signal.aborted());
    }

    #[test]
    fn removed_listener_does_not_fire() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = log.clone();
        let key = signal.on_abort(move || a.borrow_mut().push("a"));
        signal.remove_listener(key);
        controller.abort();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn late_listener_fires_immediately() {
        let controller = AbortController::new();
        controller.abort();
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        controller.signal().on_abort(move || *flag.borrow_mut() = true);
        assert!(*fired.borrow());
    }
}
