//! Broadcast channels, signals, and subscriptions.
//!
//! A [`Channel`] fans values out to every attached [`Subscription`]; a
//! [`Signal`] is the same thing with a plain-function `send` so host
//! event handlers can feed the runtime directly. Buffers live on the
//! subscriber, so consumers never contend: a slow subscriber delays only
//! itself. Subscribers see nothing sent before they attached, and a send
//! with no subscribers is dropped silently.
//!
//! A subscription is a FIFO with at most one pending reader. `next`
//! yields [`Next::Item`] per value and a sticky [`Next::Done`] after
//! close; installing a second concurrent reader is a protocol error.
//!
//! Everything here is single-threaded: senders may be called from
//! anywhere on the runtime thread (including inside steps and host
//! callbacks) because waking a reader only enqueues a command on the
//! runtime mailbox.

use crate::error::Error;
use crate::op::{call, wait, AbortHook, Op, Resumer};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// One element of a subscription: a value, or the terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next<T, R> {
    /// A value sent while this subscription was attached.
    Item(T),
    /// The channel closed; repeated on every later `next`.
    Done(R),
}

impl<T, R> Next<T, R> {
    /// Returns the item, if this is `Item`.
    pub fn item(self) -> Option<T> {
        match self {
            Self::Item(value) => Some(value),
            Self::Done(_) => None,
        }
    }

    /// Returns true for `Done`.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

struct SubInner<T, R> {
    buffer: VecDeque<T>,
    terminal: Option<R>,
    waiter: Option<Resumer<Next<T, R>>>,
}

/// A FIFO reader over a channel, with at most one pending `next`.
pub struct Subscription<T, R = ()> {
    inner: Rc<RefCell<SubInner<T, R>>>,
}

impl<T: 'static, R: Clone + 'static> Subscription<T, R> {
    fn new(terminal: Option<R>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SubInner {
                buffer: VecDeque::new(),
                terminal,
                waiter: None,
            })),
        }
    }

    /// Waits for the next element.
    ///
    /// Resolves immediately from the buffer when one is queued; after
    /// close, drains the buffer first and then yields the terminal
    /// forever. Fails with a protocol error if another `next` is already
    /// pending on this subscription.
    pub fn next(&self) -> Op<Next<T, R>> {
        let inner = self.inner.clone();
        wait(move |resumer| {
            let mut sub = inner.borrow_mut();
            if let Some(value) = sub.buffer.pop_front() {
                resumer.resume(Next::Item(value));
                return AbortHook::none();
            }
            if let Some(terminal) = &sub.terminal {
                resumer.resume(Next::Done(terminal.clone()));
                return AbortHook::none();
            }
            if sub.waiter.is_some() {
                resumer.fail(Error::protocol(
                    "subscription already has a pending next()",
                ));
                return AbortHook::none();
            }
            sub.waiter = Some(resumer);
            drop(sub);
            let unpark = inner.clone();
            AbortHook::call(move || {
                unpark.borrow_mut().waiter = None;
            })
        })
    }
}

impl<T, R> std::fmt::Debug for Subscription<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sub = self.inner.borrow();
        f.debug_struct("Subscription")
            .field("buffered", &sub.buffer.len())
            .field("closed", &sub.terminal.is_some())
            .field("has_waiter", &sub.waiter.is_some())
            .finish()
    }
}

/// Anything that can be consumed as a stream of `T` ending in `R`.
///
/// A stream is a recipe: each `subscribe` produces a fresh, independent
/// subscription, and consumers share nothing.
pub trait Stream<T: 'static, R: Clone + 'static> {
    /// Attaches a new subscription.
    fn subscribe(&self) -> Op<Subscription<T, R>>;
}

struct FanoutInner<T, R> {
    subscribers: Vec<Weak<RefCell<SubInner<T, R>>>>,
    terminal: Option<R>,
}

impl<T: Clone + 'static, R: Clone + 'static> FanoutInner<T, R> {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            terminal: None,
        }
    }

    fn attach(&mut self) -> Subscription<T, R> {
        let sub = Subscription::new(self.terminal.clone());
        self.subscribers.push(Rc::downgrade(&sub.inner));
        sub
    }

    /// Fans `value` out to every live subscriber. Dropped subscribers
    /// are pruned; a closed fanout drops the value silently.
    fn deliver(&mut self, value: &T) {
        if self.terminal.is_some() {
            return;
        }
        self.subscribers.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                let mut sub = inner.borrow_mut();
                if let Some(waiter) = sub.waiter.take() {
                    waiter.resume(Next::Item(value.clone()));
                } else {
                    sub.buffer.push_back(value.clone());
                }
                true
            }
            None => false,
        });
    }

    fn close(&mut self, terminal: &R) {
        if self.terminal.is_some() {
            return;
        }
        self.terminal = Some(terminal.clone());
        self.subscribers.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                let mut sub = inner.borrow_mut();
                sub.terminal = Some(terminal.clone());
                if let Some(waiter) = sub.waiter.take() {
                    waiter.resume(Next::Done(terminal.clone()));
                }
                true
            }
            None => false,
        });
    }
}

/// Multi-subscriber broadcast point whose `send` and `close` are
/// operations.
pub struct Channel<T, R = ()> {
    inner: Rc<RefCell<FanoutInner<T, R>>>,
}

impl<T, R> Clone for Channel<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Channel<T, R> {
    /// Creates a channel with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FanoutInner::new())),
        }
    }

    /// Enqueues `value` into every currently-attached subscription.
    pub fn send(&self, value: T) -> Op<()> {
        let inner = self.inner.clone();
        call(move || {
            inner.borrow_mut().deliver(&value);
            Op::value(())
        })
    }

    /// Closes the channel: every subscription (current and future) ends
    /// with `terminal` once its buffer drains.
    pub fn close(&self, terminal: R) -> Op<()> {
        let inner = self.inner.clone();
        call(move || {
            inner.borrow_mut().close(&terminal);
            Op::value(())
        })
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Default for Channel<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Stream<T, R> for Channel<T, R> {
    fn subscribe(&self) -> Op<Subscription<T, R>> {
        let inner = self.inner.clone();
        call(move || Op::value(inner.borrow_mut().attach()))
    }
}

impl<T, R> std::fmt::Debug for Channel<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.terminal.is_some())
            .finish()
    }
}

/// A channel whose `send` and `close` are plain synchronous functions.
///
/// This is the bridge for external event handlers: wire `send` straight
/// into a host callback. Buffering semantics are identical to
/// [`Channel`].
pub struct Signal<T, R = ()> {
    inner: Rc<RefCell<FanoutInner<T, R>>>,
}

impl<T, R> Clone for Signal<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Signal<T, R> {
    /// Creates a signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FanoutInner::new())),
        }
    }

    /// Enqueues `value` into every attached subscription.
    pub fn send(&self, value: T) {
        self.inner.borrow_mut().deliver(&value);
    }

    /// Closes the signal with `terminal`.
    pub fn close(&self, terminal: R) {
        self.inner.borrow_mut().close(&terminal);
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Default for Signal<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static, R: Clone + 'static> Stream<T, R> for Signal<T, R> {
    fn subscribe(&self) -> Op<Subscription<T, R>> {
        let inner = self.inner.clone();
        call(move || Op::value(inner.borrow_mut().attach()))
    }
}

impl<T, R> std::fmt::Debug for Signal<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Signal")
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.terminal.is_some())
            .finish()
    }
}

/// Consumes a stream one element at a time with inherent back-pressure:
/// the next element is not read until `body`'s operation for the
/// previous one has settled. Returns the stream's terminal value, which
/// is never passed to `body`.
pub fn for_each<T, R, S, F>(stream: &S, body: F) -> Op<R>
where
    T: 'static,
    R: Clone + 'static,
    S: Stream<T, R> + ?Sized,
    F: FnMut(T) -> Op<()> + 'static,
{
    stream.subscribe().then(move |sub| drain(sub, body))
}

fn drain<T, R, F>(sub: Subscription<T, R>, mut body: F) -> Op<R>
where
    T: 'static,
    R: Clone + 'static,
    F: FnMut(T) -> Op<()> + 'static,
{
    sub.next().then(move |next| match next {
        Next::Item(value) => {
            let step = body(value);
            step.then(move |()| call(move || drain(sub, body)))
        }
        Next::Done(terminal) => Op::value(terminal),
    })
}
