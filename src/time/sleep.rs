//! Sleeping.

use crate::op::{AbortAction, Node, Op};
use std::time::Duration;

/// Parks the current frame for `duration`.
///
/// The deadline registers with the runtime's timer driver; halting the
/// frame while it sleeps cancels the timer, so a halted sleep never
/// fires. Timeouts are expressed by racing an operation against a sleep;
/// there is no separate timeout primitive.
pub fn sleep(duration: Duration) -> Op<()> {
    Op::from_node(Node::Wait(Box::new(move |cx| {
        let key = cx.schedule_timer(duration);
        AbortAction::CancelTimer(key)
    })))
}
