//! Race combinator: run several operations, first completion wins.
//!
//! Every arm runs in a dedicated child scope owned by an internal driver
//! frame. The first arm to settle with a value or an error decides the
//! race; the driver then tears down, which halts the losing arms in
//! reverse spawn order and drains them before the result surfaces. A
//! race never abandons a loser.
//!
//! Halted arms do not win: the race keeps waiting for the remaining
//! arms. Ties are broken by listing order, because arms are spawned and
//! stepped in listing order.

use crate::error::{Error, ErrorKind};
use crate::op::{call, claim_outcome, spawn_node, unbox, watch_settle, Op};
use crate::task::spawn;
use crate::types::{FrameId, Outcome};

/// Runs `arms` concurrently; the first to return or error wins, and the
/// rest are halted and drained before the winner's result is returned.
pub fn race<T: 'static>(arms: Vec<Op<T>>) -> Op<T> {
    if arms.is_empty() {
        return Op::fail(Error::protocol("race requires at least one arm"));
    }

    // The driver is its own frame so that its inner scope bounds exactly
    // the arms: driver teardown is what cancels the losers.
    let driver = spawn_arms(arms).then(await_winner::<T>);

    spawn(driver)
        .then(|handle| handle.join())
        .then(|outcome| match outcome {
            Outcome::Returned(value) => Op::value(value),
            Outcome::Errored(error) => Op::fail(error),
            Outcome::Halted => Op::fail(Error::new(ErrorKind::Halted)),
        })
}

/// Spawns every arm into the driver's scope, in listing order.
fn spawn_arms<T: 'static>(arms: Vec<Op<T>>) -> Op<Vec<FrameId>> {
    arms.into_iter().fold(Op::value(Vec::new()), |acc, arm| {
        acc.then(move |mut ids| {
            spawn_node(arm.node).map(move |id| {
                ids.push(id);
                ids
            })
        })
    })
}

/// Waits for the first settling arm. Returned and errored arms decide
/// the race; a halted arm merely leaves it.
fn await_winner<T: 'static>(pending: Vec<FrameId>) -> Op<T> {
    watch_settle(pending.clone()).then(move |settled| {
        claim_outcome(settled).then(move |outcome| match outcome {
            Outcome::Returned(any) => Op::value(unbox::<T>(any)),
            Outcome::Errored(error) => Op::fail(error),
            Outcome::Halted => {
                let rest: Vec<FrameId> =
                    pending.into_iter().filter(|id| *id != settled).collect();
                if rest.is_empty() {
                    Op::fail(Error::protocol("every race arm halted"))
                } else {
                    call(move || await_winner(rest))
                }
            }
        })
    })
}
