//! Property tests for the runtime's accounting and ordering laws.
//!
//! - Subscription accounting: every send to a live subscription is
//!   delivered exactly once, in order, before the terminal.
//! - Race determinism: with simultaneous completions, the first-listed
//!   arm wins.
//! - Timer ordering: sleepers wake in deadline order, registration
//!   order breaking ties.

use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use taproot::{for_each, race, sleep, spawn, Op, Runtime, Signal};

proptest! {
    #[test]
    fn subscription_delivers_every_send_in_order(
        batches in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 0..8)
    ) {
        let mut rt = Runtime::lab();
        let signal: Signal<u8, ()> = Signal::new();
        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

        let out = seen.clone();
        let task = rt.run(for_each(&signal, move |value| {
            out.borrow_mut().push(value);
            Op::value(())
        }));
        rt.run_until_idle().expect("drive");

        // Interleave host-side sends with drives; deliveries must not
        // depend on when the runtime gets to run.
        let mut sent = Vec::new();
        for batch in &batches {
            for value in batch {
                signal.send(*value);
                sent.push(*value);
            }
            rt.run_until_idle().expect("drive");
        }
        signal.close(());
        rt.run_until_settled(&task).expect("drive");

        prop_assert!(task.take_outcome().expect("settled").is_returned());
        prop_assert_eq!(seen.borrow().clone(), sent);
    }

    #[test]
    fn race_selects_first_listed_on_simultaneous_completion(
        values in prop::collection::vec(any::<u32>(), 1..8)
    ) {
        let mut rt = Runtime::lab();
        let arms: Vec<Op<u32>> = values.iter().map(|v| Op::value(*v)).collect();
        let task = rt.run(race(arms));
        rt.run_until_settled(&task).expect("drive");
        prop_assert_eq!(
            task.take_outcome().expect("settled").returned(),
            Some(values[0])
        );
    }

    #[test]
    fn sleepers_wake_in_deadline_order(
        delays in prop::collection::vec(1u64..50, 1..6)
    ) {
        let mut rt = Runtime::lab();
        let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        let mut op: Op<()> = Op::value(());
        for (index, delay) in delays.iter().copied().enumerate() {
            let out = seen.clone();
            let child = sleep(Duration::from_millis(delay)).map(move |()| {
                out.borrow_mut().push(index);
            });
            op = op.then(move |()| spawn(child).map(|_| ()));
        }
        // The root outlives every sleeper, so all of them complete.
        let task = rt.run(op.then(|()| sleep(Duration::from_millis(100))));
        rt.run_until_settled(&task).expect("drive");

        let mut expected: Vec<usize> = (0..delays.len()).collect();
        expected.sort_by_key(|i| delays[*i]); // stable: ties keep spawn order
        prop_assert_eq!(seen.borrow().clone(), expected);
    }
}
