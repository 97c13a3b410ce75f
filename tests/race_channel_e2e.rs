//! End-to-end tests for the race combinator and the channel family.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use taproot::{
    for_each, race, sleep, spawn, Channel, Error, Next, Op, Runtime, Signal, Stream,
    Subscription,
};

#[test]
fn race_returns_winner_and_cancels_loser() {
    let mut rt = Runtime::lab();
    let task = rt.run(race(vec![
        sleep(Duration::from_millis(10)).map(|()| 1u32),
        sleep(Duration::from_millis(1000)).map(|()| 2u32),
    ]));
    rt.run_until_settled(&task).expect("drive");

    assert_eq!(task.take_outcome().expect("settled").returned(), Some(1));
    // The loser's timer was cancelled when it was halted: the settle
    // loop never had to advance toward the 1000ms deadline.
    assert_eq!(rt.now().as_millis(), 10);
    assert_eq!(rt.live_frames(), 0);
}

#[test]
fn race_error_wins_and_surfaces() {
    let mut rt = Runtime::lab();
    let task = rt.run(race(vec![
        sleep(Duration::from_millis(10)).then(|()| Op::<u32>::fail(Error::msg("arm failed"))),
        sleep(Duration::from_millis(1000)).map(|()| 2u32),
    ]));
    rt.run_until_settled(&task).expect("drive");

    let error = task
        .take_outcome()
        .expect("settled")
        .errored()
        .expect("error arm wins");
    assert_eq!(error.context(), Some("arm failed"));
    assert_eq!(rt.live_frames(), 0);
}

#[test]
fn race_ties_break_by_listing_order() {
    let mut rt = Runtime::lab();
    let task = rt.run(race(vec![
        Op::value("first"),
        Op::value("second"),
        Op::value("third"),
    ]));
    rt.run_until_settled(&task).expect("drive");
    assert_eq!(
        task.take_outcome().expect("settled").returned(),
        Some("first")
    );
}

#[test]
fn timeout_is_a_race_against_sleep() {
    let mut rt = Runtime::lab();
    let task = rt.run(race(vec![
        sleep(Duration::from_millis(5000)).map(|()| Some("slow work")),
        sleep(Duration::from_millis(100)).map(|()| None),
    ]));
    rt.run_until_settled(&task).expect("drive");
    assert_eq!(task.take_outcome().expect("settled").returned(), Some(None));
    assert_eq!(rt.now().as_millis(), 100);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SendCount {
    count: u32,
}

fn read3<T: 'static, R: Clone + 'static>(
    sub: Subscription<T, R>,
    out: Rc<RefCell<Vec<Next<T, R>>>>,
) -> Op<()> {
    let out_a = out.clone();
    sub.next().then(move |first| {
        out_a.borrow_mut().push(first);
        let out_b = out.clone();
        sub.next().then(move |second| {
            out_b.borrow_mut().push(second);
            sub.next().then(move |third| {
                out.borrow_mut().push(third);
                Op::value(())
            })
        })
    })
}

#[test]
fn subscription_buffers_across_sends() {
    let mut rt = Runtime::lab();
    let channel: Channel<&'static str, SendCount> = Channel::new();
    let seen: Rc<RefCell<Vec<Next<&'static str, SendCount>>>> = Rc::new(RefCell::new(Vec::new()));

    let sender = channel.clone();
    let results = seen.clone();
    let task = rt.run(channel.subscribe().then(move |sub| {
        let step2 = sender.clone();
        let step3 = sender.clone();
        spawn(
            sender
                .send("hello")
                .then(|()| sleep(Duration::from_millis(1000)))
                .then(move |()| step2.send("world"))
                .then(move |()| step3.close(SendCount { count: 2 })),
        )
        .then(move |_sender| read3(sub, results))
    }));
    rt.run_until_settled(&task).expect("drive");

    assert!(task.take_outcome().expect("settled").is_returned());
    assert_eq!(
        *seen.borrow(),
        vec![
            Next::Item("hello"),
            Next::Item("world"),
            Next::Done(SendCount { count: 2 }),
        ]
    );
}

#[test]
fn terminal_result_is_sticky() {
    let mut rt = Runtime::lab();
    let channel: Channel<u8, &'static str> = Channel::new();
    let sender = channel.clone();
    let task = rt.run(channel.subscribe().then(move |sub| {
        sender.close("done").then(move |()| {
            sub.next()
                .then(move |first| sub.next().map(move |second| (first, second)))
        })
    }));
    rt.run_until_settled(&task).expect("drive");
    let (first, second) = task
        .take_outcome()
        .expect("settled")
        .returned()
        .expect("reads succeed");
    assert_eq!(first, Next::Done("done"));
    assert_eq!(second, Next::Done("done"));
}

#[test]
fn sends_before_subscription_are_dropped() {
    let mut rt = Runtime::lab();
    let channel: Channel<u8, ()> = Channel::new();
    let late = channel.clone();
    let closer = channel.clone();
    let task = rt.run(
        channel
            .send(1)
            .then(move |()| late.subscribe())
            .then(move |sub| closer.close(()).then(move |()| sub.next())),
    );
    rt.run_until_settled(&task).expect("drive");
    let next = task
        .take_outcome()
        .expect("settled")
        .returned()
        .expect("read succeeds");
    assert_eq!(next, Next::Done(()), "pre-subscription send must not replay");
}

#[test]
fn concurrent_next_calls_are_a_protocol_error() {
    let mut rt = Runtime::lab();
    let channel: Channel<u8, ()> = Channel::new();
    let task = rt.run(channel.subscribe().then(|sub| {
        let first = sub.next();
        let second = sub.next();
        // Park the first reader in a child, then try to read again.
        spawn(first.map(|_| ())).then(move |_reader| second.map(|_| ()))
    }));
    rt.run_until_settled(&task).expect("drive");
    let error = task
        .take_outcome()
        .expect("settled")
        .errored()
        .expect("second reader must fail");
    assert_eq!(error.kind(), taproot::ErrorKind::Protocol);
}

#[test]
fn signal_feeds_runtime_from_outside() {
    let mut rt = Runtime::lab();
    let signal: Signal<u32, &'static str> = Signal::new();
    let seen: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let out = seen.clone();
    let task = rt.run(for_each(&signal, move |value| {
        out.borrow_mut().push(value);
        Op::value(())
    }));

    // Attach the subscriber, then fire the signal like a host event
    // handler would: plain function calls between drives.
    rt.run_until_idle().expect("drive");
    signal.send(1);
    signal.send(2);
    rt.run_until_idle().expect("drive");
    signal.send(3);
    signal.close("closed");
    rt.run_until_settled(&task).expect("drive");

    assert_eq!(
        task.take_outcome().expect("settled").returned(),
        Some("closed")
    );
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}
