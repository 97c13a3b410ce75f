//! Halt semantics, detached scopes, scope-locals, and the abort-signal
//! bridge.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use taproot::{
    call, ensure, ensure_with, provide, resource, sleep, spawn, suspend, use_abort_signal,
    Error, Op, Runtime, ScopeKey,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn halt_is_idempotent() {
    let mut rt = Runtime::lab();
    let released = Rc::new(RefCell::new(0u32));
    let flag = released.clone();
    let task = rt.run(ensure(move || *flag.borrow_mut() += 1).then(|()| suspend::<()>()));
    rt.run_until_idle().expect("drive");

    task.halt();
    task.halt();
    rt.run_until_settled(&task).expect("drive");
    task.halt();
    rt.run_until_idle().expect("drive");

    assert!(task.take_outcome().expect("settled").is_halted());
    assert_eq!(*released.borrow(), 1, "cleanup must run exactly once");
    assert_eq!(rt.live_frames(), 0);
}

#[test]
fn halt_tears_down_children_in_reverse_admission_order() {
    let mut rt = Runtime::lab();
    let order = log::<&'static str>();

    let (one, two) = (order.clone(), order.clone());
    let task = rt.run(
        spawn(ensure(move || one.borrow_mut().push("one")).then(|()| suspend::<()>()))
            .then(move |_first| {
                spawn(ensure(move || two.borrow_mut().push("two")).then(|()| suspend::<()>()))
            })
            .then(|_second| suspend::<()>()),
    );
    rt.run_until_idle().expect("drive");

    task.halt();
    rt.run_until_settled(&task).expect("drive");

    assert!(task.take_outcome().expect("settled").is_halted());
    assert_eq!(*order.borrow(), vec!["two", "one"]);
    assert_eq!(rt.live_frames(), 0, "halt must settle to quiescence");
    assert_eq!(rt.live_scopes(), 0);
}

#[test]
fn cleanups_may_suspend_and_are_never_aborted() {
    let mut rt = Runtime::lab();
    let slept = Rc::new(RefCell::new(false));
    let flag = slept.clone();
    let task = rt.run(
        ensure_with(move || {
            sleep(Duration::from_millis(50)).map(move |()| {
                *flag.borrow_mut() = true;
            })
        })
        .then(|()| suspend::<()>()),
    );
    rt.run_until_idle().expect("drive");

    task.halt();
    rt.run_until_settled(&task).expect("drive");

    assert!(task.take_outcome().expect("settled").is_halted());
    assert!(*slept.borrow(), "suspending cleanup ran to completion");
    assert!(rt.now().as_millis() >= 50);
}

#[test]
fn halting_a_child_individually_leaves_siblings_running() {
    let mut rt = Runtime::lab();
    let order = log::<&'static str>();

    let (kept, dropped) = (order.clone(), order.clone());
    let task = rt.run(
        spawn(ensure(move || kept.borrow_mut().push("kept")).then(|()| suspend::<u32>()))
            .then(move |_keeper| {
                spawn(
                    ensure(move || dropped.borrow_mut().push("dropped"))
                        .then(|()| suspend::<u32>()),
                )
            })
            .then(|second| second.halt().then(move |()| second.join()))
            .then(|halted| {
                assert!(halted.is_halted(), "parent sees halt as a normal state");
                sleep(Duration::from_millis(5))
            }),
    );
    rt.run_until_settled(&task).expect("drive");

    assert!(task.take_outcome().expect("settled").is_returned());
    // The individually-halted child cleaned up first; the survivor only
    // tore down when the parent finished.
    assert_eq!(*order.borrow(), vec!["dropped", "kept"]);
    assert_eq!(rt.live_frames(), 0);
}

fn counted(count: Log<u32>) -> Op<u32> {
    resource(call(move || {
        ensure(move || count.borrow_mut().push(1)).then(|()| provide(7u32))
    }))
}

#[test]
fn resource_cleanup_runs_exactly_once_per_acquisition() {
    let mut rt = Runtime::lab();
    let releases = log::<u32>();

    for _ in 0..2 {
        let counter = releases.clone();
        let task = rt.run(counted(counter).then(|value| {
            assert_eq!(value, 7);
            Op::value(())
        }));
        rt.run_until_settled(&task).expect("drive");
        assert!(task.take_outcome().expect("settled").is_returned());
    }
    assert_eq!(releases.borrow().len(), 2);
}

#[test]
fn detached_scope_destroys_in_reverse_order() {
    let mut rt = Runtime::lab();
    let order = log::<&'static str>();
    let (scope, destroyer) = rt.create_scope();

    let one = order.clone();
    let first = scope
        .run(
            &mut rt,
            ensure(move || one.borrow_mut().push("one")).then(|()| suspend::<()>()),
        )
        .expect("admit first");
    let two = order.clone();
    let second = scope
        .run(
            &mut rt,
            ensure(move || two.borrow_mut().push("two")).then(|()| suspend::<()>()),
        )
        .expect("admit second");
    rt.run_until_idle().expect("drive");

    destroyer.destroy(&mut rt).expect("clean destroy");

    assert_eq!(*order.borrow(), vec!["two", "one"]);
    assert!(first.take_outcome().expect("settled").is_halted());
    assert!(second.take_outcome().expect("settled").is_halted());
    assert_eq!(rt.live_frames(), 0);
    assert_eq!(rt.live_scopes(), 0);
}

#[test]
fn detached_scope_surfaces_child_errors_on_destroy() {
    let mut rt = Runtime::lab();
    let (scope, destroyer) = rt.create_scope();

    let survivor = scope
        .run(&mut rt, suspend::<()>())
        .expect("admit survivor");
    let _failing = scope
        .run(&mut rt, Op::<()>::fail(Error::msg("bad")))
        .expect("admit failing");
    rt.run_until_idle().expect("drive");

    // The failure already collapsed the scope: the survivor was halted
    // and further admission is refused.
    assert!(survivor.take_outcome().expect("settled").is_halted());
    let refused = scope.run(&mut rt, Op::value(())).expect_err("scope closed");
    assert!(refused.is_scope_closed());

    let error = destroyer.destroy(&mut rt).expect_err("error is reported");
    assert_eq!(error.context(), Some("bad"));
}

#[test]
fn abort_signal_fires_when_the_scope_begins_teardown() {
    let mut rt = Runtime::lab();
    let order = log::<&'static str>();

    let on_abort = order.clone();
    let on_cleanup = order.clone();
    let task = rt.run(use_abort_signal().then(move |signal| {
        assert!(!signal.aborted());
        signal.on_abort(move || on_abort.borrow_mut().push("abort"));
        spawn(
            ensure(move || on_cleanup.borrow_mut().push("child")).then(|()| suspend::<()>()),
        )
        .then(|_child| suspend::<()>())
    }));
    rt.run_until_idle().expect("drive");
    assert!(order.borrow().is_empty());

    task.halt();
    rt.run_until_settled(&task).expect("drive");

    assert!(task.take_outcome().expect("settled").is_halted());
    // The signal fires the moment the scope starts closing, before any
    // child is halted.
    assert_eq!(*order.borrow(), vec!["abort", "child"]);
}

#[test]
fn scope_locals_inherit_and_shadow() {
    let key: ScopeKey<u32> = ScopeKey::new("depth");
    let mut rt = Runtime::lab();
    let task = rt.run(key.set(1).then(move |()| {
        spawn(key.get().then(move |inherited| {
            key.set(2)
                .then(move |()| key.get())
                .map(move |shadowed| (inherited, shadowed))
        }))
        .then(|child| child.join())
        .then(move |child| key.get().map(move |root_view| (child, root_view)))
    }));
    rt.run_until_settled(&task).expect("drive");

    let (child, root_view) = task
        .take_outcome()
        .expect("settled")
        .returned()
        .expect("returns");
    assert_eq!(child.returned(), Some((Some(1), Some(2))));
    assert_eq!(root_view, Some(1), "child bindings do not leak upward");
}

#[test]
fn require_fails_on_unbound_key() {
    let key: ScopeKey<u32> = ScopeKey::new("missing");
    let mut rt = Runtime::lab();
    let task = rt.run(key.require());
    rt.run_until_settled(&task).expect("drive");
    let error = task
        .take_outcome()
        .expect("settled")
        .errored()
        .expect("unbound key fails");
    assert_eq!(error.kind(), taproot::ErrorKind::Protocol);
}

#[test]
fn provide_outside_a_resource_body_is_a_protocol_error() {
    let mut rt = Runtime::lab();
    let task = rt.run(provide(1u32));
    rt.run_until_settled(&task).expect("drive");
    let error = task
        .take_outcome()
        .expect("settled")
        .errored()
        .expect("must fail");
    assert_eq!(error.kind(), taproot::ErrorKind::Protocol);
}
