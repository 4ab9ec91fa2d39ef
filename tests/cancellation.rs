mod common;

use common::{delayed, init_test_logging, secs};
use cotask::{CancelReason, Dispatcher, Error, Runtime, TaskState};

use futures::future;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn test_cancel_before_children_suspend() {
    init_test_logging();
    let mut rt = Runtime::new();
    let completed = Rc::new(Cell::new(0));

    let counter = completed.clone();
    let outcome = rt.run_blocking(move |scope| async move {
        let mut handles = Vec::new();
        let result = scope
            .structured(|inner| {
                for n in 0..3 {
                    let counter = counter.clone();
                    let child = inner.clone();
                    handles.push(inner.spawn(Dispatcher::Default, async move {
                        child.delay(secs(1)).await;
                        counter.set(counter.get() + 1);
                        Ok::<_, Error>(n)
                    }));
                }
                assert_eq!(inner.cancel(), 3);
                async { Ok::<_, Error>(()) }
            })
            .await;

        let states: Vec<_> = handles.iter().map(|h| h.state()).collect();
        Ok::<_, Error>((result, states))
    });

    let (result, states) = outcome.unwrap();
    assert!(matches!(
        result,
        Err(Error::Cancelled {
            reason: CancelReason::Requested,
            ..
        })
    ));
    assert_eq!(states, vec![TaskState::Cancelled; 3]);
    assert_eq!(completed.get(), 0, "No child may complete");
    assert_eq!(rt.now(), secs(0));
}

#[test]
fn test_cancel_after_completion_is_a_no_op() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        scope
            .structured(|inner| async move {
                let a = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 1, 1));
                let b = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 2, 2));
                let sum = a.value().await? + b.value().await?;

                assert_eq!(inner.cancel(), 0, "Nothing left to cancel");
                assert_eq!(a.state(), TaskState::Completed);
                Ok::<_, Error>(sum)
            })
            .await
    });

    assert_eq!(result.unwrap(), 3);
    assert_eq!(rt.now(), secs(2));
}

#[test]
fn test_cancel_after_child_cancelled_by_handle_is_a_no_op() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        scope
            .structured(|inner| async move {
                let a = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 1, 1));
                let b = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 5, 2));

                assert!(b.cancel());
                assert!(b.join().await.unwrap_err().is_cancelled());
                let a = a.value().await?;

                assert_eq!(inner.live_tasks(), 0);
                assert_eq!(inner.cancel(), 0, "Nothing left to cancel");
                Ok::<_, Error>(a)
            })
            .await
    });

    assert_eq!(result.unwrap(), 1, "Only the scope's own cancellation ends it as cancelled");
    assert_eq!(rt.now(), secs(1));
}

#[test]
fn test_cancel_single_suspended_task() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let slow = scope.spawn(Dispatcher::Default, delayed(scope.clone(), 10, "slow"));
        let fast = scope.spawn(Dispatcher::Default, delayed(scope.clone(), 1, "fast"));

        let fast = fast.value().await?;
        assert!(slow.cancel());
        assert!(!slow.cancel(), "Second request is ignored");

        let err = slow.value().await.unwrap_err();
        Ok::<_, Error>((fast, err))
    });

    let (fast, err) = result.unwrap();
    assert_eq!(fast, "fast");
    assert!(matches!(
        err,
        Error::Cancelled {
            reason: CancelReason::Requested,
            ..
        }
    ));
    assert_eq!(rt.now(), secs(1), "Cancelled delay does not hold the clock");
}

#[test]
fn test_cancellation_is_transitive() {
    init_test_logging();
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let outer = scope.clone();
        let nested = scope.spawn(Dispatcher::Default, async move {
            outer
                .structured(|inner| async move {
                    let deep = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 5, ()));
                    deep.join().await
                })
                .await
        });

        scope.delay(secs(1)).await;
        assert!(nested.cancel());
        Ok::<_, Error>(nested.join().await.unwrap_err())
    });

    let err = result.unwrap();
    assert!(err.is_cancelled());
    assert_eq!(rt.now(), secs(1));
    assert_eq!(rt.live_tasks(), 0);
}

#[test]
fn test_run_waits_for_cancelled_grandchildren() {
    init_test_logging();
    let mut rt = Runtime::new();
    let deep = Rc::new(RefCell::new(None));

    let slot = deep.clone();
    let result = rt.run_blocking(move |scope| async move {
        let outer = scope.clone();
        let nested = scope.spawn(Dispatcher::Default, async move {
            outer
                .structured(|inner| {
                    let grandchild = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 5, ()));
                    *slot.borrow_mut() = Some(grandchild);
                    future::pending::<Result<(), Error>>()
                })
                .await
        });

        scope.delay(secs(1)).await;
        assert!(nested.cancel());
        Ok::<_, Error>(())
    });

    assert!(result.is_ok(), "Cancelling a handle does not cancel the root scope");
    let deep = deep.borrow_mut().take().expect("grandchild spawned");
    assert_eq!(deep.state(), TaskState::Cancelled, "Grandchild is stopped before the run returns");
    assert_eq!(rt.live_tasks(), 0);
    assert_eq!(rt.now(), secs(1));
}

#[test]
fn test_spawn_into_cancelled_scope() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        scope
            .structured(|inner| async move {
                inner.cancel();
                assert!(inner.is_cancelled());

                let late = inner.spawn(Dispatcher::Default, async { Ok::<_, Error>(1) });
                assert_eq!(late.state(), TaskState::Cancelled);
                Ok::<_, Error>(())
            })
            .await
    });

    assert!(matches!(result, Err(Error::Cancelled { .. })));
}

#[test]
fn test_cancelling_root_scope_ends_run() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let _child = scope.spawn(Dispatcher::Default, delayed(scope.clone(), 3, ()));
        scope.cancel();
        scope.delay(secs(1)).await;
        Ok::<_, Error>(())
    });

    assert!(matches!(
        result,
        Err(Error::Cancelled {
            reason: CancelReason::Requested,
            ..
        })
    ));
    assert_eq!(rt.now(), secs(0));
}
