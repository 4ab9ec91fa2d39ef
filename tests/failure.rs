mod common;

use common::{delayed, init_test_logging, secs};
use cotask::{CancelReason, Dispatcher, Error, Runtime, TaskState};
use futures::FutureExt;
use futures::future;

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
#[error("sensor offline")]
struct SensorOffline;

#[test]
fn test_failure_cancels_siblings() {
    init_test_logging();
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let outcome = scope
            .structured(|inner| async move {
                let slow = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 5, 1));
                let failing = inner.spawn(Dispatcher::Default, {
                    let inner = inner.clone();
                    async move {
                        inner.delay(secs(1)).await;
                        Err::<u32, _>(SensorOffline)
                    }
                });

                let total = slow.value().await? + failing.value().await?;
                Ok::<_, Error>(total)
            })
            .await;
        Ok::<_, Error>((outcome, scope.now()))
    });

    let (outcome, now) = result.unwrap();
    let err = outcome.unwrap_err();
    assert!(err.is_failure());
    assert!(err.to_string().contains("sensor offline"));
    assert_eq!(now, secs(1), "Siblings are cancelled at the failure instant");
}

#[test]
fn test_first_failure_surfaces_through_run_blocking() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let sibling = scope.spawn(Dispatcher::Default, delayed(scope.clone(), 3, ()));
        let _failing = scope.spawn(Dispatcher::Default, {
            let scope = scope.clone();
            async move {
                scope.delay(secs(2)).await;
                Err::<(), _>(SensorOffline)
            }
        });

        sibling.join().await?;
        Ok::<_, Error>("unreachable")
    });

    let err = result.unwrap_err();
    assert!(matches!(err, Error::TaskFailed { .. }));
    assert_eq!(err.task().as_u64(), 3, "The failing child is reported, not the root");
    assert_eq!(rt.now(), secs(2));
}

#[test]
fn test_cancelled_sibling_reports_fail_fast() {
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let mut sibling = None;
        let outcome = scope
            .structured(|inner| {
                sibling = Some(inner.spawn(Dispatcher::Default, delayed(inner.clone(), 4, ())));
                let inner = inner.clone();
                async move {
                    inner.delay(secs(1)).await;
                    Err::<(), _>(SensorOffline)
                }
            })
            .await;

        let sibling = sibling.expect("sibling spawned by the driver");
        Ok::<_, Error>((outcome, sibling.join().await))
    });

    let (outcome, sibling) = result.unwrap();
    assert!(outcome.unwrap_err().is_failure(), "Driver error becomes the scope failure");
    assert!(matches!(
        sibling,
        Err(Error::Cancelled {
            reason: CancelReason::FailFast,
            ..
        })
    ));
    assert_eq!(rt.now(), secs(1));
}

#[test]
fn test_panicking_task_fails() {
    init_test_logging();
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let child = scope.clone();
        let handle = scope.spawn(Dispatcher::Default, async move {
            child.delay(secs(1)).await;
            let reading: Option<u8> = None;
            Ok::<_, Error>(reading.expect("no readings"))
        });
        handle.value().await
    });

    let err = result.unwrap_err();
    assert!(err.is_failure());
    assert!(err.to_string().contains("no readings"));
}

#[test]
fn test_stalled_run_is_reported() {
    init_test_logging();
    let mut rt = Runtime::new();

    let result = rt.run_blocking(|scope| async move {
        let stuck = scope.spawn(Dispatcher::Default, async {
            futures::future::pending::<()>().await;
            Ok::<_, Error>(())
        });
        stuck.join().await
    });

    assert!(matches!(result, Err(Error::Stalled { .. })));
    assert_eq!(rt.live_tasks(), 0, "Stalled tasks are cancelled and dropped");
}

#[test]
fn test_stalled_run_cancels_nested_scopes() {
    let mut rt = Runtime::new();
    let deep = Rc::new(RefCell::new(None));

    let slot = deep.clone();
    let result = rt.run_blocking(move |scope| async move {
        let outer = scope.clone();
        let nested = scope.spawn(Dispatcher::Default, async move {
            outer
                .structured(|inner| {
                    let grandchild = inner.spawn(Dispatcher::Default, async {
                        future::pending::<()>().await;
                        Ok::<_, Error>(())
                    });
                    *slot.borrow_mut() = Some(grandchild);
                    future::pending::<Result<(), Error>>()
                })
                .await
        });
        nested.join().await
    });

    assert!(matches!(result, Err(Error::Stalled { .. })));
    let deep = deep.borrow_mut().take().expect("grandchild spawned");
    assert_eq!(deep.state(), TaskState::Cancelled);
    assert_eq!(rt.live_tasks(), 0);
}

#[test]
fn test_fail_fast_reaches_grandchildren() {
    init_test_logging();
    let mut rt = Runtime::builder().default_workers(1).build();
    let deep = Rc::new(RefCell::new(None));

    let slot = deep.clone();
    let result = rt.run_blocking(move |scope| async move {
        let outer = scope.clone();
        let _nested = scope.spawn(Dispatcher::Default, async move {
            outer
                .structured(|inner| {
                    let grandchild = inner.spawn(Dispatcher::Default, delayed(inner.clone(), 5, ()));
                    *slot.borrow_mut() = Some(grandchild);
                    future::pending::<Result<(), Error>>()
                })
                .await
        });

        let sibling = scope.clone();
        let _failing = scope.spawn(Dispatcher::Default, async move {
            sibling.delay(secs(1)).await;
            Err::<(), _>(SensorOffline)
        });

        future::pending::<()>().await;
        Ok::<_, Error>(())
    });

    let err = result.unwrap_err();
    assert!(err.is_failure());
    let deep = deep.borrow_mut().take().expect("grandchild spawned");
    assert!(matches!(
        deep.join().now_or_never(),
        Some(Err(Error::Cancelled {
            reason: CancelReason::ParentCancelled,
            ..
        }))
    ));
    assert_eq!(rt.live_tasks(), 0, "Every descendant is terminal when the run returns");
    assert_eq!(rt.now(), secs(1));
}

#[test]
fn test_failed_state_is_terminal() {
    let mut rt = Runtime::new();
    let global = rt.global();

    let handle = global.spawn(Dispatcher::Main, {
        let global = global.clone();
        async move {
            global.delay(secs(1)).await;
            Err::<(), _>(SensorOffline)
        }
    });
    assert_eq!(handle.state(), TaskState::Created);

    rt.run_until_idle();

    assert_eq!(handle.state(), TaskState::Failed);
    assert!(!handle.cancel(), "Terminal tasks cannot be cancelled");
    assert_eq!(handle.state(), TaskState::Failed);
    assert!(futures::executor::block_on(handle.join()).unwrap_err().is_failure());
}

#[test]
fn test_error_messages() {
    let mut rt = Runtime::new();

    let err = rt
        .run_blocking(|scope| async move {
            let handle = scope.spawn(Dispatcher::Default, async { Ok::<_, Error>(5u8) });
            handle.take().await?;
            handle.take().await
        })
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InvalidState {
            state: TaskState::Completed,
            ..
        }
    ));
    assert!(err.to_string().starts_with("cannot take the value of task#2"));
}
