//! Parent/child cancellation behavior.

use cancelkit::utils::logging::init_test_logging;
use cancelkit::{
    CancelError, CancelReason, Operation, OperationRegistry, OperationStatus, RegistryConfig,
    RunError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_registry() -> OperationRegistry {
    OperationRegistry::new(RegistryConfig::default())
}

#[tokio::test]
async fn parent_cancel_reaches_both_children() {
    init_test_logging();
    let registry = test_registry();
    let parent = Operation::builder()
        .name("p")
        .registry(&registry)
        .build();

    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel("p-stop").await;
    });

    let c1_handle = Operation::builder()
        .name("c1")
        .parent(&parent)
        .registry(&registry)
        .build();
    let c2_handle = Operation::builder()
        .name("c2")
        .parent(&parent)
        .registry(&registry)
        .build();

    let c1 = c1_handle.clone();
    let c2 = c2_handle.clone();
    let result: Result<(), RunError<CancelError>> = parent
        .run(async move {
            let _ = futures::join!(
                c1.run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), CancelError>(())
                }),
                c2.run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), CancelError>(())
                }),
            );
            Ok(())
        })
        .await;

    assert!(result.is_err());
    assert_eq!(parent.status(), OperationStatus::Cancelled);
    assert_eq!(parent.reason(), Some(CancelReason::Manual));
    assert_eq!(parent.message().as_deref(), Some("p-stop"));

    assert_eq!(c1_handle.status(), OperationStatus::Cancelled);
    assert_eq!(c1_handle.reason(), Some(CancelReason::Parent));
    assert_eq!(c2_handle.status(), OperationStatus::Cancelled);
    assert_eq!(c2_handle.reason(), Some(CancelReason::Parent));

    // All three are out of the active registry once the parent has exited.
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.history().len(), 3);
}

#[tokio::test]
async fn child_exit_unlinks_from_parent() {
    init_test_logging();
    let registry = test_registry();
    let parent = Operation::builder()
        .name("parent")
        .registry(&registry)
        .build();

    let registry_body = registry.clone();
    let parent_body = parent.clone();
    let result: Result<(), RunError<CancelError>> = parent
        .run(async move {
            let child = Operation::builder()
                .name("quick-child")
                .parent(&parent_body)
                .registry(&registry_body)
                .build();
            child.run(async { Ok::<(), CancelError>(()) }).await.unwrap();
            assert!(parent_body.children().is_empty());
            Ok(())
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(parent.status(), OperationStatus::Completed);
}

#[tokio::test]
async fn registry_lists_children_while_running() {
    init_test_logging();
    let registry = test_registry();
    let parent = Operation::builder()
        .name("listing-parent")
        .id("lp-1")
        .registry(&registry)
        .build();

    let registry_body = registry.clone();
    let parent_body = parent.clone();
    let _: Result<(), RunError<CancelError>> = parent
        .run(async move {
            let child = Operation::builder()
                .name("listed-child")
                .parent(&parent_body)
                .registry(&registry_body)
                .build();
            let registry_inner = registry_body.clone();
            child
                .run(async move {
                    let children = registry_inner.get_children("lp-1");
                    assert_eq!(children.len(), 1);
                    assert_eq!(children[0].name.as_deref(), Some("listed-child"));
                    Ok::<(), CancelError>(())
                })
                .await
                .unwrap();
            Ok(())
        })
        .await;
}

#[tokio::test]
async fn shielded_child_finishes_its_section_before_observing_cancel() {
    init_test_logging();
    let registry = test_registry();
    let op = Operation::builder()
        .name("shielded")
        .registry(&registry)
        .build();

    let shield_completed = Arc::new(AtomicBool::new(false));

    let canceller = op.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel("interrupt").await;
    });

    let body_op = op.clone();
    let completed = shield_completed.clone();
    let result: Result<(), RunError<CancelError>> = op
        .run(async move {
            {
                let _guard = body_op.shield();
                assert_eq!(body_op.status(), OperationStatus::Shielded);
                // Cancellation arrives mid-sleep but is held off by the guard.
                tokio::time::sleep(Duration::from_millis(120)).await;
                // The fired token stays visible for voluntary observation.
                assert!(body_op.token().check().is_err());
                completed.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

    assert!(result.is_err());
    assert!(
        shield_completed.load(Ordering::SeqCst),
        "the shielded section must run to completion"
    );
    assert_eq!(op.status(), OperationStatus::Cancelled);
}

#[tokio::test]
async fn shutdown_budget_bounds_the_wait_for_stuck_children() {
    init_test_logging();
    let registry = test_registry();
    let parent = Operation::builder()
        .name("impatient-parent")
        .shutdown_budget(Duration::from_millis(100))
        .registry(&registry)
        .build();

    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel("shutdown").await;
    });

    let parent_body = parent.clone();
    let registry_body = registry.clone();
    let started = std::time::Instant::now();
    let result: Result<(), RunError<CancelError>> = parent
        .run(async move {
            let child = Operation::builder()
                .name("stubborn-child")
                .parent(&parent_body)
                .registry(&registry_body)
                .build();
            let child_op = child.clone();
            let _ = child
                .run(async move {
                    // Hold a shield forever: cancellation can never deliver.
                    let _guard = child_op.shield();
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok::<(), CancelError>(())
                })
                .await;
            Ok(())
        })
        .await;

    assert!(result.is_err());
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "parent exit must be bounded by the shutdown budget, elapsed {:?}",
        started.elapsed()
    );
}
