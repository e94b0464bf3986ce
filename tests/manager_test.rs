mod common;

use std::sync::Arc;
use std::time::Duration;

use basedb::{LogServer, Manager, ManagerConfig, ManagerEvent};
use serde_json::json;
use tempfile::TempDir;

fn fast_sweep_manager(dir: &TempDir) -> Manager {
    let server: Arc<dyn LogServer> = common::log_server();
    Manager::new(
        server,
        ManagerConfig {
            db_path: Some(dir.path().to_path_buf()),
            keep_alive: Duration::from_millis(100),
            cleanup_interval: Duration::from_millis(25),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn idle_base_is_evicted_after_keep_alive() {
    let dir = TempDir::new().unwrap();
    let manager = fast_sweep_manager(&dir);
    let mut events = manager.subscribe_events();

    let base = manager.get_stream("idle").await.unwrap();
    base.put("k", json!({"v": 1})).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        ManagerEvent::Opened("idle".to_string())
    );

    // No further access: the sweeper closes it once the window elapses.
    let closed = common::eventually(common::CONVERGE, common::POLL, || {
        let base = base.clone();
        async move { base.is_closed().then_some(()) }
    })
    .await;
    let _ = closed;
    assert_eq!(
        events.recv().await.unwrap(),
        ManagerEvent::Closed("idle".to_string())
    );

    // A later get_stream opens a fresh instance over the same log.
    let reopened = manager.get_stream("idle").await.unwrap();
    assert_eq!(
        reopened.get("k").await.unwrap().unwrap().data,
        json!({"id": "k", "v": 1})
    );
    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn base_with_active_subscribers_is_never_evicted() {
    let dir = TempDir::new().unwrap();
    let manager = fast_sweep_manager(&dir);

    let base = manager.get_stream("pinned").await.unwrap();
    let sub = base.subscribe(json!({}), |_, _, _, _| {}).await.unwrap();

    // Far beyond the keep-alive window, the subscriber pins it open.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!base.is_closed());
    base.put("still", json!({"alive": true})).await.unwrap();

    // Once disposed, idleness wins.
    sub.dispose();
    common::eventually(common::CONVERGE, common::POLL, || {
        let base = base.clone();
        async move { base.is_closed().then_some(()) }
    })
    .await;

    manager.close_all().await.unwrap();
}

#[tokio::test]
async fn frequently_accessed_base_stays_open() {
    let dir = TempDir::new().unwrap();
    let manager = fast_sweep_manager(&dir);

    let base = manager.get_stream("busy").await.unwrap();
    for _ in 0..10 {
        base.get("anything").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(!base.is_closed());

    manager.close_all().await.unwrap();
    assert!(base.is_closed());
}

#[tokio::test]
async fn close_all_restarts_cleanly() {
    let dir = TempDir::new().unwrap();
    let manager = fast_sweep_manager(&dir);

    manager.get_stream("a").await.unwrap();
    manager.get_stream("b").await.unwrap();
    manager.close_all().await.unwrap();

    // The map is empty; the next open restarts the sweeper and works.
    let base = manager.get_stream("a").await.unwrap();
    base.put("k", json!({"v": 1})).await.unwrap();
    common::eventually(common::CONVERGE, common::POLL, || {
        let base = base.clone();
        async move { base.is_closed().then_some(()) }
    })
    .await;
}
