//! Registry lifecycle: persistence, upsert and removal

use std::sync::Arc;
use std::time::Duration;

use hostwatch::config::LinkConfig;
use hostwatch::history::HistoryRange;
use hostwatch::registry::ConnectionRegistry;
use hostwatch::repository::{HostRepository, JsonFileRepository};
use hostwatch::store::MetricsStore;
use hostwatch::transport::ChannelConnector;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::*;

async fn wait_for_buffer_len(registry: &ConnectionRegistry, host_id: &str, len: usize) {
    for _ in 0..500 {
        if registry.get_history_buffer(host_id).await.unwrap().len() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("history buffer of {host_id} never reached {len} points");
}

#[tokio::test]
async fn test_hosts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hosts.json");

    {
        let (connector, _accepted) = ChannelConnector::new();
        let registry = ConnectionRegistry::load(
            MetricsStore::new(),
            Arc::new(connector),
            Arc::new(JsonFileRepository::new(&path)),
            LinkConfig::default(),
        )
        .await
        .unwrap();

        registry.upsert(create_test_host("h1", 8765).with_name("web")).await.unwrap();
        registry.upsert(create_test_host("h2", 8766)).await.unwrap();
        registry.remove("h2").await.unwrap();
        registry.shutdown().await;
    }

    let (connector, mut accepted) = ChannelConnector::new();
    let registry = ConnectionRegistry::load(
        MetricsStore::new(),
        Arc::new(connector),
        Arc::new(JsonFileRepository::new(&path)),
        LinkConfig::default(),
    )
    .await
    .unwrap();

    let hosts = registry.hosts().await;
    assert_eq!(hosts, vec![create_test_host("h1", 8765).with_name("web")]);

    let agent = next_agent(&mut accepted).await;
    assert_eq!(agent.target.id, "h1");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_registry_end_to_end() {
    let dir = TempDir::new().unwrap();
    let repository = Arc::new(JsonFileRepository::new(dir.path().join("hosts.json")));
    let (connector, mut accepted) = ChannelConnector::new();

    let registry = ConnectionRegistry::new(
        MetricsStore::new(),
        Arc::new(connector),
        repository.clone(),
        create_test_config(),
    );

    registry.upsert(create_test_host("h1", 8765)).await.unwrap();
    let mut agent = accept_authenticated(&mut accepted).await;
    assert_eq!(next_frame(&mut agent).await["range"], "1h");

    agent.send(history_frame("1h", &[(100, 10.0, 20.0, 30.0)]));
    wait_for_buffer_len(&registry, "h1", 1).await;

    agent.send(metrics_frame(200, 5.0));
    wait_for_snapshot(registry.store(), "h1", 200).await;
    assert!(registry.is_online("h1").await);

    wait_for_buffer_len(&registry, "h1", 2).await;
    let timestamps: Vec<i64> = registry
        .get_history_buffer("h1")
        .await
        .unwrap()
        .iter()
        .map(|point| point.timestamp)
        .collect();
    assert_eq!(timestamps, vec![100, 200]);

    registry.set_range("h1", HistoryRange::TwentyFourHours).await.unwrap();
    assert_eq!(next_frame(&mut agent).await["range"], "24h");

    registry.remove("h1").await.unwrap();
    assert!(registry.get_snapshot("h1").await.is_none());
    assert!(!registry.is_online("h1").await);
    assert!(repository.load().await.unwrap().is_empty());

    // transport released
    assert_eq!(agent.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_removed_host_never_reconnects() {
    let (connector, mut accepted) = ChannelConnector::new();
    let registry = ConnectionRegistry::new(
        MetricsStore::new(),
        Arc::new(connector),
        Arc::new(hostwatch::repository::MemoryRepository::new()),
        create_test_config(),
    );

    registry.upsert(create_test_host("h1", 8765)).await.unwrap();
    let agent = accept_authenticated(&mut accepted).await;
    wait_for_online(registry.store(), "h1", true).await;

    agent.close();
    wait_for_online(registry.store(), "h1", false).await;
    registry.remove("h1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(accepted.try_recv().is_err());
    assert!(registry.hosts().await.is_empty());
}

#[tokio::test]
async fn test_history_observer_through_registry() {
    let (connector, mut accepted) = ChannelConnector::new();
    let registry = ConnectionRegistry::new(
        MetricsStore::new(),
        Arc::new(connector),
        Arc::new(hostwatch::repository::MemoryRepository::new()),
        create_test_config(),
    );
    registry.upsert(create_test_host("h1", 8765)).await.unwrap();

    let (tx, mut views) = tokio::sync::mpsc::unbounded_channel();
    registry
        .on_history_update("h1", move |view| {
            let _ = tx.send(view.clone());
        })
        .await
        .unwrap();

    let mut agent = accept_authenticated(&mut accepted).await;
    next_frame(&mut agent).await;
    agent.send(history_frame("1h", &[(100, 1.0, 2.0, 3.0)]));

    loop {
        let view = tokio::time::timeout(Duration::from_secs(10), views.recv())
            .await
            .expect("no history update")
            .unwrap();
        if !view.loading && view.points.len() == 1 {
            assert_eq!(view.host_id, "h1");
            break;
        }
    }

    registry.shutdown().await;
}
