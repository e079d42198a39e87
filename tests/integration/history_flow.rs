//! History correlation across a full connection

use std::sync::Arc;
use std::time::Duration;

use hostwatch::connection::ConnectionHandle;
use hostwatch::correlator::CorrelatorHandle;
use hostwatch::history::{HistoryRange, HistoryView};
use hostwatch::store::MetricsStore;
use hostwatch::transport::{AgentEnd, ChannelConnector};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

use crate::helpers::*;

struct Setup {
    connection: ConnectionHandle,
    correlator: CorrelatorHandle,
    accepted: mpsc::UnboundedReceiver<AgentEnd>,
}

fn setup(range: HistoryRange) -> Setup {
    let (connector, accepted) = ChannelConnector::new();
    let store = MetricsStore::new();
    let config = create_test_config();

    let connection = ConnectionHandle::spawn(
        create_test_host("h1", 8765),
        Arc::new(connector),
        store.clone(),
        &config,
    );
    let correlator = CorrelatorHandle::spawn(connection.clone(), range, &config);

    Setup {
        connection,
        correlator,
        accepted,
    }
}

async fn wait_for_view(
    correlator: &CorrelatorHandle,
    check: impl Fn(&HistoryView) -> bool,
) -> HistoryView {
    for _ in 0..500 {
        let view = correlator.view().await;
        if check(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("unexpected history state: {:?}", correlator.view().await);
}

#[tokio::test]
async fn test_one_hour_history_then_live_point() {
    let mut setup = setup(HistoryRange::OneHour);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;

    assert_eq!(
        next_frame(&mut agent).await,
        json!({"type": "history", "range": "1h"})
    );

    agent.send(history_frame("1h", &[(100, 10.0, 20.0, 30.0)]));
    let view = wait_for_view(&setup.correlator, |view| !view.loading).await;
    assert_eq!(view.points.len(), 1);
    assert_eq!(view.points[0].timestamp, 100);
    assert_eq!(view.points[0].cpu_percent, 10.0);
    assert_eq!(view.points[0].memory_percent, 20.0);
    assert_eq!(view.points[0].disk_percent, 30.0);

    agent.send(metrics_frame(200, 55.0));
    let view = wait_for_view(&setup.correlator, |view| view.points.len() == 2).await;
    assert_eq!(view.points[1].timestamp, 200);
    assert_eq!(view.points[1].cpu_percent, 55.0);
    assert_eq!(view.points[1].memory_percent, 25.0);
    assert_eq!(view.points[1].disk_percent, 40.0);

    setup.connection.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_sent_right_after_response_is_appended() {
    let mut setup = setup(HistoryRange::OneHour);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;
    assert_eq!(next_frame(&mut agent).await["range"], "1h");

    agent.send(history_frame("1h", &[(100, 10.0, 20.0, 30.0)]));
    agent.send(metrics_frame(200, 55.0));

    let view = wait_for_view(&setup.correlator, |view| view.points.len() == 2).await;
    assert_eq!(view.points[0].timestamp, 100);
    assert_eq!(view.points[1].timestamp, 200);

    setup.connection.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_response_after_range_switch() {
    let mut setup = setup(HistoryRange::OneHour);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;
    assert_eq!(next_frame(&mut agent).await["range"], "1h");

    agent.send(history_frame("1h", &[(100, 1.0, 1.0, 1.0)]));
    wait_for_view(&setup.correlator, |view| view.points.len() == 1).await;

    setup.correlator.set_range(HistoryRange::SevenDays).await.unwrap();
    assert_eq!(next_frame(&mut agent).await["range"], "7d");

    // the old range's points are gone right away
    let view = setup.correlator.view().await;
    assert_eq!(view.range, HistoryRange::SevenDays);
    assert!(view.points.is_empty());

    agent.send(history_frame("1h", &[(300, 1.0, 1.0, 1.0), (400, 1.0, 1.0, 1.0)]));
    agent.send(history_frame("7d", &[(50, 2.0, 2.0, 2.0)]));

    let view = wait_for_view(&setup.correlator, |view| !view.loading).await;
    assert_eq!(view.points.len(), 1);
    assert_eq!(view.points[0].timestamp, 50);

    setup.connection.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_response_is_sorted_deduplicated_and_bounded() {
    let mut setup = setup(HistoryRange::SevenDays);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;
    next_frame(&mut agent).await;

    let max = HistoryRange::SevenDays.max_points() as i64;
    let mut points: Vec<(i64, f64, f64, f64)> =
        (0..max + 10).rev().map(|ts| (ts, 1.0, 1.0, 1.0)).collect();
    points.push((max + 9, 99.0, 99.0, 99.0));
    agent.send(history_frame("7d", &points));

    let view = wait_for_view(&setup.correlator, |view| !view.loading).await;
    assert_eq!(view.points.len(), HistoryRange::SevenDays.max_points());
    assert_eq!(view.points[0].timestamp, 10);

    // duplicate collapsed to the last value seen
    let last = view.points.last().unwrap();
    assert_eq!(last.timestamp, max + 9);
    assert_eq!(last.cpu_percent, 99.0);
    assert!(view.points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    setup.connection.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_requests_history_again() {
    let mut setup = setup(HistoryRange::SixHours);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;
    assert_eq!(next_frame(&mut agent).await["range"], "6h");

    // drop and reconnect right away
    setup.connection.disable().await.unwrap();
    setup.connection.enable().await.unwrap();

    let mut agent = accept_authenticated(&mut setup.accepted).await;
    assert_eq!(
        next_frame(&mut agent).await,
        json!({"type": "history", "range": "6h"})
    );

    setup.connection.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_live_ticks_are_skipped() {
    let mut setup = setup(HistoryRange::OneHour);
    setup.connection.enable().await.unwrap();
    let mut agent = accept_authenticated(&mut setup.accepted).await;
    next_frame(&mut agent).await;
    agent.send(history_frame("1h", &[]));
    wait_for_view(&setup.correlator, |view| !view.loading).await;

    agent.send(metrics_frame(1000, 1.0));
    agent.send(metrics_frame(1000, 2.0));
    agent.send(metrics_frame(1001, 3.0));

    let view = wait_for_view(&setup.correlator, |view| view.points.len() == 2).await;
    assert_eq!(view.points[0].cpu_percent, 1.0);
    assert_eq!(view.points[1].timestamp, 1001);

    setup.connection.shutdown().await.unwrap();
}
