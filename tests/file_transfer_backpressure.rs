//! File-transfer scenarios: pacing against a slow wire through a bounded
//! transmit queue, and controller-initiated cancellation when the port
//! closes mid-transfer.

use parking_lot::Mutex;
use serial_fabric::transport::LoopbackTransport;
use serial_fabric::{
    CloseMode, ConnectionController, Event, EventBus, FileTransferEngine, ParserSelection,
    PortConfig,
};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn slow_wire_config(id: &str, queue_limit: usize) -> PortConfig {
    let mut config = PortConfig::new(format!("loop://{id}"));
    config.read_timeout_ms = 5;
    config.parser = ParserSelection::Raw;
    config.tx_queue_limit = queue_limit;
    config
}

fn recorder(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<(String, Event)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe("*", move |topic, event| {
        sink.lock().push((topic.to_string(), event.clone()));
    });
    events
}

/// Scenario: queue of 4 chunks, wire that consumes one chunk per 50 ms,
/// 40 KiB stream in 1 KiB chunks. The transfer is paced by backpressure to
/// roughly 40 × 50 ms, loses nothing, and never saturates under the default
/// retry budget.
#[tokio::test]
async fn backpressure_paces_transfer_without_loss() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);
    let events = recorder(&bus);

    let transport = LoopbackTransport::new()
        .with_echo(false)
        .with_write_delay(Duration::from_millis(50));
    controller
        .open_with_transport(slow_wire_config("bp", 4), Box::new(transport))
        .await
        .unwrap();

    let payload = vec![0xA5u8; 40 * 1024];
    let engine = FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
    let started = Instant::now();
    engine
        .start(
            "loop://bp",
            Box::new(Cursor::new(payload)),
            40 * 1024,
            Some(1024),
        )
        .unwrap();

    // Wait for completion (pacing math: ~36 pops at 50 ms before EOF).
    let deadline = Instant::now() + Duration::from_secs(6);
    loop {
        if events
            .lock()
            .iter()
            .any(|(topic, _)| topic == "file.completed")
        {
            break;
        }
        assert!(Instant::now() < deadline, "transfer did not complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1500),
        "completed implausibly fast: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(2600),
        "completed implausibly slow: {elapsed:?}"
    );

    // Give the worker time to put the final queued chunks on the wire.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let sent_total: usize = events
            .lock()
            .iter()
            .filter_map(|(_, e)| match e {
                Event::DataSent { bytes, .. } => Some(bytes.len()),
                _ => None,
            })
            .sum();
        if sent_total == 40 * 1024 {
            break;
        }
        assert!(Instant::now() < deadline, "only {sent_total} bytes hit the wire");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let events = events.lock();
    assert!(
        !events.iter().any(|(topic, _)| topic == "file.error"),
        "no saturation failure expected under the default retry budget"
    );
    let progress: Vec<u64> = events
        .iter()
        .filter_map(|(_, e)| match e {
            Event::FileProgress { sent_bytes, .. } => Some(*sent_bytes),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {progress:?}"
    );
    drop(events);
    controller.close("loop://bp", CloseMode::Force).await;
}

/// Scenario: closing the port mid-transfer cancels the job first —
/// `file.cancelled` precedes `port.closed`, progress stops, and the
/// registration is gone.
#[tokio::test]
async fn port_close_cancels_running_transfer() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);
    let events = recorder(&bus);

    let transport = LoopbackTransport::new()
        .with_echo(false)
        .with_write_delay(Duration::from_millis(50));
    controller
        .open_with_transport(slow_wire_config("cx", 4), Box::new(transport))
        .await
        .unwrap();

    let engine = FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
    let handle = engine
        .start(
            "loop://cx",
            Box::new(Cursor::new(vec![0x42u8; 40 * 1024])),
            40 * 1024,
            Some(1024),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let close_requested = Instant::now();
    assert!(controller.close("loop://cx", CloseMode::Drain).await);
    let cancel_latency = close_requested.elapsed();

    assert!(handle.is_cancelled());
    assert!(
        cancel_latency < Duration::from_secs(2),
        "close took {cancel_latency:?}"
    );

    {
        let events = events.lock();
        let cancelled_at = events
            .iter()
            .position(|(topic, _)| topic == "file.cancelled")
            .expect("file.cancelled not published");
        let closed_at = events
            .iter()
            .position(|(topic, _)| topic == "port.closed")
            .expect("port.closed not published");
        assert!(
            cancelled_at < closed_at,
            "cancellation must precede port.closed"
        );
        assert!(!events.iter().any(|(topic, _)| topic == "file.completed"));
    }

    // No further progress after the cancellation settles.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let count_then = events
        .lock()
        .iter()
        .filter(|(topic, _)| topic == "file.progress")
        .count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let count_now = events
        .lock()
        .iter()
        .filter(|(topic, _)| topic == "file.progress")
        .count();
    assert_eq!(count_then, count_now, "progress continued after cancel");

    // Registration removed: a fresh transfer on a reopened port is accepted.
    controller
        .open_with_transport(
            slow_wire_config("cx", 4),
            Box::new(LoopbackTransport::new().with_echo(false)),
        )
        .await
        .unwrap();
    assert!(engine
        .start("loop://cx", Box::new(Cursor::new(vec![1u8])), 1, None)
        .is_ok());
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.close("loop://cx", CloseMode::Force).await;
}

/// A queue that never drains saturates the retry budget and fails the job
/// with `queue_saturated`.
#[tokio::test]
async fn saturated_queue_fails_the_job() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);
    let events = recorder(&bus);

    // The wire stalls for far longer than the whole retry budget.
    let transport = LoopbackTransport::new()
        .with_echo(false)
        .with_write_delay(Duration::from_secs(30));
    controller
        .open_with_transport(slow_wire_config("sat", 2), Box::new(transport))
        .await
        .unwrap();

    let engine = FileTransferEngine::new(Arc::clone(&controller), Arc::clone(&bus));
    engine
        .start(
            "loop://sat",
            Box::new(Cursor::new(vec![0u8; 16 * 1024])),
            16 * 1024,
            Some(1024),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let failed = events.lock().iter().any(|(_, e)| {
            matches!(
                e,
                Event::FileError { error_kind, .. } if error_kind == "queue_saturated"
            )
        });
        if failed {
            break;
        }
        assert!(Instant::now() < deadline, "saturation never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    controller.close("loop://sat", CloseMode::Force).await;
}
