//! End-to-end loopback scenarios: open a port whose transport echoes every
//! write, send a command, and observe the full delivery fan-out — data_sent
//! on the bus, the raw bytes on the fast path, and a parsed packet.

use bytes::Bytes;
use parking_lot::Mutex;
use serial_fabric::{
    CloseMode, ConnectionController, Event, EventBus, PacketCategory, ParserSelection, PortConfig,
};
use serial_fabric::transport::LoopbackTransport;
use std::sync::Arc;
use std::time::Duration;

fn loop_config(id: &str, parser: ParserSelection) -> PortConfig {
    let mut config = PortConfig::new(format!("loop://{id}"));
    config.read_timeout_ms = 5;
    config.parser = parser;
    config
}

/// Scenario: open and loopback under the raw parser. Within 200 ms of the
/// send we see one `port.data_sent`, one fast-path delivery, and one
/// `RawPacket` with the exact bytes.
#[tokio::test]
async fn open_and_loopback_raw_parser() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe("port.*", move |topic, event| {
        sink.lock().push((topic.to_string(), event.clone()));
    });

    let fast = Arc::new(Mutex::new(Vec::new()));
    let fast_sink = Arc::clone(&fast);
    controller.set_fast_path_sink(Arc::new(move |port_id, bytes, _ts| {
        fast_sink.lock().push((port_id.to_string(), bytes));
    }));

    controller
        .open(loop_config("rt", ParserSelection::Raw))
        .await
        .unwrap();
    controller
        .send("loop://rt", Bytes::from_static(b"AT\r\n"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = events.lock();
    let sent: Vec<_> = events
        .iter()
        .filter(|(topic, _)| topic == "port.data_sent")
        .collect();
    assert_eq!(sent.len(), 1);
    match &sent[0].1 {
        Event::DataSent { bytes, .. } => assert_eq!(&bytes[..], b"AT\r\n"),
        other => panic!("unexpected payload: {other:?}"),
    }

    let packets: Vec<_> = events
        .iter()
        .filter_map(|(_, event)| match event {
            Event::Packet(packet) => Some(packet),
            _ => None,
        })
        .collect();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].category, PacketCategory::RawPacket);
    assert_eq!(&packets[0].bytes[..], b"AT\r\n");

    let fast = fast.lock();
    assert_eq!(fast.len(), 1);
    assert_eq!(fast[0].0, "loop://rt");
    assert_eq!(&fast[0].1[..], b"AT\r\n");

    controller.close("loop://rt", CloseMode::Drain).await;
}

/// The same exchange under the AT parser classifies the echoed OK response.
#[tokio::test]
async fn open_and_loopback_at_parser() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);

    let packets = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&packets);
    bus.subscribe("port.packet", move |_, event| {
        if let Event::Packet(packet) = event {
            sink.lock().push(packet.clone());
        }
    });

    let transport = LoopbackTransport::new().with_responder(|written| {
        (written == b"AT\r\n").then(|| serial_fabric::transport::LoopbackReply {
            bytes: b"AT\r\nOK\r\n".to_vec(),
            delay: Duration::from_millis(10),
        })
    });
    controller
        .open_with_transport(loop_config("at", ParserSelection::At), Box::new(transport))
        .await
        .unwrap();
    controller
        .send("loop://at", Bytes::from_static(b"AT\r\n"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let packets = packets.lock();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].category, PacketCategory::AtOk);
    assert_eq!(&packets[0].bytes[..], b"AT\r\nOK\r\n");

    controller.close("loop://at", CloseMode::Drain).await;
}

/// Sustained input is delivered on the fast path without loss and in order,
/// and the bus path may coalesce but never reorders.
#[tokio::test]
async fn fast_path_sustained_input_is_lossless_and_ordered() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);

    let fast = Arc::new(Mutex::new(Vec::<u8>::new()));
    let fast_sink = Arc::clone(&fast);
    controller.set_fast_path_sink(Arc::new(move |_, bytes, _| {
        fast_sink.lock().extend_from_slice(&bytes);
    }));

    let slow = Arc::new(Mutex::new(Vec::<u8>::new()));
    let slow_sink = Arc::clone(&slow);
    bus.subscribe("port.data_received", move |_, event| {
        if let Event::DataReceived { bytes, .. } = event {
            slow_sink.lock().extend_from_slice(bytes);
        }
    });

    let transport = LoopbackTransport::new().with_echo(false);
    let handle = transport.handle();
    controller
        .open_with_transport(loop_config("load", ParserSelection::Raw), Box::new(transport))
        .await
        .unwrap();

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk: Vec<u8> = (0..1024).map(|j| (i.wrapping_add(j) % 251) as u8).collect();
        expected.extend_from_slice(&chunk);
        handle.inject(&chunk);
        if i % 16 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // Wait until the worker has drained everything.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fast.lock().len() < expected.len() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    controller.close("loop://load", CloseMode::Drain).await;

    assert_eq!(fast.lock().as_slice(), expected.as_slice());
    assert_eq!(slow.lock().as_slice(), expected.as_slice());
}

/// An open failure leaves no connection behind and publishes
/// `port.open_failed` with a typed kind.
#[tokio::test]
async fn open_failure_publishes_typed_event() {
    let bus = Arc::new(EventBus::new());
    let controller = ConnectionController::new(Arc::clone(&bus), None);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    bus.subscribe("port.open_failed", move |_, event| {
        if let Event::PortOpenFailed { error_kind, .. } = event {
            sink.lock().push(error_kind.clone());
        }
    });

    let config = loop_config("bad", ParserSelection::FixedLength { length: 0 });
    assert!(controller.open(config).await.is_err());
    assert!(!controller.is_open("loop://bad"));
    assert_eq!(failures.lock().as_slice(), ["invalid_parameters"]);
}
