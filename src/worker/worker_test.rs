use std::time::Duration;

use shm_channel::{ChannelNames, FrameHeader, PixelFormat, RegionLayout};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::transport::{MediaTransportBackend, ShmBackend};

const LAYOUT: RegionLayout = RegionLayout::new(64, 32);
const WAIT: Duration = Duration::from_secs(5);

fn names(tag: &str) -> ChannelNames {
    ChannelNames::from_prefix(&format!("eo_worker_{}_{}", std::process::id(), tag)).unwrap()
}

fn connected_pair(tag: &str) -> (WorkerChannel, ShmBackend) {
    let names = names(tag);
    let worker = WorkerChannel::create(names.clone(), LAYOUT).unwrap();
    let mut client = ShmBackend::new(names, LAYOUT);
    assert!(client.try_attach().unwrap());
    client.open_signals().unwrap();
    worker.signal_ready().unwrap();
    client.wait_ready(WAIT).unwrap();
    (worker, client)
}

fn rgba_header(data_size: u32, timestamp_ns: u64) -> FrameHeader {
    FrameHeader {
        width: 4,
        height: 2,
        timestamp_ns,
        insert_idr: false,
        pixel_format: PixelFormat::Rgba.to_wire(),
        row_pitch: 16,
        data_size,
        shutdown: false,
    }
}

#[test]
fn test_client_cannot_attach_before_create() {
    let mut client = ShmBackend::new(names("early"), LAYOUT);
    assert!(!client.try_attach().unwrap());
    assert!(!client.is_attached());
}

#[test]
fn test_second_worker_leaves_running_channel_alone() {
    let (mut worker, mut client) = connected_pair("twice");
    match WorkerChannel::create(names("twice"), LAYOUT) {
        Err(IpcError::SharedRegionUnavailable { reason }) => {
            assert!(reason.contains("running process"), "{}", reason)
        }
        Err(e) => panic!("unexpected {:?}", e),
        Ok(_) => panic!("second worker took over a running channel"),
    }

    // signals and region still belong to the first worker
    client.publish_frame(&rgba_header(4, 7), &[1, 2, 3, 4]).unwrap();
    match worker.wait_frame(WAIT).unwrap() {
        Some(WorkerEvent::Frame(frame)) => assert_eq!(frame.header.timestamp_ns, 7),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_wait_frame_times_out() {
    let (mut worker, _client) = connected_pair("idle");
    assert!(worker.wait_frame(Duration::from_millis(20)).unwrap().is_none());
}

#[test]
fn test_frame_reaches_worker() {
    let (mut worker, mut client) = connected_pair("frame");
    let payload: Vec<u8> = (0..32).collect();
    client.publish_frame(&rgba_header(32, 1234), &payload).unwrap();

    match worker.wait_frame(WAIT).unwrap() {
        Some(WorkerEvent::Frame(frame)) => {
            assert_eq!(frame.header.timestamp_ns, 1234);
            assert_eq!(frame.format, PixelFormat::Rgba);
            assert_eq!(frame.data, payload.as_slice());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_shutdown_checked_before_frame() {
    let (mut worker, mut client) = connected_pair("shutdown");
    client.publish_frame(&rgba_header(4, 1), &[1, 2, 3, 4]).unwrap();
    client.request_shutdown();

    assert!(matches!(
        worker.wait_frame(WAIT).unwrap(),
        Some(WorkerEvent::Shutdown)
    ));
    assert!(worker.shutdown_requested());
}

#[test]
fn test_unknown_pixel_format_is_reported() {
    let (mut worker, mut client) = connected_pair("format");
    let header = FrameHeader {
        pixel_format: 7,
        ..rgba_header(4, 9)
    };
    client.publish_frame(&header, &[0; 4]).unwrap();
    match worker.wait_frame(WAIT).unwrap() {
        Some(WorkerEvent::Unsupported(seen)) => assert_eq!(seen.pixel_format, 7),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_send_packet_rejects_oversize() {
    let (mut worker, _client) = connected_pair("oversize");
    let packet = EncodedPacket {
        data: vec![0; LAYOUT.packet_capacity + 1],
        timestamp_ns: 0,
        is_idr: false,
    };
    assert!(matches!(
        worker.send_packet(&packet),
        Err(IpcError::PacketTooLarge { size: 33, capacity: 32 })
    ));
}

#[test]
fn test_serve_round_trip_then_shutdown() {
    let (mut worker, mut client) = connected_pair("serve");
    let cancel = CancellationToken::new();
    let opts = ServeOptions {
        poll_interval: Duration::from_millis(10),
        watch_parent: false,
    };
    let handle = std::thread::spawn(move || {
        let mut encoder = PassthroughEncoder::new(None, true);
        serve(&mut worker, &mut encoder, &cancel, &opts)
    });

    for ts in [100u64, 200, 300] {
        let payload = vec![ts as u8; 16];
        client.publish_frame(&rgba_header(16, ts), &payload).unwrap();
        let packet = client.await_packet(WAIT).unwrap();
        assert_eq!(packet.timestamp_ns, ts);
        assert!(packet.is_idr);
        assert_eq!(&packet.data[..], payload.as_slice());
    }

    client.request_shutdown();
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.exit, ServeExit::Shutdown);
    assert_eq!(summary.frames_received, 3);
    assert_eq!(summary.packets_sent, 3);
    assert_eq!(summary.frames_dropped, 0);
}

#[test]
fn test_serve_stops_on_cancel() {
    let (mut worker, _client) = connected_pair("cancel");
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = std::thread::spawn(move || {
        let mut encoder = PassthroughEncoder::default();
        let opts = ServeOptions {
            poll_interval: Duration::from_millis(10),
            watch_parent: false,
        };
        serve(&mut worker, &mut encoder, &token, &opts)
    });
    std::thread::sleep(Duration::from_millis(30));
    cancel.cancel();
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.exit, ServeExit::Cancelled);
    assert_eq!(summary.frames_received, 0);
}

#[test]
fn test_serve_drops_unencodable_frame() {
    struct Failing;

    impl FrameEncoder for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn encode(&mut self, _frame: &InboundFrame<'_>) -> anyhow::Result<Vec<EncodedPacket>> {
            anyhow::bail!("no encoder session")
        }
    }

    let (mut worker, mut client) = connected_pair("failing");
    let cancel = CancellationToken::new();
    let handle = std::thread::spawn(move || {
        let opts = ServeOptions {
            poll_interval: Duration::from_millis(10),
            watch_parent: false,
        };
        serve(&mut worker, &mut Failing, &cancel, &opts)
    });

    client.publish_frame(&rgba_header(4, 5), &[0; 4]).unwrap();
    assert!(matches!(
        client.await_packet(Duration::from_millis(100)),
        Err(IpcError::Timeout(_))
    ));
    client.request_shutdown();
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.frames_received, 1);
    assert_eq!(summary.frames_dropped, 1);
    assert_eq!(summary.packets_sent, 0);
}
