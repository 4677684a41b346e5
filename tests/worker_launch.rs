use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use encode_offload::{
    BridgeConfig, Codec, ConnectionState, EncoderClient, FrameDescriptor, IpcError, PixelFormat,
    RegionLayout,
};
use shm_channel::{NamedSignal, SharedRegion};

fn worker_config(tag: &str, layout: RegionLayout, extra: &[&str]) -> BridgeConfig {
    BridgeConfig {
        channel_prefix: format!("eo_launch_{}_{}", std::process::id(), tag),
        layout,
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_encode-offload-worker"))),
        worker_args: extra.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn test_launch_encode_and_shutdown() {
    let layout = RegionLayout::new(1920 * 1080 * 4, 64 * 1024);
    let config = worker_config(
        "e2e",
        layout,
        &["--declared-size", "4096", "--force-idr", "--poll-ms", "10"],
    );
    let region_name = config.channel_names().unwrap().region;
    let mut client = EncoderClient::new(config);

    client.initialize(1920, 1080, Codec::H264).unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.worker_pid().is_some());

    let pixels = vec![0x80u8; 1920 * 1080 * 4];
    let frame = FrameDescriptor::new(1920, 1080, PixelFormat::Rgba).with_timestamp(1000);
    client.send_frame(&pixels, &frame).unwrap();
    let packet = client.receive_packet(Duration::from_secs(5)).unwrap();
    assert!(packet.is_idr);
    assert_eq!(packet.timestamp_ns, 1000);
    assert_eq!(packet.len(), 4096);

    let frame = frame.with_timestamp(2000);
    client.send_frame(&pixels, &frame).unwrap();
    let packet = client.receive_packet_default().unwrap();
    assert_eq!(packet.timestamp_ns, 2000);

    client.shutdown();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    // the worker removes its region on the way out
    assert!(SharedRegion::open(&region_name, layout).unwrap().is_none());
}

#[test]
fn test_worker_rejecting_args_fails_discovery() {
    let config = BridgeConfig {
        discovery_interval_ms: 20,
        discovery_attempts: 250,
        ..worker_config("bad_args", RegionLayout::new(1024, 1024), &["--bitrate", "fast"])
    };
    let mut client = EncoderClient::new(config);
    match client.initialize(640, 480, Codec::Hevc) {
        Err(IpcError::SharedRegionUnavailable { reason }) => {
            assert!(reason.contains("exited"), "{}", reason)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!client.is_attached());
}

#[test]
fn test_missing_worker_binary() {
    let config = BridgeConfig {
        worker_path: Some(PathBuf::from("/nonexistent/encode-offload-worker")),
        ..worker_config("missing", RegionLayout::new(1024, 1024), &[])
    };
    let mut client = EncoderClient::new(config);
    match client.initialize(1920, 1080, Codec::H264) {
        Err(IpcError::WorkerBinaryNotFound { path }) => {
            assert_eq!(path, PathBuf::from("/nonexistent/encode-offload-worker"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_relaunch_after_worker_killed() {
    let layout = RegionLayout::new(64 * 64 * 4, 4096);
    let config = worker_config("killed", layout, &["--poll-ms", "10"]);
    let names = config.channel_names().unwrap();

    // a worker started by someone else, then killed without any cleanup
    let mut crashed = Command::new(env!("CARGO_BIN_EXE_encode-offload-worker"))
        .args(encode_offload::launcher::worker_args(64, 64, Codec::H264, &config))
        .stdin(Stdio::null())
        .spawn()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while SharedRegion::open(&names.region, layout).unwrap().is_none() {
        assert!(Instant::now() < deadline, "worker never published its region");
        std::thread::sleep(Duration::from_millis(10));
    }
    crashed.kill().unwrap();
    crashed.wait().unwrap();

    // its objects are still there but no longer count as a running worker
    assert!(NamedSignal::open(&names.worker_ready).unwrap().is_some());
    assert!(SharedRegion::open(&names.region, layout).unwrap().is_none());

    let mut client = EncoderClient::new(config);
    client.initialize(64, 64, Codec::H264).unwrap();
    assert!(client.worker_pid().is_some());
    assert_ne!(client.worker_pid(), Some(crashed.id()));

    let pixels = vec![3u8; 64 * 64 * 4];
    let frame = FrameDescriptor::new(64, 64, PixelFormat::Rgba).with_timestamp(77);
    client.send_frame(&pixels, &frame).unwrap();
    let packet = client.receive_packet(Duration::from_secs(5)).unwrap();
    assert_eq!(packet.timestamp_ns, 77);

    client.shutdown();
    assert!(SharedRegion::open(&names.region, layout).unwrap().is_none());
}
