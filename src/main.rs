use std::time::Duration;

use clap::{Parser, ValueEnum};
use encode_offload::worker::{self, FrameEncoder, PassthroughEncoder, ServeOptions, WorkerChannel};
use encode_offload::{Codec, RegionLayout};
use shm_channel::ChannelNames;
use shm_channel::names::DEFAULT_PREFIX;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EncoderKind {
    /// Echo raw frames back as packets.
    Passthrough,
    /// Encode with FFmpeg (needs the `ffmpeg` feature).
    Ffmpeg,
}

/// Encode worker: serves one offload channel until the client shuts it down.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    #[arg(default_value_t = 1920)]
    width: u32,
    #[arg(default_value_t = 1080)]
    height: u32,
    #[arg(default_value_t = Codec::H264)]
    codec: Codec,

    /// Prefix of the shared region and signal names.
    #[arg(long, default_value = DEFAULT_PREFIX)]
    channel: String,
    #[arg(long)]
    frame_capacity: Option<usize>,
    #[arg(long)]
    packet_capacity: Option<usize>,

    #[arg(long, value_enum, default_value_t = EncoderKind::Passthrough)]
    encoder: EncoderKind,
    /// Passthrough output size in bytes.
    #[arg(long)]
    declared_size: Option<usize>,
    /// Mark every passthrough packet as IDR.
    #[arg(long)]
    force_idr: bool,
    #[arg(long)]
    bitrate: Option<usize>,
    #[arg(long, default_value_t = 60)]
    fps: u32,
    /// Frame-ready wait slice in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,
}

impl Args {
    fn layout(&self) -> RegionLayout {
        let reference = RegionLayout::reference();
        RegionLayout::new(
            self.frame_capacity.unwrap_or(reference.frame_capacity),
            self.packet_capacity.unwrap_or(reference.packet_capacity),
        )
    }
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn build_encoder(args: &Args) -> anyhow::Result<Box<dyn FrameEncoder>> {
    match args.encoder {
        EncoderKind::Passthrough => Ok(Box::new(PassthroughEncoder::new(
            args.declared_size,
            args.force_idr,
        ))),
        #[cfg(feature = "ffmpeg")]
        EncoderKind::Ffmpeg => {
            let settings = worker::ffmpeg::Settings {
                width: args.width,
                height: args.height,
                codec: args.codec,
                fps: args.fps,
                bitrate: args.bitrate,
                ..Default::default()
            };
            Ok(Box::new(worker::FfmpegEncoder::new(&settings)?))
        }
        #[cfg(not(feature = "ffmpeg"))]
        EncoderKind::Ffmpeg => {
            anyhow::bail!("built without the ffmpeg feature, use --encoder passthrough")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    log::info!(
        "encode worker {}x{} {} on channel {}",
        args.width,
        args.height,
        args.codec,
        args.channel
    );

    let names = ChannelNames::from_prefix(&args.channel)?;
    let mut encoder = build_encoder(&args)?;
    let mut channel = WorkerChannel::create(names, args.layout())?;
    channel.signal_ready()?;

    let cancel = CancellationToken::new();
    let opts = ServeOptions {
        poll_interval: Duration::from_millis(args.poll_ms.max(1)),
        watch_parent: true,
    };
    let serve_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        worker::serve(&mut channel, &mut encoder, &serve_cancel, &opts)
    });

    let summary = loop {
        tokio::select! {
            result = &mut handle => break result??,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping");
                cancel.cancel();
            },
        }
    };

    log::info!(
        "encode worker exiting ({:?}), {} packets sent",
        summary.exit,
        summary.packets_sent
    );
    Ok(())
}
