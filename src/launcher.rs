use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use shm_channel::signal::deadline_after;

use crate::codec::Codec;
use crate::config::BridgeConfig;
use crate::error::IpcError;

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Locates the worker executable. Relative locations resolve against the
/// directory holding the current executable.
pub fn resolve_worker_binary(config: &BridgeConfig) -> Result<PathBuf, IpcError> {
    let path = match &config.worker_path {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => exe_dir().join(path),
        None => exe_dir().join(format!(
            "{}{}",
            config.worker_executable,
            std::env::consts::EXE_SUFFIX
        )),
    };
    if !path.is_file() {
        return Err(IpcError::WorkerBinaryNotFound { path });
    }
    Ok(path)
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Command line of the worker: `<width> <height> <codec>`, then the channel
/// flags when they differ from the worker's defaults, then the configured extras.
pub fn worker_args(width: u32, height: u32, codec: Codec, config: &BridgeConfig) -> Vec<String> {
    let mut args = vec![width.to_string(), height.to_string(), codec.to_string()];
    if let Ok(names) = config.channel_names() {
        if !names.is_default() {
            args.push("--channel".to_string());
            args.push(names.prefix().to_string());
        }
    }
    if !config.layout.is_reference() {
        args.push("--frame-capacity".to_string());
        args.push(config.layout.frame_capacity.to_string());
        args.push("--packet-capacity".to_string());
        args.push(config.layout.packet_capacity.to_string());
    }
    args.extend(config.worker_args.iter().cloned());
    args
}

/// A worker process launched by this client.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn spawn(path: &Path, args: &[String]) -> Result<Self, IpcError> {
        log::info!("launching worker {} {}", path.display(), args.join(" "));
        let child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| IpcError::SharedRegionUnavailable {
                reason: format!("failed to launch {}: {}", path.display(), e),
            })?;
        Ok(Self { child })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// `Some(status)` once the process has exited.
    pub fn has_exited(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::warn!("failed to poll worker {}: {}", self.child.id(), e);
                None
            }
        }
    }

    /// Polls for exit until `grace` elapses. The process is never killed; a
    /// worker still running afterwards is left to finish on its own.
    /// `Duration::MAX` waits for as long as the worker runs.
    pub fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let deadline = deadline_after(grace);
        loop {
            if let Some(status) = self.has_exited() {
                log::info!("worker {} exited with {}", self.child.id(), status);
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "worker {} still running after {:?}, releasing its handle",
                    self.child.id(),
                    grace
                );
                return false;
            }
            std::thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use shm_channel::RegionLayout;

    use super::*;

    #[test]
    fn test_default_args_are_positional_only() {
        let config = BridgeConfig::default();
        assert_eq!(
            worker_args(1920, 1080, Codec::H264, &config),
            vec!["1920", "1080", "h264"]
        );
    }

    #[test]
    fn test_channel_flags_forwarded() {
        let config = BridgeConfig {
            channel_prefix: "vr_left".to_string(),
            layout: RegionLayout::new(4096, 1024),
            worker_args: vec!["--force-idr".to_string()],
            ..Default::default()
        };
        assert_eq!(
            worker_args(640, 480, Codec::Hevc, &config),
            vec![
                "640",
                "480",
                "hevc",
                "--channel",
                "vr_left",
                "--frame-capacity",
                "4096",
                "--packet-capacity",
                "1024",
                "--force-idr",
            ]
        );
    }

    #[test]
    fn test_missing_binary() {
        let config = BridgeConfig {
            worker_executable: "no-such-encode-worker".to_string(),
            ..Default::default()
        };
        match resolve_worker_binary(&config) {
            Err(IpcError::WorkerBinaryNotFound { path }) => {
                assert!(path.ends_with(format!(
                    "no-such-encode-worker{}",
                    std::env::consts::EXE_SUFFIX
                )));
                assert_eq!(path.parent(), Some(exe_dir().as_path()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_absolute_worker_path() {
        let config = BridgeConfig {
            worker_path: Some(PathBuf::from("/bin/sh")),
            ..Default::default()
        };
        assert_eq!(resolve_worker_binary(&config).unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_wait_for_exit() {
        let mut quick = WorkerProcess::spawn(Path::new("/bin/sh"), &["-c".into(), "exit 0".into()])
            .unwrap();
        assert!(quick.wait_for_exit(Duration::from_secs(5)));
        assert!(quick.has_exited().is_some());

        let mut slow = WorkerProcess::spawn(Path::new("/bin/sh"), &["-c".into(), "sleep 2".into()])
            .unwrap();
        let started = Instant::now();
        assert!(!slow.wait_for_exit(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(slow.wait_for_exit(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_for_exit_without_limit() {
        let mut worker =
            WorkerProcess::spawn(Path::new("/bin/sh"), &["-c".into(), "sleep 0.1".into()]).unwrap();
        assert!(worker.wait_for_exit(Duration::MAX));
        assert!(worker.has_exited().is_some());
    }
}
