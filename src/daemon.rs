//! Daemon lifecycle: pid-file discipline, the signal map, and the main
//! event loop that drives the forwarding engine.
//!
//! Signal contract for a running daemon: SIGPIPE is ignored, SIGUSR1 reloads
//! the mapping in place, SIGUSR2 and SIGTERM shut down gracefully.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, SigHandler, Signal};
use nix::unistd::Pid;
use slog_scope::{error, info};
use tokio::signal::unix::{signal, SignalKind};

use crate::config;
use crate::engine::{Engine, EngineConfig};
use crate::error::{AppError, Result};
use crate::mapping::MappingIndex;
use crate::mux::{MuxClient, MuxEvent};
use crate::status::StatusServer;

pub struct RunOptions {
    pub mappings: Option<PathBuf>,
    pub status_port: Option<u16>,
    pub tunnel_timeout: Option<Duration>,
    pub exit_on_os_error: bool,
}

/// Broken client pipes must never kill the daemon.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

fn pid_is_alive(pid: u32) -> bool {
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn write_pid_file_at(path: &Path) -> Result<()> {
    if let Ok(text) = fs::read_to_string(path) {
        if let Ok(pid) = text.trim().parse::<u32>() {
            if pid != std::process::id() && pid_is_alive(pid) {
                return Err(AppError::AlreadyRunning(pid));
            }
        }
    }

    let pid_file = |source| AppError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(pid_file)?;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o666));
    write!(file, "{}", std::process::id()).map_err(pid_file)?;
    Ok(())
}

fn read_running_pid_at(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).map_err(|_| AppError::NotRunning)?;
    let pid = text.trim().parse::<u32>().map_err(|_| AppError::NotRunning)?;
    if !pid_is_alive(pid) {
        return Err(AppError::NotRunning);
    }
    Ok(pid)
}

/// Claim the pid file for this process, refusing if another instance holds
/// it with a live pid.
pub fn write_pid_file() -> Result<PathBuf> {
    let path = config::pid_file_path();
    write_pid_file_at(&path)?;
    Ok(path)
}

pub fn remove_pid_file() {
    let _ = fs::remove_file(config::pid_file_path());
}

/// Deliver `sig` to the daemon named by the pid file. Used by the `reload`
/// and `shutdown` subcommands.
pub fn signal_running_daemon(sig: Signal) -> Result<()> {
    let pid = read_running_pid_at(&config::pid_file_path())?;
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            info!("signal_sent"; "pid" => pid, "signal" => format!("{:?}", sig));
            Ok(())
        }
        Err(Errno::ESRCH) => Err(AppError::NotRunning),
        Err(Errno::EPERM) => Err(AppError::SignalDenied(format!(
            "pid {} belongs to another user",
            pid
        ))),
        Err(e) => Err(AppError::SignalDenied(e.to_string())),
    }
}

/// Run the daemon until a shutdown signal or an engine-level failure.
pub async fn run(options: RunOptions) -> Result<()> {
    ignore_sigpipe();
    let pid_path = write_pid_file()?;
    info!(
        "daemon_started";
        "pid" => std::process::id(),
        "pid_file" => pid_path.display().to_string()
    );

    let result = match options.mappings.clone() {
        None => run_listen_only().await,
        Some(mapping_path) => run_forwarding(mapping_path, &options).await,
    };

    remove_pid_file();
    result
}

/// Without a mapping file the daemon only reports device comings and goings
/// on stdout.
async fn run_listen_only() -> Result<()> {
    let client = MuxClient::new();
    let mut subscription = client.subscribe().await?;
    info!("listen_only_mode"; "socket" => client.socket_path().display().to_string());

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            event = subscription.next_event() => match event? {
                MuxEvent::Attached(props) => {
                    println!(
                        "Device {} with serial number: {} connected",
                        props.device_id, props.serial_number
                    );
                }
                MuxEvent::Detached { device_id } => {
                    println!("Device {} disconnected", device_id);
                }
            },
            _ = sigusr1.recv() => {
                info!("reload_ignored_without_mapping");
            }
            _ = sigusr2.recv() => break,
            _ = sigterm.recv() => break,
        }
    }
    Ok(())
}

async fn run_forwarding(mapping_path: PathBuf, options: &RunOptions) -> Result<()> {
    let mapping = MappingIndex::load(&mapping_path)?;
    let engine = Engine::new(
        MuxClient::new(),
        mapping,
        EngineConfig {
            mapping_path,
            tunnel_timeout: options.tunnel_timeout,
            exit_on_os_error: options.exit_on_os_error,
        },
    );
    let mut subscription = engine.start().await?;

    let status_task = match options.status_port {
        Some(port) => {
            let server = StatusServer::bind(engine.clone(), port).await?;
            Some(tokio::spawn(server.run()))
        }
        None => None,
    };

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let run_result = loop {
        tokio::select! {
            event = subscription.next_event() => match event {
                Ok(event) => {
                    if let Err(e) = engine.handle_event(event).await {
                        error!("engine_stopped"; "error" => e.to_string());
                        break Err(e);
                    }
                }
                Err(e) => {
                    error!("mux_event_stream_failed"; "error" => e.to_string());
                    break Err(e);
                }
            },
            _ = sigusr1.recv() => {
                info!("reload_requested"; "signal" => "SIGUSR1");
                if let Err(e) = engine.restart().await {
                    error!("reload_failed"; "error" => e.to_string());
                    break Err(e);
                }
            }
            _ = sigusr2.recv() => {
                info!("shutdown_requested"; "signal" => "SIGUSR2");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("shutdown_requested"; "signal" => "SIGTERM");
                break Ok(());
            }
        }
    };

    engine.complete_shutdown().await;
    if let Some(task) = status_task {
        task.abort();
    }
    run_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");

        write_pid_file_at(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim().parse::<u32>().unwrap(), std::process::id());

        // Our own pid counts as running.
        assert_eq!(read_running_pid_at(&path).unwrap(), std::process::id());
    }

    #[test]
    fn test_live_foreign_pid_is_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");
        // Pid 1 is always alive and never ours.
        fs::write(&path, "1").unwrap();

        match write_pid_file_at(&path) {
            Err(AppError::AlreadyRunning(1)) => {}
            other => panic!("expected AlreadyRunning, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_stale_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");

        // A spawned-and-reaped child is a pid that is certainly dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, dead_pid.to_string()).unwrap();

        write_pid_file_at(&path).unwrap();
        assert_eq!(read_running_pid_at(&path).unwrap(), std::process::id());
    }

    #[test]
    fn test_missing_pid_file_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        match read_running_pid_at(&dir.path().join("gandalf.pid")) {
            Err(AppError::NotRunning) => {}
            other => panic!("expected NotRunning, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_garbage_pid_file_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");
        fs::write(&path, "not-a-pid\n").unwrap();
        match read_running_pid_at(&path) {
            Err(AppError::NotRunning) => {}
            other => panic!("expected NotRunning, got {:?}", other.err()),
        }
    }
}
