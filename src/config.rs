use std::path::PathBuf;
use std::time::Duration;

/// Unix socket where usbmuxd listens for clients.
pub const MUX_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Pid file written by the running daemon; read by `reload` / `shutdown`.
pub const PID_FILE_PATH: &str = "/var/run/gandalf.pid";

/// How long the engine accumulates the initial burst of `Attached` events
/// before binding listeners.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(1);

/// Client name reported to usbmuxd in every request.
pub const PROG_NAME: &str = "gandalf";

/// Version string reported to usbmuxd (stamped by build.rs, overridable
/// through GANDALF_GIT_TAG at build time).
pub const CLIENT_VERSION: &str = env!("GANDALF_BUILD_VERSION");

/// Mux socket path, honoring the USBMUXD_SOCKET_ADDRESS override the mux
/// ecosystem uses. Only path-style (absolute) values are meaningful here.
#[must_use]
pub fn mux_socket_path() -> PathBuf {
    match std::env::var_os("USBMUXD_SOCKET_ADDRESS") {
        Some(addr) if !addr.is_empty() => PathBuf::from(addr),
        _ => PathBuf::from(MUX_SOCKET_PATH),
    }
}

/// Pid file path, honoring the GANDALF_PID_FILE override.
#[must_use]
pub fn pid_file_path() -> PathBuf {
    match std::env::var_os("GANDALF_PID_FILE") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(PID_FILE_PATH),
    }
}
