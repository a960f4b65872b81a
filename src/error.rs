use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("mapping file {path}: {reason}")]
    MappingFile { path: PathBuf, reason: String },

    #[error("usbmuxd is not reachable at {path} -- is it running? ({source})")]
    MuxUnreachable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unexpected mux reply: {0}")]
    UnexpectedReply(String),

    #[error("mux result code {0} is not known")]
    MuxReplyUnknown(i64),

    #[error("device {0} is not connected")]
    DeviceNotConnected(i32),

    #[error("device {device_id} refused connection to port {device_port}")]
    PortNotAvailable { device_id: i32, device_port: u16 },

    #[error("mux request was malformed")]
    MalformedRequest,

    #[error("mux connection closed mid-frame")]
    ShortRead,

    #[error("plist error: {0}")]
    Plist(String),

    #[error("cannot open pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("no running daemon found -- are you sure it was running?")]
    NotRunning,

    #[error("not permitted to signal the running daemon: {0}")]
    SignalDenied(String),

    #[error("status endpoint not reachable: {0}")]
    StatusUnreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Process exit code for this error. The numeric values are part of the
    /// CLI contract and must not be renumbered.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::SignalDenied(_) => 2,
            AppError::AlreadyRunning(_) => 3,
            AppError::PidFile { .. } => 4,
            AppError::NotRunning => 5,
            AppError::StatusUnreachable(_) => 6,
            AppError::MuxUnreachable { .. } => 7,
            AppError::MappingFile { .. } => 8,
            AppError::Io(_) => 9,
            AppError::ShortRead => 9,
            _ => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_contract_values() {
        let mapping = AppError::MappingFile {
            path: PathBuf::from("/tmp/m.json"),
            reason: "missing field `forwarding`".into(),
        };
        assert_eq!(mapping.exit_code(), 8);

        let mux = AppError::MuxUnreachable {
            path: PathBuf::from("/var/run/usbmuxd"),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(mux.exit_code(), 7);

        assert_eq!(AppError::NotRunning.exit_code(), 5);
        assert_eq!(AppError::AlreadyRunning(42).exit_code(), 3);
        assert_eq!(AppError::SignalDenied("EPERM".into()).exit_code(), 2);
        assert_eq!(AppError::StatusUnreachable("refused".into()).exit_code(), 6);
        assert_eq!(AppError::MuxReplyUnknown(77).exit_code(), 10);
    }
}
