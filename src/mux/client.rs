//! Mux client operations: event subscription and per-tunnel connects.
//!
//! Subscriptions and connects never share a socket; the mux dedicates a
//! connection to whichever role its first request selects.

use std::path::{Path, PathBuf};

use tokio::net::UnixStream;
use tracing::debug;

use super::frame;
use super::message::{self, MuxEvent, MuxReply};
use crate::config;
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct MuxClient {
    socket_path: PathBuf,
}

impl Default for MuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxClient {
    /// Client for the ambient mux socket (`/var/run/usbmuxd`, or the
    /// USBMUXD_SOCKET_ADDRESS override).
    #[must_use]
    pub fn new() -> Self {
        Self {
            socket_path: config::mux_socket_path(),
        }
    }

    #[must_use]
    pub fn with_socket_path(path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn open(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| AppError::MuxUnreachable {
                path: self.socket_path.clone(),
                source,
            })
    }

    /// Send `Listen` on a fresh connection and return the event stream.
    pub async fn subscribe(&self) -> Result<MuxSubscription> {
        let mut stream = self.open().await?;
        frame::write_frame(&mut stream, &message::listen_payload()).await?;
        let (_, payload) = frame::read_frame(&mut stream).await?;
        match message::parse_reply(&payload)? {
            MuxReply::Success => {
                debug!("mux subscription established");
                Ok(MuxSubscription {
                    stream,
                    buffer: Vec::new(),
                })
            }
            other => Err(reply_error(other, None)),
        }
    }

    /// Open a fresh mux connection and negotiate a connect to
    /// `device_port` on the device the mux knows as `device_id`. On success
    /// the returned socket is the data path to the device.
    pub async fn connect_device(&self, device_id: i32, device_port: u16) -> Result<UnixStream> {
        let mut stream = self.open().await?;
        let payload = message::connect_payload(device_id, device_port);
        frame::write_frame(&mut stream, &payload).await?;
        let (_, reply) = frame::read_frame(&mut stream).await?;
        match message::parse_reply(&reply)? {
            MuxReply::Success => Ok(stream),
            other => Err(reply_error(other, Some((device_id, device_port)))),
        }
    }
}

fn reply_error(reply: MuxReply, target: Option<(i32, u16)>) -> AppError {
    match (reply, target) {
        (MuxReply::DeviceNotConnected, Some((device_id, _))) => {
            AppError::DeviceNotConnected(device_id)
        }
        (MuxReply::PortNotAvailable, Some((device_id, device_port))) => {
            AppError::PortNotAvailable {
                device_id,
                device_port,
            }
        }
        (MuxReply::MalformedRequest, _) => AppError::MalformedRequest,
        (MuxReply::UnknownCode(code), _) => AppError::MuxReplyUnknown(code),
        (reply, _) => AppError::UnexpectedReply(format!("unexpected reply {:?}", reply)),
    }
}

/// A live `Listen` subscription. Dropping it closes the connection.
pub struct MuxSubscription {
    stream: UnixStream,
    /// Partial-frame reassembly buffer. Frames are only removed once whole,
    /// so `next_event` can be raced against a timeout without desyncing the
    /// stream.
    buffer: Vec<u8>,
}

impl MuxSubscription {
    /// Next attach/detach event. Frames carrying message types the daemon
    /// does not act on are skipped. Ends with an error when the mux closes
    /// the connection.
    pub async fn next_event(&mut self) -> Result<MuxEvent> {
        use tokio::io::AsyncReadExt;

        loop {
            while let Some(payload) = self.take_buffered_frame()? {
                if let Some(event) = message::parse_event(&payload)? {
                    return Ok(event);
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(AppError::ShortRead);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < frame::HEADER_LEN {
            return Ok(None);
        }
        let header_bytes: [u8; frame::HEADER_LEN] =
            self.buffer[..frame::HEADER_LEN].try_into().unwrap();
        let header = frame::FrameHeader::from_bytes(&header_bytes);
        let total = header.total_length as usize;
        if total < frame::HEADER_LEN {
            return Err(AppError::UnexpectedReply(format!(
                "frame declares total length {} below the header size",
                header.total_length
            )));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        let payload = self.buffer[frame::HEADER_LEN..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(payload))
    }
}
