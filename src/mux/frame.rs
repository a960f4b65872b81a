//! Mux frame layer: a 16-byte little-endian header followed by an XML plist
//! payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, Result};

pub const HEADER_LEN: usize = 16;

/// Protocol version 1 selects plist payloads (0 is the legacy binary form,
/// which we never send).
pub const VERSION_PLIST: u32 = 1;

/// Message category for plist traffic. All requests and replies use it.
pub const REQUEST_PLIST: u32 = 8;

/// Correlation tag. All our interactions are strictly request/reply or a
/// subscription on a dedicated connection, so a constant is sufficient.
pub const TAG: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including the header itself.
    pub total_length: u32,
    pub version: u32,
    pub request: u32,
    pub tag: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn for_payload(payload_len: usize) -> Self {
        Self {
            total_length: (payload_len + HEADER_LEN) as u32,
            version: VERSION_PLIST,
            request: REQUEST_PLIST,
            tag: TAG,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.total_length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.request.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.tag.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Self {
            total_length: word(0),
            version: word(4),
            request: word(8),
            tag: word(12),
        }
    }
}

/// Write one frame. The header and payload are assembled into a single
/// buffer and written with one `write_all`, so a frame is never interleaved
/// with another write on the same stream.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = FrameHeader::for_payload(payload.len());
    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(payload);
    stream.write_all(&buffer).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one whole frame. EOF mid-frame is a `ShortRead`; EOF exactly on a
/// frame boundary surfaces the same way, which callers treat as the
/// connection closing.
pub async fn read_frame<S>(stream: &mut S) -> Result<(FrameHeader, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header_bytes)
        .await
        .map_err(short_read)?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if (header.total_length as usize) < HEADER_LEN {
        return Err(AppError::UnexpectedReply(format!(
            "frame declares total length {} below the header size",
            header.total_length
        )));
    }

    let mut payload = vec![0u8; header.total_length as usize - HEADER_LEN];
    stream.read_exact(&mut payload).await.map_err(short_read)?;
    Ok((header, payload))
}

fn short_read(err: std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        AppError::ShortRead
    } else {
        AppError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"<plist/>").await.unwrap();
        let (header, payload) = read_frame(&mut b).await.unwrap();

        assert_eq!(header.total_length as usize, HEADER_LEN + 8);
        assert_eq!(header.version, VERSION_PLIST);
        assert_eq!(header.request, REQUEST_PLIST);
        assert_eq!(header.tag, TAG);
        assert_eq!(payload, b"<plist/>");
    }

    #[tokio::test]
    async fn test_empty_payload_is_not_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, b"").await.unwrap();
        let (header, payload) = read_frame(&mut b).await.unwrap();

        assert_eq!(header.total_length as usize, HEADER_LEN);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_eof_mid_header_is_short_read() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0u8; 7]).await.unwrap();
        drop(a);

        match read_frame(&mut b).await {
            Err(AppError::ShortRead) => {}
            other => panic!("expected ShortRead, got {:?}", other.map(|(h, _)| h)),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_short_read() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);
        let header = FrameHeader::for_payload(100);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(b"only a little").await.unwrap();
        drop(a);

        match read_frame(&mut b).await {
            Err(AppError::ShortRead) => {}
            other => panic!("expected ShortRead, got {:?}", other.map(|(h, _)| h)),
        }
    }

    #[tokio::test]
    async fn test_undersized_length_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);
        let header = FrameHeader {
            total_length: 7,
            version: VERSION_PLIST,
            request: REQUEST_PLIST,
            tag: TAG,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(AppError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_header_byte_layout_is_little_endian() {
        let header = FrameHeader {
            total_length: 0x0102_0304,
            version: 1,
            request: 8,
            tag: 1,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[8, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[1, 0, 0, 0]);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }
}
