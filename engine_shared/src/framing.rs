//! Length-prefixed framing for TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself and must lie in
//! `(0, MAX_FRAME_LEN]`. A read that cannot produce a full frame yields
//! `None` ("no message"), which is distinct from any payload.

use anyhow::{bail, Context};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tracing::{debug, trace};

/// Upper bound for a frame payload (1 MiB).
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Reads one frame. Returns `None` if the stream ends or errors before a full
/// frame arrives, or if the length prefix is outside `(0, MAX_FRAME_LEN]`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        trace!(error = %e, "Frame length read ended");
        return None;
    }

    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        debug!(len, "Rejecting frame with invalid length prefix");
        return None;
    }

    let mut payload = vec![0u8; len as usize];
    if let Err(e) = reader.read_exact(&mut payload).await {
        trace!(error = %e, "Frame body read ended");
        return None;
    }
    Some(payload)
}

/// Writes one frame as a single buffer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len == 0 || len > MAX_FRAME_LEN {
        bail!("frame payload of {} bytes is outside (0, {MAX_FRAME_LEN}]", payload.len());
    }

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await.context("tcp write")?;
    writer.flush().await.context("tcp flush")?;
    Ok(())
}

/// Receiving half of a framed connection.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: Option<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }

    /// Receives the next frame. Once a read fails the reader is released and
    /// every later call returns `None`.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let reader = self.inner.as_mut()?;
        let frame = read_frame(reader).await;
        if frame.is_none() {
            self.inner = None;
        }
        frame
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn close(&mut self) {
        self.inner = None;
    }
}

/// Sending half of a framed connection.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: Option<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    /// Sends a frame. Sending on a closed writer is a silent no-op; a failed
    /// write closes the writer and returns the error.
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let Some(writer) = self.inner.as_mut() else {
            return Ok(());
        };
        if let Err(e) = write_frame(writer, payload).await {
            self.inner = None;
            return Err(e);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Shuts the write side down and releases it. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Splits a TCP stream into independently owned framed halves.
pub fn split_tcp(stream: TcpStream) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}
