//! Length-prefixed framing codec for node-to-node messages.
//!
//! Each frame is a 4-byte big-endian body length followed by that many bytes
//! of JSON. [`FrameReader`] and [`FrameWriter`] read and write typed frames
//! over any async byte stream.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Reads length-prefixed JSON frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read and decode the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` on EOF inside a frame, oversized frames, or a body
    /// that does not decode as `T`.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let Some(len) = self.read_length().await? else {
            return Ok(None);
        };

        if len > MAX_FRAME_BYTES {
            bail!("frame length {len} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        let value = serde_json::from_slice(&body).context("decoding frame body")?;
        Ok(Some(value))
    }

    async fn read_length(&mut self) -> Result<Option<usize>> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_BYTES {
            let n = self
                .reader
                .read(&mut prefix[filled..])
                .await
                .context("reading frame length")?;
            if n == 0 {
                // EOF is only clean before the first prefix byte.
                if filled == 0 {
                    return Ok(None);
                }
                bail!("unexpected EOF inside frame length prefix");
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(prefix) as usize))
    }
}

/// Writes length-prefixed JSON frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let body = serde_json::to_vec(msg).context("encoding frame body")?;
        if body.len() > MAX_FRAME_BYTES {
            bail!(
                "frame length {} exceeds maximum {MAX_FRAME_BYTES}",
                body.len()
            );
        }
        let prefix = u32::try_from(body.len())
            .context("frame length overflows u32")?
            .to_be_bytes();

        self.writer
            .write_all(&prefix)
            .await
            .context("writing frame length")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;

        Ok(())
    }
}
