//! Line-delimited JSON framing over a byte stream.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

/// Maximum frame size (1MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A bidirectional byte stream a duplex connection can run over.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Reading side of a [`Link`].
pub struct FrameReader {
    inner: BufReader<ReadHalf<BoxConnection>>,
    /// Bytes of a frame whose newline has not arrived yet.
    partial: Vec<u8>,
}

impl FrameReader {
    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Read the next raw line, for callers that decode leniently.
    ///
    /// Never buffers more than [`MAX_FRAME_SIZE`] plus one byte. Cancel safe:
    /// a partly read frame is kept for the next call.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let budget = (MAX_FRAME_SIZE + 1).saturating_sub(self.partial.len()) as u64;
        (&mut self.inner)
            .take(budget)
            .read_until(b'\n', &mut self.partial)
            .await?;

        if self.partial.is_empty() {
            return Ok(None);
        }
        if self.partial.last() == Some(&b'\n') {
            self.partial.pop();
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
        } else if self.partial.len() > MAX_FRAME_SIZE {
            let size = self.partial.len();
            self.partial.clear();
            return Err(Error::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let line = std::mem::take(&mut self.partial);
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

/// Writing side of a [`Link`].
pub struct FrameWriter {
    inner: WriteHalf<BoxConnection>,
}

impl FrameWriter {
    pub async fn write<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.write_line(&json).await
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A framed duplex connection.
pub struct Link {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Link {
    pub fn new(io: impl Connection) -> Self {
        let boxed: BoxConnection = Box::new(io);
        let (read, write) = tokio::io::split(boxed);
        Self {
            reader: FrameReader {
                inner: BufReader::new(read),
                partial: Vec::new(),
            },
            writer: FrameWriter { inner: write },
        }
    }

    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.reader.read().await
    }

    pub async fn write<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        self.writer.write(frame).await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}
