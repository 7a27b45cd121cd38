//! Newline-delimited JSON messages interleaved with raw payload bytes.

use crate::error::{Result, ZangetsuError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

/// Longest JSON line accepted from the peer.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A buffered, bidirectional protocol stream.
///
/// Writes are buffered until [`flush`](Self::flush). Partially read lines
/// survive cancellation, so [`receive`](Self::receive) and
/// [`wait_for_eof`](Self::wait_for_eof) may be used inside `select!`.
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufStream<S>,
    line: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            line: Vec::new(),
        }
    }

    /// Queues one JSON message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut encoded = serde_json::to_vec(message)?;
        encoded.push(b'\n');
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Queues raw bytes.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Writes everything queued so far.
    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one JSON message. Returns `None` if the peer closed the
    /// connection between messages.
    ///
    /// # Errors
    ///
    /// [`ZangetsuError::Protocol`] if the connection ends mid-message or the
    /// line exceeds [`MAX_MESSAGE_SIZE`]; [`ZangetsuError::Json`] if the line
    /// does not parse as `T`.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(end) = self.line.iter().position(|&b| b == b'\n') {
                let parsed = serde_json::from_slice(&self.line[..end]);
                self.line.drain(..=end);
                return Ok(Some(parsed?));
            }
            if self.line.len() > MAX_MESSAGE_SIZE {
                return Err(ZangetsuError::Protocol(format!(
                    "message exceeds {} bytes",
                    MAX_MESSAGE_SIZE
                )));
            }

            let buf = self.stream.fill_buf().await?;
            if buf.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Err(ZangetsuError::Protocol(
                    "connection closed in the middle of a message".into(),
                ));
            }
            let taken = match buf.iter().position(|&b| b == b'\n') {
                Some(end) => end + 1,
                None => buf.len(),
            };
            self.line.extend_from_slice(&buf[..taken]);
            self.stream.consume(taken);
        }
    }

    /// Reads exactly `size` raw bytes.
    pub async fn receive_bytes(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        let from_line = self.line.len().min(size);
        data[..from_line].copy_from_slice(&self.line[..from_line]);
        self.line.drain(..from_line);

        match self.stream.read_exact(&mut data[from_line..]).await {
            Ok(_) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                ZangetsuError::Protocol(format!("connection closed before {} payload bytes arrived", size)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    /// Waits until the peer closes its side of the connection.
    ///
    /// # Errors
    ///
    /// [`ZangetsuError::Protocol`] if the peer sends anything instead.
    pub async fn wait_for_eof(&mut self) -> Result<()> {
        if !self.line.is_empty() {
            return Err(ZangetsuError::Protocol("unexpected data from peer".into()));
        }
        let buf = self.stream.fill_buf().await?;
        if buf.is_empty() {
            Ok(())
        } else {
            Err(ZangetsuError::Protocol("unexpected data from peer".into()))
        }
    }

    /// Returns the underlying stream. Buffered data is lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}
