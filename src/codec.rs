//! Frame Codec
//!
//! Handles message framing with Content-Length headers over any async byte
//! stream (child stdio, TCP, or in-memory pipes in tests).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::Message;

/// Reads framed messages from a byte stream.
///
/// Frames look like:
/// ```text
/// Content-Length: 123\r\n
/// \r\n
/// {"jsonrpc":"2.0",...}
/// ```
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next message from the stream.
    ///
    /// Returns `Ok(None)` on a clean stream close (EOF before any header
    /// byte of the next frame). A stream that ends mid-frame is an error.
    pub async fn read_message(&mut self) -> io::Result<Option<Message>> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        let json =
            String::from_utf8(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!("<- {}", json);

        Message::parse(&json)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read headers and return Content-Length; `None` on clean EOF.
    async fn read_headers(&mut self) -> io::Result<Option<usize>> {
        let mut content_length: Option<usize> = None;
        let mut started = false;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                if started {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-headers",
                    ));
                }
                return Ok(None);
            }
            started = true;

            let line = line.trim();

            // Empty line marks end of headers
            if line.is_empty() {
                break;
            }

            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                );
            }
            // Ignore other headers (Content-Type, etc.)
        }

        content_length
            .map(Some)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing Content-Length"))
    }
}

/// Write one framed message and flush.
///
/// Must only be called from a connection's single writer task; interleaved
/// writers would corrupt the frame boundaries.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> io::Result<()> {
    let json = serde_json::to_string(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    tracing::trace!("-> {}", json);

    let framed = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await
}
