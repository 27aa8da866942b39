use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;
use crate::protocol::Message;

/// Reads newline-delimited frames, bounded by `max_frame_bytes`.
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes,
            buf: Vec::new(),
        }
    }

    /// Next frame without its line terminator.
    ///
    /// `Ok(None)` means the peer closed the stream cleanly between frames.
    /// Bytes left at end of stream without a newline come back as a last frame,
    /// so a truncated message shows up as a decode failure rather than silence.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            self.buf.clear();
            // Room for a `\r\n` terminator on top of a full-size payload.
            let limit = self.max_frame_bytes as u64 + 2;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if n == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if terminated {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            }
            if self.buf.len() > self.max_frame_bytes {
                return Err(SessionError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }

            // blank keep-alive lines
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                if terminated {
                    continue;
                }
                return Ok(None);
            }

            return Ok(Some(std::mem::take(&mut self.buf)));
        }
    }
}

/// Decode one frame into a message.
pub fn decode(frame: &[u8]) -> Result<Message, SessionError> {
    serde_json::from_slice(frame).map_err(SessionError::Decode)
}

/// Encode `msg` as a single line and write it out.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), SessionError> {
    let mut out = serde_json::to_vec(msg).map_err(SessionError::Encode)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(bytes: &'static [u8], max: usize) -> FrameReader<BufReader<&'static [u8]>> {
        FrameReader::new(BufReader::new(bytes), max)
    }

    #[tokio::test]
    async fn splits_on_newlines_and_skips_blank_lines() {
        let mut frames = reader(b"{\"id\":\"a\"}\n\r\n\n{\"id\":\"b\"}\r\n", 64);

        assert_eq!(frames.next_frame().await.unwrap().unwrap(), b"{\"id\":\"a\"}");
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), b"{\"id\":\"b\"}");
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut frames = reader(b"", 64);
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trailing_bytes_without_newline_become_a_frame() {
        let mut frames = reader(b"{\"id\":\"m1\",\"ty", 64);
        let frame = frames.next_frame().await.unwrap().unwrap();
        assert!(matches!(decode(&frame), Err(SessionError::Decode(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut frames = reader(b"0123456789\n", 4);
        assert!(matches!(
            frames.next_frame().await,
            Err(SessionError::FrameTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn frame_at_exact_limit_is_accepted() {
        let mut frames = reader(b"1234\n", 4);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), b"1234");
    }

    #[tokio::test]
    async fn crlf_terminator_does_not_count_toward_the_limit() {
        let mut frames = reader(b"1234\r\n5678\n", 4);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), b"1234");
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), b"5678");

        let mut frames = reader(b"12345\r\n", 4);
        assert!(matches!(
            frames.next_frame().await,
            Err(SessionError::FrameTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn unterminated_overflow_is_rejected() {
        let mut frames = reader(b"12345", 4);
        assert!(matches!(
            frames.next_frame().await,
            Err(SessionError::FrameTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn written_frame_reads_back() {
        let msg = Message {
            kind: "data".into(),
            id: "m1".into(),
            ..Message::default()
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, &msg).await.unwrap();
        assert_eq!(wire.last(), Some(&b'\n'));

        let mut frames = FrameReader::new(BufReader::new(wire.as_slice()), 1024);
        let frame = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }
}
