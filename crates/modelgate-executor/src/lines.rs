use bytes::Bytes;

use crate::transport::{BodyStream, TransportError};

/// Upstream SSE lines can carry multi-megabyte tool payloads; anything
/// beyond this is treated as a protocol error rather than buffered forever.
pub const MAX_LINE_BYTES: usize = 20 * 1024 * 1024;

/// Splits a streamed response body into lines.
pub struct LineReader {
    body: BodyStream,
    buffer: Vec<u8>,
    done: bool,
}

impl LineReader {
    pub fn new(body: BodyStream) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Next line without its terminator, `Ok(None)` at EOF.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(Bytes::from(line)));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return Ok(Some(Bytes::from(line)));
            }
            match self.body.recv().await {
                Some(Ok(chunk)) => {
                    if self.buffer.len() + chunk.len() > MAX_LINE_BYTES {
                        return Err(TransportError::other("stream line exceeds buffer budget"));
                    }
                    self.buffer.extend_from_slice(&chunk);
                }
                Some(Err(err)) => return Err(err),
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn reader_for(chunks: Vec<&'static [u8]>) -> LineReader {
        let (tx, rx) = mpsc::channel(8);
        for chunk in chunks {
            tx.send(Ok(Bytes::from_static(chunk))).await.unwrap();
        }
        drop(tx);
        LineReader::new(rx)
    }

    #[tokio::test]
    async fn splits_lines_across_chunks() {
        let mut reader = reader_for(vec![b"data: {\"a\"", b":1}\n\ndata:", b" [DONE]\n"]).await;
        assert_eq!(
            reader.next_line().await.unwrap().unwrap(),
            Bytes::from_static(b"data: {\"a\":1}")
        );
        assert_eq!(reader.next_line().await.unwrap().unwrap(), Bytes::new());
        assert_eq!(
            reader.next_line().await.unwrap().unwrap(),
            Bytes::from_static(b"data: [DONE]")
        );
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trailing_partial_line_is_flushed() {
        let mut reader = reader_for(vec![b"no newline at eof"]).await;
        assert_eq!(
            reader.next_line().await.unwrap().unwrap(),
            Bytes::from_static(b"no newline at eof")
        );
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn strips_carriage_returns() {
        let mut reader = reader_for(vec![b"data: x\r\n"]).await;
        assert_eq!(
            reader.next_line().await.unwrap().unwrap(),
            Bytes::from_static(b"data: x")
        );
    }
}
