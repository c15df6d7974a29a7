//! Framed AudioSocket connection
//!
//! Splits a TCP stream into a reading half that yields whole frames and a
//! writing half that serializes them. Reads are buffered; each call pulls
//! at most one frame so callers can interleave their own polling (the leg
//! handlers bound every read with the termination poll interval).

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{AudioSocketError, Result};
use crate::frame::Frame;

const READ_CHUNK: usize = 4096;

/// Reading half of an AudioSocket connection.
pub struct FrameStream {
    reader: OwnedReadHalf,
    buf: BytesMut,
}

/// Writing half of an AudioSocket connection.
pub struct FrameSink {
    writer: OwnedWriteHalf,
}

/// Split a freshly accepted stream into framed halves.
pub fn split(stream: TcpStream) -> (FrameStream, FrameSink) {
    let (reader, writer) = stream.into_split();
    (
        FrameStream {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
        },
        FrameSink { writer },
    )
}

impl FrameStream {
    /// Read the next frame, waiting for bytes as needed.
    ///
    /// Returns [`AudioSocketError::Closed`] when the peer shuts the stream
    /// down cleanly at a frame boundary; a close mid-frame surfaces as an
    /// I/O error.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(frame);
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(AudioSocketError::Closed);
                }
                return Err(AudioSocketError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                )));
            }
        }
    }
}

impl FrameSink {
    /// Serialize and write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes();
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Write the 3-byte HANGUP frame.
    pub async fn send_hangup(&mut self) -> Result<()> {
        self.write_frame(&Frame::Hangup).await
    }

    /// Flush and shut the writing direction down.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_id::CallId;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_survive_a_loopback_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_rx, mut tx) = split(stream);
            tx.write_frame(&Frame::Id(CallId::generate())).await.unwrap();
            tx.write_frame(&Frame::Audio(Bytes::from(vec![7u8; 320])))
                .await
                .unwrap();
            tx.send_hangup().await.unwrap();
            tx.close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut rx, _tx) = split(stream);

        assert!(matches!(rx.read_frame().await.unwrap(), Frame::Id(_)));
        match rx.read_frame().await.unwrap() {
            Frame::Audio(pcm) => assert_eq!(pcm.len(), 320),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(rx.read_frame().await.unwrap(), Frame::Hangup));
        assert!(matches!(
            rx.read_frame().await.unwrap_err(),
            AudioSocketError::Closed
        ));

        client.await.unwrap();
    }
}
