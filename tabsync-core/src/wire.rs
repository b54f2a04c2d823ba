//! Framed reading and writing over a byte stream.
//!
//! A session first exchanges JSON text messages and then switches to
//! length-prefixed frames on the same stream. [`FramedReader`] keeps one
//! buffer across both phases, so bytes that arrive together with the last
//! text message are not lost.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tabsync_types::{MessageError, MAX_MESSAGE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ReplicationError, Result};
use crate::frame::{encode_frame, Frame, FrameDecoder, HEARTBEAT};

const READ_CHUNK: usize = 64 * 1024;

/// Reads text messages and frames from a stream.
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
            read_timeout: None,
        }
    }

    /// Fail any single read that takes longer than `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Change the per-read timeout.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Read one JSON text message.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some(value) = self.try_parse_message()? {
                return Ok(value);
            }
            if self.decoder.buffered() > MAX_MESSAGE_SIZE {
                return Err(MessageError::TooLarge {
                    size: self.decoder.buffered(),
                    limit: MAX_MESSAGE_SIZE,
                }
                .into());
            }
            self.fill().await?;
        }
    }

    /// Read one frame, waiting across as many reads as it takes.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn try_parse_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let parsed = {
            let mut stream =
                serde_json::Deserializer::from_slice(self.decoder.buffer()).into_iter::<T>();
            match stream.next() {
                Some(Ok(value)) => Some(Ok((value, stream.byte_offset()))),
                Some(Err(e)) if e.is_eof() => None,
                Some(Err(e)) => Some(Err(e)),
                None => None,
            }
        };
        match parsed {
            Some(Ok((value, used))) => {
                self.decoder.consume(used);
                Ok(Some(value))
            }
            Some(Err(e)) => Err(MessageError::Deserialization(e).into()),
            None => Ok(None),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let read = self.inner.read(&mut self.chunk);
        let n = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ReplicationError::Timeout(limit))??,
            None => read.await?,
        };
        if n == 0 {
            let buffered = self.decoder.buffered();
            return Err(if buffered > 0 {
                ProtocolError::Truncated { buffered }.into()
            } else {
                ReplicationError::Closed
            });
        }
        self.decoder.feed(&self.chunk[..n]);
        Ok(())
    }
}

/// Writes text messages and frames to a stream.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wrap a stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one compact JSON text message.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message).map_err(MessageError::Serialization)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Compress and write one frame. Returns the bytes put on the wire.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let frame = encode_frame(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(frame.len())
    }

    /// Write the heartbeat marker.
    pub async fn write_heartbeat(&mut self) -> Result<()> {
        self.inner.write_all(&HEARTBEAT).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_types::StateReply;

    #[tokio::test]
    async fn message_then_frames_share_one_read() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWriter::new(client);
        let mut reader = FramedReader::new(server);

        // Both land in the reader's buffer with a single read.
        let reply = StateReply {
            mtime: 2.5,
            count: 9,
        };
        let mut bytes = serde_json::to_vec(&reply).unwrap();
        bytes.extend_from_slice(&HEARTBEAT);
        bytes.extend_from_slice(&encode_frame(b"rows"));
        writer.inner.write_all(&bytes).await.unwrap();

        let got: StateReply = reader.read_message().await.unwrap();
        assert_eq!(got, reply);
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Heartbeat);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Data(b"rows".to_vec())
        );
    }

    #[tokio::test]
    async fn message_split_across_reads() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FramedReader::new(server);

        let handle = tokio::spawn(async move {
            client.write_all(br#"{"mtime":1.0,"#).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(br#""count":3}"#).await.unwrap();
            client
        });

        let got: StateReply = reader.read_message().await.unwrap();
        assert_eq!(got.count, 3);
        drop(handle.await.unwrap());
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FramedReader::new(server);
        client.write_all(b"{not json}").await.unwrap();
        let err = reader.read_message::<StateReply>().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Message(_)));
    }

    #[tokio::test]
    async fn clean_close_and_truncation_are_distinguished() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let mut reader = FramedReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(ReplicationError::Closed)
        ));

        let (mut client, server) = tokio::io::duplex(1024);
        let frame = encode_frame(b"partial payload");
        client.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(client);
        let mut reader = FramedReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(ReplicationError::Protocol(ProtocolError::Truncated { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_fires() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut reader = FramedReader::new(server).with_read_timeout(Duration::from_secs(60));
        assert!(matches!(
            reader.read_frame().await,
            Err(ReplicationError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let (mut client, server) = tokio::io::duplex(MAX_MESSAGE_SIZE * 2);
        let mut reader = FramedReader::new(server);
        let mut junk = b"{\"token\":\"".to_vec();
        junk.extend(std::iter::repeat(b'a').take(MAX_MESSAGE_SIZE + 10));
        let writer = tokio::spawn(async move {
            let _ = client.write_all(&junk).await;
            client
        });
        let err = reader.read_message::<StateReply>().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Message(MessageError::TooLarge { .. })));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn writer_output_decodes() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWriter::new(client);
        let mut reader = FramedReader::new(server);

        let sent = writer.write_frame(&[7u8; 256]).await.unwrap();
        assert!(sent > 4);
        writer.write_heartbeat().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), Frame::Data(vec![7u8; 256]));
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Heartbeat);
    }
}
