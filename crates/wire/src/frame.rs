//! Length-delimited framing for stream transports.
//!
//! Each frame is a 4-byte big-endian length followed by one encoded prost
//! message. `FrameSink` and `FrameStream` wrap the write and read halves of a
//! stream with tokio-util's `LengthDelimitedCodec`.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{
    FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError,
};

use crate::WireError;

/// Default maximum accepted frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Codec shared by both halves: u32 big-endian prefix, bounded length.
pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

fn codec_error(e: std::io::Error, max: usize) -> WireError {
    let oversize = e
        .get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
    if oversize {
        WireError::FrameTooLarge { max }
    } else {
        WireError::Io(e)
    }
}

/// Framed writer.
pub struct FrameSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameSink<W> {
    pub fn new(writer: W, max_frame_len: usize) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec(max_frame_len)),
            max_frame_len,
        }
    }

    /// Send one raw frame and flush.
    pub async fn send_bytes(&mut self, payload: impl Into<Bytes>) -> Result<(), WireError> {
        self.inner
            .send(payload.into())
            .await
            .map_err(|e| codec_error(e, self.max_frame_len))
    }

    /// Encode and send one message.
    pub async fn send<M: Message>(&mut self, message: &M) -> Result<(), WireError> {
        self.send_bytes(message.encode_to_vec()).await
    }
}

/// Framed reader.
pub struct FrameStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, codec(max_frame_len)),
            max_frame_len,
        }
    }

    /// Next raw frame. `Ok(None)` when the stream ends between frames; a
    /// stream that ends inside a frame is an error.
    pub async fn recv_bytes(&mut self) -> Result<Option<BytesMut>, WireError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(codec_error(e, self.max_frame_len)),
            None => Ok(None),
        }
    }

    /// Next decoded message. `Ok(None)` on clean end of stream.
    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, WireError> {
        match self.recv_bytes().await? {
            Some(frame) => Ok(Some(M::decode(frame.freeze())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkHello;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (client, server) = duplex(64 * 1024);
        let mut sink = FrameSink::new(client, DEFAULT_MAX_FRAME_LEN);
        let mut stream = FrameStream::new(server, DEFAULT_MAX_FRAME_LEN);
        let hello = LinkHello {
            listen_address: "127.0.0.1:4801".into(),
        };

        sink.send(&hello).await.unwrap();
        let got: LinkHello = stream.recv().await.unwrap().unwrap();
        assert_eq!(got, hello);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, server) = duplex(1024);
        drop(client);
        let mut stream = FrameStream::new(server, DEFAULT_MAX_FRAME_LEN);
        assert!(stream.recv_bytes().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, server) = duplex(1024);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut stream = FrameStream::new(server, DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(stream.recv_bytes().await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_rejects_too_large_frame() {
        let (mut client, server) = duplex(1024);
        // Only the prefix is needed; the reader bails before the body.
        client.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();

        let mut stream = FrameStream::new(server, DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(
            stream.recv_bytes().await,
            Err(WireError::FrameTooLarge { max: DEFAULT_MAX_FRAME_LEN })
        ));
    }

    #[tokio::test]
    async fn test_refuses_to_send_too_large_frame() {
        let (client, _server) = duplex(1024);
        let mut sink = FrameSink::new(client, 8);
        assert!(matches!(
            sink.send_bytes(vec![0u8; 9]).await,
            Err(WireError::FrameTooLarge { max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (client, server) = duplex(1024);
        let mut sink = FrameSink::new(client, 16);
        sink.send_bytes(&b"one"[..]).await.unwrap();
        sink.send_bytes(Bytes::new()).await.unwrap();
        sink.send_bytes(&b"three"[..]).await.unwrap();
        drop(sink);

        let mut stream = FrameStream::new(server, 16);
        let mut got = Vec::new();
        while let Some(frame) = stream.recv_bytes().await.unwrap() {
            got.push(frame.to_vec());
        }
        assert_eq!(got, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }
}
