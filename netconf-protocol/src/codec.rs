//! Async message reader and writer over a framed byte stream.

use crate::error::ProtocolError;
use crate::framing::{encode_eom, ChunkedDecoder, ChunkedEncoder, EomDecoder, Framing};
use crate::message::validate_root;
use crate::xml::Element;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Reads framed messages from the receive half of a session.
pub struct MessageReader<R> {
    inner: R,
    buffer: BytesMut,
    framing: Framing,
    eom: EomDecoder,
    chunked: ChunkedDecoder,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(8192),
            framing: Framing::EndOfMessage,
            eom: EomDecoder::new(),
            chunked: ChunkedDecoder::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Switches framing for all following messages. Bytes already buffered
    /// are kept.
    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
        self.eom.reset();
    }

    /// Reads the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends or fails before a frame
    /// completes; the peer is considered gone in both cases. Framing
    /// violations are returned as `ProtocolError::Malformed`.
    ///
    /// Cancel safe: buffered bytes survive if the future is dropped.
    pub async fn read_frame(&mut self) -> Result<Option<BytesMut>, ProtocolError> {
        loop {
            let frame = match self.framing {
                Framing::EndOfMessage => self.eom.decode(&mut self.buffer),
                Framing::Chunked => self.chunked.decode(&mut self.buffer)?,
            };
            if frame.is_some() {
                return Ok(frame);
            }

            match self.inner.read_buf(&mut self.buffer).await {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("read failed, treating as close: {}", e);
                    return Ok(None);
                }
            }
        }
    }

    /// Reads the next frame and parses it as a message whose root must be
    /// one of `expected_roots` in the base namespace.
    pub async fn read_message(
        &mut self,
        expected_roots: &[&str],
    ) -> Result<Option<Element>, ProtocolError> {
        let frame = match self.read_frame().await? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let element = Element::from_bytes(&frame)?;
        validate_root(&element, expected_roots)?;
        Ok(Some(element))
    }
}

/// Writes framed messages to the send half of a session.
pub struct MessageWriter<W> {
    inner: W,
    framing: Framing,
    chunked: ChunkedEncoder,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            framing: Framing::EndOfMessage,
            chunked: ChunkedEncoder::default(),
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_chunk_encoder(mut self, encoder: ChunkedEncoder) -> Self {
        self.chunked = encoder;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    /// Serializes `message` with an XML declaration, frames it, and flushes.
    pub async fn write_message(&mut self, message: &Element) -> Result<(), ProtocolError> {
        let mut payload = String::from(XML_DECLARATION);
        payload.push_str(&message.to_pretty_xml());
        self.write_payload(payload.as_bytes()).await
    }

    /// Frames and writes an already serialized payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.clear();
        match self.framing {
            Framing::EndOfMessage => encode_eom(payload, &mut self.buffer),
            Framing::Chunked => self.chunked.encode(payload, &mut self.buffer),
        }
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Direct access to the stream, bypassing framing.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BASE_NS;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_eom_message_in_pieces() {
        let mock = Builder::new()
            .read(b"<rpc xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\" message-id=\"1\">")
            .read(b"<get/></rpc>\n]]>")
            .read(b"]]>\n")
            .build();
        let mut reader = MessageReader::new(mock);
        let rpc = reader.read_message(&["rpc"]).await.unwrap().unwrap();
        assert_eq!(rpc.attr("message-id"), Some("1"));
        assert!(rpc.child_ns(BASE_NS, "get").is_some());
        assert!(reader.read_message(&["rpc"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_chunked_message() {
        let body = b"<rpc xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\" message-id=\"7\"><get/></rpc>";
        let mut wire = BytesMut::new();
        ChunkedEncoder::new(10).encode(body, &mut wire);

        let mock = Builder::new().read(&wire).build();
        let mut reader = MessageReader::new(mock);
        reader.set_framing(Framing::Chunked);
        let rpc = reader.read_message(&["rpc"]).await.unwrap().unwrap();
        assert_eq!(rpc.attr("message-id"), Some("7"));
    }

    #[tokio::test]
    async fn test_wrong_root_is_malformed() {
        let mock = Builder::new()
            .read(b"<other xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"/>]]>]]>")
            .build();
        let mut reader = MessageReader::new(mock);
        let err = reader.read_message(&["rpc"]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedRoot { .. }));
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_missing_namespace_is_malformed() {
        let mock = Builder::new().read(b"<rpc message-id=\"1\"/>]]>]]>").build();
        let mut reader = MessageReader::new(mock);
        let err = reader.read_message(&["rpc"]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::WrongNamespace { .. }));
    }

    #[tokio::test]
    async fn test_eof_mid_chunk_is_clean_close() {
        let mock = Builder::new().read(b"\n#10\n<rpc").build();
        let mut reader = MessageReader::new(mock);
        reader.set_framing(Framing::Chunked);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_clean_close() {
        let mock = Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = MessageReader::new(mock);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_chunk_then_next_message() {
        let mock = Builder::new()
            .read(b"\n#1a")
            .read(b"\n#5\n<ok/>\n##\n")
            .build();
        let mut reader = MessageReader::new(mock);
        reader.set_framing(Framing::Chunked);
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::Malformed(_))
        ));
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"<ok/>");
    }

    #[tokio::test]
    async fn test_write_eom_and_chunked() {
        let msg = Element::new_ns(BASE_NS, "hello");

        let mut writer = MessageWriter::new(Vec::new());
        writer.write_message(&msg).await.unwrap();
        let out = String::from_utf8(writer.get_ref().clone()).unwrap();
        assert!(out.starts_with(XML_DECLARATION));
        assert!(out.ends_with("\n]]>]]>\n"));

        let mut writer = MessageWriter::new(Vec::new());
        writer.set_framing(Framing::Chunked);
        writer.write_payload(b"abc").await.unwrap();
        assert_eq!(writer.into_inner(), b"\n#3\nabc\n##\n".to_vec());
    }
}
