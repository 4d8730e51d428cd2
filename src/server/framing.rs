//! Length-prefixed framing: a 4-byte big-endian length, then the body.

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::Envelope;
use crate::error::ProtocolError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Read a length prefix. `Ok(None)` on a clean EOF before any byte.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<usize>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Closed)
            };
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(header) as usize))
}

/// Read a body of `len` bytes, rejecting anything over `limit`.
pub async fn read_body<R>(reader: &mut R, len: usize, limit: usize) -> Result<BytesMut, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { size: len, limit });
    }
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Closed
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(body)
}

/// Encode an envelope with its length prefix.
pub fn encode_frame(envelope: &Envelope) -> BytesMut {
    let len = envelope.encoded_len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    buf.put_u32(len as u32);
    // Capacity was reserved above, so encoding cannot run out of space
    let _ = envelope.encode(&mut buf);
    buf
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(envelope)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one full envelope. Used by clients and tests.
pub async fn read_envelope<R>(reader: &mut R, limit: usize) -> Result<Option<Envelope>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let Some(len) = read_header(reader).await? else {
        return Ok(None);
    };
    let body = read_body(reader, len, limit).await?;
    Ok(Some(Envelope::decode(body.freeze())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::protocol::MessageType;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = Envelope {
            r#type: MessageType::GetSensor as i32,
            data: vec![1, 2, 3],
        };
        write_envelope(&mut a, &envelope).await.unwrap();
        let received = read_envelope(&mut b, 1024).await.unwrap().unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_reading_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
        let len = read_header(&mut b).await.unwrap().unwrap();
        let err = read_body(&mut b, len, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 1_000_000, limit: 1024 }));
    }

    #[tokio::test]
    async fn test_clean_eof_and_truncated_header() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_header(&mut b).await.unwrap().is_none());

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(read_header(&mut b).await, Err(ProtocolError::Closed)));
    }
}
