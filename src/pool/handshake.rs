//! Connection handshake.
//!
//! Before a socket becomes a Pipe, both sides exchange one JSON control
//! message inside a regular envelope:
//!
//! ```text
//! connector -> acceptor   Handshake     {"host_id": "...", "name": "...", "protocol_version": 1}
//! acceptor  -> connector  HandshakeAck  {"host_id": "...", "name": "...", "protocol_version": <negotiated>}
//! ```
//!
//! The negotiated version is the lower of the two; anything below
//! [`MIN_PROTOCOL_VERSION`] is rejected.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{RmiError, Result};
use crate::guid::Guid;
use crate::protocol::{
    check_payload_len, Header, MessageType, HEADER_SIZE, MIN_PROTOCOL_VERSION, NO_REQUEST,
    PROTOCOL_VERSION,
};
use crate::transport::receive_data;

/// Largest handshake payload accepted.
const MAX_HELLO_SIZE: u32 = 4 * 1024;

/// Handshake control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's host id, 32 hex digits.
    pub host_id: String,
    /// Name the sender can be reached under; may be empty.
    pub name: String,
    pub protocol_version: u16,
}

impl Hello {
    pub fn new(host_id: Guid, name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.to_string(),
            name: name.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn host_guid(&self) -> Result<Guid> {
        let id: Guid = self
            .host_id
            .parse()
            .map_err(|_| RmiError::Protocol(format!("Invalid host id: {}", self.host_id)))?;
        if !id.is_valid() {
            return Err(RmiError::Protocol("Null host id in handshake".to_string()));
        }
        Ok(id)
    }
}

/// What a completed handshake learned about the peer.
#[derive(Debug)]
pub struct Handshake {
    pub peer_id: Guid,
    pub peer_name: String,
    pub protocol_version: u16,
    /// Bytes read past the handshake frame; they belong to the Pipe.
    pub leftover: BytesMut,
}

/// Pick the version both sides speak.
pub fn negotiate(local: u16, remote: u16) -> Result<u16> {
    let version = local.min(remote);
    if version < MIN_PROTOCOL_VERSION {
        return Err(RmiError::VersionMismatch {
            expected: MIN_PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok(version)
}

/// Connecting side: send our hello, wait for the acknowledgement.
pub async fn initiate<R, W>(reader: &mut R, writer: &mut W, local: &Hello) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_hello(writer, MessageType::Handshake, local).await?;
    let (ack, leftover) = read_hello(reader, MessageType::HandshakeAck).await?;

    // The acceptor already negotiated; it must not pick something we can't speak.
    let version = negotiate(local.protocol_version, ack.protocol_version)?;
    if version != ack.protocol_version {
        return Err(RmiError::VersionMismatch {
            expected: version,
            actual: ack.protocol_version,
        });
    }

    Ok(Handshake {
        peer_id: ack.host_guid()?,
        peer_name: ack.name,
        protocol_version: version,
        leftover,
    })
}

/// Accepting side: read the peer's hello, answer with the negotiated version.
pub async fn accept<R, W>(reader: &mut R, writer: &mut W, local: &Hello) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (hello, leftover) = read_hello(reader, MessageType::Handshake).await?;
    let peer_id = hello.host_guid()?;
    let version = negotiate(local.protocol_version, hello.protocol_version)?;

    let ack = Hello {
        protocol_version: version,
        ..local.clone()
    };
    write_hello(writer, MessageType::HandshakeAck, &ack).await?;

    Ok(Handshake {
        peer_id,
        peer_name: hello.name,
        protocol_version: version,
        leftover,
    })
}

async fn write_hello<W>(writer: &mut W, message_type: MessageType, hello: &Hello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(hello)?;
    let len = check_payload_len(payload.len(), MAX_HELLO_SIZE)?;
    let header = Header::new(message_type, NO_REQUEST, len);
    writer.write_all(&header.encode()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_hello<R>(reader: &mut R, expected: MessageType) -> Result<(Hello, BytesMut)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    receive_data(reader, &mut buf, HEADER_SIZE).await?;

    let header = Header::decode(&buf[..HEADER_SIZE])
        .ok_or_else(|| RmiError::Protocol("Truncated handshake header".to_string()))?;
    let message_type = MessageType::try_from(header.message_type)?;
    if message_type != expected {
        return Err(RmiError::Protocol(format!(
            "Expected {:?}, got {:?}",
            expected, message_type
        )));
    }
    let len = check_payload_len(header.payload_length as usize, MAX_HELLO_SIZE)? as usize;

    receive_data(reader, &mut buf, HEADER_SIZE + len).await?;
    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(len);
    let hello: Hello = serde_json::from_slice(&payload)?;
    Ok((hello, buf))
}
