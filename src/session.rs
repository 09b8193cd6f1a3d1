// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Frame codec and per-connection session state.
//!
//! Every message travels as a 5 byte header (one protocol marker byte, then
//! the body length as a little-endian `u32`) followed by the
//! protobuf-encoded body.

use crate::{error::Error, proto};

use bytes::{BufMut, BytesMut};
use prost::Message as _;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    time::timeout,
};

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

pub(crate) const PROTOCOL_MARKER: u8 = 0x01;
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const FRAME_HEADER_SIZE: usize = 5;

/// Sessions without keepalive are torn down after this much read idleness.
pub(crate) const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) async fn write_frame<W>(writer: &mut W, message: &proto::Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body_size = message.encoded_len();
    if body_size > MAX_MESSAGE_SIZE {
        return Err(Error::Internal(format!("message size is over limit: {}", body_size)));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body_size);
    buf.put_u8(PROTOCOL_MARKER);
    buf.put_u32_le(body_size as u32);
    message
        .encode(&mut buf)
        .map_err(|e| Error::Internal(format!("error encoding message: {}", e)))?;

    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<proto::Message, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[0] != PROTOCOL_MARKER {
        return Err(Error::BadRequest(format!("invalid protocol marker: {:#04x}", header[0])));
    }

    let body_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if body_size > MAX_MESSAGE_SIZE {
        return Err(Error::BadRequest(format!("message size is over limit: {}", body_size)));
    }

    let mut body = vec![0u8; body_size];
    reader.read_exact(&mut body).await?;

    Ok(proto::Message::decode(body.as_slice())?)
}

/// The shared half of an accepted connection: serialized writes, the
/// observed remote address and the outbound request id counter.
///
/// The accompanying [`SessionReader`] stays with the task owning the
/// dispatch loop; everything else (notifier tasks) holds the session only
/// weakly and must not extend its life.
pub(crate) struct Session {
    id: String,
    remote_ip: IpAddr,
    writer: Mutex<OwnedWriteHalf>,
    next_request_id: AtomicU32,
    keep_alive: AtomicBool,
}

impl Session {
    /// Splits a connected stream into the shared session state and the
    /// reader owned by the dispatch loop.
    pub(crate) fn split(stream: TcpStream) -> Result<(Arc<Self>, SessionReader), Error> {
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let session = Arc::new(Self {
            id: remote.to_string(),
            remote_ip: remote.ip(),
            writer: Mutex::new(write_half),
            next_request_id: AtomicU32::new(1),
            keep_alive: AtomicBool::new(false),
        });
        let reader = SessionReader {
            read_half,
            session: Arc::clone(&session),
        };

        Ok((session, reader))
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    /// Returns the next session-local request id (counting from 1).
    pub(crate) fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Exempts the session from the idle timeout.
    pub(crate) fn set_keep_alive(&self) {
        self.keep_alive.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    pub(crate) async fn send_message(&self, message: proto::Message) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &message).await
    }
}

/// The read half of a session; only its owning task may receive.
pub(crate) struct SessionReader {
    read_half: OwnedReadHalf,
    session: Arc<Session>,
}

impl SessionReader {
    pub(crate) async fn receive_message(&mut self) -> Result<proto::Message, Error> {
        if self.session.is_keep_alive() {
            read_frame(&mut self.read_half).await
        } else {
            match timeout(SESSION_IDLE_TIMEOUT, read_frame(&mut self.read_half)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Connection(format!("session {} idle timeout", self.session.id()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging;

    use prost::Message as _;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let message = messaging::request_message(
            7,
            proto::request::Request::RemoteNode(proto::RemoteNodeRequest {
                request: Some(proto::remote_node_request::Request::GetNodeCount(
                    proto::GetNodeCountRequest {},
                )),
            }),
        );

        write_frame(&mut client, &message).await.unwrap();
        let received = read_frame(&mut server).await.unwrap();

        assert_eq!(received.id, 7);
        assert_eq!(received.version, messaging::PROTOCOL_VERSION.to_vec());
        assert!(matches!(received.body, Some(proto::message::Body::Request(_))));
    }

    #[tokio::test]
    async fn invalid_marker_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        client.write_all(&[0x02, 0, 0, 0, 0]).await.unwrap();
        let result = read_frame(&mut server).await;

        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let oversize = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        client
            .write_all(&[PROTOCOL_MARKER, oversize[0], oversize[1], oversize[2], oversize[3]])
            .await
            .unwrap();
        let result = read_frame(&mut server).await;

        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn header_length_is_little_endian() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let message = messaging::request_message(
            1,
            proto::request::Request::Client(proto::ClientRequest {
                request: Some(proto::client_request::Request::GetServices(proto::GetServicesRequest {})),
            }),
        );
        write_frame(&mut client, &message).await.unwrap();

        let mut header = [0u8; FRAME_HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], PROTOCOL_MARKER);

        let body_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        assert_eq!(body_size, prost::Message::encoded_len(&message));

        let mut body = vec![0u8; body_size];
        server.read_exact(&mut body).await.unwrap();
        assert!(proto::Message::decode(body.as_slice()).is_ok());
    }
}
