//! Inbound accept loop and first-frame classification.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::MessageFrame;
use crate::collaborators::TcpTransportFactory;
use crate::config::ConnectionOptions;
use crate::connection::raw::RawConnection;
use crate::error::{SlskError, SlskResult};
use crate::messages::init::InitMessage;
use crate::messages::PeerConnectionType;

/// The outcome of classifying a freshly accepted socket by its first
/// frame's initialization code.
pub enum ClassifiedConnection {
    PierceFirewall {
        token: u32,
        raw: Arc<RawConnection>,
    },
    PeerInit {
        username: String,
        connection_type: PeerConnectionType,
        token: u32,
        raw: Arc<RawConnection>,
    },
}

pub struct Listener {
    listener: tokio::net::TcpListener,
    options: ConnectionOptions,
}

impl Listener {
    pub async fn bind(
        factory: &dyn TcpTransportFactory,
        addr: SocketAddr,
        options: ConnectionOptions,
    ) -> SlskResult<Self> {
        let listener = factory.bind(addr).await.map_err(SlskError::Io)?;
        Ok(Self { listener, options })
    }

    pub fn local_addr(&self) -> SlskResult<SocketAddr> {
        self.listener.local_addr().map_err(SlskError::Io)
    }

    /// Accept one inbound connection and classify it. The listener never
    /// reads further bytes after this — ownership of the socket passes to
    /// the caller as a [`RawConnection`].
    pub async fn accept_and_classify(&self) -> SlskResult<ClassifiedConnection> {
        let (stream, _peer_addr) = self.listener.accept().await.map_err(SlskError::Io)?;
        let raw = Arc::new(RawConnection::from_stream(stream, &self.options));

        let length_bytes = raw.read_exact(4, None).await?;
        let length = u32::from_le_bytes([length_bytes[0], length_bytes[1], length_bytes[2], length_bytes[3]]) as usize;
        if length == 0 {
            raw.disconnect(crate::error::DisconnectReason::TransportError(
                "empty initialization frame".into(),
            ))
            .await;
            return Err(SlskError::Protocol("empty initialization frame".into()));
        }

        let body = raw.read_exact(length, None).await?;
        let code = body[0] as u32;
        let payload = Bytes::copy_from_slice(&body[1..]);
        let frame = MessageFrame { code, payload };

        match InitMessage::decode(&frame) {
            Ok(InitMessage::PierceFirewall(p)) => Ok(ClassifiedConnection::PierceFirewall { token: p.token, raw }),
            Ok(InitMessage::PeerInit(p)) => Ok(ClassifiedConnection::PeerInit {
                username: p.username,
                connection_type: p.connection_type,
                token: p.token,
                raw,
            }),
            Err(err) => {
                raw.disconnect(crate::error::DisconnectReason::TransportError(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Run the accept loop forever, dispatching each classified connection
    /// to `sender`. A per-connection classification failure is logged and
    /// the loop continues rather than exiting.
    pub async fn run(self: Arc<Self>, sender: mpsc::Sender<ClassifiedConnection>) {
        loop {
            match self.accept_and_classify().await {
                Ok(classified) => {
                    if sender.send(classified).await.is_err() {
                        tracing::debug!("listener dispatch channel closed, stopping accept loop");
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to classify inbound connection");
                }
            }
        }
    }
}
