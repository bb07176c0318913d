//! QUIC Transport
//!
//! TransportAgent over QUIC (via Quinn) with self-signed certificates.
//! Every call is one bidirectional stream carrying a length-prefixed bincode
//! request frame and its response frame.
//!
//! Uses Sans-IO pattern: frame encoding/decoding and request dispatch are
//! separated from the network for testability.

use crate::distro::error::{DistroError, Result};
use crate::distro::ports::TransportAgent;
use crate::distro::{DistroProtocol, PeerAddr, ReplicationKey, ReplicationRecord};
use crate::infrastructure::ShutdownController;
use async_trait::async_trait;
use dashmap::DashMap;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Default deadline for one request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Push one record
    SyncData { record: ReplicationRecord },
    /// Checksum summary from `from`
    VerifyData { from: PeerAddr, summary: ReplicationRecord },
    /// Fetch one record
    Query { key: ReplicationKey },
    /// Fetch a whole domain
    Snapshot { data_type: String },
    /// Request handled; `changed` tells whether local state moved
    Ack { changed: bool },
    Record(ReplicationRecord),
    Records(Vec<ReplicationRecord>),
    NotFound { data_type: String, resource_id: String },
    Error(String),
}

// ==================== Sans-IO Functions ====================

/// Encode a frame: 4-byte big-endian length followed by the bincode body.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(DistroError::Codec(format!("frame too large: {} bytes", data.len())));
    }
    let len = data.len() as u32;

    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Decode and bound-check the length prefix.
pub fn decode_length(buf: &[u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(*buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DistroError::Codec(format!("frame too large: {} bytes", len)));
    }
    Ok(len)
}

/// Decode a frame body.
pub fn decode_frame(data: &[u8]) -> Result<WireMessage> {
    Ok(bincode::deserialize(data)?)
}

pub fn message_type_name(msg: &WireMessage) -> &'static str {
    match msg {
        WireMessage::SyncData { .. } => "SyncData",
        WireMessage::VerifyData { .. } => "VerifyData",
        WireMessage::Query { .. } => "Query",
        WireMessage::Snapshot { .. } => "Snapshot",
        WireMessage::Ack { .. } => "Ack",
        WireMessage::Record(_) => "Record",
        WireMessage::Records(_) => "Records",
        WireMessage::NotFound { .. } => "NotFound",
        WireMessage::Error(_) => "Error",
    }
}

fn error_response(err: DistroError) -> WireMessage {
    match err {
        DistroError::RecordNotFound {
            data_type,
            resource_id,
        } => WireMessage::NotFound {
            data_type,
            resource_id,
        },
        other => WireMessage::Error(other.to_string()),
    }
}

/// Dispatch an inbound request to the protocol handlers.
pub async fn respond(protocol: &DistroProtocol, request: WireMessage) -> WireMessage {
    let result = match request {
        WireMessage::SyncData { record } => protocol
            .on_receive_record(record)
            .await
            .map(|changed| WireMessage::Ack { changed }),
        WireMessage::VerifyData { from, summary } => protocol
            .on_receive_verify(summary, &from)
            .await
            .map(|pulls| WireMessage::Ack { changed: pulls > 0 }),
        WireMessage::Query { key } => protocol.on_query(&key).await.map(WireMessage::Record),
        WireMessage::Snapshot { data_type } => {
            protocol.on_snapshot(&data_type).await.map(WireMessage::Records)
        }
        other => Err(DistroError::Codec(format!(
            "unexpected request {}",
            message_type_name(&other)
        ))),
    };
    result.unwrap_or_else(error_response)
}

fn unexpected(peer: &PeerAddr, response: &WireMessage) -> DistroError {
    DistroError::transport(peer, format!("unexpected response {}", message_type_name(response)))
}

// ==================== Network ====================

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<WireMessage> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| DistroError::Codec(format!("read length: {}", e)))?;
    let len = decode_length(&len_buf)?;

    let mut data = vec![0u8; len];
    recv.read_exact(&mut data)
        .await
        .map_err(|e| DistroError::Codec(format!("read body: {}", e)))?;
    decode_frame(&data)
}

async fn write_frame(send: &mut quinn::SendStream, msg: &WireMessage) -> Result<()> {
    let frame = encode_frame(msg)?;
    send.write_all(&frame)
        .await
        .map_err(|e| DistroError::Codec(format!("write frame: {}", e)))?;
    send.finish()
        .map_err(|e| DistroError::Codec(format!("finish stream: {}", e)))?;
    Ok(())
}

/// QUIC client and server for one node.
pub struct QuicTransportAgent {
    endpoint: Endpoint,
    advertise: PeerAddr,
    connections: DashMap<PeerAddr, Connection>,
    request_timeout: Duration,
}

impl QuicTransportAgent {
    /// Bind a QUIC endpoint on `bind_addr`.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let setup = |e: &dyn std::fmt::Display| DistroError::transport(bind_addr, e);

        // Already installed when a second endpoint is bound in the same process
        let _ = rustls::crypto::ring::default_provider().install_default();

        // Generate self-signed certificate for QUIC
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| setup(&e))?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let private_key = rustls::pki_types::PrivateKeyDer::try_from(key_der).map_err(|e| setup(&e))?;

        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| setup(&e))?;
        let server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(|e| setup(&e))?,
        ));

        // Client config - use SkipServerVerification for self-signed certs in cluster
        let client_crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(|e| setup(&e))?,
        ));

        let mut endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| setup(&e))?;
        endpoint.set_default_client_config(client_config);

        tracing::info!("quic transport listening on {}", bind_addr);

        let advertise = endpoint
            .local_addr()
            .map(PeerAddr::from)
            .map_err(|e| setup(&e))?;

        Ok(Self {
            endpoint,
            advertise,
            connections: DashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Set the per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Address peers should use to reach this node. Defaults to the bound address.
    pub fn advertise(mut self, addr: PeerAddr) -> Self {
        self.advertise = addr;
        self
    }

    pub fn advertised_addr(&self) -> &PeerAddr {
        &self.advertise
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| DistroError::transport("local", e))
    }

    /// Accept inbound streams and answer them through `protocol` until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn serve(&self, protocol: Weak<DistroProtocol>, shutdown: &ShutdownController) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.is_shutdown() {
                    break;
                }
                let incoming = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    incoming = endpoint.accept() => incoming,
                };
                let Some(incoming) = incoming else {
                    break;
                };

                let protocol = protocol.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => Self::handle_connection(conn, protocol).await,
                        Err(e) => tracing::warn!("failed to accept connection: {:?}", e),
                    }
                });
            }
            endpoint.close(0u32.into(), b"shutdown");
            tracing::info!("quic transport stopped");
        })
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_connection(conn: Connection, protocol: Weak<DistroProtocol>) {
        let remote = conn.remote_address();
        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => {
                    let protocol = protocol.clone();
                    tokio::spawn(async move {
                        let request = match read_frame(&mut recv).await {
                            Ok(request) => request,
                            Err(e) => {
                                tracing::debug!("bad frame from {}: {}", remote, e);
                                return;
                            }
                        };
                        let response = match protocol.upgrade() {
                            Some(protocol) => respond(&protocol, request).await,
                            None => WireMessage::Error(DistroError::Shutdown.to_string()),
                        };
                        if let Err(e) = write_frame(&mut send, &response).await {
                            tracing::debug!("failed to answer {}: {}", remote, e);
                        }
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_)) => break,
                Err(e) => {
                    tracing::debug!("connection error from {}: {:?}", remote, e);
                    break;
                }
            }
        }
    }

    /// Cached connection to `peer`, reconnecting if it was closed.
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn connection(&self, peer: &PeerAddr) -> Result<Connection> {
        if let Some(conn) = self.connections.get(peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let addr = peer.socket_addr()?;
        let conn = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|e| DistroError::transport(peer, e))?
            .await
            .map_err(|e| DistroError::transport(peer, e))?;
        tracing::debug!("connected to {}", peer);
        self.connections.insert(peer.clone(), conn.clone());
        Ok(conn)
    }

    /// Send a request and wait for its response.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn request(&self, peer: &PeerAddr, msg: &WireMessage) -> Result<WireMessage> {
        let exchange = async {
            let conn = self.connection(peer).await?;
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| DistroError::transport(peer, e))?;
            write_frame(&mut send, msg).await?;
            read_frame(&mut recv).await
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(DistroError::Codec(e))) => {
                self.connections.remove(peer);
                Err(DistroError::transport(peer, e))
            }
            Ok(Err(e)) => {
                self.connections.remove(peer);
                Err(e)
            }
            Err(_) => Err(DistroError::transport(peer, "request timed out")),
        }
    }

    /// Close the endpoint and every cached connection.
    pub fn close(&self) {
        self.connections.clear();
        self.endpoint.close(0u32.into(), b"closed");
    }
}

#[async_trait]
impl TransportAgent for QuicTransportAgent {
    async fn sync_data(&self, record: ReplicationRecord, peer: &PeerAddr) -> Result<bool> {
        match self.request(peer, &WireMessage::SyncData { record }).await? {
            WireMessage::Ack { .. } => Ok(true),
            WireMessage::Error(e) => {
                tracing::warn!("{} rejected record: {}", peer, e);
                Ok(false)
            }
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn sync_verify_data(&self, summary: ReplicationRecord, peer: &PeerAddr) -> Result<()> {
        let from = self.advertise.clone();
        match self.request(peer, &WireMessage::VerifyData { from, summary }).await? {
            WireMessage::Ack { .. } => Ok(()),
            WireMessage::Error(e) => Err(DistroError::transport(peer, e)),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn fetch(&self, key: &ReplicationKey, peer: &PeerAddr) -> Result<ReplicationRecord> {
        match self.request(peer, &WireMessage::Query { key: key.local() }).await? {
            WireMessage::Record(record) => Ok(record),
            WireMessage::NotFound {
                data_type,
                resource_id,
            } => Err(DistroError::not_found(data_type, resource_id)),
            WireMessage::Error(e) => Err(DistroError::transport(peer, e)),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn fetch_snapshot(&self, data_type: &str, peer: &PeerAddr) -> Result<Vec<ReplicationRecord>> {
        let request = WireMessage::Snapshot {
            data_type: data_type.to_string(),
        };
        match self.request(peer, &request).await? {
            WireMessage::Records(records) => Ok(records),
            WireMessage::Error(e) => Err(DistroError::transport(peer, e)),
            other => Err(unexpected(peer, &other)),
        }
    }
}

/// Skip server certificate verification for self-signed certs in cluster.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> std::result::Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> std::result::Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        vec![
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            quinn::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            quinn::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            quinn::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA256,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA384,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA512,
            quinn::rustls::SignatureScheme::ED25519,
        ]
    }
}
