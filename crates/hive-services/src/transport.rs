//! Secure transport — TLS over TCP plus the token handshake.
//!
//! A connection is usable only after both steps succeed:
//!
//! ```text
//!   master (client)                          worker (server)
//!   ── TLS handshake (rustls, server cert always, client cert optional) ──
//!   Hello{nonce_c}                 ──────►
//!                                  ◄──────   AuthChallenge{nonce_s}
//!   AuthResponse{HMAC(client)}     ──────►
//!                                            verify, else Disconnect
//!                                  ◄──────   Hello{nonce_s}
//!                                  ◄──────   AuthResponse{HMAC(server)}
//!   verify
//! ```
//!
//! Every later frame goes through `FrameReader` / `FrameWriter`, which apply
//! the length-prefix limits and per-sender sequence numbers.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use hive_core::crypto::{self, AuthToken, Nonce, CLIENT_PROOF_LABEL, SERVER_PROOF_LABEL};
use hive_core::message::{AuthChallenge, AuthResponse, Disconnect, Hello, Message, MessageKind, Role};
use hive_core::wire::{self, WireError, FRAME_HEADER_LEN, HANDSHAKE_TIMEOUT_SECS, PROTOCOL_VERSION};

pub type ClientChannel = Channel<tokio_rustls::client::TlsStream<TcpStream>>;
pub type ServerChannel = Channel<tokio_rustls::server::TlsStream<TcpStream>>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {0}: {1}")]
    Unreadable(std::path::PathBuf, std::io::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("this node has no certificate/key configured")]
    MissingIdentity,

    #[error("invalid server name {0:?}")]
    BadServerName(String),

    #[error("tls configuration: {0}")]
    Config(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Conn(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("handshake timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("protocol error: unexpected {0:?} during handshake")]
    Unexpected(MessageKind),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

// ── TLS identity ──────────────────────────────────────────────────────────────

/// Loaded TLS materials: trust roots plus this node's optional identity.
pub struct TlsIdentity {
    roots: Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("roots", &self.roots.len())
            .field("certs", &self.certs.len())
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl TlsIdentity {
    /// Build from PEM bytes. `identity` is `(cert_chain_pem, key_pem)`.
    pub fn from_pem(ca_pem: &[u8], identity: Option<(&[u8], &[u8])>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem, "CA bundle")? {
            roots
                .add(cert)
                .map_err(|e| TlsError::Config(format!("bad CA certificate: {e}")))?;
        }

        let (certs, key) = match identity {
            Some((cert_pem, key_pem)) => {
                let certs = parse_certs(cert_pem, "certificate")?;
                let key = rustls_pemfile::private_key(&mut &key_pem[..])
                    .map_err(|e| TlsError::Config(format!("bad private key: {e}")))?
                    .ok_or_else(|| TlsError::NoPrivateKey("private key".into()))?;
                (certs, Some(key))
            }
            None => (Vec::new(), None),
        };

        Ok(Self {
            roots: Arc::new(roots),
            certs,
            key,
        })
    }

    /// Load PEM files from disk.
    pub fn load(ca_path: &Path, identity: Option<(&Path, &Path)>) -> Result<Self, TlsError> {
        let read = |p: &Path| std::fs::read(p).map_err(|e| TlsError::Unreadable(p.to_path_buf(), e));
        let ca = read(ca_path)?;
        match identity {
            Some((cert_path, key_path)) => {
                let cert = read(cert_path)?;
                let key = zeroize::Zeroizing::new(read(key_path)?);
                Self::from_pem(&ca, Some((cert.as_slice(), key.as_slice())))
            }
            None => Self::from_pem(&ca, None),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.key.is_some() && !self.certs.is_empty()
    }

    /// Server-side config. Client certificates are required when asked.
    pub fn server_config(&self, require_client_cert: bool) -> Result<Arc<ServerConfig>, TlsError> {
        let key = self.key.as_ref().ok_or(TlsError::MissingIdentity)?;
        let builder = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let builder = if require_client_cert {
            let verifier = WebPkiClientVerifier::builder_with_provider(self.roots.clone(), provider())
                .build()
                .map_err(|e| TlsError::Config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(self.certs.clone(), key.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;
        Ok(Arc::new(config))
    }

    /// Client-side config. Presents a certificate when one is loaded.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_root_certificates(self.roots.clone());

        let config = match &self.key {
            Some(key) if !self.certs.is_empty() => builder
                .with_client_auth_cert(self.certs.clone(), key.clone_key())
                .map_err(|e| TlsError::Config(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("bad {what}: {e}")))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what.to_string()));
    }
    Ok(certs)
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Reads frames, enforcing size limits and dropping replayed sequence numbers.
pub struct FrameReader<R> {
    inner: R,
    last_seq: Option<u64>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            last_seq: None,
        }
    }

    /// Next message from the peer.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        loop {
            let mut header = [0u8; FRAME_HEADER_LEN];
            match self.inner.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(TransportError::Closed)
                }
                Err(e) => return Err(e.into()),
            }
            let len = wire::frame_len(header)?;

            let mut body = vec![0u8; len];
            self.inner.read_exact(&mut body).await?;
            let envelope = wire::decode_body(&body)?;

            if let Some(last) = self.last_seq {
                if envelope.seq <= last {
                    tracing::warn!(seq = envelope.seq, last, kind = ?envelope.kind, "dropping duplicate frame");
                    continue;
                }
            }
            self.last_seq = Some(envelope.seq);
            return Ok(Message::from_envelope(envelope)?);
        }
    }
}

/// Writes frames with a strictly increasing sequence number.
pub struct FrameWriter<W> {
    inner: W,
    next_seq: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, next_seq: 1 }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let envelope = message.into_envelope(self.next_seq)?;
        let frame = wire::encode_frame(&envelope)?;
        self.next_seq += 1;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// What this node says about itself in `Hello`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub role: Role,
    pub hostname: String,
    pub listen_port: u16,
}

impl NodeInfo {
    fn hello(&self, nonce: &Nonce) -> Hello {
        Hello {
            node_id: self.node_id.clone(),
            role: self.role,
            hostname: self.hostname.clone(),
            listen_port: self.listen_port,
            nonce: hex::encode(nonce),
            version: PROTOCOL_VERSION,
        }
    }
}

async fn step<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Message, TransportError> {
    tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), reader.recv())
        .await
        .map_err(|_| TransportError::Timeout)?
}

fn nonce_from(hex_str: &str) -> Result<Nonce, TransportError> {
    crypto::parse_nonce(hex_str).map_err(|e| WireError::Malformed(e.to_string()).into())
}

fn refused(message: Message) -> TransportError {
    match message {
        Message::Disconnect(d) => TransportError::Auth(d.reason),
        other => TransportError::Unexpected(other.kind()),
    }
}

/// Connecting side. Returns the peer's `Hello` once both proofs check out.
pub async fn client_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    token: &AuthToken,
    info: &NodeInfo,
) -> Result<Hello, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let client_nonce = crypto::generate_nonce();
    writer.send(Message::Hello(info.hello(&client_nonce))).await?;

    let server_nonce = match step(reader).await? {
        Message::AuthChallenge(c) => nonce_from(&c.nonce)?,
        other => return Err(refused(other)),
    };

    let proof = token.client_proof(&server_nonce, &client_nonce);
    writer
        .send(Message::AuthResponse(AuthResponse {
            mac: hex::encode(proof),
        }))
        .await?;

    let peer = match step(reader).await? {
        Message::Hello(h) => h,
        other => return Err(refused(other)),
    };
    if nonce_from(&peer.nonce)? != server_nonce {
        return Err(WireError::Malformed("hello nonce does not match challenge".into()).into());
    }

    let server_proof = match step(reader).await? {
        Message::AuthResponse(r) => r,
        other => return Err(refused(other)),
    };
    let mac = hex::decode(&server_proof.mac)
        .map_err(|_| TransportError::Auth("malformed server proof".into()))?;
    if !token.verify(SERVER_PROOF_LABEL, &[&client_nonce, &server_nonce], &mac) {
        return Err(TransportError::Auth("server proof mismatch".into()));
    }

    Ok(peer)
}

/// Accepting side. Sends `Disconnect` and fails if the client proof is wrong.
pub async fn server_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    token: &AuthToken,
    info: &NodeInfo,
) -> Result<Hello, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = match step(reader).await? {
        Message::Hello(h) => h,
        other => return Err(refused(other)),
    };
    let client_nonce = nonce_from(&peer.nonce)?;

    let server_nonce = crypto::generate_nonce();
    writer
        .send(Message::AuthChallenge(AuthChallenge {
            nonce: hex::encode(server_nonce),
        }))
        .await?;

    let response = match step(reader).await? {
        Message::AuthResponse(r) => r,
        other => return Err(refused(other)),
    };
    let verified = hex::decode(&response.mac)
        .map(|mac| token.verify(CLIENT_PROOF_LABEL, &[&server_nonce, &client_nonce], &mac))
        .unwrap_or(false);
    if !verified {
        let _ = writer
            .send(Message::Disconnect(Disconnect {
                reason: "authentication failed".into(),
            }))
            .await;
        writer.shutdown().await;
        return Err(TransportError::Auth("client proof mismatch".into()));
    }

    writer.send(Message::Hello(info.hello(&server_nonce))).await?;
    writer
        .send(Message::AuthResponse(AuthResponse {
            mac: hex::encode(token.server_proof(&client_nonce, &server_nonce)),
        }))
        .await?;

    Ok(peer)
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// An authenticated, framed connection.
pub struct Channel<S> {
    peer: Hello,
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    /// Run the client handshake over an established stream.
    pub async fn client(stream: S, token: &AuthToken, info: &NodeInfo) -> Result<Self, TransportError> {
        let (r, w) = tokio::io::split(stream);
        let (mut reader, mut writer) = (FrameReader::new(r), FrameWriter::new(w));
        let peer = client_handshake(&mut reader, &mut writer, token, info).await?;
        Ok(Self { peer, reader, writer })
    }

    /// Run the server handshake over an established stream.
    pub async fn server(stream: S, token: &AuthToken, info: &NodeInfo) -> Result<Self, TransportError> {
        let (r, w) = tokio::io::split(stream);
        let (mut reader, mut writer) = (FrameReader::new(r), FrameWriter::new(w));
        let peer = server_handshake(&mut reader, &mut writer, token, info).await?;
        Ok(Self { peer, reader, writer })
    }

    pub fn peer(&self) -> &Hello {
        &self.peer
    }

    pub async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.reader.recv().await
    }

    /// Split for separate reader and writer tasks.
    pub fn into_split(self) -> (Hello, FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.peer, self.reader, self.writer)
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Everything needed to open or accept authenticated channels.
#[derive(Clone)]
pub struct Transport {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    server_name: ServerName<'static>,
    token: AuthToken,
    info: NodeInfo,
}

impl Transport {
    /// Connecting side (master).
    pub fn client(
        tls: &TlsIdentity,
        token: AuthToken,
        info: NodeInfo,
        server_name: &str,
    ) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::BadServerName(server_name.to_string()))?;
        Ok(Self {
            connector: Some(TlsConnector::from(tls.client_config()?)),
            acceptor: None,
            server_name,
            token,
            info,
        })
    }

    /// Accepting side (worker).
    pub fn server(
        tls: &TlsIdentity,
        token: AuthToken,
        info: NodeInfo,
        require_client_cert: bool,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            connector: None,
            acceptor: Some(TlsAcceptor::from(tls.server_config(require_client_cert)?)),
            server_name: ServerName::try_from("localhost")
                .map_err(|_| TlsError::BadServerName("localhost".into()))?,
            token,
            info,
        })
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Open a channel to `addr`. TLS first, then the token handshake.
    pub async fn connect(&self, addr: SocketAddr) -> Result<ClientChannel, TransportError> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| TlsError::Config("transport has no client config".into()))?;

        let timeout = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        tcp.set_nodelay(true)?;

        let tls = tokio::time::timeout(timeout, connector.connect(self.server_name.clone(), tcp))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let channel = Channel::client(tls, &self.token, &self.info).await?;
        tracing::debug!(%addr, peer = %channel.peer().node_id, "channel established");
        Ok(channel)
    }

    /// Accept a channel on an inbound TCP stream.
    pub async fn accept(&self, tcp: TcpStream) -> Result<ServerChannel, TransportError> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| TlsError::Config("transport has no server config".into()))?;
        tcp.set_nodelay(true)?;

        let timeout = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        let tls = tokio::time::timeout(timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| TransportError::Timeout)??;

        Channel::server(tls, &self.token, &self.info).await
    }
}
