//! Inbound Reflex handler.
//!
//! One handler serves a mixed TCP port. Each accepted connection is
//! classified by a non-destructive peek at its first bytes:
//!
//! - the protocol magic selects the binary handshake path,
//! - an HTTP POST selects the envelope handshake path,
//! - anything else is spliced to the configured fallback.
//!
//! Handshake failures answer with plausible HTTP before falling back, so
//! active probes see an ordinary web server rather than a reset.

pub mod handshake;

mod fallback;
mod session;

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use uuid::Uuid;

use crate::config::{FallbackConfig, InboundConfig};
use crate::crypto::{derive_session_key, EphemeralSecret, PublicKey};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::transport::PeekReader;

use self::handshake::{
    content_length, encrypt_policy_grant, read_http_head, validate_timestamp,
    write_handshake_response, write_http_error, ClientHandshake, HandshakeEnvelope, NonceStore,
    ServerHandshake, MAX_POLICY_PAYLOAD, REFLEX_MAGIC,
};

/// How many leading bytes are peeked for protocol detection.
pub const DETECTION_PEEK_SIZE: usize = 64;

/// One configured user held in memory.
#[derive(Debug, Clone)]
pub struct MemoryUser {
    /// User identity.
    pub id: Uuid,
    /// Traffic policy tag.
    pub policy: String,
}

/// The Reflex inbound handler.
pub struct Handler {
    clients: Vec<MemoryUser>,
    fallback: Option<FallbackConfig>,
    nonces: NonceStore,
}

pub(crate) fn is_reflex_magic(data: &[u8]) -> bool {
    data.len() >= 4 && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == REFLEX_MAGIC
}

pub(crate) fn is_http_post_like(data: &[u8]) -> bool {
    data.len() >= 5 && &data[..5] == b"POST "
}

impl Handler {
    /// Build a handler from validated configuration.
    pub fn new(config: &InboundConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clients: config
                .clients
                .iter()
                .map(|c| MemoryUser {
                    id: c.id,
                    policy: c.policy.clone(),
                })
                .collect(),
            fallback: config.fallback,
            nonces: NonceStore::default(),
        })
    }

    /// The configured clients.
    pub fn clients(&self) -> &[MemoryUser] {
        &self.clients
    }

    /// Serve one accepted connection until it closes.
    ///
    /// Classifies the connection, runs the handshake and session loop for
    /// Reflex traffic, and splices everything else to the fallback.
    pub async fn process<S, D>(&self, stream: S, dispatcher: &D) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: Dispatcher,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PeekReader::new(read_half);

        let (empty, magic, http_post) = {
            let peeked = reader.peek(DETECTION_PEEK_SIZE).await?;
            (
                peeked.is_empty(),
                is_reflex_magic(peeked),
                is_http_post_like(peeked),
            )
        };
        if empty {
            return Ok(());
        }

        if magic {
            self.handle_binary(&mut reader, write_half, dispatcher).await
        } else if http_post {
            self.handle_http(&mut reader, write_half, dispatcher).await
        } else {
            tracing::debug!("unrecognized traffic, engaging fallback");
            fallback::run(&mut reader, write_half, self.fallback.as_ref()).await
        }
    }

    async fn handle_binary<R, S, D>(
        &self,
        reader: &mut PeekReader<R>,
        writer: WriteHalf<S>,
        dispatcher: &D,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        S: AsyncWrite + Send + 'static,
        D: Dispatcher,
    {
        use tokio::io::AsyncReadExt;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;
        if u32::from_be_bytes(magic) != REFLEX_MAGIC {
            return fallback::run(reader, writer, self.fallback.as_ref()).await;
        }

        let client_hs = match ClientHandshake::read(reader).await {
            Ok(hs) => hs,
            Err(e) => {
                tracing::debug!("binary handshake parse failed: {e}");
                return fallback::run(reader, writer, self.fallback.as_ref()).await;
            }
        };
        self.process_handshake(reader, writer, dispatcher, client_hs)
            .await
    }

    async fn handle_http<R, S, D>(
        &self,
        reader: &mut PeekReader<R>,
        writer: WriteHalf<S>,
        dispatcher: &D,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        S: AsyncWrite + Send + 'static,
        D: Dispatcher,
    {
        let client_hs = match self.read_http_handshake(reader).await {
            Ok(hs) => hs,
            Err(e) => {
                tracing::debug!("http handshake parse failed: {e}");
                return fallback::run(reader, writer, self.fallback.as_ref()).await;
            }
        };
        self.process_handshake(reader, writer, dispatcher, client_hs)
            .await
    }

    async fn read_http_handshake<R>(&self, reader: &mut PeekReader<R>) -> Result<ClientHandshake>
    where
        R: AsyncRead + Unpin,
    {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        use tokio::io::AsyncReadExt;

        let head = read_http_head(reader).await?;
        if !head.starts_with("POST ") {
            return Err(Error::malformed("handshake request is not a POST"));
        }
        let body_len = content_length(&head)
            .ok_or_else(|| Error::malformed("handshake request missing content length"))?;

        let mut body = vec![0u8; body_len.min(MAX_POLICY_PAYLOAD)];
        reader.read_exact(&mut body).await?;

        let envelope: HandshakeEnvelope = serde_json::from_slice(&body)
            .map_err(|_| Error::malformed("handshake envelope is not valid json"))?;
        let mut raw = BASE64
            .decode(envelope.data.as_bytes())
            .map_err(|_| Error::malformed("handshake envelope is not valid base64"))?;
        if is_reflex_magic(&raw) {
            raw.drain(..4);
        }
        ClientHandshake::parse(&raw)
    }

    async fn process_handshake<R, S, D>(
        &self,
        reader: &mut PeekReader<R>,
        mut writer: WriteHalf<S>,
        dispatcher: &D,
        client_hs: ClientHandshake,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        S: AsyncWrite + Send + 'static,
        D: Dispatcher,
    {
        if validate_timestamp(client_hs.timestamp).is_err() {
            tracing::debug!("handshake timestamp out of window");
            let _ = write_http_error(&mut writer, 403).await;
            return fallback::run(reader, writer, self.fallback.as_ref()).await;
        }
        if !self.nonces.check_and_store(client_hs.nonce) {
            tracing::debug!("handshake nonce replayed");
            let _ = write_http_error(&mut writer, 403).await;
            return fallback::run(reader, writer, self.fallback.as_ref()).await;
        }

        let server_secret = EphemeralSecret::random();
        let server_public = PublicKey::from(&server_secret);
        let shared = match server_secret.diffie_hellman(&PublicKey::from_bytes(client_hs.public_key))
        {
            Ok(shared) => shared,
            Err(_) => {
                let _ = write_http_error(&mut writer, 403).await;
                return fallback::run(reader, writer, self.fallback.as_ref()).await;
            }
        };
        let session_key = match derive_session_key(&shared, &client_hs.nonce) {
            Ok(key) => key,
            Err(e) => {
                let _ = write_http_error(&mut writer, 500).await;
                return Err(e);
            }
        };

        let user_id = Uuid::from_bytes(client_hs.user_id);
        let Some(user) = self.clients.iter().find(|u| u.id == user_id) else {
            tracing::debug!("handshake from unknown user");
            let _ = write_http_error(&mut writer, 403).await;
            return fallback::run(reader, writer, self.fallback.as_ref()).await;
        };

        let grant = match encrypt_policy_grant(&session_key, &user.policy) {
            Ok(grant) => grant,
            Err(e) => {
                let _ = write_http_error(&mut writer, 500).await;
                return Err(e);
            }
        };

        let server_hs = ServerHandshake {
            public_key: server_public.to_bytes(),
            policy_grant: grant,
        };
        write_handshake_response(&mut writer, &server_hs).await?;

        tracing::debug!(user = %user_id, policy = %user.policy, "reflex session established");
        session::run(reader, writer, dispatcher, &session_key, &user.policy).await
    }
}
