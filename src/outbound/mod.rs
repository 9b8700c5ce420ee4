//! Outbound Reflex handler.
//!
//! The client-side mirror of the inbound protocol: it sends the binary
//! handshake, verifies the server's HTTP response, derives the session key,
//! opens the policy grant, and then relays a local link through morphed
//! DATA frames. The first DATA frame carries the destination prefix.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::OutboundConfig;
use crate::crypto::{derive_session_key, EphemeralSecret, PublicKey, SecureRandom};
use crate::dispatch::{Destination, Link};
use crate::error::{Error, Result};
use crate::inbound::handshake::{
    content_length, decrypt_policy_grant, read_http_head, unix_now, ClientHandshake,
    HandshakeEnvelope, ServerHandshake,
};
use crate::morphing::TrafficProfile;
use crate::transport::{FrameType, Session};

/// Upper bound on the handshake response body.
const MAX_RESPONSE_BODY: usize = 16384;

/// The Reflex outbound handler.
pub struct Handler {
    id: Uuid,
    policy_req: Vec<u8>,
}

/// Encode the destination prefix of the first DATA frame.
pub(crate) fn encode_destination(dest: &Destination) -> Result<Vec<u8>> {
    if dest.addr.len() > u8::MAX as usize {
        return Err(Error::malformed("destination address too long"));
    }
    let mut prefix = Vec::with_capacity(3 + dest.addr.len());
    prefix.push(dest.addr.len() as u8);
    prefix.extend_from_slice(dest.addr.as_bytes());
    prefix.extend_from_slice(&dest.port.to_be_bytes());
    Ok(prefix)
}

impl Handler {
    /// Build a handler from validated configuration.
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: config.id,
            policy_req: Vec::new(),
        })
    }

    /// Attach an opaque policy request to future handshakes.
    pub fn with_policy_request(mut self, policy_req: Vec<u8>) -> Self {
        self.policy_req = policy_req;
        self
    }

    /// Perform the client side of the handshake over `stream`.
    ///
    /// Returns the keyed session, already carrying the granted traffic
    /// profile, together with the granted policy tag.
    pub async fn connect<S>(&self, stream: &mut S) -> Result<(Session, String)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        let client_hs = ClientHandshake {
            public_key: public.to_bytes(),
            user_id: *self.id.as_bytes(),
            timestamp: unix_now(),
            nonce: SecureRandom::bytes(),
            policy_req: self.policy_req.clone(),
        };
        stream.write_all(&client_hs.encode_binary()).await?;

        let head = read_http_head(stream).await?;
        let status = head.split_whitespace().nth(1).unwrap_or("");
        if status != "200" {
            return Err(Error::auth(format!(
                "server rejected handshake: {}",
                head.lines().next().unwrap_or("no status line")
            )));
        }
        let body_len = content_length(&head)
            .ok_or_else(|| Error::malformed("handshake response missing content length"))?;
        if body_len > MAX_RESPONSE_BODY {
            return Err(Error::malformed("handshake response body too large"));
        }
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        let envelope: HandshakeEnvelope = serde_json::from_slice(&body)
            .map_err(|_| Error::malformed("handshake response is not valid json"))?;
        let raw = BASE64
            .decode(envelope.data.as_bytes())
            .map_err(|_| Error::malformed("handshake response is not valid base64"))?;
        let server_hs = ServerHandshake::parse(&raw)?;

        let shared = secret.diffie_hellman(&PublicKey::from_bytes(server_hs.public_key))?;
        let session_key = derive_session_key(&shared, &client_hs.nonce)?;
        let policy = decrypt_policy_grant(&session_key, &server_hs.policy_grant)?;

        let mut session = Session::new(&session_key);
        session.set_traffic_profile(TrafficProfile::from_policy(&policy));
        Ok((session, policy))
    }

    /// Relay a local link to `dest` through a Reflex session on `stream`.
    pub async fn process<S>(&self, mut stream: S, dest: Destination, link: Link) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, policy) = self.connect(&mut stream).await?;
        tracing::debug!(%dest, %policy, "reflex outbound session established");
        let session = Arc::new(session);

        let (mut server_read, mut server_write) = tokio::io::split(stream);
        let prefix = encode_destination(&dest)?;
        session
            .write_frame(&mut server_write, FrameType::Data, &prefix)
            .await?;

        let uplink = tokio::spawn(uplink(Arc::clone(&session), server_write, link.reader));
        let result = downlink(&session, &mut server_read, &link.writer).await;
        uplink.abort();
        result
    }
}

/// Forward local buffers to the server as morphed DATA frames; local EOF
/// sends CLOSE.
async fn uplink<W>(
    session: Arc<Session>,
    mut writer: W,
    mut local: mpsc::Receiver<io::Result<Vec<u8>>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        match local.recv().await {
            Some(Ok(buffer)) => {
                if session
                    .write_frame_with_morphing(&mut writer, FrameType::Data, &buffer)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(_)) => return,
            None => {
                let _ = session
                    .write_frame(&mut writer, FrameType::Close, &[])
                    .await;
                return;
            }
        }
    }
}

/// Deliver server frames to the local link, applying control hints.
async fn downlink<R>(
    session: &Session,
    server_read: &mut R,
    local: &mpsc::Sender<Vec<u8>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(frame) = session.read_frame(server_read).await? else {
            return Ok(());
        };
        match frame.frame_type {
            FrameType::Data => {
                if !frame.payload.is_empty() && local.send(frame.payload).await.is_err() {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "local link closed",
                    )));
                }
            }
            FrameType::Padding | FrameType::Timing => session.handle_control_frame(&frame)?,
            FrameType::Close => return Ok(()),
        }
    }
}
