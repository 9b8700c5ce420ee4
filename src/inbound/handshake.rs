//! Handshake wire formats and key schedule.
//!
//! Two ingress framings carry the same 74-byte handshake payload: raw
//! binary prefixed with the protocol magic, and an HTTP POST whose JSON
//! body wraps the payload in base64. The server always answers in HTTP so
//! that probing clients observe a plausible web exchange.
//!
//! Binary layout (network byte order):
//!
//! ```text
//! 0..4    magic  = 0x5246584C ("REFX")
//! 4..36   client public key (32)
//! 36..52  user id (16, UUID bytes)
//! 52..60  timestamp (u64 BE, seconds since epoch)
//! 60..76  client nonce (16)
//! 76..78  policy request length (u16 BE, <= 4096)
//! 78..    policy request
//! ```

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Aead, AeadKey, Nonce, SecureRandom, NONCE_SIZE};
use crate::error::{Error, Result};

/// Protocol magic, "REFX".
pub const REFLEX_MAGIC: u32 = 0x5246_584C;

/// Fixed handshake payload size before the variable policy request.
pub const HANDSHAKE_HEAD_SIZE: usize = 74;

/// Upper bound on policy request and HTTP envelope bodies.
pub const MAX_POLICY_PAYLOAD: usize = 4096;

/// Accepted clock skew on handshake timestamps.
pub const HANDSHAKE_SKEW: Duration = Duration::from_secs(5 * 60);

/// How long a handshake nonce is remembered for replay defense.
pub const DEFAULT_NONCE_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Upper bound on the HTTP header section during envelope parsing.
const MAX_HTTP_HEAD: usize = 8192;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The parsed handshake payload from a client.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// Client's ephemeral X25519 public key.
    pub public_key: [u8; 32],
    /// Raw UUID bytes identifying the user.
    pub user_id: [u8; 16],
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Anti-replay nonce, also the HKDF salt.
    pub nonce: [u8; 16],
    /// Opaque policy request, at most [`MAX_POLICY_PAYLOAD`] bytes.
    pub policy_req: Vec<u8>,
}

impl ClientHandshake {
    /// Encode the handshake payload without the magic prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_HEAD_SIZE + self.policy_req.len());
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.user_id);
        buf.put_u64(self.timestamp as u64);
        buf.put_slice(&self.nonce);
        buf.put_u16(self.policy_req.len() as u16);
        buf.put_slice(&self.policy_req);
        buf.to_vec()
    }

    /// Encode the binary wire form, magic included.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + HANDSHAKE_HEAD_SIZE + self.policy_req.len());
        buf.put_u32(REFLEX_MAGIC);
        buf.put_slice(&self.encode());
        buf.to_vec()
    }

    /// Encode the HTTP envelope form: a POST request whose JSON body wraps
    /// the binary payload in base64.
    pub fn encode_http(&self) -> Vec<u8> {
        let envelope = HandshakeEnvelope {
            data: BASE64.encode(self.encode_binary()),
        };
        let body = serde_json::to_vec(&envelope).expect("envelope serialization cannot fail");
        let mut request = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);
        request
    }

    /// Parse a complete payload (magic already stripped). The buffer must
    /// contain exactly the handshake and its policy request.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HANDSHAKE_HEAD_SIZE {
            return Err(Error::malformed("reflex handshake too short"));
        }
        let policy_len = u16::from_be_bytes([raw[72], raw[73]]) as usize;
        if policy_len > MAX_POLICY_PAYLOAD {
            return Err(Error::malformed("reflex handshake policy too large"));
        }
        if raw.len() != HANDSHAKE_HEAD_SIZE + policy_len {
            return Err(Error::malformed("reflex handshake malformed payload length"));
        }

        let mut hs = Self {
            public_key: [0u8; 32],
            user_id: [0u8; 16],
            timestamp: u64::from_be_bytes(raw[48..56].try_into().expect("slice is 8 bytes")) as i64,
            nonce: [0u8; 16],
            policy_req: raw[HANDSHAKE_HEAD_SIZE..].to_vec(),
        };
        hs.public_key.copy_from_slice(&raw[0..32]);
        hs.user_id.copy_from_slice(&raw[32..48]);
        hs.nonce.copy_from_slice(&raw[56..72]);
        Ok(hs)
    }

    /// Read the handshake from a stream positioned just past the magic.
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; HANDSHAKE_HEAD_SIZE];
        reader.read_exact(&mut head).await?;

        let policy_len = u16::from_be_bytes([head[72], head[73]]) as usize;
        if policy_len > MAX_POLICY_PAYLOAD {
            return Err(Error::malformed("reflex handshake policy too large"));
        }
        let mut policy_req = vec![0u8; policy_len];
        if policy_len > 0 {
            reader.read_exact(&mut policy_req).await?;
        }

        let mut hs = Self {
            public_key: [0u8; 32],
            user_id: [0u8; 16],
            timestamp: u64::from_be_bytes(head[48..56].try_into().expect("slice is 8 bytes"))
                as i64,
            nonce: [0u8; 16],
            policy_req,
        };
        hs.public_key.copy_from_slice(&head[0..32]);
        hs.user_id.copy_from_slice(&head[32..48]);
        hs.nonce.copy_from_slice(&head[56..72]);
        Ok(hs)
    }
}

/// The handshake payload sent by the server.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    /// Server's ephemeral X25519 public key.
    pub public_key: [u8; 32],
    /// Sealed policy grant: `nonce(12) || ciphertext`.
    pub policy_grant: Vec<u8>,
}

impl ServerHandshake {
    /// Encode as `pubkey(32) || grant_len:u16 BE || grant`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(34 + self.policy_grant.len());
        buf.put_slice(&self.public_key);
        buf.put_u16(self.policy_grant.len() as u16);
        buf.put_slice(&self.policy_grant);
        buf.to_vec()
    }

    /// Parse the encoded form.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 34 {
            return Err(Error::malformed("server handshake too short"));
        }
        let grant_len = u16::from_be_bytes([raw[32], raw[33]]) as usize;
        if raw.len() != 34 + grant_len {
            return Err(Error::malformed("server handshake malformed grant length"));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&raw[0..32]);
        Ok(Self {
            public_key,
            policy_grant: raw[34..].to_vec(),
        })
    }
}

/// JSON envelope used by the HTTP framing in both directions.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    /// Base64-encoded binary payload.
    pub data: String,
}

/// Reject timestamps outside the accepted skew window.
pub fn validate_timestamp(timestamp: i64) -> Result<()> {
    let skew = HANDSHAKE_SKEW.as_secs() as i64;
    if (unix_now() - timestamp).abs() > skew {
        return Err(Error::auth("reflex handshake timestamp out of range"));
    }
    Ok(())
}

/// Remembered handshake nonces with opportunistic expiry.
///
/// One store per handler; a nonce is accepted at most once within its
/// lifetime. Expired entries are swept on each insert.
pub struct NonceStore {
    entries: Mutex<HashMap<[u8; 16], i64>>,
    lifetime: Duration,
}

impl NonceStore {
    /// Create a store with the given nonce lifetime.
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Record `nonce` if it has not been seen within the lifetime.
    /// Returns false for duplicates.
    pub fn check_and_store(&self, nonce: [u8; 16]) -> bool {
        let now = unix_now();
        let mut entries = self.entries.lock();
        let lifetime = self.lifetime.as_secs() as i64;
        entries.retain(|_, first_seen| now - *first_seen <= lifetime);
        if entries.contains_key(&nonce) {
            return false;
        }
        entries.insert(nonce, now);
        true
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_LIFETIME)
    }
}

/// Seal the user's policy string under the session key.
///
/// Returns `nonce(12) || ciphertext` with a fresh random nonce.
pub fn encrypt_policy_grant(session_key: &AeadKey, policy: &str) -> Result<Vec<u8>> {
    let nonce_bytes: [u8; NONCE_SIZE] = SecureRandom::bytes();
    let aead = Aead::new(session_key);
    let ciphertext = aead.seal(&Nonce::from_bytes(nonce_bytes), policy.as_bytes())?;

    let mut grant = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    grant.extend_from_slice(&nonce_bytes);
    grant.extend_from_slice(&ciphertext);
    Ok(grant)
}

/// Open a policy grant produced by [`encrypt_policy_grant`].
pub fn decrypt_policy_grant(session_key: &AeadKey, grant: &[u8]) -> Result<String> {
    if grant.len() <= NONCE_SIZE {
        return Err(Error::malformed("policy grant too short"));
    }
    let nonce_bytes: [u8; NONCE_SIZE] = grant[..NONCE_SIZE]
        .try_into()
        .expect("slice is NONCE_SIZE bytes");
    let aead = Aead::new(session_key);
    let plaintext = aead.open(&Nonce::from_bytes(nonce_bytes), &grant[NONCE_SIZE..])?;
    String::from_utf8(plaintext).map_err(|_| Error::malformed("policy grant is not utf-8"))
}

/// Write the successful handshake response: HTTP 200 with the JSON
/// envelope wrapping the encoded server handshake.
pub async fn write_handshake_response<W>(writer: &mut W, handshake: &ServerHandshake) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let envelope = HandshakeEnvelope {
        data: BASE64.encode(handshake.encode()),
    };
    let body = serde_json::to_vec(&envelope).expect("envelope serialization cannot fail");
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

fn status_text(status: u16) -> &'static str {
    match status {
        403 => "Forbidden",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// Write a plain-text HTTP error response.
pub async fn write_http_error<W>(writer: &mut W, status: u16) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let text = status_text(status);
    let response = format!(
        "HTTP/1.1 {status} {text}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
        text.len()
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Read an HTTP header section (through the blank line) from `reader`.
pub(crate) async fn read_http_head<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(Error::malformed("http header section too large"));
        }
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::malformed("unexpected eof in http headers"));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| Error::malformed("http headers are not utf-8"))
}

/// Extract the Content-Length header value, if present.
pub(crate) fn content_length(head: &str) -> Option<usize> {
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
