//! Encrypted frame session.
//!
//! A `Session` owns the AEAD state for one connection: per-direction nonce
//! counters, the replay defense on the read side, and the optional traffic
//! profile applied when writing DATA frames with morphing.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::crypto::{Aead, AeadKey, Nonce};
use crate::error::{Error, Result};
use crate::morphing::TrafficProfile;
use crate::transport::frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};

/// Maximum number of remembered ciphertext hashes per session.
const REPLAY_WINDOW_SIZE: usize = 1000;

#[derive(Default, Debug)]
struct ReplayLog {
    seen: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

impl ReplayLog {
    /// Remember a ciphertext hash. Returns false when it was seen before.
    /// The log is bounded: once full, the oldest entry is evicted.
    fn remember(&mut self, ciphertext: &[u8]) -> bool {
        let hash: [u8; 32] = Sha256::digest(ciphertext).into();
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > REPLAY_WINDOW_SIZE {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Framing and AEAD state for one Reflex connection.
///
/// Counters start at zero, are strictly monotonic, and are never rolled
/// back: a failed or oversized write burns its counter and the session is
/// unusable after a partial write.
#[derive(Debug)]
pub struct Session {
    aead: Aead,
    read_counter: AtomicU64,
    // Guards the write counter and the outbound byte stream; intentionally
    // held across the morphing sleep so frame pacing is realized on the wire.
    write_counter: AsyncMutex<u64>,
    replay: parking_lot::Mutex<ReplayLog>,
    profile: Option<TrafficProfile>,
}

impl Session {
    /// Create a new session keyed with `key`.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            aead: Aead::new(key),
            read_counter: AtomicU64::new(0),
            write_counter: AsyncMutex::new(0),
            replay: parking_lot::Mutex::new(ReplayLog::default()),
            profile: None,
        }
    }

    /// Attach a traffic morphing profile to this session.
    pub fn set_traffic_profile(&mut self, profile: TrafficProfile) {
        self.profile = Some(profile);
    }

    /// The session's traffic profile, if any.
    pub fn profile(&self) -> Option<&TrafficProfile> {
        self.profile.as_ref()
    }

    /// Read and decrypt one frame.
    ///
    /// Returns `Ok(None)` on clean EOF between frames; EOF inside a frame
    /// is a transport error. A ciphertext already seen this session is
    /// rejected before decryption.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof inside frame header",
                )));
            }
            filled += n;
        }

        let length = u16::from_be_bytes([header[0], header[1]]);
        let type_byte = header[2];
        if length == 0 {
            return Err(Error::malformed("invalid reflex frame length"));
        }

        let mut ciphertext = vec![0u8; length as usize];
        reader.read_exact(&mut ciphertext).await?;

        if !self.replay.lock().remember(&ciphertext) {
            return Err(Error::Replay);
        }

        let nonce = Nonce::from_counter(self.read_counter.fetch_add(1, Ordering::SeqCst));
        let payload = self.aead.open(&nonce, &ciphertext)?;
        let frame_type = FrameType::try_from(type_byte)?;

        Ok(Some(Frame {
            length,
            frame_type,
            payload,
        }))
    }

    /// Encrypt and write one frame.
    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut counter = self.write_counter.lock().await;
        self.write_frame_locked(writer, &mut counter, frame_type, plaintext)
            .await
    }

    async fn write_frame_locked<W>(
        &self,
        writer: &mut W,
        counter: &mut u64,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let nonce = Nonce::from_counter(*counter);
        *counter += 1;
        let ciphertext = self.aead.seal(&nonce, plaintext)?;
        if ciphertext.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::malformed("frame too large"));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..2].copy_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        header[2] = frame_type as u8;

        writer.write_all(&header).await?;
        writer.write_all(&ciphertext).await?;
        Ok(())
    }

    /// Write DATA with size and timing shaping.
    ///
    /// Falls back to a plain [`Session::write_frame`] for non-DATA frames
    /// or when no profile is attached. Otherwise the payload is chunked to
    /// profile-sampled target sizes; each chunk is followed by a PADDING
    /// hint, and sampled delays emit a TIMING hint and are slept locally.
    /// The write lock is held for the whole loop, sleeps included, so the
    /// pacing shows up as inter-frame gaps on the wire.
    pub async fn write_frame_with_morphing<W>(
        &self,
        writer: &mut W,
        frame_type: FrameType,
        data: &[u8],
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let profile = match &self.profile {
            Some(profile) if frame_type == FrameType::Data => profile,
            _ => return self.write_frame(writer, frame_type, data).await,
        };

        let mut counter = self.write_counter.lock().await;
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut target = profile.next_packet_size();
            if target == 0 {
                target = remaining.len();
            }
            let take = remaining.len().min(target);
            let (chunk, rest) = remaining.split_at(take);
            remaining = rest;

            self.write_frame_locked(writer, &mut counter, FrameType::Data, chunk)
                .await?;
            self.send_padding_control_locked(writer, &mut counter, target)
                .await?;

            let delay = profile.next_delay();
            if !delay.is_zero() {
                self.send_timing_control_locked(writer, &mut counter, delay)
                    .await?;
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Send a PADDING control frame carrying the target payload size.
    pub async fn send_padding_control<W>(&self, writer: &mut W, target_size: usize) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut counter = self.write_counter.lock().await;
        self.send_padding_control_locked(writer, &mut counter, target_size)
            .await
    }

    async fn send_padding_control_locked<W>(
        &self,
        writer: &mut W,
        counter: &mut u64,
        target_size: usize,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if target_size == 0 || target_size > MAX_FRAME_PAYLOAD {
            return Err(Error::malformed("invalid padding target size"));
        }
        let payload = (target_size as u16).to_be_bytes();
        self.write_frame_locked(writer, counter, FrameType::Padding, &payload)
            .await
    }

    /// Send a TIMING control frame carrying the delay in milliseconds.
    pub async fn send_timing_control<W>(&self, writer: &mut W, delay: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut counter = self.write_counter.lock().await;
        self.send_timing_control_locked(writer, &mut counter, delay)
            .await
    }

    async fn send_timing_control_locked<W>(
        &self,
        writer: &mut W,
        counter: &mut u64,
        delay: Duration,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if delay.is_zero() {
            return Err(Error::malformed("invalid timing delay"));
        }
        let payload = (delay.as_millis() as u64).to_be_bytes();
        self.write_frame_locked(writer, counter, FrameType::Timing, &payload)
            .await
    }

    /// Apply a received PADDING/TIMING hint to the local profile.
    ///
    /// The hint installs a single-shot override on this session's own
    /// outgoing distribution; it never reaches upstream. Other frame types
    /// are ignored. A session without a profile drops the hint.
    pub fn handle_control_frame(&self, frame: &Frame) -> Result<()> {
        let Some(profile) = &self.profile else {
            return Ok(());
        };
        match frame.frame_type {
            FrameType::Padding => {
                let payload: [u8; 2] = frame
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::malformed("invalid padding control payload"))?;
                profile.set_next_packet_size(u16::from_be_bytes(payload) as usize);
            }
            FrameType::Timing => {
                let payload: [u8; 8] = frame
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::malformed("invalid timing control payload"))?;
                profile.set_next_delay(Duration::from_millis(u64::from_be_bytes(payload)));
            }
            _ => {}
        }
        Ok(())
    }
}
