//! Frame wire format.
//!
//! Wire layout: `len:u16 BE || type:u8 || ciphertext[len]` with
//! `1 <= len <= 65535`. The ciphertext carries a 16-byte Poly1305 tag, so
//! the plaintext capacity per frame is slightly below the maximum.

use crate::error::Error;

/// Maximum ciphertext length per frame.
pub const MAX_FRAME_PAYLOAD: usize = 65535;

/// Size of the cleartext frame header.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Frame types carried in the cleartext header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Opaque proxied payload. The first DATA frame of a session carries a
    /// destination prefix.
    Data = 0x01,
    /// Shaping hint: 2-byte big-endian target payload size.
    Padding = 0x02,
    /// Shaping hint: 8-byte big-endian delay in milliseconds.
    Timing = 0x03,
    /// Session teardown; empty payload.
    Close = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Padding),
            0x03 => Ok(Self::Timing),
            0x04 => Ok(Self::Close),
            _ => Err(Error::malformed(format!(
                "unknown reflex frame type: 0x{value:02x}"
            ))),
        }
    }
}

/// One decrypted Reflex frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Ciphertext length as carried on the wire.
    pub length: u16,
    /// Frame type.
    pub frame_type: FrameType,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}
