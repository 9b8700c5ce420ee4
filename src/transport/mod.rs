//! Encrypted frame transport.
//!
//! Every byte after the handshake travels in length-prefixed AEAD-sealed
//! frames. A [`Session`](session::Session) keeps the per-direction nonce
//! counters and the replay defense; [`PeekReader`](peek::PeekReader)
//! provides the non-destructive look-ahead used for protocol detection.

mod frame;
mod peek;
mod session;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use peek::PeekReader;
pub use session::Session;
