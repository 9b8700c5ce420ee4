//! # Reflex
//!
//! Reflex is an inbound/outbound proxy protocol designed to resist
//! traffic-analysis and active probing on a shared TCP port.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Inbound / Outbound Handlers (detection, handshake)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Morphing Engine (size/delay profiles, KS diagnostics)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Frame Transport (AEAD framing, replay defense)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (X25519, ChaCha20-Poly1305, HKDF)         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A client establishes an authenticated, encrypted session with a Reflex
//! server; the server dispatches the requested destination upstream and
//! relays traffic, shaping the wire so that packet-size and inter-frame
//! timing distributions approximate a configured reference traffic class.
//! Connections that do not parse as Reflex are spliced to a configured
//! fallback port so that probing clients observe a plausible service.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod morphing;
pub mod outbound;
pub mod transport;

pub use error::{Error, Result};
