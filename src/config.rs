//! Configuration types.
//!
//! Configuration is plain JSON loaded by the host. Users are keyed by UUID
//! and select a traffic policy by name; the inbound fallback names a local
//! port that non-Reflex connections are spliced to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One configured client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client identity.
    pub id: Uuid,
    /// Traffic policy tag (e.g. `http2-api`, `youtube`, `zoom`).
    /// Unknown tags resolve to `http2-api`.
    #[serde(default)]
    pub policy: String,
}

/// Fallback relay target for unmatched connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Local TCP port on 127.0.0.1.
    pub dest: u16,
}

/// Inbound handler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Accepted clients. IDs must be unique.
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    /// Optional fallback for unmatched traffic.
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

impl InboundConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.id) {
                return Err(Error::config(format!("duplicate client id: {}", client.id)));
            }
        }
        Ok(())
    }
}

/// Outbound handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Server hostname or IP address.
    pub address: String,
    /// Server TCP port.
    pub port: u16,
    /// Client identity presented in the handshake.
    pub id: Uuid,
}

impl OutboundConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::config("outbound address is not set"));
        }
        if self.port == 0 {
            return Err(Error::config("outbound port is not set"));
        }
        Ok(())
    }
}
