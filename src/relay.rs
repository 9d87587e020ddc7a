//! Relay descriptors
//!
//! The input type handed to the proxy by its directory collaborator: one
//! entry per relay, with the base64 identity fingerprint and ntor onion
//! key as they appear in directory documents.

use crate::error::{Result, TorError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use x25519_dalek::PublicKey;

/// A relay as described by the directory: immutable input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Relay nickname, used only for logging.
    pub name: String,

    /// RSA identity fingerprint: base64 of a 20-byte SHA-1 digest.
    pub identity: String,

    /// ntor onion key: base64 of a 32-byte curve25519 public key.
    #[serde(rename = "ntor-onion-key")]
    pub ntor_onion_key: String,

    /// IPv4 address of the OR.
    pub ip: Ipv4Addr,

    /// OR port.
    pub or_port: u16,
}

/// Directory documents strip base64 padding; restore it before decoding.
fn b64decode(data: &str) -> Result<Vec<u8>> {
    let mut padded = data.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD
        .decode(&padded)
        .map_err(|e| TorError::InvalidDescriptor(format!("bad base64: {}", e)))
}

impl RelayDescriptor {
    /// The 20-byte identity digest.
    pub fn identity_digest(&self) -> Result<[u8; 20]> {
        let bytes = b64decode(&self.identity)?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            TorError::InvalidDescriptor(format!(
                "identity digest is {} bytes, want 20",
                bytes.len()
            ))
        })
    }

    /// The relay's ntor onion key.
    pub fn onion_key(&self) -> Result<PublicKey> {
        let bytes = b64decode(&self.ntor_onion_key)?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            TorError::InvalidDescriptor(format!("ntor key is {} bytes, want 32", bytes.len()))
        })?;
        Ok(PublicKey::from(key))
    }

    /// Socket address of the OR port.
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.or_port)
    }
}
