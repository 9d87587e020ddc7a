//! ntor handshake implementation
//!
//! The ntor (curve25519 + SHA-256) key exchange used for CREATE2 and
//! RELAY_EXTEND2. One `NtorClient` value is one handshake attempt: it is
//! created when the CREATE2/EXTEND2 goes out and consumed when the reply
//! arrives. AUTH verification is constant time, and every intermediate
//! secret is zeroized before the call returns.

use crate::error::{Result, TorError};
use crate::protocol::crypto::CircuitKeys;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";

/// Client handshake length: NODEID(20) | KEYID(32) | X(32).
pub const HANDSHAKE_LEN: usize = 84;

/// Server reply length: Y(32) | AUTH(32).
pub const REPLY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// One in-flight ntor handshake.
///
/// The ephemeral secret lives only inside this value; `StaticSecret`
/// zeroizes itself on drop.
pub struct NtorClient {
    /// Client's ephemeral secret x
    secret: StaticSecret,

    /// Client's ephemeral public X
    public: PublicKey,

    /// Relay's 20-byte identity digest
    node_id: [u8; 20],

    /// Relay's ntor onion key B
    onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward a relay with a fresh ephemeral keypair.
    pub fn new(node_id: [u8; 20], onion_key: PublicKey) -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng), node_id, onion_key)
    }

    /// Start a handshake with a caller-supplied ephemeral secret.
    /// Deterministic builds use this to replay fixed handshakes.
    pub fn from_secret(secret: StaticSecret, node_id: [u8; 20], onion_key: PublicKey) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            node_id,
            onion_key,
        }
    }

    /// Our ephemeral public key X.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The 84-byte client handshake body: NODEID | KEYID(B) | X.
    pub fn client_handshake(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[..20].copy_from_slice(&self.node_id);
        out[20..52].copy_from_slice(self.onion_key.as_bytes());
        out[52..84].copy_from_slice(self.public.as_bytes());
        out
    }

    /// Consume the server reply `Y | AUTH` and derive the hop keys.
    ///
    /// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    /// KEY_SEED    = H(secret_input, t_key)
    /// verify      = H(secret_input, t_verify)
    /// auth_input  = verify | ID | B | Y | X | PROTOID | "Server"
    /// and the reply's AUTH must equal H(auth_input, t_mac).
    pub fn complete(self, y: &[u8; 32], auth: &[u8; 32]) -> Result<CircuitKeys> {
        let server_public = PublicKey::from(*y);

        let shared_yx = self.secret.diffie_hellman(&server_public);
        let shared_bx = self.secret.diffie_hellman(&self.onion_key);

        // A non-contributory result means one of the EXP() operations hit
        // the point at infinity; the handshake is unauthenticated garbage.
        if !shared_yx.was_contributory() || !shared_bx.was_contributory() {
            return Err(TorError::NtorAuthMismatch);
        }

        let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 5 + 20 + PROTOID.len()));
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(y);
        secret_input.extend_from_slice(PROTOID);

        let key_seed = Zeroizing::new(hmac_sha256(T_KEY, &secret_input));
        let verify = Zeroizing::new(hmac_sha256(T_VERIFY, &secret_input));

        let mut auth_input = Zeroizing::new(Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6));
        auth_input.extend_from_slice(&*verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(self.onion_key.as_bytes());
        auth_input.extend_from_slice(y);
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected = hmac_sha256(T_MAC, &auth_input);
        if !bool::from(expected.as_slice().ct_eq(auth.as_slice())) {
            log::warn!("ntor AUTH verification failed");
            return Err(TorError::NtorAuthMismatch);
        }

        CircuitKeys::derive(&key_seed)
    }
}

/// Parse a server reply (CREATED2/EXTENDED2 hdata) into (Y, AUTH).
pub fn parse_server_reply(hdata: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if hdata.len() < REPLY_LEN {
        return Err(TorError::Protocol(format!(
            "ntor reply too short: {} bytes",
            hdata.len()
        )));
    }
    let mut y = [0u8; 32];
    let mut auth = [0u8; 32];
    y.copy_from_slice(&hdata[..32]);
    auth.copy_from_slice(&hdata[32..64]);
    Ok((y, auth))
}

/// The relay side of the handshake, used by tests to answer a client
/// handshake the way an OR would.
#[cfg(test)]
pub fn server_reply(
    client_handshake: &[u8; HANDSHAKE_LEN],
    node_id: &[u8; 20],
    onion_secret: &StaticSecret,
    ephemeral_secret: StaticSecret,
) -> ([u8; REPLY_LEN], CircuitKeys) {
    let mut x_bytes = [0u8; 32];
    x_bytes.copy_from_slice(&client_handshake[52..84]);
    let client_public = PublicKey::from(x_bytes);

    let onion_public = PublicKey::from(onion_secret);
    let server_public = PublicKey::from(&ephemeral_secret);

    let shared_xy = ephemeral_secret.diffie_hellman(&client_public);
    let shared_xb = onion_secret.diffie_hellman(&client_public);

    let mut secret_input = Vec::new();
    secret_input.extend_from_slice(shared_xy.as_bytes());
    secret_input.extend_from_slice(shared_xb.as_bytes());
    secret_input.extend_from_slice(node_id);
    secret_input.extend_from_slice(onion_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_sha256(T_KEY, &secret_input);
    let verify = hmac_sha256(T_VERIFY, &secret_input);

    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(node_id);
    auth_input.extend_from_slice(onion_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth = hmac_sha256(T_MAC, &auth_input);

    let mut reply = [0u8; REPLY_LEN];
    reply[..32].copy_from_slice(server_public.as_bytes());
    reply[32..].copy_from_slice(&auth);

    (reply, CircuitKeys::derive(&key_seed).unwrap())
}
