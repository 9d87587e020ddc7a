//! Circuit cryptography
//!
//! Per-hop key material and streaming state: AES-128-CTR in both
//! directions and the running SHA-1 digests over every relay body that
//! crossed this hop. Ciphers and digests are instantiated once when the
//! hop completes its handshake and are never reseeded or rewound; the
//! key buffer itself is zeroized as soon as the streaming state exists.

use crate::error::{Result, TorError};
use crate::protocol::cell::{PAYLOAD_LEN, RELAY_DIGEST_OFFSET};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// KDF info string for the ntor key expansion.
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Key material for one hop, as produced by the ntor KDF.
///
/// Layout of the 72-byte expansion: Df(20) | Db(20) | Kf(16) | Kb(16).
/// Zeroized on drop; once a `HopCrypto` is built from it the cipher and
/// digest state is the only long-lived secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward digest seed Df
    pub forward_digest: [u8; 20],

    /// Backward digest seed Db
    pub backward_digest: [u8; 20],

    /// Forward encryption key Kf (client to relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key Kb (relay to client)
    pub backward_key: [u8; 16],
}

impl CircuitKeys {
    /// Expand a 32-byte KEY_SEED into hop keys.
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so it is used
    /// directly as the HKDF pseudorandom key and only the Expand step
    /// runs, with `m_expand` as info.
    pub fn derive(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Internal("invalid PRK length".into()))?;

        let mut okm = [0u8; 72];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::Internal("key expansion failed".into()))?;

        let mut keys = CircuitKeys {
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        okm.zeroize();

        Ok(keys)
    }
}

/// Streaming crypto state for one hop of a circuit.
pub struct HopCrypto {
    /// Running SHA-1 over every relay body sent toward this hop,
    /// seeded with Df, digest fields zeroed.
    forward_digest: Sha1,

    /// Running SHA-1 over every relay body received from this hop,
    /// seeded with Db.
    backward_digest: Sha1,

    /// Forward AES-128-CTR, zero IV, never rewound.
    encrypt: Aes128Ctr,

    /// Backward AES-128-CTR, zero IV, never rewound.
    decrypt: Aes128Ctr,
}

impl HopCrypto {
    /// Instantiate the streaming state from hop keys.
    pub fn new(keys: &CircuitKeys) -> Self {
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        let iv = [0u8; 16];
        Self {
            forward_digest,
            backward_digest,
            encrypt: Aes128Ctr::new((&keys.forward_key).into(), (&iv).into()),
            decrypt: Aes128Ctr::new((&keys.backward_key).into(), (&iv).into()),
        }
    }

    /// Fold an outbound relay body (digest field zeroed) into the forward
    /// digest and return the 4 bytes that go into the cell.
    pub fn digest_outbound(&mut self, body: &[u8; PAYLOAD_LEN]) -> [u8; 4] {
        debug_assert_eq!(
            body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4],
            [0, 0, 0, 0]
        );
        self.forward_digest.update(body);
        let full = self.forward_digest.clone().finalize();
        let mut digest = [0u8; 4];
        digest.copy_from_slice(&full[..4]);
        digest
    }

    /// Check whether a structurally-recognized inbound body belongs to
    /// this hop. The body's digest field is zeroed into a scratch copy,
    /// the running backward digest is advanced on a clone, and only a
    /// match commits the advanced state.
    pub fn check_inbound(&mut self, body: &[u8; PAYLOAD_LEN]) -> bool {
        let claimed = &body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4];

        let mut zeroed = *body;
        zeroed[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);

        let mut advanced = self.backward_digest.clone();
        advanced.update(zeroed);
        let full = advanced.clone().finalize();

        if claimed == &full[..4] {
            self.backward_digest = advanced;
            true
        } else {
            false
        }
    }

    /// Apply one forward encryption layer in place.
    pub fn encrypt(&mut self, payload: &mut [u8]) {
        self.encrypt.apply_keystream(payload);
    }

    /// Remove one backward encryption layer in place.
    pub fn decrypt(&mut self, payload: &mut [u8]) {
        self.decrypt.apply_keystream(payload);
    }
}

/// Test-side mirror of a relay: the same state a hop would hold, used by
/// unit tests to produce and check traffic as the OR.
#[cfg(test)]
pub struct RelaySide {
    forward_digest: Sha1,
    backward_digest: Sha1,
    decrypt_forward: Aes128Ctr,
    encrypt_backward: Aes128Ctr,
}

#[cfg(test)]
impl RelaySide {
    pub fn new(keys: &CircuitKeys) -> Self {
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        let iv = [0u8; 16];
        Self {
            forward_digest,
            backward_digest,
            decrypt_forward: Aes128Ctr::new((&keys.forward_key).into(), (&iv).into()),
            encrypt_backward: Aes128Ctr::new((&keys.backward_key).into(), (&iv).into()),
        }
    }

    /// Strip the client's layer for this hop.
    pub fn peel(&mut self, payload: &mut [u8]) {
        self.decrypt_forward.apply_keystream(payload);
    }

    /// Check a fully-peeled forward body against the relay's running digest.
    pub fn check_forward(&mut self, body: &[u8; PAYLOAD_LEN]) -> bool {
        let claimed = &body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4];
        let mut zeroed = *body;
        zeroed[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);

        let mut advanced = self.forward_digest.clone();
        advanced.update(zeroed);
        let full = advanced.clone().finalize();
        if claimed == &full[..4] {
            self.forward_digest = advanced;
            true
        } else {
            false
        }
    }

    /// Stamp a backward body with the relay's running digest and add this
    /// hop's backward layer.
    pub fn seal_backward(&mut self, body: &mut [u8; PAYLOAD_LEN]) {
        body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);
        self.backward_digest.update(*body);
        let full = self.backward_digest.clone().finalize();
        body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].copy_from_slice(&full[..4]);
        self.encrypt_backward.apply_keystream(body);
    }

    /// Add this hop's backward layer only (for hops between the origin
    /// of a cell and the client).
    pub fn layer_backward(&mut self, payload: &mut [u8]) {
        self.encrypt_backward.apply_keystream(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{RelayCell, RelayCommand};

    fn test_keys(tag: u8) -> CircuitKeys {
        let mut seed = [tag; 32];
        seed[0] = 0x10;
        CircuitKeys::derive(&seed).unwrap()
    }

    #[test]
    fn kdf_is_deterministic() {
        let seed = [42u8; 32];
        let a = CircuitKeys::derive(&seed).unwrap();
        let b = CircuitKeys::derive(&seed).unwrap();
        assert_eq!(a.forward_key, b.forward_key);
        assert_eq!(a.backward_key, b.backward_key);
        assert_eq!(a.forward_digest, b.forward_digest);
        assert_eq!(a.backward_digest, b.backward_digest);
        assert_ne!(a.forward_key, a.backward_key);
    }

    #[test]
    fn ctr_layers_cancel() {
        let keys = test_keys(1);
        let mut client = HopCrypto::new(&keys);
        let mut relay = RelaySide::new(&keys);

        let mut payload = [0xABu8; PAYLOAD_LEN];
        client.encrypt(&mut payload);
        assert_ne!(payload, [0xABu8; PAYLOAD_LEN]);
        relay.peel(&mut payload);
        assert_eq!(payload, [0xABu8; PAYLOAD_LEN]);
    }

    #[test]
    fn forward_digest_matches_independent_chain() {
        let keys = test_keys(2);
        let mut hop = HopCrypto::new(&keys);

        // Independent chain: SHA1(Df || body1 || body2 || ...)
        let mut shadow = Sha1::new();
        shadow.update(keys.forward_digest);

        for n in 0..5u8 {
            let cell = RelayCell::new(RelayCommand::Data, 7, vec![n; 100]);
            let body = cell.encode().unwrap();
            let digest = hop.digest_outbound(&body);

            shadow.update(body);
            let expected = shadow.clone().finalize();
            assert_eq!(digest, expected[..4]);
        }
    }

    #[test]
    fn inbound_digest_commits_only_on_match() {
        let keys = test_keys(3);
        let mut client = HopCrypto::new(&keys);
        let mut relay = RelaySide::new(&keys);

        let mut body = RelayCell::new(RelayCommand::Data, 3, vec![1, 2, 3])
            .encode()
            .unwrap();
        relay.seal_backward(&mut body);
        client.decrypt(&mut body);

        // A corrupted copy must not advance the running digest.
        let mut corrupt = body;
        corrupt[5] ^= 0xFF;
        assert!(!client.check_inbound(&corrupt));

        // The genuine body still verifies afterwards.
        assert!(client.check_inbound(&body));

        // Replays fail: the chain advanced.
        assert!(!client.check_inbound(&body));
    }

    #[test]
    fn three_hop_onion_peels_at_origin_only() {
        let keys: Vec<CircuitKeys> = (0..3).map(|i| test_keys(10 + i)).collect();
        let mut client: Vec<HopCrypto> = keys.iter().map(HopCrypto::new).collect();
        let mut relays: Vec<RelaySide> = keys.iter().map(RelaySide::new).collect();

        // The exit (hop 2) seals a backward cell; middle and guard add layers.
        let mut body = RelayCell::new(RelayCommand::Data, 11, vec![9; 50])
            .encode()
            .unwrap();
        relays[2].seal_backward(&mut body);
        relays[1].layer_backward(&mut body);
        relays[0].layer_backward(&mut body);

        // The client peels hop by hop; only hop 2 recognizes it.
        let mut accepted = None;
        for (idx, hop) in client.iter_mut().enumerate() {
            hop.decrypt(&mut body);
            if let Some(cell) = RelayCell::try_parse(&body) {
                if hop.check_inbound(&body) {
                    accepted = Some((idx, cell));
                    break;
                }
            }
        }

        let (idx, cell) = accepted.expect("no hop recognized the cell");
        assert_eq!(idx, 2);
        assert_eq!(cell.data, vec![9; 50]);
    }
}
