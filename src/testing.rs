//! Test harness: the relay side of the protocol
//!
//! A simulated chain of onion routers used by unit tests. `RelayChain`
//! does the pure crypto (server ntor, layered cells, running digests);
//! `ScriptedRelay` adds cell framing over an in-memory transport so the
//! link reactor can be driven end to end.

use crate::protocol::cell::{
    encode_versions, Cell, CellCommand, Decoded, Netinfo, RelayCell, RelayCommand, PAYLOAD_LEN,
};
use crate::protocol::crypto::RelaySide;
use crate::protocol::ntor;
use crate::relay::RelayDescriptor;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use x25519_dalek::{PublicKey, StaticSecret};

/// A deterministic curve25519 secret for hop `tag`.
pub fn secret(tag: u8) -> StaticSecret {
    let mut bytes = [tag; 32];
    bytes[0] = 0x20;
    StaticSecret::from(bytes)
}

/// One simulated onion router.
pub struct HopSim {
    pub descriptor: RelayDescriptor,
    onion_secret: StaticSecret,

    /// Crypto state, present once the hop's handshake completed.
    pub side: Option<RelaySide>,
}

/// A chain of simulated hops terminating a client circuit.
pub struct RelayChain {
    pub hops: Vec<HopSim>,
}

impl RelayChain {
    /// A chain of `n` relays with deterministic keys.
    pub fn new(n: usize) -> Self {
        let hops = (0..n)
            .map(|i| {
                let onion_secret = secret(0x30 + i as u8);
                let identity = [0x40 + i as u8; 20];
                let descriptor = RelayDescriptor {
                    name: format!("sim{}", i),
                    identity: STANDARD.encode(identity),
                    ntor_onion_key: STANDARD
                        .encode(PublicKey::from(&onion_secret).as_bytes()),
                    ip: Ipv4Addr::new(10, 1, 1, 1 + i as u8),
                    or_port: 9001 + i as u16,
                };
                HopSim {
                    descriptor,
                    onion_secret,
                    side: None,
                }
            })
            .collect();
        Self { hops }
    }

    pub fn descriptors(&self) -> Vec<RelayDescriptor> {
        self.hops.iter().map(|h| h.descriptor.clone()).collect()
    }

    fn active_hops(&self) -> usize {
        self.hops.iter().take_while(|h| h.side.is_some()).count()
    }

    /// Complete a handshake for hop `idx` from the raw 84-byte client
    /// handshake; returns the 64-byte server reply.
    fn complete_handshake(&mut self, idx: usize, hdata: &[u8]) -> Vec<u8> {
        let handshake: [u8; ntor::HANDSHAKE_LEN] =
            hdata.try_into().expect("client handshake is 84 bytes");
        let node_id = self.hops[idx]
            .descriptor
            .identity_digest()
            .expect("sim identity");
        assert_eq!(&handshake[..20], &node_id, "handshake targets wrong hop");

        let (reply, keys) = ntor::server_reply(
            &handshake,
            &node_id,
            &self.hops[idx].onion_secret,
            secret(0x60 + idx as u8),
        );
        self.hops[idx].side = Some(RelaySide::new(&keys));
        reply.to_vec()
    }

    /// Answer the client's CREATE2 with a CREATED2.
    pub fn answer_create2(&mut self, cell: &Cell) -> Cell {
        assert_eq!(cell.command, CellCommand::Create2);
        assert_eq!(&cell.payload[..2], &[0x00, 0x02], "handshake type");
        let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
        assert_eq!(hlen, ntor::HANDSHAKE_LEN);

        let reply = self.complete_handshake(0, &cell.payload[4..4 + hlen]);
        let mut payload = Vec::with_capacity(2 + reply.len());
        payload.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        payload.extend_from_slice(&reply);
        Cell::new(cell.circuit_id, CellCommand::Created2, payload)
    }

    /// Peel a client RELAY/RELAY_EARLY to the hop that recognizes it.
    pub fn accept_forward(&mut self, cell: &Cell) -> (usize, RelayCell) {
        assert!(matches!(
            cell.command,
            CellCommand::Relay | CellCommand::RelayEarly
        ));
        let mut body: [u8; PAYLOAD_LEN] =
            cell.payload.clone().try_into().expect("relay payload size");

        let active = self.active_hops();
        for idx in 0..active {
            let side = self.hops[idx].side.as_mut().expect("active hop");
            side.peel(&mut body);
            if RelayCell::try_parse(&body).is_some() && side.check_forward(&body) {
                let parsed = RelayCell::try_parse(&body).expect("parsed above");
                return (idx, parsed);
            }
        }
        panic!("no simulated hop recognized the cell");
    }

    /// Answer a RELAY_EXTEND2 (which must arrive as RELAY_EARLY and be
    /// recognized at the last established hop) with a RELAY_EXTENDED2.
    pub fn answer_extend2(&mut self, cell: &Cell) -> Cell {
        assert_eq!(cell.command, CellCommand::RelayEarly, "EXTEND2 must be RELAY_EARLY");
        let last = self.active_hops() - 1;
        let (at, relay) = self.accept_forward(cell);
        assert_eq!(at, last, "EXTEND2 recognized at the wrong hop");
        assert_eq!(relay.relay_command(), Some(RelayCommand::Extend2));
        assert_eq!(relay.stream_id, 0);

        // NSPEC | LSTYPE 0 LSLEN 6 ip port | LSTYPE 2 LSLEN 20 id |
        // HTYPE HLEN HDATA
        let body = &relay.data;
        assert_eq!(body[0], 2, "link specifier count");
        assert_eq!(&body[1..3], &[0x00, 6]);
        let next = last + 1;
        assert_eq!(&body[3..7], &self.hops[next].descriptor.ip.octets());
        assert_eq!(
            u16::from_be_bytes([body[7], body[8]]),
            self.hops[next].descriptor.or_port
        );
        assert_eq!(&body[9..11], &[0x02, 20]);
        let identity = self.hops[next].descriptor.identity_digest().unwrap();
        assert_eq!(&body[11..31], &identity);
        assert_eq!(&body[31..33], &[0x00, 0x02]);
        let hlen = u16::from_be_bytes([body[33], body[34]]) as usize;
        assert_eq!(hlen, ntor::HANDSHAKE_LEN);

        let reply = self.complete_handshake(next, &body[35..35 + hlen]);
        let mut data = Vec::with_capacity(2 + reply.len());
        data.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        data.extend_from_slice(&reply);

        // The EXTENDED2 comes from the hop that performed the extend,
        // which was the last hop at the time the EXTEND2 was sent.
        self.make_backward(last, cell.circuit_id, RelayCell::new(RelayCommand::Extended2, 0, data))
    }

    /// Build a backward relay cell as sent by hop `origin`.
    pub fn make_backward(&mut self, origin: usize, circuit_id: u32, relay: RelayCell) -> Cell {
        let mut body = relay.encode().expect("relay body");
        self.hops[origin]
            .side
            .as_mut()
            .expect("origin hop established")
            .seal_backward(&mut body);
        for idx in (0..origin).rev() {
            self.hops[idx]
                .side
                .as_mut()
                .expect("established hop")
                .layer_backward(&mut body);
        }
        Cell::new(circuit_id, CellCommand::Relay, body.to_vec())
    }
}

/// A throwaway self-signed certificate whose validity covers the next
/// hour; the link only checks DER well-formedness and the window.
pub fn test_cert_der() -> Vec<u8> {
    use p256::ecdsa::{DerSignature, SigningKey};
    use std::str::FromStr;
    use x509_cert::builder::{Builder, CertificateBuilder, Profile};
    use x509_cert::der::Encode;
    use x509_cert::name::Name;
    use x509_cert::serial_number::SerialNumber;
    use x509_cert::spki::SubjectPublicKeyInfoOwned;
    use x509_cert::time::Validity;

    let signing_key = SigningKey::from_slice(&[7u8; 32]).expect("p256 scalar");
    let spki = SubjectPublicKeyInfoOwned::from_key(*signing_key.verifying_key())
        .expect("spki from key");
    let subject = Name::from_str("CN=or.invalid").expect("subject");

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::from(1u32),
        Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        subject,
        spki,
        &signing_key,
    )
    .expect("certificate builder");
    let cert = builder.build::<DerSignature>().expect("self-sign");
    cert.to_der().expect("der encode")
}

/// CERTS payload with link (1) and identity (2) certificates.
pub fn test_certs_payload() -> Vec<u8> {
    let der = test_cert_der();
    let mut payload = vec![2u8];
    for cert_type in [1u8, 2u8] {
        payload.push(cert_type);
        payload.extend_from_slice(&(der.len() as u16).to_be_bytes());
        payload.extend_from_slice(&der);
    }
    payload
}

/// The relay end of a link: cell framing over an in-memory pipe plus a
/// simulated hop chain.
pub struct ScriptedRelay {
    io: DuplexStream,
    buffer: Vec<u8>,
    pub proto_version: u16,
    pub chain: RelayChain,
}

impl ScriptedRelay {
    pub fn new(io: DuplexStream, hops: usize) -> Self {
        Self {
            io,
            buffer: Vec::new(),
            proto_version: 3,
            chain: RelayChain::new(hops),
        }
    }

    pub async fn read_cell(&mut self) -> Cell {
        let mut scratch = vec![0u8; 4096];
        loop {
            match Cell::try_decode(&self.buffer, self.proto_version).expect("harness decode") {
                Decoded::Cell { consumed, cell } => {
                    self.buffer.drain(..consumed);
                    return cell;
                }
                Decoded::Unknown { command, .. } => panic!("client sent unknown command {}", command),
                Decoded::NeedMore => {
                    let n = self.io.read(&mut scratch).await.expect("harness read");
                    assert!(n > 0, "client closed the link");
                    self.buffer.extend_from_slice(&scratch[..n]);
                }
            }
        }
    }

    pub async fn write_cell(&mut self, cell: Cell) {
        let bytes = cell.encode(self.proto_version).expect("harness encode");
        self.io.write_all(&bytes).await.expect("harness write");
    }

    /// Push raw bytes at the client, bypassing the cell encoder.
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("harness write");
    }

    /// Serve VERSIONS/CERTS/AUTH_CHALLENGE/NETINFO; returns the
    /// client's VERSIONS payload and its NETINFO reply.
    pub async fn serve_link_handshake(&mut self, timestamp: u32) -> (Vec<u16>, Netinfo) {
        let versions = self.read_cell().await;
        assert_eq!(versions.command, CellCommand::Versions);
        assert_eq!(versions.circuit_id, 0);
        let offered = crate::protocol::cell::parse_versions(&versions.payload).unwrap();

        self.write_cell(Cell::new(
            0,
            CellCommand::Versions,
            encode_versions(&[3, 4, 5]),
        ))
        .await;
        self.proto_version = 4;

        self.write_cell(Cell::new(0, CellCommand::Certs, test_certs_payload()))
            .await;

        // challenge(32) n_methods(2) method(2)
        let mut challenge = vec![0xC5u8; 32];
        challenge.extend_from_slice(&1u16.to_be_bytes());
        challenge.extend_from_slice(&1u16.to_be_bytes());
        self.write_cell(Cell::new(0, CellCommand::AuthChallenge, challenge))
            .await;

        let relay_ip = self
            .chain
            .hops
            .first()
            .map(|h| h.descriptor.ip)
            .unwrap_or(Ipv4Addr::new(10, 1, 1, 1));
        let netinfo = Netinfo::encode(timestamp, Ipv4Addr::new(127, 0, 0, 1), relay_ip);
        self.write_cell(Cell::new(0, CellCommand::Netinfo, netinfo))
            .await;

        let reply = self.read_cell().await;
        assert_eq!(reply.command, CellCommand::Netinfo);
        (offered, Netinfo::parse(&reply.payload).unwrap())
    }

    /// Answer the whole circuit build for however many hops the chain has.
    pub async fn serve_circuit_build(&mut self) -> u32 {
        let create2 = self.read_cell().await;
        let circuit_id = create2.circuit_id;
        let created2 = self.chain.answer_create2(&create2);
        self.write_cell(created2).await;

        for _ in 1..self.chain.hops.len() {
            let extend = self.read_cell().await;
            assert_eq!(extend.circuit_id, circuit_id);
            let extended = self.chain.answer_extend2(&extend);
            self.write_cell(extended).await;
        }
        circuit_id
    }

    /// Read the next relay cell and return where it was recognized.
    pub async fn expect_relay(&mut self) -> (u32, usize, RelayCell) {
        let cell = self.read_cell().await;
        let circuit_id = cell.circuit_id;
        let (hop, relay) = self.chain.accept_forward(&cell);
        (circuit_id, hop, relay)
    }

    /// Inject a backward relay cell from hop `origin`.
    pub async fn send_backward(&mut self, origin: usize, circuit_id: u32, relay: RelayCell) {
        let cell = self.chain.make_backward(origin, circuit_id, relay);
        self.write_cell(cell).await;
    }
}
