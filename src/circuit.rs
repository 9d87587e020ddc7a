//! Circuit engine
//!
//! A circuit owns its ordered list of hops and everything that moves
//! through them: the CREATE2/EXTEND2 build sequence, layered encryption
//! of outbound relay cells, onion peeling of inbound ones, per-hop
//! running digests, SENDME credit, and the table of streams multiplexed
//! on top. The link reactor is the only caller; every method runs on the
//! reactor task, so digest updates, cipher advances, and window changes
//! for one cell happen as a single step relative to other cells.

use crate::error::{Result, TorError};
use crate::protocol::cell::{
    encode_create2, parse_created2, Cell, CellCommand, DestroyReason, EndReason, RelayCell,
    RelayCommand, PAYLOAD_LEN, RELAY_DIGEST_OFFSET,
};
use crate::protocol::crypto::HopCrypto;
use crate::protocol::flow_control::CircuitFlowControl;
use crate::protocol::ntor::NtorClient;
use crate::relay::RelayDescriptor;
use crate::stream::{StreamEvent, StreamState, StreamTarget};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};

/// A circuit may never send more than this many RELAY_EARLY cells.
const MAX_RELAY_EARLY: u8 = 8;

/// Signal fired when a circuit finishes building.
pub(crate) type BuildDone = oneshot::Sender<Result<u32>>;

/// Signal fired when a stream finishes opening.
pub(crate) type OpenDone = oneshot::Sender<Result<(u16, mpsc::Receiver<StreamEvent>)>>;

/// Signal fired when a write has been put on the wire.
pub(crate) type WriteDone = oneshot::Sender<Result<()>>;

/// Circuit lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitState {
    /// CREATE2 sent, waiting for CREATED2.
    Building,
    /// RELAY_EXTEND2 sent, waiting for RELAY_EXTENDED2.
    PendingExtend,
    /// All hops up; streams may open.
    Open,
    /// Torn down; the id is retired.
    Destroyed,
}

/// One hop of the circuit.
struct Hop {
    descriptor: RelayDescriptor,
    crypto: HopCrypto,
}

/// An outbound relay cell waiting its turn in the strictly-ordered
/// per-circuit queue. Sealing (digest + layered encryption) happens at
/// dequeue time so the digest chain matches transmit order.
struct PendingRelay {
    relay: RelayCell,
    early: bool,
    needs_credit: bool,
    stream: Option<u16>,
    done: Option<WriteDone>,
}

/// A sealed cell ready for the link, with an optional completion to fire
/// once it has been written.
pub(crate) struct Outgoing {
    pub cell: Cell,
    pub done: Option<WriteDone>,
}

pub(crate) struct Circuit {
    id: u32,
    state: CircuitState,
    hops: Vec<Hop>,

    /// Relays still to be extended to, in order.
    pending_hops: VecDeque<RelayDescriptor>,

    /// The handshake attempt currently waiting for its reply, with the
    /// relay it is being performed with.
    inflight_ntor: Option<(NtorClient, RelayDescriptor)>,

    build_done: Option<BuildDone>,

    streams: HashMap<u16, StreamState>,
    next_stream_id: u16,
    stream_ids_exhausted: bool,

    flow: CircuitFlowControl,
    relay_early_used: u8,
    outbox: VecDeque<PendingRelay>,

    /// Fixed ephemeral secrets consumed in hop order, for deterministic
    /// handshakes in tests.
    #[cfg(test)]
    test_secrets: VecDeque<x25519_dalek::StaticSecret>,
}

impl Circuit {
    /// Begin building a circuit along `path`. Returns the engine and the
    /// CREATE2 cell for the first hop.
    pub fn start(id: u32, path: Vec<RelayDescriptor>) -> Result<(Self, Cell)> {
        let mut circuit = Self::prepare(id, path)?;
        let cell = circuit.send_create2()?;
        Ok((circuit, cell))
    }

    /// As `start`, but with fixed ephemeral secrets so the handshake
    /// bytes are reproducible.
    #[cfg(test)]
    pub fn start_with_secrets(
        id: u32,
        path: Vec<RelayDescriptor>,
        secrets: Vec<x25519_dalek::StaticSecret>,
    ) -> Result<(Self, Cell)> {
        let mut circuit = Self::prepare(id, path)?;
        circuit.test_secrets = secrets.into();
        let cell = circuit.send_create2()?;
        Ok((circuit, cell))
    }

    fn prepare(id: u32, path: Vec<RelayDescriptor>) -> Result<Self> {
        if path.is_empty() {
            return Err(TorError::Internal("circuit path is empty".into()));
        }
        Ok(Self {
            id,
            state: CircuitState::Building,
            hops: Vec::new(),
            pending_hops: path.into(),
            inflight_ntor: None,
            build_done: None,
            streams: HashMap::new(),
            next_stream_id: 1,
            stream_ids_exhausted: false,
            flow: CircuitFlowControl::new(),
            relay_early_used: 0,
            outbox: VecDeque::new(),
            #[cfg(test)]
            test_secrets: VecDeque::new(),
        })
    }

    fn send_create2(&mut self) -> Result<Cell> {
        let first = self
            .pending_hops
            .pop_front()
            .ok_or_else(|| TorError::Internal("circuit path is empty".into()))?;
        log::info!("circuit {:#x}: CREATE2 toward {}", self.id, first.name);

        let ntor = self.new_ntor(&first)?;
        let payload = encode_create2(&ntor.client_handshake());
        self.inflight_ntor = Some((ntor, first));
        Ok(Cell::new(self.id, CellCommand::Create2, payload))
    }

    /// Attach the signal fired when the build finishes or fails.
    pub fn set_build_done(&mut self, done: BuildDone) {
        self.build_done = Some(done);
    }

    #[cfg(test)]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    fn new_ntor(&mut self, node: &RelayDescriptor) -> Result<NtorClient> {
        let node_id = node.identity_digest()?;
        let onion_key = node.onion_key()?;

        #[cfg(test)]
        if let Some(secret) = self.test_secrets.pop_front() {
            return Ok(NtorClient::from_secret(secret, node_id, onion_key));
        }

        Ok(NtorClient::new(node_id, onion_key))
    }

    // ===== Inbound =====

    /// Handle a cell the link routed to this circuit.
    pub fn on_cell(&mut self, cell: Cell) -> Result<Vec<Outgoing>> {
        match cell.command {
            CellCommand::Created2 => {
                if self.state != CircuitState::Building {
                    return Err(TorError::Protocol(format!(
                        "CREATED2 in state {:?}",
                        self.state
                    )));
                }
                let (y, auth) = parse_created2(&cell.payload)?;
                self.complete_hop(&y, &auth)
            }
            CellCommand::Relay | CellCommand::RelayEarly => self.on_relay(cell.payload),
            other => Err(TorError::Protocol(format!(
                "unexpected {:?} cell on circuit {:#x}",
                other, self.id
            ))),
        }
    }

    /// Finish the pending ntor handshake and append the new hop, then
    /// either extend further or open the circuit.
    fn complete_hop(&mut self, y: &[u8; 32], auth: &[u8; 32]) -> Result<Vec<Outgoing>> {
        let (ntor, descriptor) = self
            .inflight_ntor
            .take()
            .ok_or_else(|| TorError::Protocol("handshake reply with no handshake".into()))?;

        let keys = ntor.complete(y, auth).map_err(|e| match e {
            TorError::NtorAuthMismatch => TorError::CircuitFailure {
                hop_index: self.hops.len(),
                reason: "ntor auth mismatch".into(),
            },
            other => other,
        })?;

        log::info!(
            "circuit {:#x}: hop {} ({}) established",
            self.id,
            self.hops.len() + 1,
            descriptor.name
        );
        self.hops.push(Hop {
            crypto: HopCrypto::new(&keys),
            descriptor,
        });

        if let Some(next) = self.pending_hops.pop_front() {
            self.state = CircuitState::PendingExtend;
            self.queue_extend(next)
        } else {
            self.state = CircuitState::Open;
            log::info!(
                "circuit {:#x} open: {}",
                self.id,
                self.hop_names().join(" -> ")
            );
            if let Some(done) = self.build_done.take() {
                let _ = done.send(Ok(self.id));
            }
            Ok(Vec::new())
        }
    }

    /// Build and enqueue the RELAY_EXTEND2 for `node`.
    fn queue_extend(&mut self, node: RelayDescriptor) -> Result<Vec<Outgoing>> {
        log::info!("circuit {:#x}: EXTEND2 toward {}", self.id, node.name);

        let ntor = self.new_ntor(&node)?;
        let handshake = ntor.client_handshake();
        let identity = node.identity_digest()?;

        // NSPEC(1) | LSTYPE 0x00 LSLEN 6 ipv4+port | LSTYPE 0x02 LSLEN 20
        // identity | HTYPE 0x0002 HLEN 84 HDATA.
        let mut body = Vec::with_capacity(1 + 8 + 22 + 4 + handshake.len());
        body.push(2);
        body.push(0x00);
        body.push(6);
        body.extend_from_slice(&node.ip.octets());
        body.extend_from_slice(&node.or_port.to_be_bytes());
        body.push(0x02);
        body.push(20);
        body.extend_from_slice(&identity);
        body.extend_from_slice(&0x0002u16.to_be_bytes());
        body.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        body.extend_from_slice(&handshake);

        self.inflight_ntor = Some((ntor, node));

        self.outbox.push_back(PendingRelay {
            relay: RelayCell::new(RelayCommand::Extend2, 0, body),
            early: true,
            needs_credit: false,
            stream: None,
            done: None,
        });
        self.pump()
    }

    /// Peel an inbound relay payload hop by hop and dispatch it at the
    /// hop whose digest recognizes it.
    fn on_relay(&mut self, payload: Vec<u8>) -> Result<Vec<Outgoing>> {
        let mut body: [u8; PAYLOAD_LEN] = payload.try_into().map_err(|payload: Vec<u8>| {
            TorError::Protocol(format!("relay payload of {} bytes", payload.len()))
        })?;

        let mut accepted: Option<(usize, RelayCell)> = None;
        for (idx, hop) in self.hops.iter_mut().enumerate() {
            hop.crypto.decrypt(&mut body);
            if let Some(cell) = RelayCell::try_parse(&body) {
                if hop.crypto.check_inbound(&body) {
                    accepted = Some((idx, cell));
                    break;
                }
            }
        }

        let Some((hop_index, cell)) = accepted else {
            log::warn!(
                "circuit {:#x}: relay cell not recognized at any hop, dropped",
                self.id
            );
            return Ok(Vec::new());
        };

        self.dispatch(hop_index, cell)
    }

    fn dispatch(&mut self, hop_index: usize, cell: RelayCell) -> Result<Vec<Outgoing>> {
        let Some(command) = cell.relay_command() else {
            log::warn!(
                "circuit {:#x}: unknown relay command {}, dropped",
                self.id,
                cell.command
            );
            return Ok(Vec::new());
        };

        match command {
            RelayCommand::Extended2 => {
                if self.state != CircuitState::PendingExtend {
                    return Err(TorError::Protocol(format!(
                        "EXTENDED2 in state {:?}",
                        self.state
                    )));
                }
                if hop_index != self.hops.len() - 1 || cell.stream_id != 0 {
                    return Err(TorError::Protocol(
                        "EXTENDED2 from the wrong hop or stream".into(),
                    ));
                }
                let (y, auth) = parse_created2(&cell.data)?;
                self.complete_hop(&y, &auth)
            }

            RelayCommand::Sendme if cell.stream_id == 0 => {
                self.flow.on_sendme_received();
                self.pump()
            }

            RelayCommand::Truncated => Err(TorError::CircuitFailure {
                hop_index,
                reason: "circuit truncated by relay".into(),
            }),

            RelayCommand::Drop => Ok(Vec::new()),

            RelayCommand::Connected
            | RelayCommand::Data
            | RelayCommand::End
            | RelayCommand::Sendme => self.dispatch_stream(command, cell),

            other => {
                log::warn!(
                    "circuit {:#x}: unexpected relay {:?}, dropped",
                    self.id,
                    other
                );
                Ok(Vec::new())
            }
        }
    }

    fn dispatch_stream(&mut self, command: RelayCommand, cell: RelayCell) -> Result<Vec<Outgoing>> {
        let stream_id = cell.stream_id;
        if !self.streams.contains_key(&stream_id) {
            log::warn!(
                "circuit {:#x}: relay {:?} for unknown stream {}, dropped",
                self.id,
                command,
                stream_id
            );
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        match command {
            RelayCommand::Connected => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_connected()?;
                }
            }

            RelayCommand::Data => {
                // One indivisible step: both window counters move before
                // the bytes are surfaced.
                let circuit_sendme_due = self.flow.on_receive_data();
                let stream_sendme_due = match self.streams.get_mut(&stream_id) {
                    Some(stream) => stream.on_data(cell.data)?,
                    None => false,
                };
                if circuit_sendme_due {
                    self.outbox.push_back(PendingRelay {
                        relay: RelayCell::new(RelayCommand::Sendme, 0, Vec::new()),
                        early: false,
                        needs_credit: false,
                        stream: None,
                        done: None,
                    });
                }
                if stream_sendme_due {
                    self.outbox.push_back(PendingRelay {
                        relay: RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()),
                        early: false,
                        needs_credit: false,
                        stream: None,
                        done: None,
                    });
                }
                out = self.pump()?;
            }

            RelayCommand::End => {
                let reason = cell
                    .data
                    .first()
                    .copied()
                    .map(EndReason::from_u8)
                    .unwrap_or(EndReason::Misc);
                if let Some(mut stream) = self.streams.remove(&stream_id) {
                    stream.on_end(reason);
                }
            }

            RelayCommand::Sendme => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_sendme_received();
                }
            }

            _ => {
                return Err(TorError::Internal(format!(
                    "relay {:?} dispatched as stream command",
                    command
                )))
            }
        }

        Ok(out)
    }

    // ===== Outbound =====

    /// Allocate a stream id and send RELAY_BEGIN / RELAY_BEGIN_DIR.
    pub fn open_stream(&mut self, target: StreamTarget, done: OpenDone) -> Result<Vec<Outgoing>> {
        if self.state != CircuitState::Open {
            let _ = done.send(Err(TorError::CircuitClosed));
            return Ok(Vec::new());
        }

        let stream_id = match self.allocate_stream_id() {
            Ok(id) => id,
            Err(e) => {
                let _ = done.send(Err(e));
                return Ok(Vec::new());
            }
        };

        let relay = match &target {
            StreamTarget::Directory => RelayCell::new(RelayCommand::BeginDir, stream_id, Vec::new()),
            StreamTarget::Tcp {
                host,
                port,
                ipv4_preferred,
            } => {
                let mut data = format!("{}:{}\0", host, port).into_bytes();
                let flags: u32 = if *ipv4_preferred { 1 } else { 0 };
                data.extend_from_slice(&flags.to_be_bytes());
                RelayCell::new(RelayCommand::Begin, stream_id, data)
            }
        };

        log::info!(
            "circuit {:#x}: opening stream {} ({:?})",
            self.id,
            stream_id,
            target
        );
        self.streams
            .insert(stream_id, StreamState::new(stream_id, done));

        self.outbox.push_back(PendingRelay {
            relay,
            early: false,
            needs_credit: false,
            stream: None,
            done: None,
        });
        self.pump()
    }

    /// Stream ids are unique for the life of the circuit; the counter
    /// never wraps back over ids that have been handed out.
    fn allocate_stream_id(&mut self) -> Result<u16> {
        if self.stream_ids_exhausted {
            return Err(TorError::StreamIdExhausted);
        }
        let id = self.next_stream_id;
        match self.next_stream_id.checked_add(1) {
            Some(next) => self.next_stream_id = next,
            None => self.stream_ids_exhausted = true,
        }
        Ok(id)
    }

    /// Chunk application bytes into DATA cells on `stream_id`.
    pub fn write_stream(
        &mut self,
        stream_id: u16,
        data: Vec<u8>,
        done: WriteDone,
    ) -> Result<Vec<Outgoing>> {
        let Some(stream) = self.streams.get(&stream_id) else {
            let _ = done.send(Err(TorError::CircuitClosed));
            return Ok(Vec::new());
        };
        if !stream.writable() {
            let _ = done.send(Err(TorError::StreamClosed(EndReason::Done)));
            return Ok(Vec::new());
        }

        if data.is_empty() {
            let _ = done.send(Ok(()));
            return Ok(Vec::new());
        }

        let chunks: Vec<&[u8]> = data.chunks(crate::protocol::cell::RELAY_DATA_MAX).collect();
        let last = chunks.len() - 1;
        let mut done = Some(done);
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.outbox.push_back(PendingRelay {
                relay: RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()),
                early: false,
                needs_credit: true,
                stream: Some(stream_id),
                done: if i == last { done.take() } else { None },
            });
        }
        self.pump()
    }

    /// Send RELAY_END and half-close the stream.
    pub fn close_stream(&mut self, stream_id: u16) -> Result<Vec<Outgoing>> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(Vec::new());
        };
        if !stream.writable() {
            return Ok(Vec::new());
        }
        stream.half_close();

        self.outbox.push_back(PendingRelay {
            relay: RelayCell::new(RelayCommand::End, stream_id, vec![EndReason::DONE]),
            early: false,
            needs_credit: false,
            stream: None,
            done: None,
        });
        self.pump()
    }

    /// Drain the ordered outbox while credit allows, sealing each cell
    /// in transmit order.
    fn pump(&mut self) -> Result<Vec<Outgoing>> {
        let mut out = Vec::new();
        loop {
            let blocked = match self.outbox.front() {
                Some(front) => front.needs_credit && !self.flow.can_send(),
                None => break,
            };
            if blocked {
                log::debug!(
                    "circuit {:#x}: outbound credit exhausted, {} cells queued",
                    self.id,
                    self.outbox.len()
                );
                break;
            }
            let Some(pending) = self.outbox.pop_front() else {
                break;
            };

            if pending.needs_credit {
                self.flow.on_send();
                if let Some(stream) = pending.stream.and_then(|id| self.streams.get_mut(&id)) {
                    stream.on_send();
                }
            }

            let cell = self.seal(pending.relay, pending.early)?;
            out.push(Outgoing {
                cell,
                done: pending.done,
            });
        }
        Ok(out)
    }

    /// Digest, patch, and onion-encrypt one relay cell for the last hop.
    fn seal(&mut self, relay: RelayCell, early: bool) -> Result<Cell> {
        if self.hops.is_empty() {
            return Err(TorError::Internal(
                "cannot send relay cells on a zero-hop circuit".into(),
            ));
        }
        if early {
            if self.relay_early_used >= MAX_RELAY_EARLY {
                return Err(TorError::Internal("RELAY_EARLY budget exhausted".into()));
            }
            self.relay_early_used += 1;
        }

        let k = self.hops.len() - 1;
        let mut body = relay.encode()?;
        let digest = self.hops[k].crypto.digest_outbound(&body);
        body[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].copy_from_slice(&digest);
        for hop in self.hops[..=k].iter_mut().rev() {
            hop.crypto.encrypt(&mut body);
        }

        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        Ok(Cell::new(self.id, command, body.to_vec()))
    }

    // ===== Teardown =====

    /// Tear the circuit down, surfacing `reason` to every waiter. Used
    /// for inbound DESTROY, local errors, and link loss alike.
    pub fn destroy(&mut self, reason: DestroyReason) {
        if self.state == CircuitState::Destroyed {
            return;
        }
        log::info!("circuit {:#x}: destroyed ({})", self.id, reason);
        self.state = CircuitState::Destroyed;

        if let Some(done) = self.build_done.take() {
            let _ = done.send(Err(TorError::CircuitDestroyed(reason)));
        }
        for pending in self.outbox.drain(..) {
            if let Some(done) = pending.done {
                let _ = done.send(Err(TorError::CircuitDestroyed(reason)));
            }
        }
        for (_, mut stream) in self.streams.drain() {
            stream.on_circuit_closed(reason);
        }
        self.hops.clear();
        self.inflight_ntor = None;
        self.pending_hops.clear();
    }

    /// Local cancellation: RELAY_END every open stream before dropping
    /// state. Returns the cells to flush before the link goes away.
    pub fn shutdown(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if self.state == CircuitState::Open {
            let open_ids: Vec<u16> = self
                .streams
                .iter()
                .filter(|(_, s)| s.writable())
                .map(|(id, _)| *id)
                .collect();
            for id in open_ids {
                if let Ok(mut cells) = self.close_stream(id) {
                    out.append(&mut cells);
                }
            }
        }
        self.destroy(DestroyReason::Finished);
        out
    }

    /// The descriptors of the established hops, for diagnostics.
    pub fn hop_names(&self) -> Vec<&str> {
        self.hops
            .iter()
            .map(|h| h.descriptor.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEvent;
    use crate::testing::{secret, RelayChain};
    use x25519_dalek::PublicKey;

    const CIRC_ID: u32 = 0x8000_1234;

    /// Build a circuit against a simulated chain, answering every
    /// handshake, and return both plus the build result receiver.
    fn built_circuit(hops: usize) -> (Circuit, RelayChain) {
        let mut chain = RelayChain::new(hops);
        let (mut circuit, create2) = Circuit::start(CIRC_ID, chain.descriptors()).unwrap();
        let (done, mut wait) = oneshot::channel();
        circuit.set_build_done(done);

        let created2 = chain.answer_create2(&create2);
        let mut replies = circuit.on_cell(created2).unwrap();
        for _ in 1..hops {
            assert_eq!(replies.len(), 1, "expected exactly one EXTEND2");
            let extend = replies.remove(0).cell;
            let extended = chain.answer_extend2(&extend);
            replies = circuit.on_cell(extended).unwrap();
        }
        assert!(replies.is_empty());
        assert_eq!(wait.try_recv().unwrap().unwrap(), CIRC_ID);
        assert!(circuit.is_open());
        (circuit, chain)
    }

    /// Open a stream on a built circuit, answering the BEGIN from the
    /// last hop.
    fn open_stream(
        circuit: &mut Circuit,
        chain: &mut RelayChain,
    ) -> (u16, mpsc::Receiver<StreamEvent>) {
        let (done, mut wait) = oneshot::channel();
        let out = circuit
            .open_stream(StreamTarget::Directory, done)
            .unwrap();
        assert_eq!(out.len(), 1);
        let (hop, begin) = chain.accept_forward(&out[0].cell);
        assert_eq!(hop, chain.hops.len() - 1);
        assert_eq!(begin.relay_command(), Some(RelayCommand::BeginDir));

        let connected = chain.make_backward(
            hop,
            CIRC_ID,
            RelayCell::new(RelayCommand::Connected, begin.stream_id, Vec::new()),
        );
        assert!(circuit.on_cell(connected).unwrap().is_empty());
        wait.try_recv().unwrap().unwrap()
    }

    #[test]
    fn create2_bytes_with_fixed_ephemeral() {
        let chain = RelayChain::new(1);
        let x = secret(0x70);
        let expected_public = PublicKey::from(&x);

        let (_, create2) =
            Circuit::start_with_secrets(CIRC_ID, chain.descriptors(), vec![x]).unwrap();

        assert_eq!(create2.command, CellCommand::Create2);
        assert_eq!(create2.circuit_id & 0x8000_0000, 0x8000_0000);
        let payload = &create2.payload;
        assert_eq!(&payload[..2], &[0x00, 0x02]);
        assert_eq!(&payload[2..4], &[0x00, 0x54]);
        let node_id = chain.hops[0].descriptor.identity_digest().unwrap();
        let onion = chain.hops[0].descriptor.onion_key().unwrap();
        assert_eq!(&payload[4..24], &node_id);
        assert_eq!(&payload[24..56], onion.as_bytes());
        assert_eq!(&payload[56..88], expected_public.as_bytes());
    }

    #[test]
    fn single_hop_build_derives_working_keys() {
        let (mut circuit, mut chain) = built_circuit(1);
        // A full round trip proves Df/Db/Kf/Kb all agree with the relay.
        let (stream_id, mut rx) = open_stream(&mut circuit, &mut chain);

        let data = chain.make_backward(
            0,
            CIRC_ID,
            RelayCell::new(RelayCommand::Data, stream_id, b"hello".to_vec()),
        );
        circuit.on_cell(data).unwrap();
        match rx.try_recv().unwrap() {
            StreamEvent::Data(d) => assert_eq!(d, b"hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn three_hop_build_uses_relay_early_per_extend() {
        let mut chain = RelayChain::new(3);
        let (mut circuit, create2) = Circuit::start(CIRC_ID, chain.descriptors()).unwrap();

        let created2 = chain.answer_create2(&create2);
        let first = circuit.on_cell(created2).unwrap();
        assert_eq!(first.len(), 1);
        // answer_extend2 asserts RELAY_EARLY and that the cell peels at
        // the guard only (one encryption layer).
        let extended = chain.answer_extend2(&first[0].cell);

        let second = circuit.on_cell(extended).unwrap();
        assert_eq!(second.len(), 1);
        // Second extend peels at the middle (two layers).
        assert_ne!(first[0].cell.payload, second[0].cell.payload);
        let extended = chain.answer_extend2(&second[0].cell);
        assert!(circuit.on_cell(extended).unwrap().is_empty());

        assert!(circuit.is_open());
        assert_eq!(circuit.hop_names(), vec!["sim0", "sim1", "sim2"]);
    }

    #[test]
    fn relay_early_budget_is_eight() {
        // Nine extends would need nine RELAY_EARLY cells; the ninth must
        // fail rather than go out.
        let mut chain = RelayChain::new(10);
        let (mut circuit, create2) = Circuit::start(CIRC_ID, chain.descriptors()).unwrap();

        // The CREATED2 reply queues extend #1; each EXTENDED2 at round k
        // queues extend #(k + 2). Extend #9 would be the ninth
        // RELAY_EARLY, so round 7 must fail.
        let mut replies = circuit.on_cell(chain.answer_create2(&create2)).unwrap();
        for round in 0..9 {
            let extend = replies.remove(0).cell;
            let extended = chain.answer_extend2(&extend);
            match circuit.on_cell(extended) {
                Ok(next) => {
                    assert!(round < 7, "ninth RELAY_EARLY was allowed");
                    replies = next;
                }
                Err(e) => {
                    assert_eq!(round, 7, "budget tripped early: {}", e);
                    return;
                }
            }
        }
        panic!("RELAY_EARLY budget never enforced");
    }

    #[test]
    fn inbound_peels_to_the_originating_hop() {
        let (mut circuit, mut chain) = built_circuit(2);
        let (stream_id, mut rx) = open_stream(&mut circuit, &mut chain);

        // Built as if sent by the middle: sealed at hop 1, layered by
        // hop 0. The guard layer must not recognize it.
        let cell = chain.make_backward(
            1,
            CIRC_ID,
            RelayCell::new(RelayCommand::Data, stream_id, vec![0xEE; 120]),
        );
        circuit.on_cell(cell).unwrap();
        match rx.try_recv().unwrap() {
            StreamEvent::Data(d) => assert_eq!(d, vec![0xEE; 120]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn corrupted_relay_cell_is_dropped_not_fatal() {
        let (mut circuit, mut chain) = built_circuit(2);
        let (stream_id, mut rx) = open_stream(&mut circuit, &mut chain);

        let mut cell = chain.make_backward(
            1,
            CIRC_ID,
            RelayCell::new(RelayCommand::Data, stream_id, vec![1]),
        );
        cell.payload[100] ^= 0xFF;
        assert!(circuit.on_cell(cell).unwrap().is_empty());
        assert!(rx.try_recv().is_err());
        assert!(circuit.is_open());
    }

    #[test]
    fn stream_sendme_emitted_after_fifty_data_cells() {
        let (mut circuit, mut chain) = built_circuit(2);
        let (stream_id, mut rx) = open_stream(&mut circuit, &mut chain);

        for n in 0..50u8 {
            let cell = chain.make_backward(
                1,
                CIRC_ID,
                RelayCell::new(RelayCommand::Data, stream_id, vec![n; 498]),
            );
            let out = circuit.on_cell(cell).unwrap();
            if n < 49 {
                assert!(out.is_empty(), "unexpected cell after {} data cells", n + 1);
            } else {
                assert_eq!(out.len(), 1, "exactly one SENDME after 50 data cells");
                // The harness verifies the SENDME against the mirror of
                // the hop's forward digest at this moment.
                let (hop, sendme) = chain.accept_forward(&out[0].cell);
                assert_eq!(hop, 1);
                assert_eq!(sendme.relay_command(), Some(RelayCommand::Sendme));
                assert_eq!(sendme.stream_id, stream_id);
            }
        }
        for _ in 0..50 {
            assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Data(_)));
        }
    }

    #[test]
    fn circuit_sendme_emitted_after_hundred_data_cells() {
        let (mut circuit, mut chain) = built_circuit(1);
        let (stream_id, _rx) = open_stream(&mut circuit, &mut chain);

        let mut circuit_sendmes = 0;
        for n in 0..100u32 {
            let cell = chain.make_backward(
                0,
                CIRC_ID,
                RelayCell::new(RelayCommand::Data, stream_id, vec![(n % 255) as u8]),
            );
            let out = circuit.on_cell(cell).unwrap();
            for item in out {
                let (_, relay) = chain.accept_forward(&item.cell);
                assert_eq!(relay.relay_command(), Some(RelayCommand::Sendme));
                if relay.stream_id == 0 {
                    circuit_sendmes += 1;
                    assert_eq!(n, 99, "circuit SENDME before 100 cells");
                }
            }
        }
        assert_eq!(circuit_sendmes, 1);
    }

    #[test]
    fn outbound_data_waits_for_circuit_credit() {
        let (mut circuit, mut chain) = built_circuit(1);
        let (stream_id, _rx) = open_stream(&mut circuit, &mut chain);

        // Burn the full outbound window.
        for _ in 0..1000 {
            let (done, _wait) = oneshot::channel();
            let out = circuit.write_stream(stream_id, vec![0x55], done).unwrap();
            assert_eq!(out.len(), 1);
            chain.accept_forward(&out[0].cell);
        }

        // Credit exhausted: the next write queues instead of sending.
        let (done, mut wait) = oneshot::channel();
        let out = circuit.write_stream(stream_id, vec![0x66], done).unwrap();
        assert!(out.is_empty());
        assert!(wait.try_recv().is_err());

        // A circuit SENDME releases it in order.
        let sendme = chain.make_backward(
            0,
            CIRC_ID,
            RelayCell::new(RelayCommand::Sendme, 0, Vec::new()),
        );
        let out = circuit.on_cell(sendme).unwrap();
        assert_eq!(out.len(), 1);
        let (_, relay) = chain.accept_forward(&out[0].cell);
        assert_eq!(relay.data, vec![0x66]);
    }

    #[test]
    fn writes_are_chunked_at_498() {
        let (mut circuit, mut chain) = built_circuit(1);
        let (stream_id, _rx) = open_stream(&mut circuit, &mut chain);

        let (done, mut wait) = oneshot::channel();
        let out = circuit
            .write_stream(stream_id, vec![9u8; 1000], done)
            .unwrap();
        assert_eq!(out.len(), 3);
        let sizes: Vec<usize> = out
            .iter()
            .map(|item| chain.accept_forward(&item.cell).1.data.len())
            .collect();
        assert_eq!(sizes, vec![498, 498, 4]);
        // Completion rides on the last chunk.
        assert!(out[2].done.is_some());
        assert!(wait.try_recv().is_err());
    }

    #[test]
    fn stream_ids_are_never_reused() {
        let (mut circuit, mut chain) = built_circuit(1);

        let (first_id, _rx1) = open_stream(&mut circuit, &mut chain);

        // Peer closes the first stream.
        let end = chain.make_backward(
            0,
            CIRC_ID,
            RelayCell::new(RelayCommand::End, first_id, vec![EndReason::DONE]),
        );
        circuit.on_cell(end).unwrap();

        let (second_id, _rx2) = open_stream(&mut circuit, &mut chain);
        assert_ne!(first_id, second_id);
        assert!(second_id > first_id);
    }

    #[test]
    fn destroy_reaches_streams_and_waiters() {
        let (mut circuit, mut chain) = built_circuit(1);
        let (_stream_id, mut rx) = open_stream(&mut circuit, &mut chain);

        circuit.destroy(DestroyReason::Hibernating);
        assert_eq!(circuit.state(), CircuitState::Destroyed);
        match rx.try_recv().unwrap() {
            StreamEvent::CircuitClosed(DestroyReason::Hibernating) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn extended2_from_wrong_state_is_protocol_error() {
        let (mut circuit, mut chain) = built_circuit(1);

        let bogus = chain.make_backward(
            0,
            CIRC_ID,
            RelayCell::new(RelayCommand::Extended2, 0, vec![0u8; 66]),
        );
        assert!(circuit.on_cell(bogus).is_err());
    }
}
