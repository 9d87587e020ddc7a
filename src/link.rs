//! Link connection to a relay
//!
//! One TLS connection to one onion router. After the outer TLS handshake
//! the link performs the in-band VERSIONS/CERTS/AUTH_CHALLENGE/NETINFO
//! exchange, then settles into a dispatch loop: inbound bytes are framed
//! into cells and routed to the owning circuit, and commands from
//! handles (open circuit, open stream, write, close) are applied to the
//! circuit table. The loop is a single task and is the only place that
//! touches link, circuit, or stream state, so per-circuit cell handling
//! is naturally serialized.

use crate::circuit::{BuildDone, Circuit, OpenDone, Outgoing, WriteDone};
use crate::error::{Result, TorError};
use crate::protocol::cell::{
    encode_versions, parse_versions, Cell, CellCommand, Decoded, DestroyReason, Netinfo,
};
use crate::protocol::certs::CertsCell;
use crate::relay::RelayDescriptor;
use crate::stream::{StreamTarget, TorStream};
use crate::tls::TlsConnector;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Depth of the command queue feeding the link reactor.
const CMD_QUEUE_DEPTH: usize = 64;

/// Link protocol versions we offer.
const SUPPORTED_VERSIONS: [u16; 2] = [3, 4];

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    Connecting,
    TlsHandshake,
    VersionsSent,
    AwaitCerts,
    AwaitAuthChallenge,
    AwaitNetinfo,
    Ready,
    Closed,
}

/// Wall-clock source, overridable so handshake traces are reproducible.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> u32 + Send + Sync>);

impl Clock {
    /// A clock pinned to a fixed number of epoch seconds.
    pub fn fixed(secs: u32) -> Self {
        Clock(Arc::new(move || secs))
    }

    pub fn now_secs(&self) -> u32 {
        (self.0)()
    }

    pub fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.now_secs() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock(Arc::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0)
        }))
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Clock")
    }
}

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Link protocol versions offered in our VERSIONS cell.
    pub versions: Vec<u16>,

    /// Budget for the whole VERSIONS..NETINFO exchange.
    pub handshake_timeout: Duration,

    pub clock: Clock,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            versions: SUPPORTED_VERSIONS.to_vec(),
            handshake_timeout: Duration::from_secs(10),
            clock: Clock::default(),
        }
    }
}

/// Commands accepted by the link reactor.
pub(crate) enum LinkCmd {
    OpenCircuit {
        path: Vec<RelayDescriptor>,
        done: BuildDone,
    },
    OpenStream {
        circuit_id: u32,
        target: StreamTarget,
        done: OpenDone,
    },
    StreamWrite {
        circuit_id: u32,
        stream_id: u16,
        data: Vec<u8>,
        done: WriteDone,
    },
    StreamClose {
        circuit_id: u32,
        stream_id: u16,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// A handle onto a running link reactor.
pub struct LinkHandle {
    cmd: mpsc::Sender<LinkCmd>,
    ready: Option<oneshot::Receiver<Result<String>>>,
}

impl LinkHandle {
    /// Wait for the link handshake to finish; yields the relay name.
    pub async fn ready(&mut self) -> Result<String> {
        match self.ready.take() {
            Some(rx) => rx.await.map_err(|_| TorError::LinkClosed)?,
            None => Err(TorError::Internal("link readiness already consumed".into())),
        }
    }

    /// True while the reactor is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.cmd.is_closed()
    }

    /// Build a circuit along `path`; resolves when it is open.
    pub async fn open_circuit(&self, path: Vec<RelayDescriptor>) -> Result<u32> {
        let (done, wait) = oneshot::channel();
        self.cmd
            .send(LinkCmd::OpenCircuit { path, done })
            .await
            .map_err(|_| TorError::LinkClosed)?;
        wait.await.map_err(|_| TorError::LinkClosed)?
    }

    /// Open a stream on an established circuit.
    pub async fn open_stream(&self, circuit_id: u32, target: StreamTarget) -> Result<TorStream> {
        let (done, wait) = oneshot::channel();
        self.cmd
            .send(LinkCmd::OpenStream {
                circuit_id,
                target,
                done,
            })
            .await
            .map_err(|_| TorError::LinkClosed)?;
        let (stream_id, events) = wait.await.map_err(|_| TorError::LinkClosed)??;
        Ok(TorStream::new(
            circuit_id,
            stream_id,
            self.cmd.clone(),
            events,
        ))
    }

    /// Close every circuit and the connection itself.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.cmd
            .send(LinkCmd::Shutdown { done })
            .await
            .map_err(|_| TorError::LinkClosed)?;
        let _ = wait.await;
        Ok(())
    }
}

/// Dial a relay: TCP, outer TLS, then the link handshake in a spawned
/// reactor. Returns as soon as the reactor is running; use
/// `LinkHandle::ready` to wait for NETINFO to complete.
pub(crate) async fn connect(
    descriptor: &RelayDescriptor,
    connector: &TlsConnector,
    connect_timeout: Duration,
    config: LinkConfig,
) -> Result<LinkHandle> {
    log::info!(
        "link to {} ({}): {:?}",
        descriptor.name,
        descriptor.addr(),
        LinkState::Connecting
    );
    let tcp = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect(std::net::SocketAddr::V4(descriptor.addr())),
    )
    .await
    .map_err(|_| TorError::Timeout("tcp connect"))??;

    log::debug!("link to {}: {:?}", descriptor.name, LinkState::TlsHandshake);
    let tls = connector.connect(tcp).await?;

    Ok(spawn(tls, descriptor.name.clone(), descriptor.ip, config))
}

/// Start a link reactor over an established transport.
pub fn spawn<T>(transport: T, peer_name: String, peer_ip: Ipv4Addr, config: LinkConfig) -> LinkHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
    let (ready_tx, ready_rx) = oneshot::channel();

    let link = Link {
        transport,
        config,
        peer_name,
        peer_ip,
        state: LinkState::VersionsSent,
        proto_version: 3,
        in_buffer: Vec::new(),
        circuits: HashMap::new(),
        retired: HashSet::new(),
        cmd_rx,
        auth_challenge: None,
        certs: None,
    };
    tokio::spawn(link.run(ready_tx));

    LinkHandle {
        cmd: cmd_tx,
        ready: Some(ready_rx),
    }
}

struct Link<T> {
    transport: T,
    config: LinkConfig,
    peer_name: String,

    /// Address we dialed; NETINFO fallback when the peer lists none.
    peer_ip: Ipv4Addr,

    state: LinkState,
    proto_version: u16,
    in_buffer: Vec<u8>,

    circuits: HashMap<u32, Circuit>,

    /// Circuit ids that must never be reused on this link.
    retired: HashSet<u32>,

    cmd_rx: mpsc::Receiver<LinkCmd>,

    /// Retained, never answered.
    auth_challenge: Option<Vec<u8>>,
    certs: Option<CertsCell>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Link<T> {
    async fn run(mut self, ready: oneshot::Sender<Result<String>>) {
        let deadline = self.config.handshake_timeout;
        match tokio::time::timeout(deadline, self.handshake()).await {
            Ok(Ok(())) => {
                log::info!(
                    "link to {} ready, protocol v{}",
                    self.peer_name,
                    self.proto_version
                );
                log::debug!(
                    "{}: retained {} link certs, auth challenge {}",
                    self.peer_name,
                    self.certs.as_ref().map(|c| c.certs.len()).unwrap_or(0),
                    if self.auth_challenge.is_some() {
                        "present"
                    } else {
                        "absent"
                    }
                );
                let _ = ready.send(Ok(self.peer_name.clone()));
            }
            Ok(Err(e)) => {
                log::error!("link to {}: handshake failed: {}", self.peer_name, e);
                let _ = ready.send(Err(e));
                return;
            }
            Err(_) => {
                let _ = ready.send(Err(TorError::Timeout("link handshake")));
                return;
            }
        }

        // The peer may have pipelined cells right behind its NETINFO.
        if let Err(e) = self.process_inbound().await {
            self.fail_link(&e);
            return;
        }

        let mut scratch = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Every handle is gone; nothing can use us again.
                        self.fail_link(&TorError::LinkClosed);
                        return;
                    };
                    let stop = matches!(cmd, LinkCmd::Shutdown { .. });
                    if let Err(e) = self.handle_cmd(cmd).await {
                        self.fail_link(&e);
                        return;
                    }
                    if stop {
                        return;
                    }
                }
                read = self.transport.read(&mut scratch) => {
                    match read {
                        Ok(0) => {
                            self.fail_link(&TorError::LinkClosed);
                            return;
                        }
                        Ok(n) => {
                            self.in_buffer.extend_from_slice(&scratch[..n]);
                            if let Err(e) = self.process_inbound().await {
                                self.fail_link(&e);
                                return;
                            }
                        }
                        Err(e) => {
                            self.fail_link(&TorError::Io(e));
                            return;
                        }
                    }
                }
            }
        }
    }

    // ===== Initial handshake =====

    async fn handshake(&mut self) -> Result<()> {
        let versions = Cell::new(
            0,
            CellCommand::Versions,
            encode_versions(&self.config.versions),
        );
        self.write_cell(versions).await?;
        self.state = LinkState::VersionsSent;

        let mut scratch = vec![0u8; 16 * 1024];
        while self.state != LinkState::Ready {
            match Cell::try_decode(&self.in_buffer, self.proto_version)? {
                Decoded::NeedMore => {
                    let n = self.transport.read(&mut scratch).await?;
                    if n == 0 {
                        return Err(TorError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed during link handshake",
                        )));
                    }
                    self.in_buffer.extend_from_slice(&scratch[..n]);
                }
                Decoded::Unknown { consumed, command } => {
                    log::warn!("handshake: unknown cell command {}, dropped", command);
                    self.in_buffer.drain(..consumed);
                }
                Decoded::Cell { consumed, cell } => {
                    self.in_buffer.drain(..consumed);
                    if let Some(reply) = self.on_handshake_cell(cell)? {
                        self.write_cell(reply).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drive the handshake state machine with one cell; may produce a
    /// cell to send back.
    fn on_handshake_cell(&mut self, cell: Cell) -> Result<Option<Cell>> {
        if cell.circuit_id != 0 {
            return Err(TorError::Protocol(format!(
                "cell for circuit {:#x} before link is ready",
                cell.circuit_id
            )));
        }
        if cell.command == CellCommand::Padding {
            return Ok(None);
        }

        match (self.state, cell.command) {
            (LinkState::VersionsSent, CellCommand::Versions) => {
                let theirs = parse_versions(&cell.payload)?;
                let best = self
                    .config
                    .versions
                    .iter()
                    .filter(|v| theirs.contains(v))
                    .max();
                match best {
                    Some(&version) => {
                        log::info!("{}: negotiated link protocol v{}", self.peer_name, version);
                        self.proto_version = version;
                        self.state = LinkState::AwaitCerts;
                        Ok(None)
                    }
                    None => Err(TorError::LinkProtocolUnsupported),
                }
            }

            (LinkState::AwaitCerts, CellCommand::Certs) => {
                let certs = CertsCell::parse(&cell.payload, self.config.clock.now_system())?;
                log::info!("{}: got certs ({})", self.peer_name, certs.certs.len());
                self.certs = Some(certs);
                self.state = LinkState::AwaitAuthChallenge;
                Ok(None)
            }

            (LinkState::AwaitAuthChallenge, CellCommand::AuthChallenge) => {
                log::info!("{}: got auth challenge", self.peer_name);
                self.auth_challenge = Some(cell.payload);
                self.state = LinkState::AwaitNetinfo;
                Ok(None)
            }

            (LinkState::AwaitNetinfo, CellCommand::Netinfo) => {
                let netinfo = Netinfo::parse(&cell.payload)?;
                log::info!("{}: got netinfo", self.peer_name);

                let other = netinfo
                    .router_addresses
                    .first()
                    .copied()
                    .unwrap_or(self.peer_ip);
                let ours = netinfo
                    .our_address
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                let payload = Netinfo::encode(self.config.clock.now_secs(), other, ours);

                self.state = LinkState::Ready;
                Ok(Some(Cell::new(0, CellCommand::Netinfo, payload)))
            }

            (state, command) => Err(TorError::Protocol(format!(
                "unexpected {:?} in link state {:?}",
                command, state
            ))),
        }
    }

    // ===== Dispatch loop =====

    /// Frame and route every complete cell in the inbound buffer.
    async fn process_inbound(&mut self) -> Result<()> {
        loop {
            match Cell::try_decode(&self.in_buffer, self.proto_version)? {
                Decoded::NeedMore => return Ok(()),
                Decoded::Unknown { consumed, command } => {
                    log::warn!("{}: unknown cell command {}, dropped", self.peer_name, command);
                    self.in_buffer.drain(..consumed);
                }
                Decoded::Cell { consumed, cell } => {
                    self.in_buffer.drain(..consumed);
                    self.route_cell(cell).await?;
                }
            }
        }
    }

    async fn route_cell(&mut self, cell: Cell) -> Result<()> {
        if cell.circuit_id == 0 {
            match cell.command {
                CellCommand::Padding => {}
                other => {
                    return Err(TorError::Protocol(format!(
                        "link-level {:?} after handshake",
                        other
                    )))
                }
            }
            return Ok(());
        }

        if cell.command == CellCommand::Destroy {
            let reason = DestroyReason::from_u8(cell.payload.first().copied().unwrap_or(0));
            match self.circuits.remove(&cell.circuit_id) {
                Some(mut circuit) => {
                    log::warn!(
                        "{}: circuit {:#x} destroyed by peer: {}",
                        self.peer_name,
                        cell.circuit_id,
                        reason
                    );
                    circuit.destroy(reason);
                    self.retired.insert(cell.circuit_id);
                }
                None => {
                    log::warn!(
                        "{}: DESTROY for unknown circuit {:#x}",
                        self.peer_name,
                        cell.circuit_id
                    );
                }
            }
            return Ok(());
        }

        let circuit_id = cell.circuit_id;
        let outcome = match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => circuit.on_cell(cell),
            None => {
                log::warn!(
                    "{}: cell for unknown circuit {:#x}, dropped",
                    self.peer_name,
                    circuit_id
                );
                return Ok(());
            }
        };

        self.apply_circuit_outcome(circuit_id, outcome).await
    }

    /// Write a circuit's cells, or tear that circuit down if the engine
    /// reported an error. Circuit-level failures never kill the link.
    async fn apply_circuit_outcome(
        &mut self,
        circuit_id: u32,
        outcome: Result<Vec<Outgoing>>,
    ) -> Result<()> {
        match outcome {
            Ok(outgoing) => self.write_outgoing(outgoing).await,
            Err(e) => {
                log::error!(
                    "{}: circuit {:#x} failed: {}",
                    self.peer_name,
                    circuit_id,
                    e
                );
                self.kill_circuit(circuit_id).await
            }
        }
    }

    /// Locally tear down a circuit and tell the guard with DESTROY.
    async fn kill_circuit(&mut self, circuit_id: u32) -> Result<()> {
        if let Some(mut circuit) = self.circuits.remove(&circuit_id) {
            circuit.destroy(DestroyReason::Destroyed);
        }
        self.retired.insert(circuit_id);

        let destroy = Cell::new(circuit_id, CellCommand::Destroy, vec![0]);
        self.write_cell(destroy).await
    }

    // ===== Commands =====

    async fn handle_cmd(&mut self, cmd: LinkCmd) -> Result<()> {
        match cmd {
            LinkCmd::OpenCircuit { path, done } => {
                let circuit_id = self.fresh_circuit_id();
                match Circuit::start(circuit_id, path) {
                    Ok((mut circuit, create2)) => {
                        circuit.set_build_done(done);
                        self.circuits.insert(circuit_id, circuit);
                        self.write_cell(create2).await?;
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
                Ok(())
            }

            LinkCmd::OpenStream {
                circuit_id,
                target,
                done,
            } => match self.circuits.get_mut(&circuit_id) {
                Some(circuit) => {
                    let outcome = circuit.open_stream(target, done);
                    self.apply_circuit_outcome(circuit_id, outcome).await
                }
                None => {
                    let _ = done.send(Err(TorError::CircuitClosed));
                    Ok(())
                }
            },

            LinkCmd::StreamWrite {
                circuit_id,
                stream_id,
                data,
                done,
            } => match self.circuits.get_mut(&circuit_id) {
                Some(circuit) => {
                    let outcome = circuit.write_stream(stream_id, data, done);
                    self.apply_circuit_outcome(circuit_id, outcome).await
                }
                None => {
                    let _ = done.send(Err(TorError::CircuitClosed));
                    Ok(())
                }
            },

            LinkCmd::StreamClose {
                circuit_id,
                stream_id,
            } => match self.circuits.get_mut(&circuit_id) {
                Some(circuit) => {
                    let outcome = circuit.close_stream(stream_id);
                    self.apply_circuit_outcome(circuit_id, outcome).await
                }
                None => Ok(()),
            },

            LinkCmd::Shutdown { done } => {
                log::info!("link to {}: shutting down", self.peer_name);
                let ids: Vec<u32> = self.circuits.keys().copied().collect();
                for id in ids {
                    if let Some(mut circuit) = self.circuits.remove(&id) {
                        let outgoing = circuit.shutdown();
                        // Best-effort flush of the final RELAY_ENDs.
                        let _ = self.write_outgoing(outgoing).await;
                        self.retired.insert(id);
                    }
                }
                let _ = self.transport.shutdown().await;
                self.state = LinkState::Closed;
                let _ = done.send(());
                Ok(())
            }
        }
    }

    /// Client-originated circuit ids always carry the header's top bit;
    /// on v3 links the id must fit the 2-byte header.
    fn fresh_circuit_id(&mut self) -> u32 {
        loop {
            let id = if self.proto_version >= 4 {
                rand::random::<u32>() | 0x8000_0000
            } else {
                (rand::random::<u16>() | 0x8000) as u32
            };
            if !self.circuits.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }

    // ===== Writes =====

    /// The single entry point onto the TLS write buffer.
    async fn write_cell(&mut self, cell: Cell) -> Result<()> {
        let bytes = cell.encode(self.proto_version)?;
        log::trace!(
            "{}: sending {:?} ({} bytes)",
            self.peer_name,
            cell.command,
            bytes.len()
        );
        self.transport.write_all(&bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }

    async fn write_outgoing(&mut self, outgoing: Vec<Outgoing>) -> Result<()> {
        for item in outgoing {
            match self.write_cell(item.cell).await {
                Ok(()) => {
                    if let Some(done) = item.done {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(done) = item.done {
                        let _ = done.send(Err(TorError::LinkClosed));
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// The link is dead: every circuit dies with it.
    fn fail_link(&mut self, error: &TorError) {
        if self.state != LinkState::Closed {
            log::error!("link to {} closed: {}", self.peer_name, error);
        }
        self.state = LinkState::Closed;
        for (_, mut circuit) in self.circuits.drain() {
            circuit.destroy(DestroyReason::ChannelClosed);
        }
    }
}
