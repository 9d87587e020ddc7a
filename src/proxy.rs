//! Proxy front
//!
//! The crate's public surface. Accepts stream requests, creating a guard
//! link and a circuit on demand; requests queue FIFO behind whichever
//! one is first to need the shared handshake. Transient guard failures
//! rotate to the next guard silently; protocol failures put the guard on
//! a back-off window before it is tried again.

use crate::error::{Result, TorError};
use crate::link::{self, LinkConfig, LinkHandle};
use crate::relay::RelayDescriptor;
use crate::stream::{StreamTarget, TorStream};
use crate::tls::TlsConnector;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How long a guard sits out after a protocol failure.
const GUARD_BACKOFF: Duration = Duration::from_secs(300);

/// Per-step timeouts for everything the proxy builds.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// TCP connect to the guard.
    pub connect: Duration,

    /// VERSIONS..NETINFO link handshake.
    pub link_handshake: Duration,

    /// Full circuit build (CREATE2 + every EXTEND2).
    pub circuit_build: Duration,

    /// RELAY_BEGIN to RELAY_CONNECTED.
    pub stream_begin: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            link_handshake: Duration::from_secs(10),
            circuit_build: Duration::from_secs(60),
            stream_begin: Duration::from_secs(30),
        }
    }
}

/// Relay pools and timeouts supplied by the directory collaborator.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Candidate first hops, in preference order.
    pub guards: Vec<RelayDescriptor>,

    /// Candidate middle relays. May be empty for short circuits.
    pub middles: Vec<RelayDescriptor>,

    /// Candidate exits. May be empty for directory-only use.
    pub exits: Vec<RelayDescriptor>,

    pub timeouts: Timeouts,
}

impl ProxyConfig {
    pub fn new(
        guards: Vec<RelayDescriptor>,
        middles: Vec<RelayDescriptor>,
        exits: Vec<RelayDescriptor>,
    ) -> Self {
        Self {
            guards,
            middles,
            exits,
            timeouts: Timeouts::default(),
        }
    }
}

struct ProxyState {
    link: Option<LinkHandle>,
    circuit: Option<u32>,

    /// Guards in back-off, by identity, until the stored instant.
    backoff: HashMap<String, Instant>,
}

/// The host-facing entry point.
pub struct Proxy {
    config: ProxyConfig,
    connector: TlsConnector,

    /// Serializes link/circuit establishment; the lock queue gives the
    /// FIFO drain order for requests waiting on one handshake.
    state: Mutex<ProxyState>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.guards.is_empty() {
            return Err(TorError::InvalidDescriptor("no guards configured".into()));
        }
        Ok(Self {
            config,
            connector: TlsConnector::new()?,
            state: Mutex::new(ProxyState {
                link: None,
                circuit: None,
                backoff: HashMap::new(),
            }),
        })
    }

    /// Open a directory stream on the shared circuit.
    pub async fn open_directory_stream(&self) -> Result<TorStream> {
        self.open(StreamTarget::Directory).await
    }

    /// Open a TCP stream through the exit to `host:port`.
    pub async fn open_tcp_stream(&self, host: &str, port: u16) -> Result<TorStream> {
        validate_host(host, port)?;
        self.open(StreamTarget::Tcp {
            host: host.to_string(),
            port,
            ipv4_preferred: false,
        })
        .await
    }

    /// Tear down the circuit and the guard link.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.circuit = None;
        if let Some(link) = state.link.take() {
            link.shutdown().await?;
        }
        Ok(())
    }

    async fn open(&self, target: StreamTarget) -> Result<TorStream> {
        // One retry: the first attempt may discover that the cached
        // circuit died since we last used it.
        match self.try_open(target.clone()).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_transient() || matches!(e, TorError::CircuitClosed | TorError::CircuitDestroyed(_) | TorError::LinkClosed) => {
                log::warn!("stream open failed ({}), rebuilding", e);
                self.try_open(target).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_open(&self, target: StreamTarget) -> Result<TorStream> {
        let mut state = self.state.lock().await;
        self.ensure_circuit(&mut state).await?;

        let link = state
            .link
            .as_ref()
            .ok_or(TorError::LinkClosed)?;
        let circuit_id = state.circuit.ok_or(TorError::CircuitClosed)?;

        let opened = tokio::time::timeout(
            self.config.timeouts.stream_begin,
            link.open_stream(circuit_id, target),
        )
        .await
        .map_err(|_| TorError::Timeout("stream begin"))?;

        match opened {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // A dead circuit is rebuilt on the caller's retry.
                if matches!(
                    e,
                    TorError::CircuitClosed | TorError::CircuitDestroyed(_) | TorError::LinkClosed
                ) {
                    state.circuit = None;
                }
                Err(e)
            }
        }
    }

    /// Make sure a ready link and an open circuit exist.
    async fn ensure_circuit(&self, state: &mut ProxyState) -> Result<()> {
        if let Some(link) = &state.link {
            if !link.is_alive() {
                state.link = None;
                state.circuit = None;
            }
        }

        if state.link.is_none() {
            state.circuit = None;
            state.link = Some(self.connect_any_guard(state).await?);
        }

        if state.circuit.is_none() {
            let link = state
                .link
                .as_ref()
                .ok_or(TorError::LinkClosed)?;
            let path = self.select_path()?;
            log::info!(
                "building circuit: {}",
                path.iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            let circuit_id = match tokio::time::timeout(
                self.config.timeouts.circuit_build,
                link.open_circuit(path),
            )
            .await
            {
                Ok(built) => built?,
                Err(_) => {
                    // Cancel the half-built circuit with the link; the
                    // next request starts from a fresh guard connection.
                    if let Some(link) = state.link.take() {
                        let _ = link.shutdown().await;
                    }
                    return Err(TorError::Timeout("circuit build"));
                }
            };
            state.circuit = Some(circuit_id);
        }

        Ok(())
    }

    /// Dial guards in order until one completes its link handshake.
    async fn connect_any_guard(&self, state: &mut ProxyState) -> Result<LinkHandle> {
        let now = Instant::now();
        state.backoff.retain(|_, until| *until > now);

        let mut last_error = TorError::Internal("no guard available".into());
        for guard in &self.config.guards {
            if state.backoff.contains_key(&guard.identity) {
                log::debug!("guard {} in back-off, skipped", guard.name);
                continue;
            }

            let config = LinkConfig {
                handshake_timeout: self.config.timeouts.link_handshake,
                ..LinkConfig::default()
            };
            let attempt = async {
                let mut handle = link::connect(
                    guard,
                    &self.connector,
                    self.config.timeouts.connect,
                    config,
                )
                .await?;
                handle.ready().await?;
                Ok::<LinkHandle, TorError>(handle)
            };

            match attempt.await {
                Ok(handle) => {
                    log::info!("guard {} ready", guard.name);
                    return Ok(handle);
                }
                Err(e) => {
                    if e.kills_link() && !e.is_transient() {
                        log::warn!(
                            "guard {} protocol failure ({}), backing off",
                            guard.name,
                            e
                        );
                        state
                            .backoff
                            .insert(guard.identity.clone(), now + GUARD_BACKOFF);
                    } else {
                        log::warn!("guard {} failed ({}), trying next", guard.name, e);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Guard, then a middle and an exit with pairwise-distinct
    /// identities, as far as the pools allow.
    fn select_path(&self) -> Result<Vec<RelayDescriptor>> {
        let guard = self
            .config
            .guards
            .first()
            .ok_or_else(|| TorError::InvalidDescriptor("no guards configured".into()))?;

        let mut path = vec![guard.clone()];
        if let Some(middle) = self
            .config
            .middles
            .iter()
            .find(|r| r.identity != guard.identity)
        {
            path.push(middle.clone());
        }
        if let Some(exit) = self
            .config
            .exits
            .iter()
            .find(|r| path.iter().all(|p| p.identity != r.identity))
        {
            path.push(exit.clone());
        }
        Ok(path)
    }
}

/// RELAY_BEGIN addresses are "host:port\0"; reject anything that cannot
/// be framed that way.
fn validate_host(host: &str, port: u16) -> Result<()> {
    if host.is_empty() {
        return Err(TorError::InvalidHost("empty host".into()));
    }
    if host.len() > 255 {
        return Err(TorError::InvalidHost("host name too long".into()));
    }
    if host.contains('\0') || host.contains(':') {
        return Err(TorError::InvalidHost(format!(
            "host contains forbidden characters: {:?}",
            host
        )));
    }
    if port == 0 {
        return Err(TorError::InvalidHost("port 0".into()));
    }
    Ok(())
}
