//! Streams multiplexed over a circuit
//!
//! The circuit owns one `StreamState` per live stream id and drives it
//! from relay cells; callers hold a `TorStream`, which talks to the link
//! reactor through commands and receives inbound events over a bounded
//! per-stream channel.

use crate::circuit::OpenDone;
use crate::error::{Result, TorError};
use crate::link::LinkCmd;
use crate::protocol::cell::{DestroyReason, EndReason};
use crate::protocol::flow_control::StreamFlowControl;
use tokio::sync::{mpsc, oneshot};

/// Per-stream event queue depth. The peer can have at most a full
/// stream window of DATA cells in flight, so a compliant peer never
/// fills this; overrunning it is a flow-control violation.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// What a stream connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// RELAY_BEGIN_DIR to the last hop's directory.
    Directory,
    /// RELAY_BEGIN to host:port through the exit.
    Tcp {
        host: String,
        port: u16,
        ipv4_preferred: bool,
    },
}

/// Inbound events surfaced to the stream's owner.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Vec<u8>),
    End(EndReason),
    CircuitClosed(DestroyReason),
}

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    /// RELAY_BEGIN sent, waiting for RELAY_CONNECTED.
    PendingBegin,
    Open,
    /// We sent RELAY_END; the peer may still deliver.
    HalfClosed,
    Closed,
}

/// The circuit-side state machine for one stream.
pub(crate) struct StreamState {
    id: u16,
    phase: StreamPhase,
    flow: StreamFlowControl,
    events: mpsc::Sender<StreamEvent>,

    /// Handed to the caller once RELAY_CONNECTED arrives.
    events_rx: Option<mpsc::Receiver<StreamEvent>>,
    pending_open: Option<OpenDone>,
}

impl StreamState {
    pub fn new(id: u16, done: OpenDone) -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            id,
            phase: StreamPhase::PendingBegin,
            flow: StreamFlowControl::new(),
            events,
            events_rx: Some(events_rx),
            pending_open: Some(done),
        }
    }

    /// Whether the caller may still send on this stream.
    pub fn writable(&self) -> bool {
        matches!(self.phase, StreamPhase::PendingBegin | StreamPhase::Open)
    }

    pub fn half_close(&mut self) {
        self.phase = StreamPhase::HalfClosed;
    }

    /// RELAY_CONNECTED: hand the event channel to the waiting opener.
    pub fn on_connected(&mut self) -> Result<()> {
        if self.phase != StreamPhase::PendingBegin {
            log::warn!(
                "stream {}: RELAY_CONNECTED in phase {:?}, dropped",
                self.id,
                self.phase
            );
            return Ok(());
        }
        self.phase = StreamPhase::Open;
        log::info!("stream {}: connected", self.id);

        match (self.pending_open.take(), self.events_rx.take()) {
            (Some(done), Some(rx)) => {
                if done.send(Ok((self.id, rx))).is_err() {
                    log::warn!("stream {}: opener went away before connect", self.id);
                }
            }
            _ => {
                return Err(TorError::Internal(format!(
                    "stream {} connected twice",
                    self.id
                )))
            }
        }
        Ok(())
    }

    /// RELAY_DATA: deliver and account. Returns true when a stream-level
    /// SENDME is now owed.
    pub fn on_data(&mut self, data: Vec<u8>) -> Result<bool> {
        match self.phase {
            StreamPhase::Open | StreamPhase::HalfClosed => {}
            phase => {
                log::warn!("stream {}: data in phase {:?}, dropped", self.id, phase);
                return Ok(false);
            }
        }

        match self.events.try_send(StreamEvent::Data(data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(TorError::Protocol(format!(
                    "stream {} overran its flow-control window",
                    self.id
                )));
            }
            // Owner dropped the handle; keep counting windows, drop bytes.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }

        Ok(self.flow.on_receive_data())
    }

    /// RELAY_END from the peer.
    pub fn on_end(&mut self, reason: EndReason) {
        log::info!("stream {}: closed by peer ({})", self.id, reason);
        let was_pending = self.phase == StreamPhase::PendingBegin;
        self.phase = StreamPhase::Closed;

        if was_pending {
            if let Some(done) = self.pending_open.take() {
                let _ = done.send(Err(TorError::StreamClosed(reason)));
            }
        } else {
            let _ = self.events.try_send(StreamEvent::End(reason));
        }
    }

    /// Outbound DATA accounting; credit is tracked, not enforced.
    pub fn on_send(&mut self) {
        self.flow.on_send();
    }

    pub fn on_sendme_received(&mut self) {
        self.flow.on_sendme_received();
    }

    /// The circuit is gone; tell whoever is listening.
    pub fn on_circuit_closed(&mut self, reason: DestroyReason) {
        let was_pending = self.phase == StreamPhase::PendingBegin;
        self.phase = StreamPhase::Closed;

        if was_pending {
            if let Some(done) = self.pending_open.take() {
                let _ = done.send(Err(TorError::CircuitDestroyed(reason)));
            }
        } else {
            let _ = self.events.try_send(StreamEvent::CircuitClosed(reason));
        }
    }
}

/// A live stream, as held by the caller.
///
/// Reads drain the per-stream event queue; writes and close are commands
/// to the link reactor that owns the circuit.
pub struct TorStream {
    circuit_id: u32,
    stream_id: u16,
    cmd: mpsc::Sender<LinkCmd>,
    events: mpsc::Receiver<StreamEvent>,
    ended: bool,
}

impl TorStream {
    pub(crate) fn new(
        circuit_id: u32,
        stream_id: u16,
        cmd: mpsc::Sender<LinkCmd>,
        events: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            circuit_id,
            stream_id,
            cmd,
            events,
            ended: false,
        }
    }

    /// Stream id within its circuit.
    pub fn id(&self) -> u16 {
        self.stream_id
    }

    /// Receive the next chunk of stream data.
    ///
    /// `Ok(None)` is an orderly end of stream; an abnormal close
    /// surfaces the peer's reason.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.ended {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => Ok(Some(data)),
            Some(StreamEvent::End(EndReason::Done)) => {
                self.ended = true;
                Ok(None)
            }
            Some(StreamEvent::End(reason)) => {
                self.ended = true;
                Err(TorError::StreamClosed(reason))
            }
            Some(StreamEvent::CircuitClosed(reason)) => {
                self.ended = true;
                Err(TorError::CircuitDestroyed(reason))
            }
            None => {
                self.ended = true;
                Err(TorError::LinkClosed)
            }
        }
    }

    /// Send bytes; they are chunked into DATA cells by the circuit.
    /// Completion means the cells were put on the wire (or queued no
    /// further than the link's TLS write buffer).
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.cmd
            .send(LinkCmd::StreamWrite {
                circuit_id: self.circuit_id,
                stream_id: self.stream_id,
                data: data.to_vec(),
                done,
            })
            .await
            .map_err(|_| TorError::LinkClosed)?;
        wait.await.map_err(|_| TorError::LinkClosed)?
    }

    /// Send RELAY_END (reason: done) and half-close.
    pub async fn close(&mut self) -> Result<()> {
        self.cmd
            .send(LinkCmd::StreamClose {
                circuit_id: self.circuit_id,
                stream_id: self.stream_id,
            })
            .await
            .map_err(|_| TorError::LinkClosed)?;
        Ok(())
    }
}

impl std::fmt::Debug for TorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorStream")
            .field("circuit_id", &self.circuit_id)
            .field("stream_id", &self.stream_id)
            .field("ended", &self.ended)
            .finish()
    }
}
