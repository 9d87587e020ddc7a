//! Tor protocol building blocks
//!
//! The wire-level pieces the link and circuit engines are built from:
//! cell framing, link certificates, per-hop crypto, the ntor handshake,
//! and SENDME window accounting.

pub mod cell;
pub mod certs;
pub mod crypto;
pub mod flow_control;
pub mod ntor;

pub use cell::{Cell, CellCommand, DestroyReason, EndReason, RelayCell, RelayCommand};
pub use certs::CertsCell;
pub use crypto::{CircuitKeys, HopCrypto};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use ntor::NtorClient;
