//! Minimal Tor client core
//!
//! Establishes an onion-routed circuit to a Tor relay and multiplexes
//! application streams over it: the link-level
//! VERSIONS/CERTS/AUTH_CHALLENGE/NETINFO handshake over TLS, ntor key
//! agreement hop by hop (CREATE2, then RELAY_EXTEND2), layered
//! AES-128-CTR with running SHA-1 digests per hop, and SENDME flow
//! control at circuit and stream granularity.
//!
//! The [`Proxy`] is the public surface: give it relay descriptors for
//! guards, middles, and exits, then open directory or TCP streams. The
//! layers underneath follow the ownership chain `Proxy -> Link ->
//! Circuit -> Stream`; each link runs one reactor task that owns all of
//! its circuits' mutable state.
//!
//! ```no_run
//! # async fn demo(guards: Vec<tor_client_core::RelayDescriptor>) -> tor_client_core::Result<()> {
//! use tor_client_core::{Proxy, ProxyConfig};
//!
//! let proxy = Proxy::new(ProxyConfig::new(guards, Vec::new(), Vec::new()))?;
//! let mut stream = proxy.open_directory_stream().await?;
//! stream.write(b"GET /tor/status-vote/current/consensus HTTP/1.0\r\n\r\n").await?;
//! while let Some(chunk) = stream.read().await? {
//!     // consume chunk
//!     let _ = chunk;
//! }
//! proxy.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Out of scope here: directory fetching and consensus parsing (the
//! caller supplies [`RelayDescriptor`] values), hidden services, and
//! running as a relay.

pub mod error;
pub mod protocol;

mod circuit;
mod link;
mod proxy;
mod relay;
mod stream;
mod tls;

#[cfg(test)]
mod testing;

pub use error::{Result, TorError};
pub use link::{Clock, LinkConfig};
pub use proxy::{Proxy, ProxyConfig, Timeouts};
pub use relay::RelayDescriptor;
pub use stream::{StreamTarget, TorStream};
