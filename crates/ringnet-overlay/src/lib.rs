//! RingNet Overlay
//!
//! Secure peer-to-peer overlay. Each peer opens encrypted, authenticated
//! WebSocket channels to every other member of a trust ring, gossips the
//! membership list so the overlay converges toward a complete graph, and
//! exposes a broadcast/subscribe surface to the embedder.
//!
//! # Architecture
//!
//! - `Overlay`: the service; listener, handshake, broadcast, shutdown
//! - `Session`: one connection's trust state and session ciphers
//! - `PeerTable`: the live set of connections
//! - `DiscoveryQueue` + gossip intake: converges the graph
//! - `OverlayEvent`: the event stream handed to the embedder
//!
//! # Example
//!
//! ```ignore
//! use ringnet_overlay::{Overlay, OverlayConfig, FrameType};
//! use ringnet_crypto::{Identity, IdentityPaths};
//!
//! let identity = Identity::load(&paths)?;
//! let mut overlay = Overlay::new(OverlayConfig::default(), identity);
//! let mut events = overlay.take_events().unwrap();
//! overlay.start().await?;
//! while let Some(event) = events.recv().await {
//!     // ...
//! }
//! ```

#![forbid(unsafe_code)]

pub mod discovery;
pub mod error;
pub mod message;
pub mod overlay;
pub mod session;
pub mod table;
pub mod transport;

pub use discovery::{Candidate, DiscoveryQueue};
pub use error::{OverlayError, OverlayResult};
pub use message::{ConfirmTag, Envelope, FrameType, Header, PeerRecord};
pub use overlay::{
    Delivery, Overlay, OverlayConfig, OverlayEvent, DEFAULT_DISCOVERY_RANGE, DEFAULT_PORT,
};
pub use session::{Phase, Session};
pub use table::PeerTable;
pub use transport::{TlsIdentity, NORMAL_CLOSE};
