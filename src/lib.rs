//! # Prism Selection Engine
//!
//! The X selection (clipboard/primary) transfer engine of the Prism
//! Wayland-to-X11 translator: a bidirectional implementation of the ICCCM
//! selection conventions that moves arbitrarily large values between peers
//! using only bounded property traffic, including INCR streaming and
//! batched MULTIPLE conversions.
//!
//! ## Architecture
//!
//! The engine is built from small, single-purpose modules:
//! - `slots`: property-slot pool tagging concurrent outbound conversions
//! - `read`: read-transfer engine (fetching values from a remote owner)
//! - `write`: write-transfer engine (serving values to a remote requestor)
//! - `multi`: MULTIPLE batch coordinator
//! - `queue`: serializer for conflicting inbound requests
//! - `dispatch`: protocol event routing
//! - `engine`: the owning `SelectionEngine` state
//! - `wire`: production transport over x11rb
//! - `config`: TOML-backed tunables
//!
//! Everything runs single-threaded and event-driven: the host feeds
//! protocol events and timer expirations in, and the engine suspends
//! waiting transfers as explicit state, never as blocked threads.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use prism::wire::WireTransport;
//! use prism::{SelectionConfig, SelectionEngine, TimerHost, TimerToken};
//!
//! // Bridge to the host's timer wheel.
//! struct LoopTimers;
//! impl TimerHost for LoopTimers {
//!     fn add_timer(&mut self, _delay_ms: u64, _token: TimerToken) {}
//!     fn remove_timer(&mut self, _token: TimerToken) {}
//! }
//!
//! fn main() -> prism::Result<()> {
//!     let (transport, atoms) = WireTransport::connect(None)?;
//!     let mut engine =
//!         SelectionEngine::new(transport, LoopTimers, atoms, SelectionConfig::default());
//!     loop {
//!         if let Some(event) = engine.transport_mut().wait_for_event()? {
//!             engine.handle_event(event);
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod proto;
pub mod read;
pub mod wire;
pub mod write;

mod dispatch;
mod multi;
mod queue;
mod slots;

// Re-export main types for easy access
pub use config::SelectionConfig;
pub use engine::{
    ReadHandle, SelectionEngine, SelectionSource, SelectionStats, WriteAdmission, WriteHandle,
};
pub use error::SelectionError;
pub use proto::{
    Atom, PropertyChunk, PropertyEdit, PropertyProbe, SelectionAtoms, SelectionEvent, TimerHost,
    TimerToken, Timestamp, Transport, Window, CURRENT_TIME,
};
pub use read::{FinishDisposition, ReadChunk, ReadSink};
pub use write::{DataProducer, Pull, TransferOutcome};

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Prism
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
