//! Error taxonomy for selection transfers
//!
//! Protocol refusals, transport failures, and timeouts are deliberately
//! distinct variants: refusals are a normal peer answer, transport failures
//! cancel the affected transfer without retry, and timeouts behave like
//! transport failures but stay distinguishable in diagnostics.

use thiserror::Error;

/// Errors surfaced by the selection transfer engine.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The selection owner declined the conversion.
    #[error("conversion refused by the selection owner")]
    Refused,

    /// The underlying connection failed to carry a request.
    #[error("selection transport failure: {0}")]
    Transport(String),

    /// A transfer saw no forward progress within the quiescence window.
    #[error("selection transfer timed out")]
    Timeout,

    /// A peer sent property data that violates the conventions.
    #[error("malformed property data: {0}")]
    Malformed(String),

    /// The handle does not name a live transfer.
    #[error("no transfer with that handle")]
    UnknownTransfer,

    /// The transfer has no bytes ready; wait for the next chunk callback.
    #[error("transfer has no readable bytes pending")]
    NotReadable,
}
