//! POP Reconciliation Pipeline
//!
//! Tracks "Proof of Prior" documents found in the remote task tables and
//! drives each one through extraction, matching and write-back.
//!
//! ## Architecture
//!
//! Four stages connected through the local state store:
//! ```text
//! Discovery → Extraction → Matching → Write-Back
//!   pending    extracted    matched     written_back
//!                           unmatched   awaiting_approval
//! ```
//!
//! ## Principles
//! - The local store is the single source of truth for progress.
//! - A stage reads only the state it owns and writes only the next state or `failed`.
//! - Every state change is a compare-and-swap; concurrent workers never double-process.
//! - Remote writes are keyed upserts, so replaying one after a crash is harmless.

pub mod error;
pub mod types;
pub mod traits;
pub mod retry;
pub mod store;
pub mod discovery;
pub mod extraction;
pub mod matching;
pub mod write_back;
pub mod runner;
pub mod background;

pub use error::ReconcileError;
pub use types::*;
pub use traits::*;
pub use retry::RetryPolicy;
pub use store::{SqliteStateStore, TransitionEntry};
pub use runner::Reconciler;
pub use background::{start_background_reconciler, ReconcilerHandle};
