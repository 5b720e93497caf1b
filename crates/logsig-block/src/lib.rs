//! logsig-block: block signing sessions and replay verification.
//!
//! A [`BlockSession`] owns one log's signature file. Records are folded into
//! the block's Merkle forest as they arrive; closing a block has its root
//! signed by a [`Notarizer`](logsig_core::Notarizer) and appends the block
//! signature record. The carry-over is persisted to the state file after
//! every signed block so that a restarted signer continues the chain.
//!
//! [`Verifier`] replays a log against its signature file and reports every
//! discrepancy it finds.
//!
//! ```no_run
//! use logsig_block::{BlockSession, Verifier};
//! use logsig_core::{Context, KeyedNotary};
//! use std::sync::Arc;
//! # fn main() -> logsig_core::Result<()> {
//! let ctx = Arc::new(Context::builder().block_size_limit(256).build()?);
//! let notary = KeyedNotary::new("local", [7u8; 32]);
//! let mut session = BlockSession::open(ctx, "app.log", notary.clone())?;
//! session.start()?;
//! session.add_record(b"service started\n")?;
//! session.close()?;
//!
//! let report = Verifier::new(notary).verify_files("app.log", "app.log.logsig")?;
//! assert!(report.is_ok());
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

/// Newline-delimited record input.
pub mod input;
/// Block lifecycle and signature-file writer.
pub mod session;
/// Replay verifier.
pub mod verify;

pub use input::{open_log, LineRecords};
pub use session::{BlockSession, SessionState, SigPaths, SIG_SUFFIX, STATE_SUFFIX};
pub use verify::{Verifier, VerifyFailure, VerifyOptions, VerifyReport};
