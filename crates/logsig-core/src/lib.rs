//! logsig-core: configuration, error taxonomy, file formats and notarizer traits.
//!
//! This crate defines the **stable boundary** used across LOGSIG crates:
//! - the process-wide [`Context`] and its TOML form,
//! - the [`LogSigError`] / [`FailureKind`] taxonomy with stable numeric codes,
//! - the TLV codec for `LOGSIG10` signature files and the `GTSTAT10` state file,
//! - typed record views ([`BlockSig`], [`SigRecord`]) and a pretty-printer,
//! - the [`Notarizer`] / [`NotaryVerifier`] seam plus a keyed reference notarizer.
//!
//! ```no_run
//! use logsig_core::prelude::*;
//! # fn main() -> logsig_core::Result<()> {
//! let ctx = Context::builder().hash_function("SHA2-256").block_size_limit(1024).build()?;
//! assert_eq!(ctx.hash_algorithm().wire_id(), 0x01);
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

/// Validated signing configuration.
pub mod context;
/// Error enum and verification finding kinds.
pub mod error;
/// Notarizer traits and the keyed reference implementation.
pub mod notary;
/// Diagnostic pretty-printer.
pub mod print;
/// Typed signature-file records.
pub mod records;
/// Carry-over state file.
pub mod state;
/// TLV reader/writer and file magics.
pub mod tlv;

pub use context::{Context, ContextBuilder, ContextConfig};
pub use error::{FailureKind, LogSigError, Result};
pub use notary::{KeyedNotary, NotaryError, NotaryVerifier, Notarizer};
pub use records::{BlockSig, SigRecord};
pub use state::StateFile;
pub use tlv::{BlockFrame, BlockParams, Tlv, TlvReader, TlvWriter};

pub use logsig_crypto::{HashAlgorithm, Imprint};

/// Commonly-used items for quick imports.
pub mod prelude {
    pub use crate::{
        BlockSig, Context, FailureKind, HashAlgorithm, Imprint, LogSigError, NotaryVerifier,
        Notarizer, SigRecord, StateFile, TlvReader, TlvWriter,
    };
}
