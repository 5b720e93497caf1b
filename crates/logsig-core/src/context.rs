//! Process-wide signing configuration.
//!
//! A [`Context`] is immutable once built and is shared read-only between
//! sessions (wrap it in an `Arc`). It can be assembled programmatically with
//! [`ContextBuilder`] or loaded from a TOML document:
//!
//! ```toml
//! hash_algorithm = "SHA2-256"
//! keep_record_hashes = true
//! keep_tree_hashes = false
//! block_size_limit = 1024
//! max_record_len = 65536
//! timestamper = "local"
//! sync_on_close = false
//! ```

use crate::error::{LogSigError, Result};
use logsig_crypto::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default upper bound for a single record in bytes.
pub const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024;

/// Default notarizer identity.
pub const DEFAULT_TIMESTAMPER: &str = "local";

/// Validated, immutable signing configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    hash_algorithm: HashAlgorithm,
    keep_record_hashes: bool,
    keep_tree_hashes: bool,
    block_size_limit: u64,
    max_record_len: usize,
    timestamper: String,
    sync_on_close: bool,
}

impl Context {
    /// Start a builder with default settings.
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        ContextConfig::from_toml_str(s)?.into_builder().build()
    }

    /// Load and validate a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        ContextConfig::load(path)?.into_builder().build()
    }

    /// Hash algorithm used for every digest in a block.
    #[must_use]
    pub const fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Whether each record hash is written to the signature file.
    #[must_use]
    pub const fn keep_record_hashes(&self) -> bool {
        self.keep_record_hashes
    }

    /// Whether leaf and interior node hashes are written to the signature file.
    #[must_use]
    pub const fn keep_tree_hashes(&self) -> bool {
        self.keep_tree_hashes
    }

    /// Records per block before the session rolls over to a new block.
    #[must_use]
    pub const fn block_size_limit(&self) -> u64 {
        self.block_size_limit
    }

    /// Largest record accepted by `add_record`.
    #[must_use]
    pub const fn max_record_len(&self) -> usize {
        self.max_record_len
    }

    /// Identity of the notarization authority.
    #[must_use]
    pub fn timestamper(&self) -> &str {
        &self.timestamper
    }

    /// Whether the signature file is fsync'ed after each block signature.
    #[must_use]
    pub const fn sync_on_close(&self) -> bool {
        self.sync_on_close
    }

    /// Serializable view of this context (round-trips through [`Context::from_toml_str`]).
    #[must_use]
    pub fn to_config(&self) -> ContextConfig {
        ContextConfig {
            hash_algorithm: self.hash_algorithm.name().to_owned(),
            keep_record_hashes: self.keep_record_hashes,
            keep_tree_hashes: self.keep_tree_hashes,
            block_size_limit: (self.block_size_limit != u64::MAX)
                .then_some(self.block_size_limit),
            max_record_len: self.max_record_len,
            timestamper: self.timestamper.clone(),
            sync_on_close: self.sync_on_close,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::default(),
            keep_record_hashes: true,
            keep_tree_hashes: false,
            block_size_limit: u64::MAX,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            timestamper: DEFAULT_TIMESTAMPER.to_owned(),
            sync_on_close: false,
        }
    }
}

/// Builder for [`Context`]. Validation happens in [`build`](Self::build).
#[derive(Clone, Debug, Default)]
pub struct ContextBuilder {
    hash_name: Option<String>,
    hash_algorithm: Option<HashAlgorithm>,
    keep_record_hashes: Option<bool>,
    keep_tree_hashes: Option<bool>,
    block_size_limit: Option<u64>,
    max_record_len: Option<usize>,
    timestamper: Option<String>,
    sync_on_close: Option<bool>,
}

impl ContextBuilder {
    /// Select the hash algorithm by name (e.g. `"SHA2-256"`, `"sha-512"`).
    #[must_use]
    pub fn hash_function(mut self, name: impl Into<String>) -> Self {
        self.hash_name = Some(name.into());
        self.hash_algorithm = None;
        self
    }

    /// Select the hash algorithm directly.
    #[must_use]
    pub fn hash_algorithm(mut self, alg: HashAlgorithm) -> Self {
        self.hash_algorithm = Some(alg);
        self.hash_name = None;
        self
    }

    /// Emit one record-hash TLV per record.
    #[must_use]
    pub fn keep_record_hashes(mut self, on: bool) -> Self {
        self.keep_record_hashes = Some(on);
        self
    }

    /// Emit leaf and interior node hashes.
    #[must_use]
    pub fn keep_tree_hashes(mut self, on: bool) -> Self {
        self.keep_tree_hashes = Some(on);
        self
    }

    /// Records per block; must be non-zero.
    #[must_use]
    pub fn block_size_limit(mut self, limit: u64) -> Self {
        self.block_size_limit = Some(limit);
        self
    }

    /// Largest accepted record; must be non-zero.
    #[must_use]
    pub fn max_record_len(mut self, len: usize) -> Self {
        self.max_record_len = Some(len);
        self
    }

    /// Notarizer identity string.
    #[must_use]
    pub fn timestamper(mut self, identity: impl Into<String>) -> Self {
        self.timestamper = Some(identity.into());
        self
    }

    /// fsync the signature file after every block signature.
    #[must_use]
    pub fn sync_on_close(mut self, on: bool) -> Self {
        self.sync_on_close = Some(on);
        self
    }

    /// Validate and produce the immutable [`Context`].
    ///
    /// # Errors
    /// [`LogSigError::Config`] for an unknown algorithm name, a zero block
    /// size limit, a zero record length limit or an empty timestamper id.
    pub fn build(self) -> Result<Context> {
        let defaults = Context::default();

        let hash_algorithm = match (self.hash_algorithm, self.hash_name) {
            (Some(alg), _) => alg,
            (None, Some(name)) => name
                .parse::<HashAlgorithm>()
                .map_err(|e| LogSigError::Config(e.to_string()))?,
            (None, None) => defaults.hash_algorithm,
        };

        let block_size_limit = self.block_size_limit.unwrap_or(defaults.block_size_limit);
        if block_size_limit == 0 {
            return Err(LogSigError::Config(
                "block_size_limit must be at least 1".into(),
            ));
        }

        let max_record_len = self.max_record_len.unwrap_or(defaults.max_record_len);
        if max_record_len == 0 {
            return Err(LogSigError::Config("max_record_len must be at least 1".into()));
        }

        let timestamper = self.timestamper.unwrap_or(defaults.timestamper);
        if timestamper.trim().is_empty() {
            return Err(LogSigError::Config("timestamper must not be empty".into()));
        }

        Ok(Context {
            hash_algorithm,
            keep_record_hashes: self
                .keep_record_hashes
                .unwrap_or(defaults.keep_record_hashes),
            keep_tree_hashes: self.keep_tree_hashes.unwrap_or(defaults.keep_tree_hashes),
            block_size_limit,
            max_record_len,
            timestamper,
            sync_on_close: self.sync_on_close.unwrap_or(defaults.sync_on_close),
        })
    }
}

/// On-disk (TOML) form of a [`Context`]. Missing keys take the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Algorithm name, see [`HashAlgorithm`]'s `FromStr`.
    pub hash_algorithm: String,
    /// See [`Context::keep_record_hashes`].
    pub keep_record_hashes: bool,
    /// See [`Context::keep_tree_hashes`].
    pub keep_tree_hashes: bool,
    /// Absent means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size_limit: Option<u64>,
    /// See [`Context::max_record_len`].
    pub max_record_len: usize,
    /// See [`Context::timestamper`].
    pub timestamper: String,
    /// See [`Context::sync_on_close`].
    pub sync_on_close: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Context::default().to_config()
    }
}

impl ContextConfig {
    /// Parse a TOML document without validating values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| LogSigError::Config(e.to_string()))
    }

    /// Read a TOML configuration file without validating values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| LogSigError::Config(format!("{}: {e}", path.display())))
    }

    /// Feed every field into a builder so the usual validation applies.
    #[must_use]
    pub fn into_builder(self) -> ContextBuilder {
        let builder = Context::builder()
            .hash_function(self.hash_algorithm)
            .keep_record_hashes(self.keep_record_hashes)
            .keep_tree_hashes(self.keep_tree_hashes)
            .max_record_len(self.max_record_len)
            .timestamper(self.timestamper)
            .sync_on_close(self.sync_on_close);
        match self.block_size_limit {
            Some(limit) => builder.block_size_limit(limit),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sha256_unbounded() {
        let ctx = Context::builder().build().unwrap();
        assert_eq!(ctx.hash_algorithm(), HashAlgorithm::Sha256);
        assert_eq!(ctx.block_size_limit(), u64::MAX);
        assert!(ctx.keep_record_hashes());
        assert!(!ctx.keep_tree_hashes());
    }

    #[test]
    fn misconfiguration_is_rejected_at_build() {
        let e = Context::builder().hash_function("MD5").build().unwrap_err();
        assert!(matches!(e, LogSigError::Config(_)));
        let e = Context::builder().block_size_limit(0).build().unwrap_err();
        assert!(matches!(e, LogSigError::Config(_)));
        let e = Context::builder().max_record_len(0).build().unwrap_err();
        assert!(matches!(e, LogSigError::Config(_)));
    }

    #[test]
    fn toml_partial_document_uses_defaults() {
        let ctx = Context::from_toml_str(
            r#"
            hash_algorithm = "sha-512"
            block_size_limit = 10
            keep_tree_hashes = true
            "#,
        )
        .unwrap();
        assert_eq!(ctx.hash_algorithm(), HashAlgorithm::Sha512);
        assert_eq!(ctx.block_size_limit(), 10);
        assert!(ctx.keep_tree_hashes());
        assert_eq!(ctx.max_record_len(), DEFAULT_MAX_RECORD_LEN);
    }

    #[test]
    fn toml_unknown_key_is_config_error() {
        let e = Context::from_toml_str("block_limit = 3").unwrap_err();
        assert!(matches!(e, LogSigError::Config(_)));
    }

    #[test]
    fn to_config_round_trips() {
        let ctx = Context::builder()
            .hash_algorithm(HashAlgorithm::Ripemd160)
            .block_size_limit(7)
            .timestamper("tsa.example")
            .build()
            .unwrap();
        let text = toml::to_string(&ctx.to_config()).unwrap();
        assert_eq!(Context::from_toml_str(&text).unwrap(), ctx);

        let unbounded = Context::default();
        let text = toml::to_string(&unbounded.to_config()).unwrap();
        assert!(!text.contains("block_size_limit"));
        assert_eq!(Context::from_toml_str(&text).unwrap(), unbounded);
    }

    #[test]
    fn config_file_values_can_be_overridden_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logsig.toml");
        std::fs::write(&path, "hash_algorithm = \"SHA1\"\nblock_size_limit = 4\n").unwrap();

        let ctx = ContextConfig::load(&path)
            .unwrap()
            .into_builder()
            .block_size_limit(9)
            .build()
            .unwrap();
        assert_eq!(ctx.hash_algorithm(), HashAlgorithm::Sha1);
        assert_eq!(ctx.block_size_limit(), 9);
        assert_eq!(Context::load(&path).unwrap().block_size_limit(), 4);
    }
}
