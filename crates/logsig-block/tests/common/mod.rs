//! Shared fixtures for the signing/verification integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use logsig_block::{BlockSession, Verifier, VerifyOptions, VerifyReport, SIG_SUFFIX, STATE_SUFFIX};
use logsig_core::{Context, KeyedNotary};
use logsig_crypto::HashAlgorithm;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const KEY: [u8; 32] = [0x5a; 32];
pub const AUTHORITY: &str = "test-tsa";

/// Deterministic notarizer shared by signer and verifier.
pub fn notary() -> KeyedNotary {
    KeyedNotary::new(AUTHORITY, KEY).with_fixed_time(1_700_000_000)
}

pub fn ctx(alg: HashAlgorithm, limit: u64) -> Arc<Context> {
    Arc::new(
        Context::builder()
            .hash_algorithm(alg)
            .block_size_limit(limit)
            .build()
            .unwrap(),
    )
}

pub fn sig_path(log: &Path) -> PathBuf {
    PathBuf::from(format!("{}{SIG_SUFFIX}", log.display()))
}

pub fn state_path(log: &Path) -> PathBuf {
    PathBuf::from(format!("{}{STATE_SUFFIX}", log.display()))
}

/// `n` distinct newline-terminated lines.
pub fn lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("2024-05-01T00:00:{i:02}Z host app[{i}]: event {i}\n")).collect()
}

/// Append `lines` to the log at `log` and sign each one in a single session.
pub fn append_and_sign(log: &Path, ctx: Arc<Context>, lines: &[String]) {
    let mut body = fs::read(log).unwrap_or_default();
    for l in lines {
        body.extend_from_slice(l.as_bytes());
    }
    fs::write(log, body).unwrap();

    let mut session = BlockSession::open(ctx, log, notary()).unwrap();
    session.start().unwrap();
    for l in lines {
        session.add_record(l.as_bytes()).unwrap();
    }
    session.close().unwrap();
}

pub fn verify(log: &Path) -> VerifyReport {
    Verifier::new(notary()).verify_files(log, sig_path(log)).unwrap()
}

pub fn verify_with(log: &Path, opts: VerifyOptions) -> VerifyReport {
    Verifier::with_options(notary(), opts)
        .verify_files(log, sig_path(log))
        .unwrap()
}
