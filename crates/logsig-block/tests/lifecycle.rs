//! Session lifecycle: state transitions, notarizer failures, restarts and
//! recovery of partially written signature files.

#![allow(clippy::unwrap_used)]

mod common;

use common::*;
use logsig_block::{BlockSession, SessionState};
use logsig_core::tlv::{LOGSIG_MAGIC, MAGIC_LEN};
use logsig_core::{Context, KeyedNotary, LogSigError, NotaryError, Notarizer, StateFile};
use logsig_crypto::{HashAlgorithm, Imprint};
use std::cell::Cell;
use std::fs;
use std::io::Write as _;
use std::sync::Arc;

const ALG: HashAlgorithm = HashAlgorithm::Sha256;

/// Fails the first `failures` signing requests, then delegates.
struct Flaky {
    failures: Cell<u32>,
    inner: KeyedNotary,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures: Cell::new(failures),
            inner: notary(),
        }
    }
}

impl Notarizer for Flaky {
    fn sign(&self, root: &Imprint) -> Result<Vec<u8>, NotaryError> {
        let left = self.failures.get();
        if left > 0 {
            self.failures.set(left - 1);
            return Err(NotaryError::Unavailable("authority offline".into()));
        }
        self.inner.sign(root)
    }
}

fn sig_len(log: &std::path::Path) -> u64 {
    fs::metadata(sig_path(log)).unwrap().len()
}

#[test]
fn operations_require_the_right_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    let mut s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();

    let e = s.add_record(b"early\n").unwrap_err();
    assert!(matches!(
        e,
        LogSigError::InvalidState {
            op: "add_record",
            state: "idle"
        }
    ));
    assert_eq!(e.code(), 22);
    assert!(s.finish().is_err());
    assert!(s.abandon().is_err());

    s.start().unwrap();
    assert!(matches!(
        s.start().unwrap_err(),
        LogSigError::InvalidState { op: "start", .. }
    ));
    assert_eq!(s.state(), SessionState::Open);
}

#[test]
fn empty_and_oversized_records_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("size.log");
    let ctx = Arc::new(Context::builder().max_record_len(8).build().unwrap());
    let mut s = BlockSession::open(ctx, &log, notary()).unwrap();
    s.start().unwrap();

    assert!(matches!(s.add_record(b""), Err(LogSigError::InvalidRecord(_))));
    assert!(matches!(
        s.add_record(b"123456789"),
        Err(LogSigError::InvalidRecord(_))
    ));
    s.add_record(b"12345678").unwrap();
    assert_eq!(s.record_count(), 1);
    assert_eq!(s.state(), SessionState::Open);
}

#[test]
fn empty_block_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("idle.log");
    let mut s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    s.start().unwrap();
    assert_eq!(s.finish().unwrap(), None);
    assert_eq!(s.state(), SessionState::Idle);
    s.close().unwrap();
    assert_eq!(sig_len(&log), MAGIC_LEN as u64);
}

#[test]
fn block_rolls_over_at_limit() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("roll.log");
    let mut s = BlockSession::open(ctx(ALG, 2), &log, notary()).unwrap();
    s.start().unwrap();
    for l in lines(5) {
        s.add_record(l.as_bytes()).unwrap();
    }
    assert_eq!(s.blocks_signed(), 2);
    assert_eq!(s.record_count(), 1);
    assert_eq!(s.state(), SessionState::Open);
}

#[test]
fn notarizer_failure_keeps_block_pending() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("retry.log");
    let recs = lines(2);
    fs::write(&log, recs.concat()).unwrap();

    let flaky = Flaky::new(1);
    let mut s = BlockSession::open(ctx(ALG, 10), &log, &flaky).unwrap();
    s.start().unwrap();
    for l in &recs {
        s.add_record(l.as_bytes()).unwrap();
    }
    let e = s.finish().unwrap_err();
    assert!(matches!(e, LogSigError::Notary(NotaryError::Unavailable(_))));
    assert_eq!(e.code(), 21);
    assert_eq!(s.state(), SessionState::Closing);
    assert!(s.add_record(b"late\n").is_err());
    assert!(!state_path(&log).exists());

    let bs = s.finish().unwrap().unwrap();
    assert_eq!(bs.record_count, 2);
    assert_eq!(s.state(), SessionState::Idle);
    assert_eq!(s.carry_over(), &bs.last_hash);
    s.close().unwrap();

    assert!(verify(&log).is_ok());
}

#[test]
fn rollover_failure_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("roll-retry.log");
    let recs = lines(3);
    fs::write(&log, recs.concat()).unwrap();

    let flaky = Flaky::new(1);
    let mut s = BlockSession::open(ctx(ALG, 2), &log, &flaky).unwrap();
    s.start().unwrap();
    s.add_record(recs[0].as_bytes()).unwrap();
    let e = s.add_record(recs[1].as_bytes()).unwrap_err();
    assert!(matches!(
        e,
        LogSigError::RolloverPending(NotaryError::Unavailable(_))
    ));
    assert_eq!(e.code(), 24);
    assert_eq!(s.state(), SessionState::Closing);

    s.finish().unwrap().unwrap();
    s.start().unwrap();
    s.add_record(recs[2].as_bytes()).unwrap();
    s.close().unwrap();

    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
    assert_eq!(report.blocks, 2);
}

#[test]
fn abandon_drops_the_block() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("abandon.log");
    let mut s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    s.start().unwrap();
    s.add_record(b"discarded 1\n").unwrap();
    s.add_record(b"discarded 2\n").unwrap();
    s.abandon().unwrap();
    assert_eq!(s.state(), SessionState::Idle);
    assert_eq!(s.carry_over(), &Imprint::zero(ALG));
    assert_eq!(sig_len(&log), MAGIC_LEN as u64);

    s.start().unwrap();
    s.add_record(b"kept\n").unwrap();
    s.close().unwrap();
    fs::write(&log, b"kept\n").unwrap();
    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
}

#[test]
fn abandon_cuts_bytes_the_session_never_counted() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("abandon-torn.log");
    let ctx = Arc::new(Context::builder().keep_record_hashes(false).build().unwrap());
    let mut s = BlockSession::open(ctx.clone(), &log, notary()).unwrap();
    s.start().unwrap();
    s.add_record(b"dropped\n").unwrap();
    fs::OpenOptions::new()
        .append(true)
        .open(sig_path(&log))
        .unwrap()
        .write_all(&[0x89, 0x02, 0x10])
        .unwrap();
    s.abandon().unwrap();
    assert_eq!(sig_len(&log), MAGIC_LEN as u64);

    s.start().unwrap();
    s.add_record(b"kept\n").unwrap();
    s.close().unwrap();
    fs::write(&log, b"kept\n").unwrap();
    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
}

#[test]
fn abandon_while_closing() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("abandon-closing.log");
    let flaky = Flaky::new(u32::MAX);
    let mut s = BlockSession::open(ctx(ALG, 10), &log, &flaky).unwrap();
    s.start().unwrap();
    s.add_record(b"never signed\n").unwrap();
    assert!(s.finish().is_err());
    s.abandon().unwrap();
    assert_eq!(s.state(), SessionState::Idle);
    s.close().unwrap();
    assert_eq!(sig_len(&log), MAGIC_LEN as u64);
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("restart.log");
    let all = lines(8);
    append_and_sign(&log, ctx(ALG, 10), &all[..5]);

    let state = StateFile::load(state_path(&log)).unwrap().unwrap();
    let before = fs::read(state_path(&log)).unwrap();
    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert_eq!(s.carry_over(), &state.last_hash);
    s.close().unwrap();
    assert_eq!(fs::read(state_path(&log)).unwrap(), before);

    append_and_sign(&log, ctx(ALG, 10), &all[5..]);
    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
    assert_eq!((report.blocks, report.records), (2, 8));
}

#[test]
fn unclean_drop_truncates_unsigned_block() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("crash.log");
    let recs = lines(4);
    fs::write(&log, recs.concat()).unwrap();

    let first = {
        let mut s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
        s.start().unwrap();
        s.add_record(recs[0].as_bytes()).unwrap();
        s.add_record(recs[1].as_bytes()).unwrap();
        let bs = s.finish().unwrap().unwrap();
        s.start().unwrap();
        s.add_record(recs[2].as_bytes()).unwrap();
        bs
    };
    let signed_len = sig_len(&log);

    let mut s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert!(sig_len(&log) < signed_len);
    assert_eq!(s.carry_over(), &first.last_hash);
    s.start().unwrap();
    s.add_record(recs[2].as_bytes()).unwrap();
    s.add_record(recs[3].as_bytes()).unwrap();
    s.close().unwrap();

    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
    assert_eq!(report.blocks, 2);
}

#[test]
fn missing_state_file_falls_back_to_signature_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("nostate.log");
    append_and_sign(&log, ctx(ALG, 10), &lines(3));
    let state = StateFile::load(state_path(&log)).unwrap().unwrap();
    fs::remove_file(state_path(&log)).unwrap();

    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert_eq!(s.carry_over(), &state.last_hash);
}

#[test]
fn stale_or_corrupt_state_loses_to_signature_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("stale.log");
    append_and_sign(&log, ctx(ALG, 10), &lines(3));
    let good = StateFile::load(state_path(&log)).unwrap().unwrap();

    StateFile::new(ALG.digest(b"stale")).store(state_path(&log)).unwrap();
    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert_eq!(s.carry_over(), &good.last_hash);
    drop(s);

    fs::write(state_path(&log), b"not a state file").unwrap();
    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert_eq!(s.carry_over(), &good.last_hash);
}

#[test]
fn torn_tail_is_cut_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("torn.log");
    let all = lines(6);
    append_and_sign(&log, ctx(ALG, 10), &all[..3]);
    let clean = sig_len(&log);

    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(sig_path(&log))
        .unwrap();
    f.write_all(&[0x89, 0x00, 0x00]).unwrap();
    drop(f);

    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    assert_eq!(sig_len(&log), clean);
    s.close().unwrap();

    append_and_sign(&log, ctx(ALG, 10), &all[3..]);
    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);
}

#[test]
fn torn_header_is_rewritten_foreign_file_refused() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("hdr.log");

    fs::write(sig_path(&log), &LOGSIG_MAGIC[..4]).unwrap();
    let s = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap();
    drop(s);
    assert_eq!(fs::read(sig_path(&log)).unwrap(), LOGSIG_MAGIC.to_vec());

    fs::write(sig_path(&log), b"#!/bin/sh\necho hi\n").unwrap();
    let e = BlockSession::open(ctx(ALG, 10), &log, notary()).unwrap_err();
    assert!(matches!(e, LogSigError::InvalidHeader { .. }));
}
