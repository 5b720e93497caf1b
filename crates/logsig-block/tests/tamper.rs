//! Tamper detection: every modification of log or signature file must show up
//! as a specific finding.

#![allow(clippy::unwrap_used)]

mod common;

use common::*;
use logsig_block::{Verifier, VerifyOptions};
use logsig_core::tlv::{encode_tlv, TlvReader, FLAG_NONCRIT, LOGSIG_MAGIC, MAGIC_LEN};
use logsig_core::{BlockParams, FailureKind, KeyedNotary};
use logsig_crypto::HashAlgorithm;
use proptest::prelude::*;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn signed_log(dir: &Path, n: usize, limit: u64) -> PathBuf {
    let log = dir.join("app.log");
    append_and_sign(&log, ctx(HashAlgorithm::Sha256, limit), &lines(n));
    log
}

fn blocks(sig: &Path) -> Vec<BlockParams> {
    let mut rdr = TlvReader::new(BufReader::new(File::open(sig).unwrap()));
    rdr.check_magic(LOGSIG_MAGIC).unwrap();
    let mut out = Vec::new();
    while let Some(p) = rdr.block_params(false).unwrap() {
        out.push(p);
    }
    out
}

fn block_bytes(sig: &[u8], p: &BlockParams) -> Vec<u8> {
    sig[p.start as usize..p.end as usize].to_vec()
}

#[test]
fn edited_record_is_pinpointed() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 6, 10);
    let text = fs::read_to_string(&log).unwrap();
    fs::write(&log, text.replace("event 3", "event X")).unwrap();

    let report = verify(&log);
    let bad: Vec<_> = report
        .failures
        .iter()
        .filter(|f| f.kind == FailureKind::InvalidRecordHash)
        .collect();
    assert_eq!(bad.len(), 1);
    assert_eq!((bad[0].block, bad[0].record), (1, Some(4)));
    assert_eq!(bad[0].code, 12);
    assert!(report.has(FailureKind::FinalHash));
}

#[test]
fn edited_record_without_record_hashes_breaks_root() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("bare.log");
    let ctx = std::sync::Arc::new(
        logsig_core::Context::builder()
            .keep_record_hashes(false)
            .build()
            .unwrap(),
    );
    append_and_sign(&log, ctx, &lines(4));
    let text = fs::read_to_string(&log).unwrap();
    fs::write(&log, text.replace("event 0", "event 9")).unwrap();

    let report = verify(&log);
    assert_eq!(report.count(FailureKind::FinalHash), 1);
    assert!(!report.has(FailureKind::InvalidRecordHash));
}

#[test]
fn removed_line_changes_record_count() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 5, 10);
    let text = fs::read_to_string(&log).unwrap();
    let kept: String = text.lines().take(4).map(|l| format!("{l}\n")).collect();
    fs::write(&log, kept).unwrap();

    let report = verify(&log);
    assert!(report.has(FailureKind::RecordCount));
    assert!(report.has(FailureKind::FinalHash));
}

#[test]
fn unsigned_trailing_records_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 5, 10);
    let mut text = fs::read_to_string(&log).unwrap();
    text.push_str("appended later\n");
    fs::write(&log, text).unwrap();

    let report = verify(&log);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::MissingBlockSig);
    assert_eq!(report.failures[0].block, 2);
}

#[test]
fn truncated_before_block_signature() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 3, 10);
    let sig = sig_path(&log);
    let params = blocks(&sig).remove(0);
    let sig_len = params.block_sig.to_tlv().unwrap().encoded_len() as u64;
    File::options()
        .write(true)
        .open(&sig)
        .unwrap()
        .set_len(params.end - sig_len)
        .unwrap();

    let report = verify(&log);
    assert_eq!(report.count(FailureKind::MissingBlockSig), 1);
    assert_eq!(report.blocks, 0);
}

#[test]
fn truncated_inside_block_signature() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 3, 10);
    let sig = sig_path(&log);
    let len = fs::metadata(&sig).unwrap().len();
    File::options()
        .write(true)
        .open(&sig)
        .unwrap()
        .set_len(len - 5)
        .unwrap();

    let report = verify(&log);
    assert!(report.has(FailureKind::Length));
    assert!(!report.has(FailureKind::MissingBlockSig));
}

#[test]
fn swapped_blocks_break_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 6, 3);
    let sig = sig_path(&log);
    let raw = fs::read(&sig).unwrap();
    let b = blocks(&sig);
    assert_eq!(b.len(), 2);

    let mut swapped = LOGSIG_MAGIC.to_vec();
    swapped.extend(block_bytes(&raw, &b[1]));
    swapped.extend(block_bytes(&raw, &b[0]));
    fs::write(&sig, swapped).unwrap();

    let text = fs::read_to_string(&log).unwrap();
    let l: Vec<&str> = text.split_inclusive('\n').collect();
    fs::write(&log, [&l[3..], &l[..3]].concat().concat()).unwrap();

    let report = verify(&log);
    assert!(report.has(FailureKind::ChainBreak));
    assert!(report.failures.iter().any(|f| f.block == 1));
}

#[test]
fn dropped_first_block_verifies_from_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 6, 3);
    let sig = sig_path(&log);
    let raw = fs::read(&sig).unwrap();
    let b = blocks(&sig);

    let mut tail = LOGSIG_MAGIC.to_vec();
    tail.extend(block_bytes(&raw, &b[1]));
    fs::write(&sig, tail).unwrap();
    let text = fs::read_to_string(&log).unwrap();
    let l: Vec<&str> = text.split_inclusive('\n').collect();
    fs::write(&log, l[3..].concat()).unwrap();

    let report = verify(&log);
    assert!(report.has(FailureKind::ChainBreak));

    let anchored = verify_with(
        &log,
        VerifyOptions {
            anchor: Some(b[0].block_sig.last_hash.clone()),
            check_chain: true,
        },
    );
    assert!(anchored.is_ok(), "{:?}", anchored.failures);

    // Without an anchor the chaining input is wrong even if IVs are ignored.
    let unchained = verify_with(
        &log,
        VerifyOptions {
            anchor: None,
            check_chain: false,
        },
    );
    assert!(!unchained.has(FailureKind::ChainBreak));
    assert!(unchained.has(FailureKind::FinalHash));
}

#[test]
fn foreign_record_hash_id() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 2, 10);
    let sig = sig_path(&log);
    let mut raw = fs::read(&sig).unwrap();
    // magic, then a 4-byte TLV16 header, then the imprint's id byte
    assert_eq!(&raw[MAGIC_LEN..MAGIC_LEN + 2], &[0x89, 0x00]);
    raw[MAGIC_LEN + 4] = 0x7e;
    fs::write(&sig, raw).unwrap();

    let report = verify(&log);
    let f = report
        .failures
        .iter()
        .find(|f| f.kind == FailureKind::InvalidRecordHashId)
        .unwrap();
    assert_eq!(f.record, Some(1));
    assert_eq!(report.count(FailureKind::InvalidRecordHashId), 1);
}

#[test]
fn malformed_block_sig_does_not_hide_later_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 9, 3);
    let sig = sig_path(&log);
    let mut raw = fs::read(&sig).unwrap();
    let first = blocks(&sig).remove(0);
    // 4-byte TLV16 header, then the TLV8 hash-algorithm child
    let sig_len = first.block_sig.to_tlv().unwrap().encoded_len() as u64;
    let algo = (first.end - sig_len + 6) as usize;
    assert_eq!(raw[algo], HashAlgorithm::Sha256.wire_id());
    raw[algo] = HashAlgorithm::Sha512.wire_id();
    fs::write(&sig, raw).unwrap();

    let text = fs::read_to_string(&log).unwrap();
    fs::write(&log, text.replace("event 7", "event X")).unwrap();

    let report = verify(&log);
    assert_eq!(report.blocks, 3);
    assert_eq!(report.count(FailureKind::Length), 1);
    assert_eq!(report.failures[0].block, 1);
    let bad = report
        .failures
        .iter()
        .find(|f| f.kind == FailureKind::InvalidRecordHash)
        .unwrap();
    assert_eq!((bad.block, bad.record), (3, Some(2)));
    assert!(!report.has(FailureKind::ChainBreak));
    assert!(!report.failures.iter().any(|f| f.block == 2));
    assert!(!report.has(FailureKind::MissingBlockSig));
}

#[test]
fn unreadable_last_hash_skips_next_chain_check() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 6, 3);
    let sig = sig_path(&log);
    let raw = fs::read(&sig).unwrap();
    let b = blocks(&sig);

    // Replace block 1's signature with one that only carries a record count.
    let mut children = Vec::new();
    encode_tlv(&mut children, 0x03, 0, &[3]).unwrap();
    let sig_len = b[0].block_sig.to_tlv().unwrap().encoded_len() as u64;
    let mut patched = raw[..(b[0].end - sig_len) as usize].to_vec();
    encode_tlv(&mut patched, 0x0902, 0, &children).unwrap();
    patched.extend(block_bytes(&raw, &b[1]));
    fs::write(&sig, patched).unwrap();

    let report = verify(&log);
    assert_eq!(report.blocks, 2);
    assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
    // the first child found is the count, not the hash algorithm
    assert_eq!(report.failures[0].kind, FailureKind::InvalidTlvType);
    assert_eq!(report.failures[0].block, 1);
}

#[test]
fn bad_header_stops_verification() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 2, 10);
    let sig = sig_path(&log);
    let mut raw = fs::read(&sig).unwrap();
    raw[..MAGIC_LEN].copy_from_slice(b"GTSTAT10");
    fs::write(&sig, raw).unwrap();

    let report = verify(&log);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::InvalidHeader);
    assert_eq!(report.failures[0].code, 8);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["failures"][0]["kind"], "invalid_header");
    assert!(json["failures"][0].get("record").is_none());
}

#[test]
fn wrong_key_rejects_every_block() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 7, 3);
    let other = KeyedNotary::new(AUTHORITY, [0x11; 32]);
    let report = Verifier::new(other)
        .verify_files(&log, sig_path(&log))
        .unwrap();
    assert_eq!(report.count(FailureKind::InvalidTimestamp), 3);
    assert_eq!(report.failures.len(), 3);
}

#[test]
fn non_critical_unknown_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log = signed_log(dir.path(), 3, 10);
    let sig = sig_path(&log);
    let raw = fs::read(&sig).unwrap();

    let mut patched = raw[..MAGIC_LEN].to_vec();
    encode_tlv(&mut patched, 0x0a00, FLAG_NONCRIT, b"annotation").unwrap();
    patched.extend_from_slice(&raw[MAGIC_LEN..]);
    fs::write(&sig, patched).unwrap();
    let report = verify(&log);
    assert!(report.is_ok(), "{:?}", report.failures);

    let mut critical = raw[..MAGIC_LEN].to_vec();
    encode_tlv(&mut critical, 0x0a00, 0, b"annotation").unwrap();
    critical.extend_from_slice(&raw[MAGIC_LEN..]);
    fs::write(&sig, critical).unwrap();
    let report = verify(&log);
    assert!(report.has(FailureKind::InvalidTlvType));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_flipped_log_byte_is_detected(pos in any::<prop::sample::Index>(), flip in 1u8..=255) {
        let dir = tempfile::tempdir().unwrap();
        let log = signed_log(dir.path(), 9, 4);
        let mut raw = fs::read(&log).unwrap();
        let i = pos.index(raw.len());
        raw[i] ^= flip;
        fs::write(&log, raw).unwrap();

        let report = verify(&log);
        prop_assert!(!report.is_ok());
        prop_assert!(
            report.has(FailureKind::InvalidRecordHash) || report.has(FailureKind::FinalHash),
            "{:?}",
            report.failures
        );
    }
}
