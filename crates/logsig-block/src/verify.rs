//! Replay verification of a log against its signature file.
//!
//! The verifier re-runs the aggregation over the original records and checks,
//! block by block:
//! - stored record and tree hashes against the recomputed ones,
//! - the block's record count against the records replayed,
//! - the recomputed root against the stored last hash,
//! - the signature blob through a [`NotaryVerifier`],
//! - that the block IV derives from the previous block's last hash.
//!
//! Findings are collected into a [`VerifyReport`]; only I/O failures abort
//! the run. A block signature that cannot be decoded is reported and its
//! records are skipped; only a torn or unframeable record ends the scan.

use crate::input::open_log;
use logsig_core::records::{decode_count, decode_imprint, BS_LAST_HASH, BS_RECORD_COUNT};
use logsig_core::tlv::{
    decode_all, BlockFrame, BlockParams, TlvReader, LOGSIG_MAGIC, TLV_BLOCK_SIG, TLV_RECORD_HASH,
    TLV_TREE_HASH,
};
use logsig_core::{FailureKind, LogSigError, NotaryVerifier, Result};
use logsig_crypto::Imprint;
use logsig_merkle::{derive_iv, Aggregator};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;
use tracing::{debug, info, warn};

/// Verification knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Carry-over expected before the first block. `None` means the all-zero
    /// digest of the first block's algorithm.
    pub anchor: Option<Imprint>,
    /// Check IV chaining between blocks.
    pub check_chain: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            anchor: None,
            check_chain: true,
        }
    }
}

/// One discrepancy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Stable numeric code of `kind`.
    pub code: u8,
    /// 1-based block index (0 for file-level findings).
    pub block: u64,
    /// 1-based record index within the block, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<u64>,
    /// Human-readable detail.
    pub detail: String,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.block)?;
        if let Some(r) = self.record {
            write!(f, ", record {r}")?;
        }
        write!(f, ": {} (code {}): {}", self.kind, self.code, self.detail)
    }
}

/// Outcome of a verification run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Block signatures processed.
    pub blocks: u64,
    /// Records replayed.
    pub records: u64,
    /// Every discrepancy found, in file order.
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    /// No discrepancies.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// At least one finding of `kind`.
    #[must_use]
    pub fn has(&self, kind: FailureKind) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }

    /// Number of findings of `kind`.
    #[must_use]
    pub fn count(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }

    fn push(&mut self, kind: FailureKind, block: u64, record: Option<u64>, detail: impl Into<String>) {
        let failure = VerifyFailure {
            kind,
            code: kind.code(),
            block,
            record,
            detail: detail.into(),
        };
        debug!(%failure, "verification failure");
        self.failures.push(failure);
    }
}

/// Which findings a stored hash kind maps to.
struct HashKinds {
    tlv_type: u16,
    missing: FailureKind,
    bad_id: FailureKind,
    mismatch: FailureKind,
}

const RECORD_HASH: HashKinds = HashKinds {
    tlv_type: TLV_RECORD_HASH,
    missing: FailureKind::MissingRecordHash,
    bad_id: FailureKind::InvalidRecordHashId,
    mismatch: FailureKind::InvalidRecordHash,
};

const TREE_HASH: HashKinds = HashKinds {
    tlv_type: TLV_TREE_HASH,
    missing: FailureKind::MissingTreeHash,
    bad_id: FailureKind::InvalidTreeHashId,
    mismatch: FailureKind::InvalidTreeHash,
};

/// Last hash the next block chains from.
#[derive(Clone, Debug)]
enum Carry {
    /// No anchor: the zero digest of the block's algorithm.
    Zero,
    Known(Imprint),
    /// The previous block signature was unreadable.
    Lost,
}

/// Position of a check inside the file.
#[derive(Clone, Copy)]
struct At {
    block: u64,
    record: u64,
}

/// Replays records against a signature stream.
#[derive(Debug)]
pub struct Verifier<V> {
    notary: V,
    opts: VerifyOptions,
}

impl<V: NotaryVerifier> Verifier<V> {
    /// Verifier with default options.
    pub fn new(notary: V) -> Self {
        Self::with_options(notary, VerifyOptions::default())
    }

    /// Verifier with explicit options.
    pub const fn with_options(notary: V, opts: VerifyOptions) -> Self {
        Self { notary, opts }
    }

    /// Verify a log file (newline-delimited records) against its signature file.
    pub fn verify_files(&self, log: impl AsRef<Path>, sig: impl AsRef<Path>) -> Result<VerifyReport> {
        let records = open_log(log.as_ref())?;
        let sig_file = File::open(sig.as_ref())?;
        self.verify(records, sig_file)
    }

    /// Verify `records` against the signature stream `sig`.
    ///
    /// # Errors
    /// Only I/O failures (on either input) and internal resource limits are
    /// errors; everything else is reported in the returned [`VerifyReport`].
    pub fn verify<I, S>(&self, records: I, sig: S) -> Result<VerifyReport>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        S: Read + Seek,
    {
        let mut report = VerifyReport::default();
        let mut rdr = TlvReader::new(BufReader::new(sig));
        match rdr.check_magic(LOGSIG_MAGIC) {
            Ok(()) => {}
            Err(e @ LogSigError::InvalidHeader { .. }) => {
                report.push(FailureKind::InvalidHeader, 0, None, e.to_string());
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        let mut records = records.into_iter();
        let mut carry = self.opts.anchor.clone().map_or(Carry::Zero, Carry::Known);
        let mut block = 0u64;
        let mut stream_intact = true;

        loop {
            let frame = match rdr.block_frame(true) {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    let Some(kind) = e.failure_kind() else {
                        return Err(e);
                    };
                    report.push(kind, block + 1, None, e.to_string());
                    stream_intact = false;
                    break;
                }
            };
            block += 1;
            let end = frame.end;
            carry = match frame.clone().decode() {
                Ok(params) => {
                    self.verify_block(&mut rdr, &mut records, &params, block, carry, &mut report)?;
                    Carry::Known(params.block_sig.last_hash)
                }
                Err(e) => {
                    let Some(kind) = e.failure_kind() else {
                        return Err(e);
                    };
                    report.push(kind, block, None, format!("unreadable block signature: {e}"));
                    skip_block(&mut records, &frame)?
                }
            };
            rdr.seek_to(end)?;
            report.blocks += 1;
        }

        let mut trailing = 0u64;
        for rec in records {
            rec?;
            trailing += 1;
        }
        if stream_intact && trailing > 0 {
            report.push(
                FailureKind::MissingBlockSig,
                block + 1,
                None,
                format!("{trailing} trailing record(s) not covered by any block signature"),
            );
        }

        if report.is_ok() {
            info!(blocks = report.blocks, records = report.records, "verification passed");
        } else {
            warn!(
                blocks = report.blocks,
                records = report.records,
                failures = report.failures.len(),
                "verification found discrepancies"
            );
        }
        Ok(report)
    }

    fn verify_block<R, I>(
        &self,
        rdr: &mut TlvReader<R>,
        records: &mut I,
        params: &BlockParams,
        block: u64,
        carry: Carry,
        report: &mut VerifyReport,
    ) -> Result<()>
    where
        R: Read + Seek,
        I: Iterator<Item = io::Result<Vec<u8>>>,
    {
        let bs = &params.block_sig;
        let Some(alg) = bs.algorithm() else {
            report.push(
                FailureKind::Format,
                block,
                None,
                format!("unknown hash algorithm id {:#04x}", bs.hash_id),
            );
            for _ in 0..bs.record_count {
                if records.next().transpose()?.is_none() {
                    break;
                }
            }
            return Ok(());
        };

        let (carry, trusted) = match carry {
            Carry::Zero => (Imprint::zero(alg), true),
            Carry::Known(c) => (c, true),
            Carry::Lost => (Imprint::zero(alg), false),
        };
        if trusted && self.opts.check_chain && derive_iv(alg, &carry) != bs.iv {
            report.push(
                FailureKind::ChainBreak,
                block,
                None,
                format!("IV does not follow from previous last hash {carry}"),
            );
        }

        let mut agg = Aggregator::new(alg, bs.iv.clone(), carry);
        let mut replayed = 0u64;
        while replayed < bs.record_count {
            let Some(rec) = records.next().transpose()? else {
                break;
            };
            replayed += 1;
            let step = agg.fold(&rec)?;
            let at = At {
                block,
                record: replayed,
            };
            if params.has_record_hashes() {
                check_stored(rdr, &RECORD_HASH, &step.record_hash, at, report)?;
            }
            if params.has_tree_hashes() {
                for h in step.tree_hashes() {
                    check_stored(rdr, &TREE_HASH, h, at, report)?;
                }
            }
        }
        report.records += replayed;

        if replayed != bs.record_count {
            report.push(
                FailureKind::RecordCount,
                block,
                None,
                format!(
                    "block signature covers {} records, log supplied {replayed}",
                    bs.record_count
                ),
            );
        } else if params.has_record_hashes() && params.record_hashes != bs.record_count {
            report.push(
                FailureKind::RecordCount,
                block,
                None,
                format!(
                    "block signature covers {} records, signature file holds {} record hashes",
                    bs.record_count, params.record_hashes
                ),
            );
        }

        match agg.close() {
            Some(_) if !trusted => debug!(block, "previous last hash unknown, root not compared"),
            Some(root) if root != bs.last_hash => report.push(
                FailureKind::FinalHash,
                block,
                None,
                format!("recomputed root {root}, stored {}", bs.last_hash),
            ),
            Some(_) => {}
            None if bs.record_count == 0 => report.push(
                FailureKind::RecordCount,
                block,
                None,
                "block signature covers no records",
            ),
            None => {}
        }

        match self.notary.verify(&bs.last_hash, &bs.signature) {
            Ok(true) => {}
            Ok(false) => report.push(
                FailureKind::InvalidTimestamp,
                block,
                None,
                "signature rejected by notarizer",
            ),
            Err(e) => report.push(FailureKind::InvalidTimestamp, block, None, e.to_string()),
        }
        Ok(())
    }
}

/// Step over the log records of a block whose signature does not decode.
///
/// The count comes from the record-count child when it is readable, else
/// from the stored record hashes. Returns the carry for the next block.
fn skip_block<I>(records: &mut I, frame: &BlockFrame) -> Result<Carry>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    let children = decode_all(&frame.block_sig.payload).unwrap_or_default();
    let child = |t: u16| children.iter().find(|c| c.tlv_type == t);
    let count = child(BS_RECORD_COUNT)
        .and_then(|c| decode_count(&c.payload).ok())
        .unwrap_or(frame.record_hashes);
    for _ in 0..count {
        if records.next().transpose()?.is_none() {
            break;
        }
    }
    debug!(count, start = frame.start, "skipped records of unreadable block");
    Ok(child(BS_LAST_HASH)
        .and_then(|c| decode_imprint(&c.payload).ok())
        .map_or(Carry::Lost, Carry::Known))
}

/// Compare the next stored hash of `kinds.tlv_type` with `computed`.
///
/// Unknown non-critical records in between are skipped. If something else is
/// found the reader is left in front of it.
fn check_stored<R: Read + Seek>(
    rdr: &mut TlvReader<R>,
    kinds: &HashKinds,
    computed: &Imprint,
    at: At,
    report: &mut VerifyReport,
) -> Result<()> {
    let record = Some(at.record);
    loop {
        let mark = rdr.position();
        let tlv = match rdr.read_record() {
            Ok(Some(tlv)) => tlv,
            Ok(None) => {
                report.push(kinds.missing, at.block, record, "signature stream ended");
                return Ok(());
            }
            Err(e) => {
                let Some(kind) = e.failure_kind() else {
                    return Err(e);
                };
                report.push(kind, at.block, record, e.to_string());
                return Ok(());
            }
        };

        if tlv.tlv_type == kinds.tlv_type {
            match decode_imprint(&tlv.payload) {
                Err(e) => report.push(
                    e.failure_kind().unwrap_or(FailureKind::Format),
                    at.block,
                    record,
                    e.to_string(),
                ),
                Ok(stored) if stored.hash_id != computed.hash_id => report.push(
                    kinds.bad_id,
                    at.block,
                    record,
                    format!("stored id {:#04x}, block uses {:#04x}", stored.hash_id, computed.hash_id),
                ),
                Ok(stored) if stored.digest != computed.digest => report.push(
                    kinds.mismatch,
                    at.block,
                    record,
                    format!("stored {stored}, recomputed {computed}"),
                ),
                Ok(_) => {}
            }
            return Ok(());
        }

        let known = matches!(tlv.tlv_type, TLV_RECORD_HASH | TLV_TREE_HASH | TLV_BLOCK_SIG);
        if tlv.is_non_critical() && !known {
            continue;
        }
        rdr.seek_to(mark)?;
        report.push(
            kinds.missing,
            at.block,
            record,
            format!("found record type {:#06x} instead", tlv.tlv_type),
        );
        return Ok(());
    }
}
