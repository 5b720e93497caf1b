//! Block signing session for one log file.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle --start--> Open --finish--> Closing --(signed)--> Idle
//!                    |                  |
//!                    |                  +--abandon--> Idle
//!                    +--add_record (rolls over at the block size limit)
//! ```
//!
//! A notarizer failure leaves the session in `Closing` with the block root
//! pending: call [`BlockSession::finish`] again to retry or
//! [`BlockSession::abandon`] to drop the block.
//!
//! # Files
//!
//! - `<log>.logsig`: `LOGSIG10` header followed by TLV records. On open, an
//!   unfinished trailing block (hashes with no signature, or a torn record)
//!   is truncated away.
//! - `<log>.gtstate`: carry-over of the last closed block, rewritten
//!   atomically after every signed block.

use logsig_core::records::BlockSig;
use logsig_core::state::StateFile;
use logsig_core::tlv::{
    TlvReader, TlvWriter, LOGSIG_MAGIC, MAGIC_LEN, TLV_BLOCK_SIG, TLV_RECORD_HASH, TLV_TREE_HASH,
};
use logsig_core::{Context, LogSigError, Notarizer, Result};
use logsig_crypto::Imprint;
use logsig_merkle::{Aggregator, FoldStep};
use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix appended to a log path for its signature file.
pub const SIG_SUFFIX: &str = ".logsig";
/// Suffix appended to a log path for its state file.
pub const STATE_SUFFIX: &str = ".gtstate";

/// Companion file locations for one log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigPaths {
    /// Signature file.
    pub sig: PathBuf,
    /// State file.
    pub state: PathBuf,
}

impl SigPaths {
    /// `<log>.logsig` and `<log>.gtstate`.
    #[must_use]
    pub fn for_log(log: &Path) -> Self {
        Self {
            sig: with_suffix(log, SIG_SUFFIX),
            state: with_suffix(log, STATE_SUFFIX),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Where a session is in the block lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No block in progress.
    Idle,
    /// Accepting records.
    Open,
    /// Root computed, waiting for a signature.
    Closing,
}

impl SessionState {
    const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A closed block waiting for the notarizer.
#[derive(Clone, Debug)]
struct PendingBlock {
    root: Imprint,
    iv: Vec<u8>,
    record_count: u64,
}

/// What an existing signature file looked like on open.
#[derive(Debug)]
struct Recovery {
    len: u64,
    needs_magic: bool,
    last_hash: Option<Imprint>,
}

/// Signing session over one log file. Not shareable between threads; open
/// one session per file.
pub struct BlockSession<N: Notarizer> {
    ctx: Arc<Context>,
    notary: N,
    paths: SigPaths,
    writer: TlvWriter<File>,
    /// Signature file length at the last rebase.
    base_len: u64,
    /// Writer byte count at the last rebase.
    written_at_base: u64,
    /// Signature file offset where the current block starts.
    block_start: u64,
    state: SessionState,
    carry: Imprint,
    agg: Option<Aggregator>,
    pending: Option<PendingBlock>,
    blocks_signed: u64,
}

impl<N: Notarizer> fmt::Debug for BlockSession<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSession")
            .field("paths", &self.paths)
            .field("state", &self.state)
            .field("carry", &self.carry)
            .field("blocks_signed", &self.blocks_signed)
            .finish_non_exhaustive()
    }
}

impl<N: Notarizer> BlockSession<N> {
    /// Open the companion files of `log` (`<log>.logsig`, `<log>.gtstate`).
    pub fn open(ctx: Arc<Context>, log: impl AsRef<Path>, notary: N) -> Result<Self> {
        Self::open_paths(ctx, SigPaths::for_log(log.as_ref()), notary)
    }

    /// Open explicit signature/state paths.
    ///
    /// The carry-over comes from the state file. If the state file is
    /// missing or unreadable, the last block signature in the signature file
    /// is used, and failing that the all-zero digest.
    ///
    /// # Errors
    /// I/O failures, or [`LogSigError::InvalidHeader`] if the signature file
    /// exists but is not a `LOGSIG10` file.
    pub fn open_paths(ctx: Arc<Context>, paths: SigPaths, notary: N) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&paths.sig)?;
        let recovery = recover_sig_file(&file, &paths.sig)?;

        let mut writer = TlvWriter::new(file);
        if recovery.needs_magic {
            writer.write_magic(LOGSIG_MAGIC)?;
            writer.flush()?;
        }

        let carry = restore_carry(&ctx, &paths.state, recovery.last_hash)?;
        info!(
            sig = %paths.sig.display(),
            alg = %ctx.hash_algorithm(),
            carry = %carry,
            "signing session opened"
        );

        let base_len = recovery.len;
        Ok(Self {
            ctx,
            notary,
            paths,
            writer,
            base_len,
            written_at_base: 0,
            block_start: base_len,
            state: SessionState::Idle,
            carry,
            agg: None,
            pending: None,
            blocks_signed: 0,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Last hash of the most recently signed block.
    #[must_use]
    pub const fn carry_over(&self) -> &Imprint {
        &self.carry
    }

    /// Records folded into the open block.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.agg.as_ref().map_or(0, Aggregator::leaf_count)
    }

    /// Blocks signed since this session was opened.
    #[must_use]
    pub const fn blocks_signed(&self) -> u64 {
        self.blocks_signed
    }

    /// Companion file locations.
    #[must_use]
    pub const fn paths(&self) -> &SigPaths {
        &self.paths
    }

    /// Shared configuration.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn sig_offset(&self) -> u64 {
        self.base_len + (self.writer.bytes_written() - self.written_at_base)
    }

    const fn wrong_state(&self, op: &'static str) -> LogSigError {
        LogSigError::InvalidState {
            op,
            state: self.state.name(),
        }
    }

    /// Begin a block: `Idle -> Open`.
    ///
    /// The block IV is derived from the carry-over.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(self.wrong_state("start"));
        }
        let alg = self.ctx.hash_algorithm();
        self.block_start = self.sig_offset();
        self.agg = Some(Aggregator::for_block(alg, &self.carry));
        self.state = SessionState::Open;
        debug!(offset = self.block_start, "block started");
        Ok(())
    }

    /// Fold one record into the open block.
    ///
    /// When the block reaches the configured size limit it is finished and a
    /// new block is started. If the notarizer fails at that point the record
    /// is already part of the block and the session is left in `Closing`.
    ///
    /// # Errors
    /// - [`LogSigError::InvalidState`] unless `Open`,
    /// - [`LogSigError::InvalidRecord`] for an empty or oversized record,
    /// - [`LogSigError::RolloverPending`] when the record was accepted but the
    ///   full block could not be signed; call [`finish`](Self::finish) again,
    /// - I/O errors, which also discard the block.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(self.wrong_state("add_record"));
        }
        if record.is_empty() {
            return Err(LogSigError::InvalidRecord("empty record".into()));
        }
        if record.len() > self.ctx.max_record_len() {
            return Err(LogSigError::InvalidRecord(format!(
                "record of {} bytes exceeds limit of {}",
                record.len(),
                self.ctx.max_record_len()
            )));
        }

        let Some(agg) = self.agg.as_mut() else {
            return Err(self.wrong_state("add_record"));
        };
        let step = agg.fold(record)?;
        let count = agg.leaf_count();

        if let Err(e) = self.emit_step(&step) {
            self.fail_block(&e);
            return Err(e);
        }

        if count >= self.ctx.block_size_limit() {
            debug!(records = count, "block size limit reached");
            match self.finish() {
                Ok(_) => {}
                Err(LogSigError::Notary(e)) => return Err(LogSigError::RolloverPending(e)),
                Err(e) => return Err(e),
            }
            self.start()?;
        }
        Ok(())
    }

    fn emit_step(&mut self, step: &FoldStep) -> Result<()> {
        if self.ctx.keep_record_hashes() {
            self.writer.write_imprint(TLV_RECORD_HASH, &step.record_hash)?;
        }
        if self.ctx.keep_tree_hashes() {
            for h in step.tree_hashes() {
                self.writer.write_imprint(TLV_TREE_HASH, h)?;
            }
        }
        Ok(())
    }

    /// Close the block and sign its root: `Open -> Closing -> Idle`.
    ///
    /// From `Closing` this retries the notarizer for the pending root.
    /// Returns `Ok(None)` for a block with no records; nothing is written.
    ///
    /// # Errors
    /// - [`LogSigError::InvalidState`] when `Idle`,
    /// - [`LogSigError::Notary`], leaving the session in `Closing`,
    /// - I/O errors while writing the block signature, which discard the block.
    pub fn finish(&mut self) -> Result<Option<BlockSig>> {
        match self.state {
            SessionState::Idle => return Err(self.wrong_state("finish")),
            SessionState::Open => {
                let Some(mut agg) = self.agg.take() else {
                    return Err(self.wrong_state("finish"));
                };
                let record_count = agg.leaf_count();
                let iv = agg.iv().to_vec();
                let Some(root) = agg.close() else {
                    self.state = SessionState::Idle;
                    debug!("empty block discarded");
                    return Ok(None);
                };
                self.pending = Some(PendingBlock {
                    root,
                    iv,
                    record_count,
                });
                self.state = SessionState::Closing;
            }
            SessionState::Closing => {}
        }
        self.sign_pending()
    }

    fn sign_pending(&mut self) -> Result<Option<BlockSig>> {
        let Some(pending) = self.pending.as_ref() else {
            self.state = SessionState::Idle;
            return Ok(None);
        };

        let signature = match self.notary.sign(&pending.root) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(
                    error = %e,
                    root = %pending.root,
                    records = pending.record_count,
                    "notarizer failed; block left pending"
                );
                return Err(e.into());
            }
        };

        let bs = BlockSig {
            hash_id: pending.root.hash_id,
            sig_id: self.notary.sig_id(),
            iv: pending.iv.clone(),
            last_hash: pending.root.clone(),
            record_count: pending.record_count,
            signature,
        };

        if let Err(e) = self.write_block_sig(&bs) {
            self.fail_block(&e);
            return Err(e);
        }

        self.carry = bs.last_hash.clone();
        self.pending = None;
        self.state = SessionState::Idle;
        self.blocks_signed += 1;
        StateFile::new(self.carry.clone()).store(&self.paths.state)?;

        info!(
            block = self.blocks_signed,
            records = bs.record_count,
            root = %bs.last_hash,
            "block signed"
        );
        Ok(Some(bs))
    }

    fn write_block_sig(&mut self, bs: &BlockSig) -> Result<()> {
        self.writer.write_block_sig(bs)?;
        if self.ctx.sync_on_close() {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Give up on the current block: `Open | Closing -> Idle`.
    ///
    /// Hashes already written for the block are removed from the signature
    /// file. The carry-over is unchanged, so the next block chains to the
    /// last *signed* block.
    pub fn abandon(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Err(self.wrong_state("abandon"));
        }
        let records = self
            .pending
            .as_ref()
            .map_or_else(|| self.record_count(), |p| p.record_count);
        self.agg = None;
        self.pending = None;
        self.state = SessionState::Idle;
        self.truncate_to_block_start()?;
        warn!(records, "block abandoned unsigned");
        Ok(())
    }

    /// Discard the block after an I/O failure. Best effort: the original
    /// error is what the caller sees.
    fn fail_block(&mut self, cause: &LogSigError) {
        self.agg = None;
        self.pending = None;
        self.state = SessionState::Idle;
        let cleanup = self.truncate_to_block_start();
        warn!(error = %cause, cleanup_ok = cleanup.is_ok(), "block discarded after write failure");
    }

    /// Cut the signature file back to where the current block started and
    /// drop whatever is still buffered for it.
    ///
    /// A failed write can leave part of a record on disk that the byte count
    /// never saw, so the cut does not depend on it.
    fn truncate_to_block_start(&mut self) -> Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let (_, dropped) = std::mem::replace(&mut self.writer, TlvWriter::new(file)).into_parts();
        self.base_len = self.block_start;
        self.written_at_base = self.writer.bytes_written();
        self.writer.get_ref().set_len(self.block_start)?;
        debug!(
            offset = self.block_start,
            buffered = dropped.len(),
            "signature file cut back to block start"
        );
        Ok(())
    }

    /// Finish any open or pending block, flush and persist the carry-over.
    pub fn close(mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            self.finish()?;
        }
        self.writer.flush()?;
        StateFile::new(self.carry.clone()).store(&self.paths.state)?;
        info!(
            sig = %self.paths.sig.display(),
            blocks = self.blocks_signed,
            "signing session closed"
        );
        Ok(())
    }
}

impl<N: Notarizer> Drop for BlockSession<N> {
    fn drop(&mut self) {
        if self.state != SessionState::Idle {
            warn!(
                sig = %self.paths.sig.display(),
                state = %self.state,
                records = self.record_count(),
                "session dropped with an unsigned block"
            );
        }
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "flushing signature file on drop failed");
        }
    }
}

/// Check the header of an existing signature file and cut off anything after
/// the last complete block signature.
fn recover_sig_file(file: &File, path: &Path) -> Result<Recovery> {
    let len = file.metadata()?.len();
    let mut rd = file;
    rd.seek(SeekFrom::Start(0))?;

    if len < MAGIC_LEN as u64 {
        let mut head = Vec::new();
        rd.read_to_end(&mut head)?;
        if !LOGSIG_MAGIC.starts_with(&head) {
            return Err(LogSigError::invalid_header(LOGSIG_MAGIC, &head));
        }
        if len > 0 {
            warn!(sig = %path.display(), "torn file header rewritten");
            file.set_len(0)?;
        }
        return Ok(Recovery {
            len: 0,
            needs_magic: true,
            last_hash: None,
        });
    }

    let mut rdr = TlvReader::new(BufReader::new(rd));
    rdr.check_magic(LOGSIG_MAGIC)?;
    let mut keep = MAGIC_LEN as u64;
    let mut last_hash = None;
    let mut dangling = 0u64;
    let torn = loop {
        match rdr.read_record() {
            Ok(None) => break false,
            Ok(Some(tlv)) if tlv.tlv_type == TLV_BLOCK_SIG => {
                last_hash = Some(BlockSig::from_tlv(&tlv)?.last_hash);
                keep = rdr.position();
                dangling = 0;
            }
            Ok(Some(_)) => dangling += 1,
            Err(LogSigError::Length(_)) => break true,
            Err(e) => return Err(e),
        }
    };

    if torn || dangling > 0 {
        warn!(
            sig = %path.display(),
            kept_bytes = keep,
            dropped_bytes = len - keep,
            dangling_records = dangling,
            torn,
            "unfinished block truncated from signature file"
        );
        file.set_len(keep)?;
    }
    Ok(Recovery {
        len: keep,
        needs_magic: false,
        last_hash,
    })
}

fn restore_carry(ctx: &Context, state_path: &Path, from_sig: Option<Imprint>) -> Result<Imprint> {
    let from_state = match StateFile::load(state_path) {
        Ok(st) => st.map(|s| s.last_hash),
        Err(LogSigError::Io(e)) => return Err(LogSigError::Io(e)),
        Err(e) => {
            warn!(state = %state_path.display(), error = %e, "state file unreadable");
            None
        }
    };
    Ok(match (from_state, from_sig) {
        (Some(st), Some(sig)) if st != sig => {
            // The signature file is flushed before the state file is replaced.
            warn!(
                state = %st,
                signature_file = %sig,
                "state file lags the signature file; using the last block signature"
            );
            sig
        }
        (Some(st), _) => st,
        (None, Some(sig)) => sig,
        (None, None) => Imprint::zero(ctx.hash_algorithm()),
    })
}
