// crates/logsig-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use logsig_block::{open_log, BlockSession, SigPaths, Verifier, VerifyOptions, VerifyReport};
use logsig_core::print::print_tlv;
use logsig_core::tlv::{TlvReader, LOGSIG_MAGIC};
use logsig_core::{Context, ContextConfig, KeyedNotary, StateFile};
use logsig_crypto::{name_for_id, Imprint};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "logsig",
    about = "Tamper-evident log signing",
    long_about = "Tamper-evident log signing.\n\nSign a log file block by block into a `<log>.logsig` signature file, verify a log against its signatures, and inspect signature and state files.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Sign the lines of a log file that no block signature covers yet
    Sign {
        /// Log file; every line (with its terminator) is one record
        log: PathBuf,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Hash algorithm (e.g. SHA2-256, SHA-512, RIPEMD-160)
        #[arg(long = "hash")]
        hash: Option<String>,

        /// Records per block
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        block_size: Option<u64>,

        /// Also write tree hashes (leaves and interior nodes)
        #[arg(long, default_value_t = false)]
        keep_tree_hashes: bool,

        /// Do not write per-record hashes
        #[arg(long, default_value_t = false)]
        no_record_hashes: bool,

        /// fsync the signature file after each block
        #[arg(long, default_value_t = false)]
        sync: bool,

        #[command(flatten)]
        notary: NotaryArgs,
    },

    /// Verify a log file against its signature file
    Verify {
        /// Log file
        log: PathBuf,

        /// Signature file (default: `<log>.logsig`)
        #[arg(long)]
        sig: Option<PathBuf>,

        /// Expected last hash before the first block, as a hex imprint
        /// (hash id byte followed by the digest)
        #[arg(long)]
        anchor: Option<String>,

        /// Do not check IV chaining between blocks
        #[arg(long, default_value_t = false)]
        no_chain: bool,

        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        /// TOML configuration file (supplies the default `--authority`)
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        notary: NotaryArgs,
    },

    /// Print every record of a signature file
    Dump {
        /// Signature file
        sig: PathBuf,

        /// Show full digests and signature blobs
        #[arg(long, short, default_value_t = false)]
        verbose: bool,
    },

    /// Print the carry-over stored in a state file
    State {
        /// State file
        state: PathBuf,
    },
}

#[derive(Args, Debug)]
struct NotaryArgs {
    /// Notarizer key, 64 hex digits
    #[arg(long)]
    key: String,

    /// Notarizer identity (default: `timestamper` from the configuration)
    #[arg(long)]
    authority: Option<String>,
}

impl NotaryArgs {
    fn notary(&self, default_authority: &str) -> Result<KeyedNotary> {
        let authority = self.authority.as_deref().unwrap_or(default_authority);
        KeyedNotary::from_hex_key(authority, &self.key).context("parsing --key")
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Sign {
            log,
            config,
            hash,
            block_size,
            keep_tree_hashes,
            no_record_hashes,
            sync,
            notary,
        } => {
            let ctx = build_context(
                config.as_deref(),
                hash,
                block_size,
                keep_tree_hashes,
                no_record_hashes,
                sync,
            )?;
            sign(&log, ctx, &notary)?;
            Ok(ExitCode::SUCCESS)
        }

        Cmd::Verify {
            log,
            sig,
            anchor,
            no_chain,
            json,
            config,
            notary,
        } => {
            let sig = sig.unwrap_or_else(|| SigPaths::for_log(&log).sig);
            let opts = VerifyOptions {
                anchor: anchor.as_deref().map(parse_imprint).transpose()?,
                check_chain: !no_chain,
            };
            let ctx = build_context(config.as_deref(), None, None, false, false, false)?;
            let notary = notary.notary(ctx.timestamper())?;
            let report = verify(&log, &sig, notary, opts, json)?;
            Ok(if report.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Cmd::Dump { sig, verbose } => {
            dump(&sig, verbose)?;
            Ok(ExitCode::SUCCESS)
        }

        Cmd::State { state } => {
            show_state(&state)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing with an env-driven filter (default INFO). Logs go to
/// stderr so that `verify --json` output stays machine-readable.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Configuration file (if any) overlaid with command-line flags.
fn build_context(
    config: Option<&Path>,
    hash: Option<String>,
    block_size: Option<u64>,
    keep_tree_hashes: bool,
    no_record_hashes: bool,
    sync: bool,
) -> Result<Arc<Context>> {
    let cfg = match config {
        Some(path) => ContextConfig::load(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => ContextConfig::default(),
    };
    let mut builder = cfg.into_builder();
    if let Some(name) = hash {
        builder = builder.hash_function(name);
    }
    if let Some(limit) = block_size {
        builder = builder.block_size_limit(limit);
    }
    if keep_tree_hashes {
        builder = builder.keep_tree_hashes(true);
    }
    if no_record_hashes {
        builder = builder.keep_record_hashes(false);
    }
    if sync {
        builder = builder.sync_on_close(true);
    }
    Ok(Arc::new(builder.build().context("invalid signing configuration")?))
}

/// Records already covered by block signatures in `sig`.
fn covered_records(sig: &Path) -> Result<u64> {
    let mut rdr = TlvReader::new(BufReader::new(
        File::open(sig).with_context(|| format!("open {}", sig.display()))?,
    ));
    rdr.check_magic(LOGSIG_MAGIC)?;
    let mut covered = 0u64;
    while let Some(params) = rdr
        .block_params(false)
        .with_context(|| format!("scanning {}", sig.display()))?
    {
        covered += params.block_sig.record_count;
    }
    Ok(covered)
}

fn sign(log: &Path, ctx: Arc<Context>, notary: &NotaryArgs) -> Result<()> {
    let notary = notary.notary(ctx.timestamper())?;
    let mut session = BlockSession::open(Arc::clone(&ctx), log, notary)
        .with_context(|| format!("opening signature files for {}", log.display()))?;
    let skip = covered_records(&session.paths().sig)?;

    let records = open_log(log).with_context(|| format!("open {}", log.display()))?;
    info!(log = %log.display(), already_signed = skip, alg = %ctx.hash_algorithm(), "signing");

    let mut added = 0u64;
    let mut seen = 0u64;
    for rec in records {
        let rec = rec.with_context(|| format!("reading {}", log.display()))?;
        seen += 1;
        if seen <= skip {
            continue;
        }
        if added == 0 {
            session.start()?;
        }
        session
            .add_record(&rec)
            .with_context(|| format!("line {seen} of {}", log.display()))?;
        added += 1;
    }
    if seen < skip {
        bail!(
            "{} has {seen} lines but its signature file covers {skip}; was the log truncated?",
            log.display()
        );
    }

    let sig = session.paths().sig.clone();
    session.close().context("closing signing session")?;
    println!(
        "Signed {added} new record(s) of {} -> {}",
        log.display(),
        sig.display()
    );
    Ok(())
}

fn verify(
    log: &Path,
    sig: &Path,
    notary: KeyedNotary,
    opts: VerifyOptions,
    json: bool,
) -> Result<VerifyReport> {
    info!(log = %log.display(), sig = %sig.display(), "verifying");
    let report = Verifier::with_options(notary, opts)
        .verify_files(log, sig)
        .with_context(|| format!("verifying {} against {}", log.display(), sig.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &report).context("serialize report")?;
        writeln!(out)?;
    } else {
        for f in &report.failures {
            writeln!(out, "FAIL {f}")?;
        }
        let verdict = if report.is_ok() { "OK" } else { "FAILED" };
        writeln!(
            out,
            "{verdict}: {} block(s), {} record(s), {} failure(s)",
            report.blocks,
            report.records,
            report.failures.len()
        )?;
    }
    Ok(report)
}

fn dump(sig: &Path, verbose: bool) -> Result<()> {
    let f = File::open(sig).with_context(|| format!("open {}", sig.display()))?;
    let mut rdr = TlvReader::new(BufReader::new(f));
    let magic = rdr.read_magic()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "File Header: {}", String::from_utf8_lossy(&magic))?;
    if &magic != LOGSIG_MAGIC {
        bail!("{} is not a signature file", sig.display());
    }
    while let Some(tlv) = rdr
        .read_record()
        .with_context(|| format!("reading {}", sig.display()))?
    {
        print_tlv(&mut out, &tlv, verbose)?;
    }
    Ok(())
}

fn show_state(path: &Path) -> Result<()> {
    let st = StateFile::load(path)?.ok_or_else(|| anyhow!("{} does not exist", path.display()))?;
    println!("Hash Algorithm: {}", name_for_id(st.last_hash.hash_id));
    println!("Last Hash.....: {}", st.last_hash.to_hex());
    Ok(())
}

fn parse_imprint(s: &str) -> Result<Imprint> {
    let bytes = hex::decode(s.trim()).context("anchor is not hex")?;
    let imprint = Imprint::from_bytes(&bytes).ok_or_else(|| anyhow!("anchor is empty"))?;
    if let Some(alg) = imprint.algorithm() {
        if imprint.digest.len() != alg.output_len() {
            bail!(
                "{alg} anchor needs {} digest bytes, got {}",
                alg.output_len(),
                imprint.digest.len()
            );
        }
    }
    Ok(imprint)
}
