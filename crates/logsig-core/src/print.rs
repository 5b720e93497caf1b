//! Human-readable rendering of signature-file records (diagnostics only).

use crate::records::{sig_type_name, BlockSig, SigRecord};
use crate::tlv::Tlv;
use logsig_crypto::{name_for_id, Imprint};
use std::io::{self, Write};

/// Bytes of a digest shown in terse mode.
const TERSE_BYTES: usize = 8;

fn hex_field(bytes: &[u8], verbose: bool) -> String {
    if verbose || bytes.len() <= TERSE_BYTES {
        hex::encode(bytes)
    } else {
        format!("{}...", hex::encode(&bytes[..TERSE_BYTES]))
    }
}

fn imprint_field(imprint: &Imprint, verbose: bool) -> String {
    format!(
        "{}:{}",
        name_for_id(imprint.hash_id),
        hex_field(&imprint.digest, verbose)
    )
}

/// Print any known record; unknown types get a generic line.
pub fn print_tlv<W: Write>(w: &mut W, tlv: &Tlv, verbose: bool) -> io::Result<()> {
    match SigRecord::from_tlv(tlv) {
        Ok(rec) => print_record(w, &rec, verbose),
        Err(e) => writeln!(
            w,
            "[{:#06x}]{} record, {} bytes{}",
            tlv.tlv_type,
            if tlv.is_non_critical() { "Non-critical" } else { "Unknown" },
            tlv.payload.len(),
            if verbose {
                format!(": {} ({e})", hex::encode(&tlv.payload))
            } else {
                String::new()
            }
        ),
    }
}

/// Print a decoded record.
pub fn print_record<W: Write>(w: &mut W, rec: &SigRecord, verbose: bool) -> io::Result<()> {
    match rec {
        SigRecord::RecordHash(i) => writeln!(
            w,
            "[{:#06x}]Record Signature Record: {}",
            rec.tlv_type(),
            imprint_field(i, verbose)
        ),
        SigRecord::TreeHash(i) => writeln!(
            w,
            "[{:#06x}]Tree Hash Record:        {}",
            rec.tlv_type(),
            imprint_field(i, verbose)
        ),
        SigRecord::BlockSig(bs) => print_block_sig(w, bs, verbose),
    }
}

/// Print a block signature as an indented field list.
pub fn print_block_sig<W: Write>(w: &mut W, bs: &BlockSig, verbose: bool) -> io::Result<()> {
    writeln!(w, "[{:#06x}]Block Signature Record:", crate::tlv::TLV_BLOCK_SIG)?;
    writeln!(w, "\tHash Algorithm..: {}", name_for_id(bs.hash_id))?;
    writeln!(w, "\tIV..............: {}", hex_field(&bs.iv, verbose))?;
    writeln!(w, "\tLast Hash.......: {}", imprint_field(&bs.last_hash, verbose))?;
    writeln!(w, "\tRecord Count....: {}", bs.record_count)?;
    writeln!(w, "\tSignature Type..: {}", sig_type_name(bs.sig_id))?;
    writeln!(w, "\tSignature Length: {}", bs.signature.len())?;
    if verbose {
        writeln!(w, "\tSignature.......: {}", hex::encode(&bs.signature))?;
    }
    Ok(())
}
