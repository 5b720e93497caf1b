//! Typed views over the TLV records found in a signature file.

use crate::error::{LogSigError, Result};
use crate::tlv::{
    decode_all, encode_tlv, Tlv, TLV_BLOCK_SIG, TLV_RECORD_HASH, TLV_TREE_HASH,
};
use logsig_crypto::{HashAlgorithm, Imprint};

/// Block signature child: hash algorithm wire id.
pub const BS_HASH_ALGO: u16 = 0x00;
/// Block signature child: blinding IV.
pub const BS_IV: u16 = 0x01;
/// Block signature child: last hash imprint.
pub const BS_LAST_HASH: u16 = 0x02;
/// Block signature child: record count.
pub const BS_RECORD_COUNT: u16 = 0x03;
/// Block signature child: signature blob, offset by the signature type id.
pub const BS_SIGNATURE_BASE: u16 = 0x0906;

/// RFC 3161-style timestamp token.
pub const SIG_ID_RFC3161: u8 = 0;

/// Display name for a signature type id.
#[must_use]
pub const fn sig_type_name(sig_id: u8) -> &'static str {
    match sig_id {
        SIG_ID_RFC3161 => "RFC3161",
        _ => "[unknown]",
    }
}

/// The closing proof of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSig {
    /// Hash algorithm wire id used throughout the block.
    pub hash_id: u8,
    /// Signature type id of `signature`.
    pub sig_id: u8,
    /// Blinding IV (digest-length bytes).
    pub iv: Vec<u8>,
    /// Final root of the block.
    pub last_hash: Imprint,
    /// Records covered by this block.
    pub record_count: u64,
    /// Opaque notarizer output.
    pub signature: Vec<u8>,
}

impl BlockSig {
    /// Algorithm named by `hash_id`, if known.
    #[must_use]
    pub const fn algorithm(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_wire_id(self.hash_id)
    }

    /// Encode as a `0x0902` record with nested children.
    pub fn to_tlv(&self) -> Result<Tlv> {
        let mut payload = Vec::with_capacity(
            16 + self.iv.len() + self.last_hash.encoded_len() + self.signature.len(),
        );
        encode_tlv(&mut payload, BS_HASH_ALGO, 0, &[self.hash_id])?;
        encode_tlv(&mut payload, BS_IV, 0, &self.iv)?;
        encode_tlv(&mut payload, BS_LAST_HASH, 0, &self.last_hash.to_bytes())?;
        encode_tlv(&mut payload, BS_RECORD_COUNT, 0, &encode_count(self.record_count))?;
        encode_tlv(
            &mut payload,
            BS_SIGNATURE_BASE + u16::from(self.sig_id),
            0,
            &self.signature,
        )?;
        Ok(Tlv::new(TLV_BLOCK_SIG, payload))
    }

    /// Decode a `0x0902` record.
    ///
    /// # Errors
    /// - [`LogSigError::InvalidTlvType`] if `tlv` is not a block signature or a
    ///   mandatory child has the wrong type,
    /// - [`LogSigError::Format`] for a missing child or an empty imprint,
    /// - [`LogSigError::Length`] for IV / count / algorithm size mismatches.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        if tlv.tlv_type != TLV_BLOCK_SIG {
            return Err(LogSigError::InvalidTlvType(tlv.tlv_type));
        }
        let mut children = decode_all(&tlv.payload)?.into_iter();

        let algo = expect_child(&mut children, BS_HASH_ALGO, "hash algorithm")?;
        let [hash_id] = algo.payload[..] else {
            return Err(LogSigError::Length(format!(
                "hash algorithm child is {} bytes, expected 1",
                algo.payload.len()
            )));
        };

        let iv = expect_child(&mut children, BS_IV, "IV")?.payload;
        if let Some(alg) = HashAlgorithm::from_wire_id(hash_id) {
            if iv.len() != alg.output_len() {
                return Err(LogSigError::Length(format!(
                    "IV is {} bytes, {} needs {}",
                    iv.len(),
                    alg,
                    alg.output_len()
                )));
            }
        }

        let last = expect_child(&mut children, BS_LAST_HASH, "last hash")?;
        let last_hash = decode_imprint(&last.payload)?;

        let count = expect_child(&mut children, BS_RECORD_COUNT, "record count")?;
        let record_count = decode_count(&count.payload)?;

        let sig = children
            .next()
            .ok_or_else(|| LogSigError::Format("block signature lacks signature child".into()))?;
        let sig_id = sig
            .tlv_type
            .checked_sub(BS_SIGNATURE_BASE)
            .and_then(|d| u8::try_from(d).ok())
            .ok_or(LogSigError::InvalidTlvType(sig.tlv_type))?;

        if let Some(extra) = children.find(|c| !c.is_non_critical()) {
            return Err(LogSigError::InvalidTlvType(extra.tlv_type));
        }

        Ok(Self {
            hash_id,
            sig_id,
            iv,
            last_hash,
            record_count,
            signature: sig.payload,
        })
    }
}

fn expect_child(
    children: &mut impl Iterator<Item = Tlv>,
    tlv_type: u16,
    what: &str,
) -> Result<Tlv> {
    match children.next() {
        None => Err(LogSigError::Format(format!(
            "block signature lacks {what} child"
        ))),
        Some(c) if c.tlv_type == tlv_type => Ok(c),
        Some(c) => Err(LogSigError::InvalidTlvType(c.tlv_type)),
    }
}

/// Minimal big-endian encoding (1..=8 octets).
#[must_use]
pub fn encode_count(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    bytes[skip..].to_vec()
}

/// Inverse of [`encode_count`]; accepts non-minimal encodings.
pub fn decode_count(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(LogSigError::Length(format!(
            "record count is {} bytes, expected 1..=8",
            bytes.len()
        )));
    }
    Ok(bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Decode an imprint payload, checking the digest length for known algorithms.
pub fn decode_imprint(payload: &[u8]) -> Result<Imprint> {
    let imprint = Imprint::from_bytes(payload)
        .ok_or_else(|| LogSigError::Format("empty imprint".into()))?;
    if let Some(alg) = imprint.algorithm() {
        if imprint.digest.len() != alg.output_len() {
            return Err(LogSigError::Length(format!(
                "{alg} imprint carries {} digest bytes",
                imprint.digest.len()
            )));
        }
    }
    Ok(imprint)
}

/// A decoded signature-file record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigRecord {
    /// `0x0900`
    RecordHash(Imprint),
    /// `0x0901`
    TreeHash(Imprint),
    /// `0x0902`
    BlockSig(BlockSig),
}

impl SigRecord {
    /// Decode a known record kind.
    ///
    /// # Errors
    /// [`LogSigError::InvalidTlvType`] for any other type.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        match tlv.tlv_type {
            TLV_RECORD_HASH => decode_imprint(&tlv.payload).map(Self::RecordHash),
            TLV_TREE_HASH => decode_imprint(&tlv.payload).map(Self::TreeHash),
            TLV_BLOCK_SIG => BlockSig::from_tlv(tlv).map(Self::BlockSig),
            other => Err(LogSigError::InvalidTlvType(other)),
        }
    }

    /// Encode back to a TLV.
    pub fn to_tlv(&self) -> Result<Tlv> {
        match self {
            Self::RecordHash(i) => Ok(Tlv::new(TLV_RECORD_HASH, i.to_bytes())),
            Self::TreeHash(i) => Ok(Tlv::new(TLV_TREE_HASH, i.to_bytes())),
            Self::BlockSig(bs) => bs.to_tlv(),
        }
    }

    /// Wire type id.
    #[must_use]
    pub const fn tlv_type(&self) -> u16 {
        match self {
            Self::RecordHash(_) => TLV_RECORD_HASH,
            Self::TreeHash(_) => TLV_TREE_HASH,
            Self::BlockSig(_) => TLV_BLOCK_SIG,
        }
    }
}
