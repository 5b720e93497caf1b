// crates/logsig-crypto/src/lib.rs

//! Hash substrate for LOGSIG: algorithm identifiers, a digest adapter and imprints.
//!
//! The signing engine never talks to a hash library directly. It names an
//! algorithm through [`HashAlgorithm`], feeds bytes into a [`Hasher`] and gets
//! back an [`Imprint`] (wire hash id + digest). The wire ids are stable and
//! independent of any library's internal enumeration:
//!
//! | algorithm  | id   | digest length |
//! |------------|------|---------------|
//! | SHA-1      | 0x00 | 20            |
//! | SHA2-256   | 0x01 | 32            |
//! | RIPEMD-160 | 0x02 | 20            |
//! | SHA2-224   | 0x03 | 28            |
//! | SHA2-384   | 0x04 | 48            |
//! | SHA2-512   | 0x05 | 64            |
//!
//! Unknown ids map to [`UNKNOWN_HASH_ID`]; lengths for unknown ids default to 32.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Wire id reported for algorithms this crate does not know.
pub const UNKNOWN_HASH_ID: u8 = 0xff;

/// Digest length assumed for unknown/unset algorithm ids (SHA2-256).
pub const DEFAULT_DIGEST_LEN: usize = 32;

/// Hash algorithms usable for record, tree and IV hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy; kept for reading old signature files).
    Sha1,
    /// SHA2-256, the default.
    #[default]
    Sha256,
    /// RIPEMD-160.
    Ripemd160,
    /// SHA2-224.
    Sha224,
    /// SHA2-384.
    Sha384,
    /// SHA2-512.
    Sha512,
}

impl HashAlgorithm {
    /// All supported algorithms, in wire-id order.
    pub const ALL: [Self; 6] = [
        Self::Sha1,
        Self::Sha256,
        Self::Ripemd160,
        Self::Sha224,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Stable one-byte identifier written into signature and state files.
    #[inline]
    #[must_use]
    pub const fn wire_id(self) -> u8 {
        match self {
            Self::Sha1 => 0x00,
            Self::Sha256 => 0x01,
            Self::Ripemd160 => 0x02,
            Self::Sha224 => 0x03,
            Self::Sha384 => 0x04,
            Self::Sha512 => 0x05,
        }
    }

    /// Inverse of [`HashAlgorithm::wire_id`].
    #[must_use]
    pub const fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Sha1),
            0x01 => Some(Self::Sha256),
            0x02 => Some(Self::Ripemd160),
            0x03 => Some(Self::Sha224),
            0x04 => Some(Self::Sha384),
            0x05 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Digest output length in octets.
    #[inline]
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha1 | Self::Ripemd160 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Canonical display name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA2-256",
            Self::Ripemd160 => "RIPEMD-160",
            Self::Sha224 => "SHA2-224",
            Self::Sha384 => "SHA2-384",
            Self::Sha512 => "SHA2-512",
        }
    }

    /// Start an incremental hash computation.
    #[must_use]
    pub fn hasher(self) -> Hasher {
        Hasher::new(self)
    }

    /// One-shot digest of `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Imprint {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when an algorithm name is not recognised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownAlgorithm(pub String);

impl fmt::Display for UnknownAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hash algorithm '{}'", self.0)
    }
}

impl std::error::Error for UnknownAlgorithm {}

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase();
        let alg = match norm.as_str() {
            "SHA1" | "SHA-1" => Self::Sha1,
            "SHA2-256" | "SHA-256" | "SHA256" => Self::Sha256,
            "RIPEMD-160" | "RIPEMD160" => Self::Ripemd160,
            "SHA2-224" | "SHA-224" | "SHA224" => Self::Sha224,
            "SHA2-384" | "SHA-384" | "SHA384" => Self::Sha384,
            "SHA2-512" | "SHA-512" | "SHA512" => Self::Sha512,
            _ => return Err(UnknownAlgorithm(s.to_owned())),
        };
        Ok(alg)
    }
}

/// Digest length for a raw wire id (32 for unknown ids).
#[must_use]
pub fn output_len_for_id(id: u8) -> usize {
    HashAlgorithm::from_wire_id(id).map_or(DEFAULT_DIGEST_LEN, HashAlgorithm::output_len)
}

/// Display name for a raw wire id.
#[must_use]
pub fn name_for_id(id: u8) -> &'static str {
    HashAlgorithm::from_wire_id(id).map_or("[unknown]", HashAlgorithm::name)
}

/* ------------------------------- Hasher ----------------------------------- */

/// Algorithm-agnostic incremental hasher.
#[derive(Clone)]
pub enum Hasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA2-256 state.
    Sha256(Sha256),
    /// RIPEMD-160 state.
    Ripemd160(Ripemd160),
    /// SHA2-224 state.
    Sha224(Sha224),
    /// SHA2-384 state.
    Sha384(Sha384),
    /// SHA2-512 state.
    Sha512(Sha512),
}

impl Hasher {
    /// Fresh state for `alg`.
    #[must_use]
    pub fn new(alg: HashAlgorithm) -> Self {
        match alg {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Ripemd160 => Self::Ripemd160(Ripemd160::new()),
            HashAlgorithm::Sha224 => Self::Sha224(Sha224::new()),
            HashAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    /// Algorithm this state computes.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Ripemd160(_) => HashAlgorithm::Ripemd160,
            Self::Sha224(_) => HashAlgorithm::Sha224,
            Self::Sha384(_) => HashAlgorithm::Sha384,
            Self::Sha512(_) => HashAlgorithm::Sha512,
        }
    }

    /// Absorb raw bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
            Self::Ripemd160(h) => h.update(bytes),
            Self::Sha224(h) => h.update(bytes),
            Self::Sha384(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }

    /// Absorb an imprint in its wire form (hash id byte, then digest).
    pub fn update_imprint(&mut self, imprint: &Imprint) {
        self.update(&[imprint.hash_id]);
        self.update(&imprint.digest);
    }

    /// Finish and return the digest tagged with this hasher's algorithm.
    #[must_use]
    pub fn finalize(self) -> Imprint {
        let alg = self.algorithm();
        let digest = match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Ripemd160(h) => h.finalize().to_vec(),
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        };
        Imprint::new(alg, digest)
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

/* ------------------------------- Imprint ---------------------------------- */

/// A digest tagged with the wire id of the algorithm that produced it.
///
/// `hash_id` is kept raw so imprints read from disk with an unknown id can
/// still be carried around and reported.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Imprint {
    /// Wire hash algorithm id.
    pub hash_id: u8,
    /// Digest bytes.
    #[serde(with = "hex::serde")]
    pub digest: Vec<u8>,
}

impl Imprint {
    /// Tag `digest` with `alg`.
    #[inline]
    #[must_use]
    pub fn new(alg: HashAlgorithm, digest: Vec<u8>) -> Self {
        Self {
            hash_id: alg.wire_id(),
            digest,
        }
    }

    /// All-zero digest for `alg`; the start of a fresh hash chain.
    #[must_use]
    pub fn zero(alg: HashAlgorithm) -> Self {
        Self::new(alg, vec![0u8; alg.output_len()])
    }

    /// Decode from wire form (`hash_id || digest`). `None` for an empty slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&hash_id, digest) = bytes.split_first()?;
        Some(Self {
            hash_id,
            digest: digest.to_vec(),
        })
    }

    /// Wire form: hash id byte followed by the digest.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.digest.len());
        out.push(self.hash_id);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Length of the wire form.
    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.digest.len()
    }

    /// The algorithm, if the id is known.
    #[inline]
    #[must_use]
    pub const fn algorithm(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_wire_id(self.hash_id)
    }

    /// Lowercase hex of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl fmt::Debug for Imprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imprint({:#04x}:{})", self.hash_id, self.to_hex())
    }
}

impl fmt::Display for Imprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", name_for_id(self.hash_id), self.to_hex())
    }
}
