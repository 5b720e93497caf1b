//! Notarizer abstraction for signing and checking block roots.
//!
//! A notarizer turns a block's final root imprint into an opaque signature
//! blob (an RFC 3161 token, a notarization receipt...). The core never looks
//! inside the blob; it only stores it and later hands it back to a
//! [`NotaryVerifier`].
//!
//! ## Contracts implementors should uphold
//! - `sign` is a single blocking attempt. Retrying belongs to the caller.
//! - `verify` returns `Ok(false)` for a well-formed blob that does not match,
//!   and `Err` when the blob cannot be interpreted or the service is down.
//! - Neither function should panic for malformed inputs.
//!
//! [`KeyedNotary`] is a self-contained reference implementation built on a
//! BLAKE3 keyed MAC. It is suitable for tests and closed deployments where
//! signer and verifier share a secret.

use crate::records::SIG_ID_RFC3161;
use blake3::Hasher;
use logsig_crypto::Imprint;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Failures reported by a notarizer.
#[derive(Debug, Error)]
pub enum NotaryError {
    /// The authority could not be reached or did not answer.
    #[error("notarizer unavailable: {0}")]
    Unavailable(String),
    /// The authority refused the request.
    #[error("notarizer rejected request: {0}")]
    Rejected(String),
    /// The blob is not something this verifier understands.
    #[error("malformed signature blob: {0}")]
    Malformed(String),
}

/// Produces a signature blob over a block root.
pub trait Notarizer {
    /// Signature type id written next to the blob.
    fn sig_id(&self) -> u8 {
        SIG_ID_RFC3161
    }

    /// Sign `root`.
    ///
    /// # Errors
    /// Any [`NotaryError`]; the caller keeps the block pending.
    fn sign(&self, root: &Imprint) -> Result<Vec<u8>, NotaryError>;
}

/// Checks a signature blob against a block root.
pub trait NotaryVerifier {
    /// `Ok(true)` if `blob` is a valid signature over `root`.
    ///
    /// # Errors
    /// [`NotaryError`] when the blob cannot be evaluated at all.
    fn verify(&self, root: &Imprint, blob: &[u8]) -> Result<bool, NotaryError>;
}

impl<T: Notarizer + ?Sized> Notarizer for &T {
    fn sig_id(&self) -> u8 {
        (**self).sig_id()
    }

    fn sign(&self, root: &Imprint) -> Result<Vec<u8>, NotaryError> {
        (**self).sign(root)
    }
}

impl<T: Notarizer + ?Sized> Notarizer for Box<T> {
    fn sig_id(&self) -> u8 {
        (**self).sig_id()
    }

    fn sign(&self, root: &Imprint) -> Result<Vec<u8>, NotaryError> {
        (**self).sign(root)
    }
}

impl<T: NotaryVerifier + ?Sized> NotaryVerifier for &T {
    fn verify(&self, root: &Imprint, blob: &[u8]) -> Result<bool, NotaryError> {
        (**self).verify(root, blob)
    }
}

impl<T: NotaryVerifier + ?Sized> NotaryVerifier for Box<T> {
    fn verify(&self, root: &Imprint, blob: &[u8]) -> Result<bool, NotaryError> {
        (**self).verify(root, blob)
    }
}

/// Blob format version produced by [`KeyedNotary`].
pub const KEYED_BLOB_VERSION: u8 = 1;

const KEYED_DOMAIN: &[u8] = b"logsig.notary.keyed.v1";
const MAC_LEN: usize = 32;

/// Reference notarizer: BLAKE3 keyed MAC over authority, time and root.
///
/// Blob layout: `version (1) || unix_secs (8, BE) || authority_len (2, BE) ||
/// authority || mac (32)`.
#[derive(Clone)]
pub struct KeyedNotary {
    authority: String,
    key: [u8; 32],
    fixed_time: Option<u64>,
}

impl std::fmt::Debug for KeyedNotary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedNotary")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

/// Fields recovered from a [`KeyedNotary`] blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedReceipt {
    /// Seconds since the Unix epoch at signing.
    pub timestamp: u64,
    /// Authority that signed.
    pub authority: String,
}

impl KeyedNotary {
    /// Notarizer for `authority` with a 32-byte secret.
    #[must_use]
    pub fn new(authority: impl Into<String>, key: [u8; 32]) -> Self {
        Self {
            authority: authority.into(),
            key,
            fixed_time: None,
        }
    }

    /// Parse a 64-hex-digit key.
    ///
    /// # Errors
    /// [`NotaryError::Malformed`] if `hex_key` is not exactly 32 bytes of hex.
    pub fn from_hex_key(authority: impl Into<String>, hex_key: &str) -> Result<Self, NotaryError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| NotaryError::Malformed(format!("key is not hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| NotaryError::Malformed(format!("key is {} bytes, expected 32", v.len())))?;
        Ok(Self::new(authority, key))
    }

    /// Stamp every signature with `secs` instead of the wall clock.
    #[must_use]
    pub const fn with_fixed_time(mut self, secs: u64) -> Self {
        self.fixed_time = Some(secs);
        self
    }

    /// Identity this notarizer signs as.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Decode a blob's header fields without checking the MAC.
    ///
    /// # Errors
    /// [`NotaryError::Malformed`] for an unknown version or bad lengths.
    pub fn parse_blob(blob: &[u8]) -> Result<(KeyedReceipt, &[u8]), NotaryError> {
        let malformed = |what: &str| NotaryError::Malformed(what.to_owned());
        let (&version, rest) = blob.split_first().ok_or_else(|| malformed("empty blob"))?;
        if version != KEYED_BLOB_VERSION {
            return Err(NotaryError::Malformed(format!("unknown blob version {version}")));
        }
        let (ts, rest) = split_array::<8>(rest).ok_or_else(|| malformed("truncated timestamp"))?;
        let (alen, rest) = split_array::<2>(rest).ok_or_else(|| malformed("truncated authority"))?;
        let alen = usize::from(u16::from_be_bytes(alen));
        if rest.len() != alen + MAC_LEN {
            return Err(malformed("blob length does not match authority length"));
        }
        let (authority, mac) = rest.split_at(alen);
        let authority = std::str::from_utf8(authority)
            .map_err(|_| malformed("authority is not UTF-8"))?
            .to_owned();
        Ok((
            KeyedReceipt {
                timestamp: u64::from_be_bytes(ts),
                authority,
            },
            mac,
        ))
    }

    fn now(&self) -> u64 {
        self.fixed_time.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs())
        })
    }

    fn mac(&self, timestamp: u64, authority: &str, root: &Imprint) -> blake3::Hash {
        let mut h = Hasher::new_keyed(&self.key);
        h.update(KEYED_DOMAIN);
        h.update(&timestamp.to_be_bytes());
        h.update(&(authority.len() as u64).to_be_bytes());
        h.update(authority.as_bytes());
        h.update(&root.to_bytes());
        h.finalize()
    }
}

fn split_array<const N: usize>(bytes: &[u8]) -> Option<([u8; N], &[u8])> {
    if bytes.len() < N {
        return None;
    }
    let (head, tail) = bytes.split_at(N);
    head.try_into().ok().map(|a| (a, tail))
}

impl Notarizer for KeyedNotary {
    fn sign(&self, root: &Imprint) -> Result<Vec<u8>, NotaryError> {
        let alen = u16::try_from(self.authority.len())
            .map_err(|_| NotaryError::Rejected("authority id longer than 65535 bytes".into()))?;
        let ts = self.now();
        let mac = self.mac(ts, &self.authority, root);

        let mut blob = Vec::with_capacity(1 + 8 + 2 + self.authority.len() + MAC_LEN);
        blob.push(KEYED_BLOB_VERSION);
        blob.extend_from_slice(&ts.to_be_bytes());
        blob.extend_from_slice(&alen.to_be_bytes());
        blob.extend_from_slice(self.authority.as_bytes());
        blob.extend_from_slice(mac.as_bytes());
        Ok(blob)
    }
}

impl NotaryVerifier for KeyedNotary {
    fn verify(&self, root: &Imprint, blob: &[u8]) -> Result<bool, NotaryError> {
        let (receipt, mac) = Self::parse_blob(blob)?;
        if receipt.authority != self.authority {
            return Ok(false);
        }
        let mac: [u8; MAC_LEN] = mac
            .try_into()
            .map_err(|_| NotaryError::Malformed("bad MAC length".into()))?;
        // blake3::Hash equality is constant time.
        Ok(self.mac(receipt.timestamp, &receipt.authority, root) == blake3::Hash::from(mac))
    }
}
