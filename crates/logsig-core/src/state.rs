//! Durable carry-over between blocks (`GTSTAT10` state file).
//!
//! Layout: 8-byte magic, 1-byte hash id, 1-byte digest length, digest bytes.

use crate::error::{LogSigError, Result};
use crate::records::decode_imprint;
use crate::tlv::{MAGIC_LEN, STATE_MAGIC};
use logsig_crypto::Imprint;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Last hash of the most recently closed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateFile {
    /// Carry-over imprint.
    pub last_hash: Imprint,
}

impl StateFile {
    /// Wrap a carry-over imprint.
    #[must_use]
    pub const fn new(last_hash: Imprint) -> Self {
        Self { last_hash }
    }

    /// Decode from a reader.
    ///
    /// # Errors
    /// [`LogSigError::InvalidHeader`] for a wrong magic, [`LogSigError::Length`]
    /// for a truncated body or a digest length that does not fit the algorithm.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; MAGIC_LEN];
        read_exact_or(r, &mut magic, || {
            LogSigError::invalid_header(STATE_MAGIC, b"short file")
        })?;
        if &magic != STATE_MAGIC {
            return Err(LogSigError::invalid_header(STATE_MAGIC, &magic));
        }

        let mut hdr = [0u8; 2];
        read_exact_or(r, &mut hdr, || {
            LogSigError::Length("state file truncated before digest length".into())
        })?;
        let [hash_id, len] = hdr;

        let mut buf = vec![0u8; 1 + usize::from(len)];
        buf[0] = hash_id;
        read_exact_or(r, &mut buf[1..], || {
            LogSigError::Length(format!("state file digest shorter than {len} bytes"))
        })?;
        Ok(Self::new(decode_imprint(&buf)?))
    }

    /// Encode to a writer.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let len = u8::try_from(self.last_hash.digest.len()).map_err(|_| {
            LogSigError::Length(format!(
                "digest of {} bytes does not fit a state file",
                self.last_hash.digest.len()
            ))
        })?;
        w.write_all(STATE_MAGIC)?;
        w.write_all(&[self.last_hash.hash_id, len])?;
        w.write_all(&self.last_hash.digest)?;
        Ok(())
    }

    /// Read `path`; `Ok(None)` if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let mut f = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::read_from(&mut f).map(Some)
    }

    /// Replace `path` atomically: write a sibling temp file, sync, rename.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        {
            let mut f = File::create(&tmp)?;
            self.write_to(&mut f)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), last_hash = %self.last_hash, "state file stored");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("state"), ToOwned::to_owned);
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_exact_or<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    on_eof: impl FnOnce() -> LogSigError,
) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(on_eof()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logsig_crypto::HashAlgorithm;
    use std::io::Cursor;

    #[test]
    fn layout_is_magic_id_len_digest() {
        let st = StateFile::new(HashAlgorithm::Sha1.digest(b"x"));
        let mut buf = Vec::new();
        st.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"GTSTAT10");
        assert_eq!(buf[8], 0x00);
        assert_eq!(buf[9], 20);
        assert_eq!(buf.len(), 8 + 2 + 20);
        assert_eq!(StateFile::read_from(&mut Cursor::new(buf)).unwrap(), st);
    }

    #[test]
    fn wrong_magic_and_truncation() {
        let e = StateFile::read_from(&mut Cursor::new(b"LOGSIG10\x01\x20".to_vec())).unwrap_err();
        assert!(matches!(e, LogSigError::InvalidHeader { .. }));

        let mut buf = Vec::new();
        StateFile::new(Imprint::zero(HashAlgorithm::Sha256))
            .write_to(&mut buf)
            .unwrap();
        buf.truncate(buf.len() - 1);
        let e = StateFile::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(e, LogSigError::Length(_)));
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log.gtstate");
        assert!(StateFile::load(&path).unwrap().is_none());

        let st = StateFile::new(HashAlgorithm::Sha512.digest(b"carry"));
        st.store(&path).unwrap();
        assert_eq!(StateFile::load(&path).unwrap(), Some(st.clone()));
        assert!(!dir.path().join("app.log.gtstate.tmp").exists());

        let next = StateFile::new(HashAlgorithm::Sha512.digest(b"next"));
        next.store(&path).unwrap();
        assert_eq!(StateFile::load(&path).unwrap(), Some(next));
    }
}
