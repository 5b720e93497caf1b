//! Record sources for signing and verification.
//!
//! A log file is split into records at `\n`; each record keeps its
//! terminator, so a final line without one is still a distinct record.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Iterator over newline-terminated records of a reader.
#[derive(Debug)]
pub struct LineRecords<R> {
    inner: R,
}

impl<R: BufRead> LineRecords<R> {
    /// Split `inner` into records.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: BufRead> Iterator for LineRecords<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        match self.inner.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(buf)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Open a log file as a record stream.
pub fn open_log<P: AsRef<Path>>(path: P) -> io::Result<LineRecords<BufReader<File>>> {
    Ok(LineRecords::new(BufReader::new(File::open(path)?)))
}
