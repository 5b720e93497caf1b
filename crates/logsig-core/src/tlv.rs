//! TLV codec for signature and state files.
//!
//! Wire layout of one record header:
//! - TLV8:  `[flags | type]` `[len]` with `type < 0x20`, `len <= 255`
//! - TLV16: `[0x80 | flags | type >> 8]` `[type & 0xff]` `[len_hi]` `[len_lo]`
//!
//! Flags: `0x40` non-critical, `0x20` forward. A reader that meets a critical
//! record it does not understand fails with [`LogSigError::InvalidTlvType`];
//! non-critical unknowns are skipped.
//!
//! Readers distinguish a *clean* end of stream (`Ok(None)` from
//! [`TlvReader::read_record`]) from a record cut short (`LogSigError::Length`).

use crate::error::{LogSigError, Result};
use crate::records::BlockSig;
use logsig_crypto::Imprint;
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};

/// Signature file magic.
pub const LOGSIG_MAGIC: &[u8; MAGIC_LEN] = b"LOGSIG10";
/// State file magic.
pub const STATE_MAGIC: &[u8; MAGIC_LEN] = b"GTSTAT10";
/// Length of both magics.
pub const MAGIC_LEN: usize = 8;

/// Header uses the 4-byte TLV16 form.
pub const FLAG_TLV16: u8 = 0x80;
/// Unknown record may be skipped.
pub const FLAG_NONCRIT: u8 = 0x40;
/// Unknown record should be forwarded.
pub const FLAG_FORWARD: u8 = 0x20;
/// Type bits stored in the first header byte.
pub const TYPE_MASK: u8 = 0x1f;

const FLAG_BITS: u8 = FLAG_NONCRIT | FLAG_FORWARD;

/// Largest type id expressible in a TLV8 header.
pub const TLV8_MAX_TYPE: u16 = 0x1f;
/// Largest type id expressible at all.
pub const TLV16_MAX_TYPE: u16 = 0x1fff;
/// Largest TLV8 payload.
pub const TLV8_MAX_LEN: usize = 0xff;
/// Largest TLV16 payload.
pub const TLV16_MAX_LEN: usize = 0xffff;

/// Per-record hash (imprint payload).
pub const TLV_RECORD_HASH: u16 = 0x0900;
/// Leaf or interior node hash (imprint payload).
pub const TLV_TREE_HASH: u16 = 0x0901;
/// Block signature (nested TLV payload).
pub const TLV_BLOCK_SIG: u16 = 0x0902;

/// Capacity of the signer's output buffer.
pub const TLV_BUF_SIZE: usize = 4096;

/// One decoded type-length-value record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlv {
    /// Record type id (`0..=0x1fff`).
    pub tlv_type: u16,
    /// Non-critical / forward flag bits.
    pub flags: u8,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Tlv {
    /// Critical record with no flags.
    #[must_use]
    pub const fn new(tlv_type: u16, payload: Vec<u8>) -> Self {
        Self {
            tlv_type,
            flags: 0,
            payload,
        }
    }

    /// Mark the record as non-critical.
    #[must_use]
    pub const fn non_critical(mut self) -> Self {
        self.flags |= FLAG_NONCRIT;
        self
    }

    /// Non-critical flag set.
    #[must_use]
    pub const fn is_non_critical(&self) -> bool {
        self.flags & FLAG_NONCRIT != 0
    }

    /// Forward flag set.
    #[must_use]
    pub const fn is_forward(&self) -> bool {
        self.flags & FLAG_FORWARD != 0
    }

    /// Whether this record needs the TLV16 header form.
    #[must_use]
    pub const fn is_tlv16(&self) -> bool {
        needs_tlv16(self.tlv_type, self.payload.len())
    }

    /// Total bytes on the wire (header + payload).
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        let hdr = if self.is_tlv16() { 4 } else { 2 };
        hdr + self.payload.len()
    }

    /// Append the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        encode_tlv(out, self.tlv_type, self.flags, &self.payload)
    }

    /// Wire form as a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

const fn needs_tlv16(tlv_type: u16, len: usize) -> bool {
    tlv_type > TLV8_MAX_TYPE || len > TLV8_MAX_LEN
}

/// Append a TLV with the given type, flags and payload to `out`.
///
/// # Errors
/// [`LogSigError::Format`] for a type above `0x1fff`,
/// [`LogSigError::Length`] for a payload above 65535 bytes.
pub fn encode_tlv(out: &mut Vec<u8>, tlv_type: u16, flags: u8, payload: &[u8]) -> Result<()> {
    if tlv_type > TLV16_MAX_TYPE {
        return Err(LogSigError::Format(format!(
            "TLV type {tlv_type:#x} exceeds {TLV16_MAX_TYPE:#x}"
        )));
    }
    let len = payload.len();
    if len > TLV16_MAX_LEN {
        return Err(LogSigError::Length(format!(
            "TLV {tlv_type:#06x} payload of {len} bytes exceeds {TLV16_MAX_LEN}"
        )));
    }
    let flags = flags & FLAG_BITS;
    let [type_hi, type_lo] = tlv_type.to_be_bytes();
    if needs_tlv16(tlv_type, len) {
        let [len_hi, len_lo] = u16::try_from(len)
            .map_err(|_| LogSigError::Length(format!("payload of {len} bytes")))?
            .to_be_bytes();
        out.extend_from_slice(&[FLAG_TLV16 | flags | type_hi, type_lo, len_hi, len_lo]);
    } else {
        let len = u8::try_from(len)
            .map_err(|_| LogSigError::Length(format!("payload of {len} bytes")))?;
        out.extend_from_slice(&[flags | type_lo, len]);
    }
    out.extend_from_slice(payload);
    Ok(())
}

/// Number of header bytes announced by the first header byte.
const fn header_len(b0: u8) -> usize {
    if b0 & FLAG_TLV16 != 0 {
        4
    } else {
        2
    }
}

/// Decode `(type, flags, payload_len)` from a complete header.
fn parse_header(hdr: &[u8]) -> (u16, u8, usize) {
    let b0 = hdr[0];
    let flags = b0 & FLAG_BITS;
    if b0 & FLAG_TLV16 != 0 {
        let tlv_type = (u16::from(b0 & TYPE_MASK) << 8) | u16::from(hdr[1]);
        let len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));
        (tlv_type, flags, len)
    } else {
        (u16::from(b0 & TYPE_MASK), flags, usize::from(hdr[1]))
    }
}

/// Decode one TLV from the front of `buf`, returning it and the bytes consumed.
///
/// # Errors
/// [`LogSigError::Eof`] on an empty buffer, [`LogSigError::Length`] when the
/// header or payload runs past the end of `buf`.
pub fn decode_tlv(buf: &[u8]) -> Result<(Tlv, usize)> {
    let b0 = *buf.first().ok_or(LogSigError::Eof)?;
    let hlen = header_len(b0);
    let hdr = buf
        .get(..hlen)
        .ok_or_else(|| LogSigError::Length("truncated TLV header".into()))?;
    let (tlv_type, flags, len) = parse_header(hdr);
    let payload = buf.get(hlen..hlen + len).ok_or_else(|| {
        LogSigError::Length(format!(
            "TLV {tlv_type:#06x} declares {len} bytes, {} available",
            buf.len() - hlen
        ))
    })?;
    Ok((
        Tlv {
            tlv_type,
            flags,
            payload: payload.to_vec(),
        },
        hlen + len,
    ))
}

/// Decode a buffer that consists entirely of TLV records.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Tlv>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (tlv, used) = decode_tlv(buf)?;
        out.push(tlv);
        buf = &buf[used..];
    }
    Ok(out)
}

/// Write one of the 8-byte file magics.
pub fn write_magic<W: Write>(w: &mut W, magic: &[u8; MAGIC_LEN]) -> io::Result<()> {
    w.write_all(magic)
}

/// Shape of the next block in a signature stream, found by
/// [`TlvReader::block_params`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockParams {
    /// The block's closing signature.
    pub block_sig: BlockSig,
    /// Record-hash TLVs seen before the signature.
    pub record_hashes: u64,
    /// Tree-hash TLVs seen before the signature.
    pub tree_hashes: u64,
    /// Offset of the block's first TLV.
    pub start: u64,
    /// Offset just past the block signature.
    pub end: u64,
}

/// A block located by [`TlvReader::block_frame`] whose signature record has
/// not been decoded yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockFrame {
    /// The raw `0x0902` record.
    pub block_sig: Tlv,
    /// Record-hash TLVs seen before the signature.
    pub record_hashes: u64,
    /// Tree-hash TLVs seen before the signature.
    pub tree_hashes: u64,
    /// Offset of the block's first TLV.
    pub start: u64,
    /// Offset just past the block signature.
    pub end: u64,
}

impl BlockFrame {
    /// Decode the signature record.
    ///
    /// # Errors
    /// See [`BlockSig::from_tlv`].
    pub fn decode(self) -> Result<BlockParams> {
        Ok(BlockParams {
            block_sig: BlockSig::from_tlv(&self.block_sig)?,
            record_hashes: self.record_hashes,
            tree_hashes: self.tree_hashes,
            start: self.start,
            end: self.end,
        })
    }
}

impl BlockParams {
    /// The block carries per-record hashes.
    #[must_use]
    pub const fn has_record_hashes(&self) -> bool {
        self.record_hashes > 0
    }

    /// The block carries tree hashes.
    #[must_use]
    pub const fn has_tree_hashes(&self) -> bool {
        self.tree_hashes > 0
    }
}

/// Streaming TLV reader that tracks its byte offset.
#[derive(Debug)]
pub struct TlvReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> TlvReader<R> {
    /// Reader positioned at offset 0 of `inner`.
    pub const fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Reader whose underlying stream is already at `offset`.
    pub const fn with_offset(inner: R, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.offset
    }

    /// Borrow the underlying stream.
    pub const fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the 8-byte magic. A short file yields [`LogSigError::InvalidHeader`].
    pub fn read_magic(&mut self) -> Result<[u8; MAGIC_LEN]> {
        let mut buf = [0u8; MAGIC_LEN];
        let n = self.fill_partial(&mut buf)?;
        if n < MAGIC_LEN {
            return Err(LogSigError::invalid_header(b"8 byte magic", &buf[..n]));
        }
        Ok(buf)
    }

    /// Read the magic and require it to equal `expected`.
    pub fn check_magic(&mut self, expected: &[u8; MAGIC_LEN]) -> Result<()> {
        let found = self.read_magic()?;
        if &found != expected {
            return Err(LogSigError::invalid_header(expected, &found));
        }
        Ok(())
    }

    /// Read the next record. `Ok(None)` means the stream ended exactly on a
    /// record boundary.
    ///
    /// # Errors
    /// [`LogSigError::Length`] if the stream ends inside a record.
    pub fn read_record(&mut self) -> Result<Option<Tlv>> {
        let mut hdr = [0u8; 4];
        if self.fill_partial(&mut hdr[..1])? == 0 {
            return Ok(None);
        }
        let hlen = header_len(hdr[0]);
        self.fill(&mut hdr[1..hlen], "TLV header")?;
        let (tlv_type, flags, len) = parse_header(&hdr[..hlen]);
        let mut payload = vec![0u8; len];
        self.fill(&mut payload, "TLV payload")?;
        Ok(Some(Tlv {
            tlv_type,
            flags,
            payload,
        }))
    }

    /// Read a record that must be present.
    ///
    /// # Errors
    /// [`LogSigError::Eof`] on a clean end of stream.
    pub fn next_record(&mut self) -> Result<Tlv> {
        self.read_record()?.ok_or(LogSigError::Eof)
    }

    /// Read into `buf` until it is full or the stream ends; returns bytes read.
    fn fill_partial(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut got = 0;
        while got < buf.len() {
            match self.inner.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += got as u64;
        Ok(got)
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let start = self.offset;
        let got = self.fill_partial(buf)?;
        if got < buf.len() {
            return Err(LogSigError::Length(format!(
                "truncated {what} at offset {start}: wanted {} bytes, got {got}",
                buf.len()
            )));
        }
        Ok(())
    }
}

impl<R: Read + Seek> TlvReader<R> {
    /// Reposition the reader to an absolute offset.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.offset = self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read the next record without consuming it.
    pub fn peek_record(&mut self) -> Result<Option<Tlv>> {
        let mark = self.offset;
        let rec = self.read_record();
        self.seek_to(mark)?;
        rec
    }

    /// Scan forward to the next block signature and decode it.
    ///
    /// Counts the record and tree hashes in front of it and, when `rewind`
    /// is set, returns the reader to where the scan began so the caller can
    /// replay the block. Without `rewind` the reader is left just past the
    /// signature.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly before any TLV.
    ///
    /// # Errors
    /// Everything [`TlvReader::block_frame`] reports, plus the decode errors
    /// of [`BlockSig::from_tlv`].
    pub fn block_params(&mut self, rewind: bool) -> Result<Option<BlockParams>> {
        self.block_frame(rewind)?.map(BlockFrame::decode).transpose()
    }

    /// Scan forward to the next block signature without decoding it.
    ///
    /// Only framing problems are errors here, so a malformed signature
    /// record still yields a frame whose `end` lets the caller move on to
    /// the next block.
    ///
    /// # Errors
    /// [`LogSigError::NoBlockSig`] if TLVs were found but no signature,
    /// [`LogSigError::InvalidTlvType`] for a critical unknown record,
    /// [`LogSigError::Length`] if the stream ends inside a record.
    pub fn block_frame(&mut self, rewind: bool) -> Result<Option<BlockFrame>> {
        let start = self.offset;
        let mut record_hashes = 0u64;
        let mut tree_hashes = 0u64;
        let mut seen = 0u64;
        loop {
            let Some(tlv) = self.read_record()? else {
                if seen == 0 {
                    return Ok(None);
                }
                return Err(LogSigError::NoBlockSig);
            };
            seen += 1;
            match tlv.tlv_type {
                TLV_RECORD_HASH => record_hashes += 1,
                TLV_TREE_HASH => tree_hashes += 1,
                TLV_BLOCK_SIG => {
                    let end = self.offset;
                    if rewind {
                        self.seek_to(start)?;
                    }
                    return Ok(Some(BlockFrame {
                        block_sig: tlv,
                        record_hashes,
                        tree_hashes,
                        start,
                        end,
                    }));
                }
                _ if tlv.is_non_critical() => {}
                other => return Err(LogSigError::InvalidTlvType(other)),
            }
        }
    }
}

/// Buffered TLV writer with a bounded in-memory buffer.
#[derive(Debug)]
pub struct TlvWriter<W: Write> {
    inner: BufWriter<W>,
    scratch: Vec<u8>,
    written: u64,
}

impl<W: Write> TlvWriter<W> {
    /// Wrap `inner` with a [`TLV_BUF_SIZE`] buffer.
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(TLV_BUF_SIZE, inner),
            scratch: Vec::with_capacity(256),
            written: 0,
        }
    }

    /// Bytes accepted by this writer (buffered or flushed).
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Buffer a file magic.
    pub fn write_magic(&mut self, magic: &[u8; MAGIC_LEN]) -> Result<()> {
        self.inner.write_all(magic)?;
        self.written += MAGIC_LEN as u64;
        Ok(())
    }

    /// Encode and buffer one record.
    pub fn write_tlv(&mut self, tlv: &Tlv) -> Result<()> {
        self.scratch.clear();
        tlv.encode_into(&mut self.scratch)?;
        self.push_scratch()
    }

    /// Buffer an imprint-carrying record (record or tree hash).
    pub fn write_imprint(&mut self, tlv_type: u16, imprint: &Imprint) -> Result<()> {
        self.scratch.clear();
        encode_tlv(&mut self.scratch, tlv_type, 0, &imprint.to_bytes())?;
        self.push_scratch()
    }

    /// Write a block signature and flush everything to the underlying stream.
    ///
    /// The record is encoded completely before any byte of it is written.
    pub fn write_block_sig(&mut self, sig: &BlockSig) -> Result<()> {
        let tlv = sig.to_tlv()?;
        self.write_tlv(&tlv)?;
        self.flush()
    }

    /// Push buffered bytes to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }

    /// Flush and return the underlying stream.
    pub fn into_inner(self) -> Result<W> {
        self.inner
            .into_inner()
            .map_err(|e| LogSigError::Io(e.into_error()))
    }

    /// Return the underlying stream without flushing, along with whatever
    /// was still buffered.
    pub fn into_parts(self) -> (W, Vec<u8>) {
        let (inner, buffered) = self.inner.into_parts();
        (inner, buffered.unwrap_or_else(io::WriterPanicked::into_inner))
    }

    fn push_scratch(&mut self) -> Result<()> {
        self.inner.write_all(&self.scratch)?;
        self.written += self.scratch.len() as u64;
        Ok(())
    }
}
