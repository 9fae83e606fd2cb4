//! Log framing, transaction writer and resynchronizing replay parser.
//!
//! Every record on disk is exactly [`RECORD_LEN`] bytes. Bit 7 of byte 0
//! separates the two record shapes: clear on chunk headers, set on data
//! records. A chunk header is `'1'` (first chunk) or `'0'` (continuation)
//! in byte 0, the command in byte 1, a little-endian record count in bytes
//! 2..3 and the first [`HASH_LEN`] bytes of the transaction's cumulative
//! SHA-256 in bytes 4..15. The hash runs over the data-record bytes of the
//! whole transaction as they appear on disk, so a commit chunk vouches for
//! every chunk before it.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::warn;

use lamina_store::{FileStore, Handle, StoreError};

use crate::pathkey::{Pathkey, PATHKEY_LEN};
use crate::pathmap::{PathmapError, DIRT, MASK, NOTEXIST, OPAQUE, WHITEOUT};

pub(crate) const RECORD_LEN: usize = PATHKEY_LEN;

/// Records per chunk buffer, header slot included: a chunk is at most
/// 64 KiB on disk.
pub(crate) const CHUNK_RECORDS: usize = 4096;
pub(crate) const CHUNK_BYTES: usize = CHUNK_RECORDS * RECORD_LEN;

/// Stored prefix of the cumulative SHA-256.
pub(crate) const HASH_LEN: usize = 12;

pub(crate) const CHUNK_FIRST: u8 = b'1';
pub(crate) const CHUNK_NEXT: u8 = b'0';

/// Add records to the transaction, keep going.
pub(crate) const CMD_PARTIAL: u8 = b'P';
/// Commit: replace the whole map with the transaction's records.
pub(crate) const CMD_SET: u8 = b'S';
/// Commit: merge the transaction's records into the map.
pub(crate) const CMD_ADD: u8 = b'A';

fn is_cmd(b: u8) -> bool {
    matches!(b, CMD_PARTIAL | CMD_SET | CMD_ADD)
}

/// Buffered 16-byte-record reader over a [`FileStore`] with one byte of
/// pushback, which is all resynchronization needs.
pub(crate) struct LogReader<'a> {
    store: &'a dyn FileStore,
    path: &'a str,
    fh: Handle,
    file_ofs: u64,
    buf: Vec<u8>,
    pos: usize,
    end: usize,
    unread: Option<u8>,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(store: &'a dyn FileStore, path: &'a str, fh: Handle) -> Self {
        Self {
            store,
            path,
            fh,
            file_ofs: 0,
            buf: vec![0u8; CHUNK_BYTES],
            pos: 0,
            end: 0,
            unread: None,
        }
    }

    /// Fill `out` completely, or report end of log. A record cut short by
    /// EOF counts as end of log.
    fn read_full(&mut self, out: &mut [u8]) -> Result<bool, StoreError> {
        let mut n = 0;
        if let Some(b) = self.unread.take() {
            out[0] = b;
            n = 1;
        }
        while n < out.len() {
            if self.pos == self.end {
                let got = self
                    .store
                    .read_at(self.path, self.fh, &mut self.buf, self.file_ofs)?;
                if got == 0 {
                    return Ok(false);
                }
                self.file_ofs += got as u64;
                self.pos = 0;
                self.end = got;
            }
            let take = (out.len() - n).min(self.end - self.pos);
            out[n..n + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            n += take;
        }
        Ok(true)
    }

    fn unread_byte(&mut self, b: u8) {
        debug_assert!(self.unread.is_none());
        self.unread = Some(b);
    }
}

/// Observer for [`read_transaction`]; the diagnostic dump hangs off these
/// hooks, replay uses the silent default.
pub(crate) trait TxnSink {
    fn header(&mut self, _chi: u8, _cmd: u8, _cnt: u16, _sum: &[u8; HASH_LEN], _ofs: u64) {}
    fn record(&mut self, _k: Pathkey, _v: u8) {}
    fn chunk_end(&mut self, _valid: bool, _cmd: u8) {}
}

pub(crate) struct NullSink;

impl TxnSink for NullSink {}

pub(crate) enum Txn {
    /// End of log reached, possibly mid-transaction.
    Eof,
    /// A transaction was found but is torn or fails validation.
    Abort,
    /// A complete, validated transaction.
    Commit {
        replace: bool,
        recs: HashMap<Pathkey, u8>,
    },
}

/// Read one transaction starting at the reader's position.
///
/// Leading trash (the tail of an aborted write) is skipped a record-stride
/// at a time until a first-chunk header appears. A first-chunk header in
/// the middle of a transaction means the transaction was torn by a crash;
/// it is pushed back so the next call restarts there. `ofs` advances by
/// [`RECORD_LEN`] for every full record consumed.
pub(crate) fn read_transaction<S: TxnSink>(
    rdr: &mut LogReader<'_>,
    ofs: &mut u64,
    sink: &mut S,
) -> Result<Txn, StoreError> {
    let mut recs = HashMap::new();
    let mut hsh = Sha256::new();
    let mut ch1 = false;
    let mut valid = true;

    loop {
        let (chi, cmd, cnt, sum) = loop {
            let mut b0 = [0u8; 1];
            if !rdr.read_full(&mut b0)? {
                return Ok(Txn::Eof);
            }
            if ch1 && b0[0] == CHUNK_FIRST {
                // a new transaction where a continuation was expected:
                // the current one was torn
                rdr.unread_byte(b0[0]);
                return Ok(Txn::Abort);
            }
            let mut rest = [0u8; RECORD_LEN - 1];
            if !rdr.read_full(&mut rest)? {
                return Ok(Txn::Eof);
            }
            *ofs += RECORD_LEN as u64;

            let cmd = rest[0];
            if !ch1 {
                if b0[0] == CHUNK_FIRST && is_cmd(cmd) {
                    ch1 = true;
                } else {
                    // trash; keep scanning for a first chunk
                    continue;
                }
            } else if !(b0[0] == CHUNK_NEXT && is_cmd(cmd)) {
                // trash inside a transaction
                return Ok(Txn::Abort);
            }

            let cnt = u16::from_le_bytes([rest[1], rest[2]]);
            let mut sum = [0u8; HASH_LEN];
            sum.copy_from_slice(&rest[3..3 + HASH_LEN]);
            break (b0[0], cmd, cnt, sum);
        };

        sink.header(chi, cmd, cnt, &sum, *ofs - RECORD_LEN as u64);

        let mut idx: u16 = 0;
        while idx < cnt {
            let mut b0 = [0u8; 1];
            if !rdr.read_full(&mut b0)? {
                return Ok(Txn::Eof);
            }
            if b0[0] & DIRT == 0 {
                // a header arrived early; the chunk is short
                rdr.unread_byte(b0[0]);
                break;
            }
            let mut rest = [0u8; RECORD_LEN - 1];
            if !rdr.read_full(&mut rest)? {
                return Ok(Txn::Eof);
            }
            *ofs += RECORD_LEN as u64;

            let mut rec = [0u8; RECORD_LEN];
            rec[0] = b0[0];
            rec[1..].copy_from_slice(&rest);
            hsh.update(rec);

            let v = rec[0] & MASK;
            rec[0] = 0;
            let k = Pathkey::from_bytes(rec);
            recs.insert(k, v);
            sink.record(k, v);
            idx += 1;
        }

        valid = valid && idx == cnt && hsh.clone().finalize()[..HASH_LEN] == sum[..];
        sink.chunk_end(valid, cmd);

        if cmd == CMD_SET || cmd == CMD_ADD {
            if valid {
                return Ok(Txn::Commit {
                    replace: cmd == CMD_SET,
                    recs,
                });
            }
            return Ok(Txn::Abort);
        }
    }
}

/// Replay the whole log into `vm`, leaving `ofs` at the end of file as far
/// as the map is concerned (trailing sub-record bytes excluded).
///
/// Torn or invalid transactions are discarded and parsing resumes at the
/// next first-chunk header; replay never fails on a readable file.
pub(crate) fn replay(
    store: &dyn FileStore,
    path: &str,
    fh: Handle,
    vm: &mut HashMap<Pathkey, u8>,
    ofs: &mut u64,
) -> Result<(), StoreError> {
    let mut rdr = LogReader::new(store, path, fh);
    loop {
        match read_transaction(&mut rdr, ofs, &mut NullSink)? {
            Txn::Eof => return Ok(()),
            Txn::Abort => {
                warn!(path, ofs = *ofs, "discarding invalid path map transaction");
            }
            Txn::Commit { replace, recs } => {
                if replace {
                    vm.clear();
                }
                for (k, v) in recs {
                    match v {
                        WHITEOUT | OPAQUE => {
                            vm.insert(k, v);
                        }
                        NOTEXIST => {
                            vm.remove(&k);
                        }
                        // index values are reserved on replay
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Chunked transaction writer.
///
/// Records accumulate in a 64 KiB buffer behind a header slot; a full
/// buffer flushes as a `P` chunk, [`finish`](TxnWriter::finish) flushes
/// the rest under the commit command. Each flush is one positional write
/// at the growing offset; a short write is fatal.
pub(crate) struct TxnWriter<'a> {
    store: &'a dyn FileStore,
    path: &'a str,
    fh: Handle,
    buf: Vec<u8>,
    hsh: Sha256,
    ptr: usize,
    chi: u8,
    cnt: u16,
    ofs: u64,
}

impl<'a> TxnWriter<'a> {
    pub(crate) fn new(store: &'a dyn FileStore, path: &'a str, fh: Handle, ofs: u64) -> Self {
        Self {
            store,
            path,
            fh,
            buf: vec![0u8; CHUNK_BYTES],
            hsh: Sha256::new(),
            ptr: RECORD_LEN,
            chi: CHUNK_FIRST,
            cnt: 0,
            ofs,
        }
    }

    pub(crate) fn push(&mut self, k: Pathkey, v: u8) -> Result<(), PathmapError> {
        if self.ptr >= self.buf.len() {
            self.flush(CMD_PARTIAL)?;
        }
        let mut rec = *k.as_bytes();
        // the dirty bit keeps a record from ever reading as a header
        rec[0] = DIRT | (v & MASK);
        self.buf[self.ptr..self.ptr + RECORD_LEN].copy_from_slice(&rec);
        self.ptr += RECORD_LEN;
        self.cnt += 1;
        Ok(())
    }

    /// Flush the final chunk under `cmd`, if any record is buffered.
    pub(crate) fn finish(&mut self, cmd: u8) -> Result<(), PathmapError> {
        if self.ptr > RECORD_LEN {
            self.flush(cmd)?;
        }
        Ok(())
    }

    pub(crate) fn ofs(&self) -> u64 {
        self.ofs
    }

    fn flush(&mut self, cmd: u8) -> Result<(), PathmapError> {
        self.hsh.update(&self.buf[RECORD_LEN..self.ptr]);
        let sum = self.hsh.clone().finalize();
        self.buf[0] = self.chi;
        self.buf[1] = cmd;
        self.buf[2..4].copy_from_slice(&self.cnt.to_le_bytes());
        self.buf[4..RECORD_LEN].copy_from_slice(&sum[..HASH_LEN]);

        let n = self
            .store
            .write_at(self.path, self.fh, &self.buf[..self.ptr], self.ofs)
            .map_err(PathmapError::from)?;
        if n != self.ptr {
            return Err(PathmapError::ShortWrite { ofs: self.ofs });
        }
        self.ofs += n as u64;
        self.ptr = RECORD_LEN;
        self.chi = CHUNK_NEXT;
        self.cnt = 0;
        Ok(())
    }
}
