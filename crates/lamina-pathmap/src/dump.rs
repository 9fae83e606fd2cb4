//! Diagnostic dumps of the log file and of the live map.
//!
//! Best-effort tooling: the reverse index of known paths is optional and
//! nothing here mutates map state.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::log::{
    self, LogReader, Txn, TxnSink, CHUNK_FIRST, CMD_ADD, CMD_PARTIAL, CMD_SET, HASH_LEN,
};
use crate::pathkey::Pathkey;
use crate::pathmap::{Pathmap, Result, DIRT, MASK, NOTEXIST, OPAQUE, UNKNOWN, WHITEOUT};

impl Pathmap {
    /// Register a known path so dumps can print it next to its key.
    pub fn add_dump_path(&self, path: &str) {
        let k = self.pathkey(path);
        self.dumpmap.write().unwrap().insert(k, path.to_string());
    }

    /// Write every live cell to `w`, sorted by display id so output is
    /// stable across runs.
    pub fn dump_mem(&self, w: &mut dyn Write) -> Result<()> {
        let st = self.state().read().unwrap();
        let dm = self.dumpmap.read().unwrap();

        let mut keys: Vec<Pathkey> = st.vm.keys().copied().collect();
        keys.sort_by_cached_key(|k| ktoid(k, &dm));

        for k in keys {
            dump_kv(w, k, st.vm[&k], &dm)?;
        }
        Ok(())
    }

    /// Replay the on-disk log into `w` as a human-readable trace: one line
    /// per header, one per record, `COMMIT SET`/`COMMIT ADD`/`ABORT` per
    /// transaction. The in-memory map is untouched.
    pub fn dump(&self, w: &mut dyn Write) -> Result<()> {
        let (store, path, fh) = self.backing()?;
        let dm = self.dumpmap.read().unwrap();

        let mut rdr = LogReader::new(store, path, fh);
        let mut ofs = 0u64;
        let mut sink = TraceSink {
            w,
            dm: &dm,
            status: Ok(()),
        };

        loop {
            match log::read_transaction(&mut rdr, &mut ofs, &mut sink)? {
                Txn::Eof => break,
                Txn::Abort | Txn::Commit { .. } => {}
            }
            if sink.status.is_err() {
                break;
            }
        }
        sink.status?;
        Ok(())
    }
}

struct TraceSink<'a> {
    w: &'a mut dyn Write,
    dm: &'a HashMap<Pathkey, String>,
    status: io::Result<()>,
}

impl TxnSink for TraceSink<'_> {
    fn header(&mut self, chi: u8, cmd: u8, cnt: u16, sum: &[u8; HASH_LEN], ofs: u64) {
        if self.status.is_err() {
            return;
        }
        let tag = if chi == CHUNK_FIRST { "BEGIN" } else { "CHUNK" };
        let sumhex: String = sum.iter().map(|b| format!("{b:02x}")).collect();
        self.status = writeln!(
            self.w,
            "{tag} ({}{}) count={cnt} hash={sumhex} (ofs={ofs:08x})",
            chi as char, cmd as char
        );
    }

    fn record(&mut self, k: Pathkey, v: u8) {
        if self.status.is_err() {
            return;
        }
        self.status = dump_kv(self.w, k, v, self.dm);
    }

    fn chunk_end(&mut self, valid: bool, cmd: u8) {
        if self.status.is_err() || cmd == CMD_PARTIAL {
            return;
        }
        self.status = match (valid, cmd) {
            (true, CMD_SET) => writeln!(self.w, "COMMIT SET"),
            (true, CMD_ADD) => writeln!(self.w, "COMMIT ADD"),
            _ => writeln!(self.w, "ABORT"),
        };
    }
}

fn dump_kv(
    w: &mut dyn Write,
    k: Pathkey,
    cell: u8,
    dm: &HashMap<Pathkey, String>,
) -> io::Result<()> {
    let dirt = if cell & DIRT != 0 { 'D' } else { '-' };
    let name = match cell & MASK {
        UNKNOWN => "unknown".to_string(),
        OPAQUE => "opaque".to_string(),
        WHITEOUT => "whiteout".to_string(),
        NOTEXIST => "notexist".to_string(),
        v => v.to_string(),
    };
    writeln!(w, "{dirt} {name:<13} {}", ktoa(&k, dm))
}

fn hex8(k: &Pathkey) -> String {
    k.as_bytes()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn ktoa(k: &Pathkey, dm: &HashMap<Pathkey, String>) -> String {
    match dm.get(k) {
        Some(path) => format!("{} ({path})", hex8(k)),
        None => hex8(k),
    }
}

/// Sort id: known paths group and order by name, unknown keys by hex.
fn ktoid(k: &Pathkey, dm: &HashMap<Pathkey, String>) -> String {
    match dm.get(k) {
        Some(path) => format!("({path}) {}", hex8(k)),
        None => hex8(k),
    }
}
