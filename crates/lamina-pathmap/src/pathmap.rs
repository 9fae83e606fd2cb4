//! The path map proper: visibility cells, dirty tracking, persistence
//! policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::debug;

use lamina_store::{FileStore, Handle, StoreError, INVALID_HANDLE};

use crate::log::{self, TxnWriter, CMD_ADD, CMD_SET, RECORD_LEN};
use crate::pathkey::{Pathkey, PathkeyHasher};

/// In-memory only: the cell changed durable kind since the last write.
pub(crate) const DIRT: u8 = 0x80;
pub(crate) const MASK: u8 = 0x7f;

/// Not in the map. Never stored on disk, never set by clients.
pub const UNKNOWN: u8 = MASK;
/// Lower layer suppressed for the whole subtree under this directory.
pub const OPAQUE: u8 = MASK - 1;
/// The lower layer's entry is deleted from the union view.
pub const WHITEOUT: u8 = MASK - 2;
/// Cached "no layer has this path"; persists as absence.
pub const NOTEXIST: u8 = MASK - 3;

/// Largest value a client may pass to [`Pathmap::set`].
pub const MAXVIS: u8 = OPAQUE;
/// Largest index value (a caller-chosen layer ordinal); values above it
/// are sentinels.
pub const MAX_INDEX: u8 = NOTEXIST - 1;

/// Collapse a cell to its durable kind. Opaque and whiteout survive a
/// write; index values, `NOTEXIST` and absence all persist as "not in the
/// file", so transitions among them never need a write.
pub(crate) fn kind(v: u8) -> u8 {
    match v & MASK {
        OPAQUE => OPAQUE,
        WHITEOUT => WHITEOUT,
        _ => UNKNOWN,
    }
}

#[derive(Debug, Error)]
pub enum PathmapError {
    /// File operation on a map constructed without a backing store.
    #[error("path map is memory-only")]
    MemoryOnly,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend accepted fewer bytes than one chunk.
    #[error("short write at offset {ofs}")]
    ShortWrite { ofs: u64 },
}

impl PathmapError {
    /// POSIX errno for integer-speaking callers.
    pub fn errno(&self) -> i32 {
        match self {
            PathmapError::MemoryOnly => libc::EPERM,
            PathmapError::Store(err) => err.errno,
            PathmapError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            PathmapError::ShortWrite { .. } => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, PathmapError>;

/// Statistics about a path map's live cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathmapStats {
    pub whiteouts: usize,
    pub opaques: usize,
    pub indexed: usize,
    pub notexist: usize,
    pub dirty: usize,
}

#[derive(Default)]
pub(crate) struct MapState {
    /// Visibility map: path key to cell byte.
    pub(crate) vm: HashMap<Pathkey, u8>,
    /// Dirty list: keys whose cell has the dirty bit set. Duplicates are
    /// allowed; the map itself deduplicates on write.
    pub(crate) dl: Vec<Pathkey>,
    /// Log end of file as far as the map is concerned.
    pub(crate) ofs: u64,
}

/// Durable map from path keys to visibility cells.
///
/// Readers and mutators synchronize on an internal reader-writer lock held
/// for hash-lookup time only; [`write`](Pathmap::write) serializes on a
/// second lock so a single thread is in the file-write phase, with the
/// state lock taken just in its begin/end brackets.
pub struct Pathmap {
    case_insensitive: bool,
    state: RwLock<MapState>,
    store: Option<Arc<dyn FileStore>>,
    path: String,
    fh: Handle,
    writemux: Mutex<()>,
    pub(crate) dumpmap: RwLock<HashMap<Pathkey, String>>,
}

impl Pathmap {
    /// Open (or create) the map's backing file on `store` and replay every
    /// transaction found in it.
    pub fn open(store: Arc<dyn FileStore>, path: &str, case_insensitive: bool) -> Result<Self> {
        let fh = match store.open(path) {
            Ok(fh) => fh,
            Err(_) => match store.create(path, 0o600) {
                Ok(fh) => fh,
                Err(err) if err.is_enosys() => {
                    store.mknod(path, 0o600)?;
                    store.open(path)?
                }
                Err(err) => return Err(err.into()),
            },
        };

        let mut vm = HashMap::new();
        let mut ofs = 0;
        if let Err(err) = log::replay(store.as_ref(), path, fh, &mut vm, &mut ofs) {
            store.release(path, fh);
            return Err(err.into());
        }
        debug!(path, entries = vm.len(), ofs, "replayed path map");

        Ok(Self {
            case_insensitive,
            state: RwLock::new(MapState {
                vm,
                dl: Vec::new(),
                ofs,
            }),
            store: Some(store),
            path: path.to_string(),
            fh,
            writemux: Mutex::new(()),
            dumpmap: RwLock::new(HashMap::new()),
        })
    }

    /// A map with no backing file. Visibility operations work;
    /// [`write`](Pathmap::write), [`sync`](Pathmap::sync) and
    /// [`dump`](Pathmap::dump) report [`PathmapError::MemoryOnly`].
    pub fn in_memory(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            state: RwLock::new(MapState::default()),
            store: None,
            path: String::new(),
            fh: INVALID_HANDLE,
            writemux: Mutex::new(()),
            dumpmap: RwLock::new(HashMap::new()),
        }
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().vm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the log from the map's point of view.
    pub fn log_len(&self) -> u64 {
        self.state.read().unwrap().ofs
    }

    /// Opaqueness and visibility for a path, in one pass.
    ///
    /// Walks the `/`-separated ancestor prefixes of `path`; if any prefix
    /// is opaque the path is reported opaque. The returned value is the
    /// last lookup's cell (`OPAQUE` on the path itself normalizes to index
    /// 0, so the caller sees it present at layer 0 plus the flag), or
    /// [`UNKNOWN`] when the last prefix is not in the map.
    pub fn get(&self, path: &str) -> (bool, u8) {
        let st = self.state.read().unwrap();
        let mut pkh = PathkeyHasher::new(self.case_insensitive);
        let mut isopq = false;
        let mut last: Option<u8> = None;

        let bytes = path.as_bytes();
        let mut i = 0;
        loop {
            // a run of '/'
            let j = i;
            while i < bytes.len() && bytes[i] == b'/' {
                i += 1;
            }
            if j == i {
                break;
            }
            pkh.update(&path[j..i]);
            if j == 0 {
                last = st.vm.get(&pkh.pathkey()).copied();
                if let Some(v) = last {
                    isopq = isopq || v & MASK == OPAQUE;
                }
            }
            // a segment
            let j = i;
            while i < bytes.len() && bytes[i] != b'/' {
                i += 1;
            }
            if j == i {
                break;
            }
            pkh.update(&path[j..i]);
            last = st.vm.get(&pkh.pathkey()).copied();
            if let Some(v) = last {
                isopq = isopq || v & MASK == OPAQUE;
            }
        }

        match last {
            None => (isopq, UNKNOWN),
            Some(v) => {
                let v = v & MASK;
                (isopq, if v == OPAQUE { 0 } else { v })
            }
        }
    }

    /// Exact lookup of the full path: no ancestor walk, no opaque
    /// propagation.
    pub fn try_get(&self, path: &str) -> Option<u8> {
        let k = Pathkey::compute(path, self.case_insensitive);
        self.state.read().unwrap().vm.get(&k).map(|v| v & MASK)
    }

    /// Whether the path has visibility changes not yet written.
    pub fn is_dirty(&self, path: &str) -> bool {
        let k = Pathkey::compute(path, self.case_insensitive);
        self.state
            .read()
            .unwrap()
            .vm
            .get(&k)
            .is_some_and(|v| v & DIRT != 0)
    }

    /// Set visibility for a path: an index value, [`OPAQUE`], [`WHITEOUT`]
    /// or [`NOTEXIST`].
    ///
    /// # Panics
    ///
    /// Panics when `v` exceeds [`MAXVIS`]; that is a caller bug, not a
    /// runtime condition.
    pub fn set(&self, path: &str, v: u8) {
        assert!(v <= MAXVIS, "invalid visibility value {v:#04x}");
        let k = Pathkey::compute(path, self.case_insensitive);
        let mut st = self.state.write().unwrap();
        let u = st.vm.get(&k).copied().unwrap_or(UNKNOWN);
        Self::set_cell(&mut st, k, u, v);
    }

    /// Like [`set`](Pathmap::set), but a no-op when the path is not
    /// already in the map.
    pub fn set_if(&self, path: &str, v: u8) {
        assert!(v <= MAXVIS, "invalid visibility value {v:#04x}");
        let k = Pathkey::compute(path, self.case_insensitive);
        let mut st = self.state.write().unwrap();
        let Some(&u) = st.vm.get(&k) else {
            return;
        };
        Self::set_cell(&mut st, k, u, v);
    }

    /// Dirtiness is sticky until a write clears it, and only a change of
    /// durable kind sets it; re-indexing a cell from one layer ordinal to
    /// another leaves the file alone.
    fn set_cell(st: &mut MapState, k: Pathkey, u: u8, v: u8) {
        let mut dirt = u & DIRT;
        if dirt == 0 && kind(u) != kind(v) {
            dirt = DIRT;
        }
        st.vm.insert(k, dirt | v);
        if u & DIRT != dirt {
            st.dl.push(k);
        }
    }

    /// Persist pending changes.
    ///
    /// Normally appends one incremental `A` transaction holding only dirty
    /// keys. When the log carries more than 1024 records and over twice as
    /// many records as live cells, it is compacted instead: a full `S`
    /// snapshot appended at end of file, then the same snapshot rewritten
    /// at offset 0 and the file truncated. The appended snapshot is what
    /// makes a torn rewrite recoverable: replay skips the damaged head as
    /// trash and the snapshot replaces the map wholesale.
    ///
    /// Returns `Ok(true)` when on-disk state advanced, `Ok(false)` when
    /// there was nothing to write. On error, every key whose cell was
    /// cleaned for this attempt is re-dirtied so a retry repeats the work.
    pub fn write(&self, sync: bool) -> Result<bool> {
        let Some(store) = self.store.clone() else {
            return Err(PathmapError::MemoryOnly);
        };
        let _serial = self.writemux.lock().unwrap();

        let (ofs, full) = {
            let st = self.state.read().unwrap();
            let cnt = st.ofs / RECORD_LEN as u64;
            (st.ofs, cnt > 1024 && cnt > 2 * st.vm.len() as u64)
        };

        if full {
            self.write_transaction(store.as_ref(), false, ofs, sync)?;
            self.write_transaction(store.as_ref(), false, 0, sync)
        } else {
            self.write_transaction(store.as_ref(), true, ofs, sync)
        }
    }

    /// Fsync the backing file. `ENOSYS` from the backend means the backing
    /// file system does not implement it and counts as success.
    pub fn sync(&self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Err(PathmapError::MemoryOnly);
        };
        self.fsync_tolerant(store.as_ref())
    }

    /// Aggregate counts over the live cells.
    pub fn stats(&self) -> PathmapStats {
        let st = self.state.read().unwrap();
        let mut stats = PathmapStats::default();
        for v in st.vm.values() {
            if v & DIRT != 0 {
                stats.dirty += 1;
            }
            match v & MASK {
                WHITEOUT => stats.whiteouts += 1,
                OPAQUE => stats.opaques += 1,
                NOTEXIST => stats.notexist += 1,
                _ => stats.indexed += 1,
            }
        }
        stats
    }

    /// Drop cached cells that can be recomputed from the backing layers:
    /// clean cells that are neither whiteout nor opaque. Everything
    /// durable and everything still pending a write survives.
    pub fn purge(&self) {
        let mut st = self.state.write().unwrap();
        st.vm
            .retain(|_, v| *v & DIRT != 0 || matches!(*v, WHITEOUT | OPAQUE));
    }

    fn write_transaction(
        &self,
        store: &dyn FileStore,
        incremental: bool,
        ofs0: u64,
        sync: bool,
    ) -> Result<bool> {
        let out = self.write_begin(incremental);
        match self.emit(store, incremental, ofs0, sync, &out) {
            Ok(ofs) => {
                self.state.write().unwrap().ofs = ofs;
                let advanced = ofs != ofs0;
                if advanced {
                    debug!(
                        path = self.path.as_str(),
                        incremental,
                        records = out.len(),
                        ofs,
                        "wrote path map transaction"
                    );
                }
                Ok(advanced)
            }
            Err(err) => {
                self.write_restore(&out);
                Err(err)
            }
        }
    }

    /// Begin bracket, under the state lock: collect the cells to write and
    /// clean their dirty bits. Incremental emits the dirty keys (durable
    /// kinds as themselves, everything else as a `NOTEXIST` deletion);
    /// full emits every durable cell.
    fn write_begin(&self, incremental: bool) -> HashMap<Pathkey, u8> {
        let mut st = self.state.write().unwrap();
        let mut out;

        if incremental {
            let dl = std::mem::take(&mut st.dl);
            out = HashMap::with_capacity(dl.len());
            for k in dl {
                let Some(cell) = st.vm.get_mut(&k) else {
                    out.insert(k, NOTEXIST);
                    continue;
                };
                let v = *cell & MASK;
                *cell = v;
                out.insert(k, if kind(v) == UNKNOWN { NOTEXIST } else { v });
            }
        } else {
            out = HashMap::with_capacity(st.vm.len());
            for (k, cell) in st.vm.iter_mut() {
                let v = *cell & MASK;
                *cell = v;
                if kind(v) != UNKNOWN {
                    out.insert(*k, v);
                }
            }
            st.dl.clear();
        }

        out
    }

    /// Failed-write end bracket: restore the dirty-set invariant for every
    /// cell cleaned in the begin bracket, so the next attempt redoes this
    /// work. A key purged while the write was in flight still owes the
    /// file a deletion record and comes back as dirty `NOTEXIST`.
    fn write_restore(&self, out: &HashMap<Pathkey, u8>) {
        let mut st = self.state.write().unwrap();
        for &k in out.keys() {
            match st.vm.get_mut(&k) {
                Some(cell) if *cell & DIRT == 0 => {
                    *cell |= DIRT;
                    st.dl.push(k);
                }
                Some(_) => {}
                None => {
                    st.vm.insert(k, DIRT | NOTEXIST);
                    st.dl.push(k);
                }
            }
        }
    }

    /// The I/O phase, outside the state lock. Returns the end of file
    /// after the transaction (unchanged when nothing was emitted).
    fn emit(
        &self,
        store: &dyn FileStore,
        incremental: bool,
        ofs0: u64,
        sync: bool,
        out: &HashMap<Pathkey, u8>,
    ) -> Result<u64> {
        let truncate = !incremental && ofs0 == 0;

        let mut txn = TxnWriter::new(store, &self.path, self.fh, ofs0);
        for (&k, &v) in out {
            txn.push(k, v)?;
        }
        txn.finish(if incremental { CMD_ADD } else { CMD_SET })?;
        let ofs = txn.ofs();

        if ofs == ofs0 && !truncate {
            return Ok(ofs);
        }

        if ofs != ofs0 && sync {
            self.fsync_tolerant(store)?;
        }

        if truncate {
            // an empty snapshot still truncates, or a log of dead records
            // would stay bloated forever
            store
                .truncate(&self.path, ofs, self.fh)
                .map_err(PathmapError::from)?;
            if sync {
                self.fsync_tolerant(store)?;
            }
        }

        Ok(ofs)
    }

    fn fsync_tolerant(&self, store: &dyn FileStore) -> Result<()> {
        match store.fsync(&self.path, true, self.fh) {
            Ok(()) => Ok(()),
            Err(err) if err.is_enosys() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn backing(&self) -> Result<(&dyn FileStore, &str, Handle)> {
        match self.store.as_deref() {
            Some(store) => Ok((store, self.path.as_str(), self.fh)),
            None => Err(PathmapError::MemoryOnly),
        }
    }

    pub(crate) fn state(&self) -> &RwLock<MapState> {
        &self.state
    }

    pub(crate) fn pathkey(&self, path: &str) -> Pathkey {
        Pathkey::compute(path, self.case_insensitive)
    }
}

impl Drop for Pathmap {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            store.release(&self.path, self.fh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_collapse() {
        assert_eq!(kind(OPAQUE), OPAQUE);
        assert_eq!(kind(WHITEOUT), WHITEOUT);
        assert_eq!(kind(NOTEXIST), UNKNOWN);
        assert_eq!(kind(UNKNOWN), UNKNOWN);
        assert_eq!(kind(0), UNKNOWN);
        assert_eq!(kind(MAX_INDEX), UNKNOWN);
        assert_eq!(kind(DIRT | WHITEOUT), WHITEOUT);
    }

    #[test]
    fn set_dirties_on_kind_change_only() {
        let pm = Pathmap::in_memory(false);

        // unknown -> index: both persist as absence
        pm.set("/a", 0);
        assert!(!pm.is_dirty("/a"));

        // index -> whiteout: durable kind change
        pm.set("/a", WHITEOUT);
        assert!(pm.is_dirty("/a"));

        // unknown -> whiteout
        pm.set("/b", WHITEOUT);
        assert!(pm.is_dirty("/b"));

        // index -> index on a clean cell
        pm.set("/c", 1);
        pm.set("/c", 2);
        assert!(!pm.is_dirty("/c"));
        assert_eq!(pm.try_get("/c"), Some(2));

        // index -> notexist: both persist as absence
        pm.set("/c", NOTEXIST);
        assert!(!pm.is_dirty("/c"));
    }

    #[test]
    fn dirt_is_sticky() {
        let pm = Pathmap::in_memory(false);
        pm.set("/a", WHITEOUT);
        assert!(pm.is_dirty("/a"));
        // back to the original kind; still pending a write
        pm.set("/a", 0);
        assert!(pm.is_dirty("/a"));
    }

    #[test]
    fn set_if_requires_presence() {
        let pm = Pathmap::in_memory(false);
        pm.set_if("/a", WHITEOUT);
        assert_eq!(pm.try_get("/a"), None);

        pm.set("/a", 1);
        pm.set_if("/a", WHITEOUT);
        assert_eq!(pm.try_get("/a"), Some(WHITEOUT));
    }

    #[test]
    #[should_panic(expected = "invalid visibility value")]
    fn set_rejects_unknown() {
        let pm = Pathmap::in_memory(false);
        pm.set("/a", UNKNOWN);
    }

    #[test]
    fn get_propagates_opaque() {
        let pm = Pathmap::in_memory(false);
        pm.set("/d", OPAQUE);
        pm.set("/d/e/f", 2);

        let (isopq, v) = pm.get("/d/e/f");
        assert!(isopq);
        assert_eq!(v, 2);

        // the opaque directory itself reads as index 0 plus the flag
        let (isopq, v) = pm.get("/d");
        assert!(isopq);
        assert_eq!(v, 0);

        // sibling subtree is untouched
        let (isopq, v) = pm.get("/x/y");
        assert!(!isopq);
        assert_eq!(v, UNKNOWN);
    }

    #[test]
    fn get_boundary_paths() {
        let pm = Pathmap::in_memory(false);

        assert_eq!(pm.get(""), (false, UNKNOWN));
        assert_eq!(pm.get("/"), (false, UNKNOWN));
        // no leading slash: the walk never starts
        assert_eq!(pm.get("a/b"), (false, UNKNOWN));

        pm.set("/x", OPAQUE);
        // trailing slash stops at the empty segment, after seeing /x
        assert_eq!(pm.get("/x/"), (true, 0));

        // repeated slashes hash as written, consistently with set
        pm.set("/a//b", WHITEOUT);
        let (_, v) = pm.get("/a//b");
        assert_eq!(v, WHITEOUT);
    }

    #[test]
    fn try_get_is_exact() {
        let pm = Pathmap::in_memory(false);
        pm.set("/d", OPAQUE);
        // no ancestor walk, no normalization
        assert_eq!(pm.try_get("/d"), Some(OPAQUE));
        assert_eq!(pm.try_get("/d/e"), None);
    }

    #[test]
    fn purge_keeps_durable_and_dirty() {
        let pm = Pathmap::in_memory(false);
        pm.set("/clean-index", 1);
        pm.set("/clean-notexist", NOTEXIST);
        pm.set("/whiteout", WHITEOUT);
        pm.set("/opaque", OPAQUE);
        pm.set("/dirty-index", WHITEOUT);
        pm.set("/dirty-index", 3); // sticky dirt, index kind

        pm.purge();

        assert_eq!(pm.try_get("/clean-index"), None);
        assert_eq!(pm.try_get("/clean-notexist"), None);
        assert_eq!(pm.try_get("/whiteout"), Some(WHITEOUT));
        assert_eq!(pm.try_get("/opaque"), Some(OPAQUE));
        assert_eq!(pm.try_get("/dirty-index"), Some(3));
    }

    #[test]
    fn memory_only_file_operations_fail() {
        let pm = Pathmap::in_memory(false);
        pm.set("/a", WHITEOUT);

        let err = pm.write(false).unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
        let err = pm.sync().unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[test]
    fn case_insensitive_map_folds() {
        let pm = Pathmap::in_memory(true);
        pm.set("/Foo/Bar", WHITEOUT);
        assert_eq!(pm.try_get("/foo/bar"), Some(WHITEOUT));
        assert_eq!(pm.try_get("/FOO/BAR"), Some(WHITEOUT));

        pm.set("/dir", OPAQUE);
        let (isopq, _) = pm.get("/DIR/child");
        assert!(isopq);
    }
}
