//! # lamina-store
//!
//! Positional-I/O storage backends for the Lamina path map.
//!
//! The path map never touches the OS directly; it consumes the narrow
//! [`FileStore`] interface, POSIX-flavored: files are addressed by path
//! plus an opaque [`Handle`], and errors carry an errno. Two backends are
//! provided:
//!
//! - [`DiskStore`]: a directory-rooted implementation over `std::fs`
//! - [`MemStore`]: in-memory files with fault injection, for tests and
//!   ephemeral maps

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

/// Opaque file handle issued by a [`FileStore`].
pub type Handle = u64;

/// Handle value that never names an open file.
pub const INVALID_HANDLE: Handle = u64::MAX;

/// Storage error carrying a POSIX errno.
#[derive(Debug, Error)]
#[error("storage error (errno {errno})")]
pub struct StoreError {
    pub errno: i32,
}

impl StoreError {
    pub fn from_errno(errno: i32) -> Self {
        Self { errno }
    }

    /// The backend does not implement the operation.
    pub fn is_enosys(&self) -> bool {
        self.errno == libc::ENOSYS
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Narrow positional-I/O interface the path map consumes.
///
/// `create` may report `ENOSYS`, in which case callers fall back to
/// `mknod` followed by `open`. `read_at` returns 0 at end of file;
/// `read_at`/`write_at` may transfer fewer bytes than requested.
pub trait FileStore: Send + Sync {
    fn open(&self, path: &str) -> Result<Handle>;
    fn create(&self, path: &str, mode: u32) -> Result<Handle>;
    fn mknod(&self, path: &str, mode: u32) -> Result<()>;
    fn read_at(&self, path: &str, fh: Handle, buf: &mut [u8], ofs: u64) -> Result<usize>;
    fn write_at(&self, path: &str, fh: Handle, buf: &[u8], ofs: u64) -> Result<usize>;
    fn fsync(&self, path: &str, datasync: bool, fh: Handle) -> Result<()>;
    fn truncate(&self, path: &str, len: u64, fh: Handle) -> Result<()>;
    fn release(&self, path: &str, fh: Handle);
}

/// Directory-rooted [`FileStore`] over the local filesystem.
pub struct DiskStore {
    root: PathBuf,
    files: Mutex<HashMap<Handle, File>>,
    next: AtomicU64,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            files: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn insert(&self, file: File) -> Handle {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.files.lock().unwrap().insert(fh, file);
        fh
    }

    fn with_file<T>(&self, fh: Handle, f: impl FnOnce(&File) -> io::Result<T>) -> Result<T> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(&fh)
            .ok_or_else(|| StoreError::from_errno(libc::EBADF))?;
        f(file).map_err(StoreError::from)
    }
}

impl FileStore for DiskStore {
    fn open(&self, path: &str) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.resolve(path))?;
        Ok(self.insert(file))
    }

    fn create(&self, path: &str, mode: u32) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(self.resolve(path))?;
        debug!(path, "created backing file");
        Ok(self.insert(file))
    }

    fn mknod(&self, path: &str, mode: u32) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.resolve(path))?;
        Ok(())
    }

    fn read_at(&self, _path: &str, fh: Handle, buf: &mut [u8], ofs: u64) -> Result<usize> {
        self.with_file(fh, |f| f.read_at(buf, ofs))
    }

    fn write_at(&self, _path: &str, fh: Handle, buf: &[u8], ofs: u64) -> Result<usize> {
        self.with_file(fh, |f| f.write_at(buf, ofs))
    }

    fn fsync(&self, _path: &str, datasync: bool, fh: Handle) -> Result<()> {
        self.with_file(fh, |f| {
            if datasync {
                f.sync_data()
            } else {
                f.sync_all()
            }
        })
    }

    fn truncate(&self, _path: &str, len: u64, fh: Handle) -> Result<()> {
        self.with_file(fh, |f| f.set_len(len))
    }

    fn release(&self, _path: &str, fh: Handle) {
        self.files.lock().unwrap().remove(&fh);
    }
}

#[derive(Default)]
struct MemInner {
    files: HashMap<String, Vec<u8>>,
    handles: HashMap<Handle, String>,
}

/// In-memory [`FileStore`] with fault injection.
///
/// Injected errno values apply until cleared with 0. `set_create_errno`
/// with `ENOSYS` exercises the `mknod` + `open` fallback path.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
    next: AtomicU64,
    write_errno: AtomicI32,
    fsync_errno: AtomicI32,
    truncate_errno: AtomicI32,
    create_errno: AtomicI32,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn set_write_errno(&self, errno: i32) {
        self.write_errno.store(errno, Ordering::Relaxed);
    }

    pub fn set_fsync_errno(&self, errno: i32) {
        self.fsync_errno.store(errno, Ordering::Relaxed);
    }

    pub fn set_truncate_errno(&self, errno: i32) {
        self.truncate_errno.store(errno, Ordering::Relaxed);
    }

    pub fn set_create_errno(&self, errno: i32) {
        self.create_errno.store(errno, Ordering::Relaxed);
    }

    /// Current contents of a file, if it exists.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    /// Replace a file's contents wholesale, creating it if absent.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.inner.lock().unwrap().files.insert(path.to_string(), data);
    }

    /// Cut a file to `len` bytes behind any open handles, simulating a
    /// crash that tore the tail off.
    pub fn chop(&self, path: &str, len: usize) {
        if let Some(data) = self.inner.lock().unwrap().files.get_mut(path) {
            data.truncate(len);
        }
    }

    fn injected(errno: &AtomicI32) -> Result<()> {
        match errno.load(Ordering::Relaxed) {
            0 => Ok(()),
            e => Err(StoreError::from_errno(e)),
        }
    }
}

impl FileStore for MemStore {
    fn open(&self, path: &str) -> Result<Handle> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.files.contains_key(path) {
            return Err(StoreError::from_errno(libc::ENOENT));
        }
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        inner.handles.insert(fh, path.to_string());
        Ok(fh)
    }

    fn create(&self, path: &str, _mode: u32) -> Result<Handle> {
        Self::injected(&self.create_errno)?;
        let mut inner = self.inner.lock().unwrap();
        inner.files.entry(path.to_string()).or_default();
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        inner.handles.insert(fh, path.to_string());
        Ok(fh)
    }

    fn mknod(&self, path: &str, _mode: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(path) {
            return Err(StoreError::from_errno(libc::EEXIST));
        }
        inner.files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn read_at(&self, _path: &str, fh: Handle, buf: &mut [u8], ofs: u64) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        let name = inner
            .handles
            .get(&fh)
            .ok_or_else(|| StoreError::from_errno(libc::EBADF))?;
        let data = &inner.files[name];
        let ofs = ofs as usize;
        if ofs >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        Ok(n)
    }

    fn write_at(&self, _path: &str, fh: Handle, buf: &[u8], ofs: u64) -> Result<usize> {
        Self::injected(&self.write_errno)?;
        let mut inner = self.inner.lock().unwrap();
        let name = inner
            .handles
            .get(&fh)
            .ok_or_else(|| StoreError::from_errno(libc::EBADF))?
            .clone();
        let data = inner.files.get_mut(&name).unwrap();
        let ofs = ofs as usize;
        if data.len() < ofs + buf.len() {
            data.resize(ofs + buf.len(), 0);
        }
        data[ofs..ofs + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn fsync(&self, _path: &str, _datasync: bool, _fh: Handle) -> Result<()> {
        Self::injected(&self.fsync_errno)
    }

    fn truncate(&self, _path: &str, len: u64, fh: Handle) -> Result<()> {
        Self::injected(&self.truncate_errno)?;
        let mut inner = self.inner.lock().unwrap();
        let name = inner
            .handles
            .get(&fh)
            .ok_or_else(|| StoreError::from_errno(libc::EBADF))?
            .clone();
        inner.files.get_mut(&name).unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn release(&self, _path: &str, fh: Handle) {
        self.inner.lock().unwrap().handles.remove(&fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        let fh = store.create("map.bin", 0o600).unwrap();
        assert_eq!(store.write_at("map.bin", fh, b"hello", 0).unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(store.read_at("map.bin", fh, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        store.release("map.bin", fh);
        let fh = store.open("map.bin").unwrap();
        assert_eq!(store.read_at("map.bin", fh, &mut buf, 0).unwrap(), 5);
        store.release("map.bin", fh);
    }

    #[test]
    fn disk_store_read_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        let fh = store.create("map.bin", 0o600).unwrap();
        store.write_at("map.bin", fh, b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(store.read_at("map.bin", fh, &mut buf, 100).unwrap(), 0);
        store.release("map.bin", fh);
    }

    #[test]
    fn disk_store_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();

        let fh = store.create("map.bin", 0o600).unwrap();
        store.write_at("map.bin", fh, &[0xffu8; 64], 0).unwrap();
        store.truncate("map.bin", 16, fh).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(store.read_at("map.bin", fh, &mut buf, 0).unwrap(), 16);
        store.release("map.bin", fh);
    }

    #[test]
    fn disk_store_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let err = store.open("nope.bin").unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }

    #[test]
    fn disk_store_bad_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let mut buf = [0u8; 4];
        let err = store.read_at("x", INVALID_HANDLE, &mut buf, 0).unwrap_err();
        assert_eq!(err.errno, libc::EBADF);
    }

    #[test]
    fn mem_store_sparse_write() {
        let store = MemStore::new();
        let fh = store.create("f", 0o600).unwrap();
        store.write_at("f", fh, b"xy", 10).unwrap();

        let data = store.contents("f").unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(&data[..10], &[0u8; 10]);
        assert_eq!(&data[10..], b"xy");
    }

    #[test]
    fn mem_store_write_fault() {
        let store = MemStore::new();
        let fh = store.create("f", 0o600).unwrap();

        store.set_write_errno(libc::ENOSPC);
        let err = store.write_at("f", fh, b"x", 0).unwrap_err();
        assert_eq!(err.errno, libc::ENOSPC);

        store.set_write_errno(0);
        assert_eq!(store.write_at("f", fh, b"x", 0).unwrap(), 1);
    }

    #[test]
    fn mem_store_create_unsupported() {
        let store = MemStore::new();
        store.set_create_errno(libc::ENOSYS);

        let err = store.create("f", 0o600).unwrap_err();
        assert!(err.is_enosys());

        store.mknod("f", 0o600).unwrap();
        assert_eq!(store.mknod("f", 0o600).unwrap_err().errno, libc::EEXIST);
        store.open("f").unwrap();
    }

    #[test]
    fn mem_store_chop() {
        let store = MemStore::new();
        let fh = store.create("f", 0o600).unwrap();
        store.write_at("f", fh, &[1u8; 32], 0).unwrap();

        store.chop("f", 17);
        let mut buf = [0u8; 32];
        assert_eq!(store.read_at("f", fh, &mut buf, 0).unwrap(), 17);
    }
}
