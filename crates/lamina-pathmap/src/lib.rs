//! # lamina-pathmap
//!
//! Durable path-visibility map for the Lamina union filesystem.
//!
//! Two directory trees — a writable upper layer and a read-only lower
//! layer — compose into one view; the path map is the piece that answers,
//! for any virtual path and without walking either tree: is the path
//! whited out, is an ancestor directory opaque, or is the path unknown.
//! Cells are keyed by 16-byte truncated SHA-256 path keys
//! ([`Pathkey`]) and persisted in an append-only log that is replayed on
//! open.
//!
//! ## File format
//!
//! A file is a list of transactions; a transaction is a list of chunks; a
//! chunk is one 16-byte header followed by 16-byte data records. A
//! transaction is read into a temporary map and, once every chunk has
//! validated, either assigned to the map (command `S`) or merged into it
//! (command `A`); `P` chunks carry records for a transaction still in
//! flight.
//!
//! | record | byte 0 | byte 1 | bytes 2..3 | bytes 4..15 |
//! |---|---|---|---|---|
//! | header, first chunk | `'1'` | `P`/`S`/`A` | record count (LE) | cumulative hash |
//! | header, later chunk | `'0'` | `P`/`S`/`A` | record count (LE) | cumulative hash |
//! | data record | `0x80 \| visibility` | key byte 1 | key bytes 2..3 | key bytes 4..15 |
//!
//! The hash is the first 12 bytes of a SHA-256 over the data-record bytes
//! of all chunks of the transaction so far, so the commit chunk vouches
//! for the whole transaction: a torn tail can never half-commit.
//!
//! Headers always have bit 7 of byte 0 clear and data records always have
//! it set, which is what makes recovery after an arbitrary crash position
//! deterministic: scan forward a record at a time until byte 0 reads `'1'`
//! and byte 1 reads a command, and parse from there. An empty file is a
//! valid log.
//!
//! ## Concurrency
//!
//! [`Pathmap`] is `Send + Sync`. Lookups and mutations synchronize on an
//! internal reader-writer lock held for hash-lookup time only; writes to
//! the backing file are serialized separately, with the bulk of the I/O
//! outside the state lock.

mod dump;
mod log;
mod pathkey;
mod pathmap;

pub use pathkey::{Pathkey, PathkeyHasher, PATHKEY_LEN};
pub use pathmap::{
    Pathmap, PathmapError, PathmapStats, Result, MAXVIS, MAX_INDEX, NOTEXIST, OPAQUE, UNKNOWN,
    WHITEOUT,
};
