//! A chunked bump allocator producing stable, reload-safe references.
//!
//! This is C1 in the design: the only heap region that needs to survive a
//! `save`/`load` round-trip at a different host address. Instead of the
//! original engine's raw pointers with a post-load fix-up pass, every
//! reference handed out ([`ArenaRef`], [`ArenaSlice`]) is already a
//! `(chunk, offset)` pair, so it stays valid across a reload with zero
//! fix-up work — the representation the design notes (`spec.md` §9)
//! explicitly invite when they say a rewrite may replace the packed/pointer
//! encoding with something clearer "without changing observable behavior".
//!
//! Growing the arena appends a new `Vec<u8>` chunk; existing chunks are
//! never moved or reallocated, so references into them remain valid for the
//! lifetime of the `Arena` even while the outer `Vec<Vec<u8>>` itself grows.

use crate::error::ArenaError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};

/// Default chunk size. Large enough that most rulesets fit in one chunk,
/// small enough that a single bad allocation request can't blow up memory.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A stable reference to a `T` living inside an [`Arena`].
///
/// Valid for as long as the `Arena` that produced it is alive. `Copy`
/// because it is just an offset, exactly like the spec's arena-relative
/// offsets.
pub struct ArenaRef<T> {
    chunk: u32,
    offset: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: `T` doesn't need to be `Clone`/`Copy`/etc. for the handle
// itself to be.
impl<T> Clone for ArenaRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ArenaRef<T> {}
impl<T> PartialEq for ArenaRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.chunk == other.chunk && self.offset == other.offset
    }
}
impl<T> Eq for ArenaRef<T> {}
impl<T> std::fmt::Debug for ArenaRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaRef(chunk={}, offset={})", self.chunk, self.offset)
    }
}

/// A reference to a variable-length run of bytes inside the arena, used for
/// pattern bytes, hex masks and interned identifier text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaSlice {
    chunk: u32,
    offset: u32,
    len: u32,
}

impl ArenaSlice {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

#[derive(Serialize, Deserialize)]
struct ArenaSnapshot {
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
}

/// The bump allocator itself.
pub struct Arena {
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Arena { chunk_size, chunks: vec![Vec::with_capacity(chunk_size)] }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total number of bytes allocated across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve(&mut self, nbytes: usize, align: usize) -> Result<(u32, u32), ArenaError> {
        if nbytes > self.chunk_size {
            return Err(ArenaError::RecordTooLarge {
                requested: nbytes,
                chunk_size: self.chunk_size,
            });
        }
        let last = self.chunks.last_mut().expect("arena always has >=1 chunk");
        let padded_len = (last.len() + align - 1) / align * align;
        if padded_len + nbytes > self.chunk_size {
            // Doesn't fit in the current chunk: start a new one.
            self.chunks.push(Vec::with_capacity(self.chunk_size));
            let chunk = (self.chunks.len() - 1) as u32;
            let chunk_buf = self.chunks.last_mut().unwrap();
            chunk_buf.resize(nbytes, 0);
            return Ok((chunk, 0));
        }
        let chunk = (self.chunks.len() - 1) as u32;
        last.resize(padded_len, 0);
        let offset = last.len() as u32;
        last.resize(padded_len + nbytes, 0);
        Ok((chunk, offset))
    }

    /// Allocates space for one `T` and writes `value` into it, returning a
    /// stable reference. `T` must be `Copy` (and have no padding-sensitive
    /// invariants) since it's stored as raw bytes.
    pub fn allocate<T: Copy>(&mut self, value: T) -> Result<ArenaRef<T>, ArenaError> {
        let nbytes = size_of::<T>();
        let (chunk, offset) = self.reserve(nbytes, align_of::<T>())?;
        // SAFETY: `reserve` guarantees `nbytes` writable bytes at `offset`
        // within `self.chunks[chunk]`, freshly zeroed and aligned to
        // `align_of::<T>()` because every chunk is itself a `Vec<u8>`
        // (guaranteed to start at an allocator-aligned address) and we pad
        // `offset` up to `align_of::<T>()` above.
        unsafe {
            let dst = self.chunks[chunk as usize].as_mut_ptr().add(offset as usize);
            std::ptr::write_unaligned(dst as *mut T, value);
        }
        Ok(ArenaRef { chunk, offset, _marker: PhantomData })
    }

    /// Returns a reference to the very first byte ever allocated in this
    /// arena — the header record in the ruleset's on-disk layout
    /// (`spec.md` §4.1). Only meaningful once at least one allocation has
    /// happened; an empty arena still returns `(chunk 0, offset 0)`, the
    /// same slot the next allocation will land in.
    pub fn base_address<T>(&self) -> ArenaRef<T> {
        ArenaRef { chunk: 0, offset: 0, _marker: PhantomData }
    }

    /// Walks fixed-width records of `stride` bytes as if they were laid out
    /// contiguously, hopping chunk boundaries transparently. Returns `None`
    /// ("NIL", per `spec.md` §4.1) once stepping from `prev` would run past
    /// the last record allocated in this arena.
    ///
    /// Only valid when every record of that width was allocated back to
    /// back with no intervening allocation of a different size — exactly
    /// how `RulesetBuilder` lays out tables such as the rule and string
    /// lists, one `allocate::<T>()` call per record in order.
    pub fn next_address<T>(&self, prev: ArenaRef<T>, stride: usize) -> Option<ArenaRef<T>> {
        let chunk_len = self.chunks.get(prev.chunk as usize)?.len();
        let next_offset = prev.offset as usize + stride;
        if next_offset + stride <= chunk_len {
            return Some(ArenaRef { chunk: prev.chunk, offset: next_offset as u32, _marker: PhantomData });
        }
        let next_chunk = prev.chunk + 1;
        let next_chunk_len = self.chunks.get(next_chunk as usize)?.len();
        if stride <= next_chunk_len {
            Some(ArenaRef { chunk: next_chunk, offset: 0, _marker: PhantomData })
        } else {
            None
        }
    }

    /// Dereferences a previously returned [`ArenaRef`].
    pub fn get<T: Copy>(&self, r: ArenaRef<T>) -> T {
        // SAFETY: `r` was produced by `allocate::<T>` on an arena that never
        // shrinks or moves chunk storage, so the bytes are still there,
        // still aligned, and still hold a valid `T` (copy types have no
        // drop glue to double-run).
        unsafe {
            let src = self.chunks[r.chunk as usize].as_ptr().add(r.offset as usize);
            std::ptr::read_unaligned(src as *const T)
        }
    }

    /// Copies `bytes` into the arena and returns a slice reference to them.
    pub fn allocate_bytes(&mut self, bytes: &[u8]) -> Result<ArenaSlice, ArenaError> {
        if bytes.is_empty() {
            return Ok(ArenaSlice { chunk: 0, offset: 0, len: 0 });
        }
        let (chunk, offset) = self.reserve(bytes.len(), 1)?;
        self.chunks[chunk as usize][offset as usize..offset as usize + bytes.len()]
            .copy_from_slice(bytes);
        Ok(ArenaSlice { chunk, offset, len: bytes.len() as u32 })
    }

    pub fn get_bytes(&self, s: ArenaSlice) -> &[u8] {
        if s.len == 0 {
            return &[];
        }
        &self.chunks[s.chunk as usize][s.offset as usize..s.offset as usize + s.len as usize]
    }

    pub fn get_str(&self, s: ArenaSlice) -> &str {
        std::str::from_utf8(self.get_bytes(s)).unwrap_or("<invalid-utf8>")
    }

    /// Writes a self-describing dump of the arena to `w`.
    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), ArenaError> {
        let snapshot = ArenaSnapshot { chunk_size: self.chunk_size, chunks: self.chunks.clone() };
        bincode::serialize_into(w, &snapshot)
            .map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        Ok(())
    }

    /// Reads back a dump produced by [`Arena::save`]. Every [`ArenaRef`]
    /// and [`ArenaSlice`] obtained before the save remains valid after the
    /// load, at this or any other host address, because handles never held
    /// a raw pointer to begin with.
    pub fn load<R: Read>(r: &mut R) -> Result<Self, ArenaError> {
        let snapshot: ArenaSnapshot =
            bincode::deserialize_from(r).map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        if snapshot.chunks.is_empty() {
            return Err(ArenaError::Corrupt("arena stream has zero chunks".into()));
        }
        Ok(Arena { chunk_size: snapshot.chunk_size, chunks: snapshot.chunks })
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
