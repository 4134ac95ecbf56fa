//! `LinkedVector` / `LinkedDurationVector`: an append-only `u64` sequence
//! implemented as chunks of a fixed default size, plus (for the duration
//! variant) a running (min, max, mean). Values are addressed either by
//! absolute index (`at`, O(n / chunk_size), tail-to-head since recent
//! accesses dominate) or by a stable `DurationHandle` returned from `add`,
//! which the writer uses to back-patch a cell once its true duration
//! becomes known.
//!
//! Persistence is lazy: `write` stores a small header plus (for 2+
//! elements) the payload in a separate value file via the codec layer;
//! `read_header` only reads the header, remembering the value file's path
//! and offset so the payload can be decoded on first access. Coordination
//! for that lazy decode is interior mutability (`RefCell`), not a raw
//! pointer or an explicit two-phase API.

use crate::codec;
use crate::io_utils::{read_u64, read_usize, write_u64, write_usize};
use crate::params::Parameters;
use crate::Result;
use std::cell::RefCell;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Default number of elements per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// A stable handle to one element of a `LinkedVector`, valid for the
/// lifetime of the vector. Used instead of a raw pointer so that
/// back-patching never crosses a method boundary holding a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationHandle {
    chunk: usize,
    index: usize,
}

struct LazyPayload {
    value_path: PathBuf,
    offset: u64,
    len: usize,
    params: Parameters,
}

struct Inner {
    chunks: Vec<Vec<u64>>,
    size: usize,
    chunk_size: usize,
    lazy: Option<LazyPayload>,
}

impl Inner {
    fn ensure_loaded(&mut self) {
        let Some(lazy) = self.lazy.take() else { return };
        let values = load_payload(&lazy).expect("failed to load duration payload");
        self.chunks = values
            .chunks(self.chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    fn push(&mut self, val: u64) -> DurationHandle {
        self.ensure_loaded();
        if self.chunks.is_empty() || self.chunks.last().map(Vec::len).unwrap_or(0) >= self.chunk_size {
            self.chunks.push(Vec::with_capacity(self.chunk_size));
        }
        let chunk = self.chunks.len() - 1;
        let index = self.chunks[chunk].len();
        self.chunks[chunk].push(val);
        self.size += 1;
        DurationHandle { chunk, index }
    }

    fn values(&mut self) -> Vec<u64> {
        self.ensure_loaded();
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

fn load_payload(lazy: &LazyPayload) -> Result<Vec<u64>> {
    use std::fs::File;
    use std::io::{Seek, SeekFrom};
    let mut attempts = 0;
    loop {
        attempts += 1;
        let opened = File::open(&lazy.value_path).and_then(|mut f| {
            f.seek(SeekFrom::Start(lazy.offset))?;
            Ok(f)
        });
        match opened {
            Ok(mut f) => return codec::decode_with(&mut f, lazy.len, &lazy.params),
            Err(e) if attempts < 2 => {
                log::warn!("reopening duration payload file {:?}: {}", lazy.value_path, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Append-only `u64` vector stored as a sequence of fixed-size chunks.
pub struct LinkedVector {
    inner: RefCell<Inner>,
}

impl Default for LinkedVector {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkedVector {
    /// A fresh, empty vector with the default chunk size.
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                chunks: Vec::new(),
                size: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
                lazy: None,
            }),
        }
    }

    fn from_lazy(size: usize, lazy: LazyPayload) -> Self {
        Self {
            inner: RefCell::new(Inner {
                chunks: Vec::new(),
                size,
                chunk_size: DEFAULT_CHUNK_SIZE,
                lazy: Some(lazy),
            }),
        }
    }

    /// Number of elements currently stored (or, for a lazily-loaded vector
    /// whose payload hasn't been decoded yet, the number on disk).
    pub fn size(&self) -> usize {
        self.inner.borrow().size
    }

    /// Appends `val`, growing a new chunk if the current tail is full.
    /// Amortised O(1). Returns a handle that can later be used to overwrite
    /// this exact cell.
    pub fn add(&self, val: u64) -> DurationHandle {
        self.inner.borrow_mut().push(val)
    }

    /// Overwrites the value at `handle`. Used by the writer to back-patch a
    /// provisional timestamp with its computed duration.
    pub fn set(&self, handle: DurationHandle, val: u64) {
        self.inner.borrow_mut().chunks[handle.chunk][handle.index] = val;
    }

    /// Reads the value at `handle`.
    pub fn get(&self, handle: DurationHandle) -> u64 {
        self.inner.borrow().chunks[handle.chunk][handle.index]
    }

    /// Handle for the most recently added element. Panics if empty.
    pub fn last_handle(&self) -> DurationHandle {
        let inner = self.inner.borrow();
        let chunk = inner.chunks.len() - 1;
        let index = inner.chunks[chunk].len() - 1;
        DurationHandle { chunk, index }
    }

    /// Returns the element at `pos`, scanning from the tail chunk backward
    /// since recent accesses dominate. Fatal (panics) if out of range.
    pub fn at(&self, pos: usize) -> u64 {
        let mut inner = self.inner.borrow_mut();
        assert!(pos < inner.size, "LinkedVector::at index {pos} out of range");
        inner.ensure_loaded();
        // Tail-to-head scan using starting indices computed from chunk lengths.
        let mut base = 0usize;
        let mut offsets = Vec::with_capacity(inner.chunks.len());
        for c in &inner.chunks {
            offsets.push(base);
            base += c.len();
        }
        for (ci, &start) in offsets.iter().enumerate().rev() {
            if pos >= start {
                return inner.chunks[ci][pos - start];
            }
        }
        unreachable!("LinkedVector size/chunk bookkeeping out of sync")
    }

    /// First element. Panics if empty.
    pub fn front(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_loaded();
        inner.chunks.first().and_then(|c| c.first()).copied().unwrap()
    }

    /// Last element. Panics if empty.
    pub fn back(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_loaded();
        inner.chunks.last().and_then(|c| c.last()).copied().unwrap()
    }

    /// Materialises and returns all elements, in order.
    pub fn to_vec(&self) -> Vec<u64> {
        self.inner.borrow_mut().values()
    }

    /// Writes the payload through the codec layer unconditionally (used
    /// directly by callers that don't need the size/stats header, e.g.
    /// tests). Most callers go through `LinkedDurationVector::write`.
    pub fn write_payload<W: Write>(&self, value_writer: &mut W, params: &Parameters) -> Result<usize> {
        let values = self.to_vec();
        codec::encode(&values, params, value_writer)
    }
}

/// `LinkedVector` plus a running (min, max, mean) over all elements except
/// the most recently appended one, which the writer treats as a still-
/// provisional timestamp. `final_update_stats` folds in that last element
/// once the owning sequence/event is closed.
pub struct LinkedDurationVector {
    vector: LinkedVector,
    pub min: u64,
    pub max: u64,
    pub mean: u64,
    sum: u128,
    stats_count: usize,
}

impl Default for LinkedDurationVector {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkedDurationVector {
    pub fn new() -> Self {
        Self {
            vector: LinkedVector::new(),
            min: u64::MAX,
            max: 0,
            mean: 0,
            sum: 0,
            stats_count: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.vector.size()
    }

    pub fn at(&self, pos: usize) -> u64 {
        self.vector.at(pos)
    }

    pub fn front(&self) -> u64 {
        self.vector.front()
    }

    pub fn back(&self) -> u64 {
        self.vector.back()
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.vector.to_vec()
    }

    /// Appends `val`, updating the stats from the *previous* last element,
    /// per the deferred-update rule: the element just pushed is still a
    /// provisional timestamp, not a finished duration.
    pub fn add(&mut self, val: u64) -> DurationHandle {
        if self.vector.size() >= 1 {
            let prev = self.vector.back();
            self.fold_stat(prev);
        }
        self.vector.add(val)
    }

    /// Back-patches the value at `handle`, e.g. once a provisional
    /// duration's true length is known.
    pub fn set(&self, handle: DurationHandle, val: u64) {
        self.vector.set(handle, val);
    }

    /// Reads the value at `handle`.
    pub fn get(&self, handle: DurationHandle) -> u64 {
        self.vector.get(handle)
    }

    /// Handle to the most recently added value.
    pub fn last_handle(&self) -> DurationHandle {
        self.vector.last_handle()
    }

    fn fold_stat(&mut self, v: u64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.sum += v as u128;
        self.stats_count += 1;
        self.mean = (self.sum / self.stats_count as u128) as u64;
    }

    /// Folds in the final element. Call once, when the owning Sequence or
    /// EventSummary is closed by `Thread::finalize`.
    pub fn final_update_stats(&mut self) {
        if self.vector.size() >= 1 {
            let last = self.vector.back();
            self.fold_stat(last);
        }
    }

    /// Header layout: `size == 0` -> `[size]`; `size == 1` -> `[size,
    /// value]`; `size >= 2` -> `[size, min, max, mean, offset]` plus the
    /// payload written to `value_writer` through the codec.
    pub fn write<W: Write, V: Write>(
        &self,
        vector_writer: &mut W,
        value_writer: &mut V,
        running_offset: &mut u64,
        params: &Parameters,
    ) -> Result<()> {
        let size = self.vector.size();
        write_usize(vector_writer, size)?;
        match size {
            0 => {}
            1 => write_u64(vector_writer, self.vector.front())?,
            _ => {
                write_u64(vector_writer, self.min)?;
                write_u64(vector_writer, self.max)?;
                write_u64(vector_writer, self.mean)?;
                write_u64(vector_writer, *running_offset)?;
                let values = self.vector.to_vec();
                let written = codec::encode(&values, params, value_writer)?;
                *running_offset += written as u64;
            }
        }
        Ok(())
    }

    /// Reads only the header, remembering `value_path`/offset/`params` for
    /// lazy payload loading (through the matching codec configuration) on
    /// first access.
    pub fn read_header<R: Read>(reader: &mut R, value_path: PathBuf, params: &Parameters) -> Result<Self> {
        let size = read_usize(reader)?;
        match size {
            0 => Ok(Self::new()),
            1 => {
                let v = read_u64(reader)?;
                let mut result = Self::new();
                result.vector.add(v);
                result.final_update_stats();
                Ok(result)
            }
            _ => {
                let min = read_u64(reader)?;
                let max = read_u64(reader)?;
                let mean = read_u64(reader)?;
                let offset = read_u64(reader)?;
                let mut result = Self::new();
                result.min = min;
                result.max = max;
                result.mean = mean;
                result.stats_count = size - 1;
                result.vector = LinkedVector::from_lazy(
                    size,
                    LazyPayload { value_path, offset, len: size, params: params.clone() },
                );
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_at_front_back() {
        let v = LinkedVector::new();
        for i in 0..2500u64 {
            v.add(i);
        }
        assert_eq!(v.size(), 2500);
        assert_eq!(v.front(), 0);
        assert_eq!(v.back(), 2499);
        assert_eq!(v.at(1234), 1234);
    }

    #[test]
    fn handle_backpatch() {
        let v = LinkedVector::new();
        v.add(10);
        let h = v.add(20);
        v.add(30);
        v.set(h, 999);
        assert_eq!(v.at(1), 999);
    }

    #[test]
    fn duration_vector_stats_deferred() {
        let mut v = LinkedDurationVector::new();
        v.add(10);
        v.add(20);
        v.add(30);
        // stats only reflect elements 0..size-1 so far: {10, 20}
        assert_eq!(v.min, 10);
        assert_eq!(v.max, 20);
        v.final_update_stats();
        assert_eq!(v.min, 10);
        assert_eq!(v.max, 30);
        assert_eq!(v.mean, 20);
    }

    #[test]
    fn duration_vector_single_element_final_stats() {
        let mut v = LinkedDurationVector::new();
        v.add(42);
        v.final_update_stats();
        assert_eq!(v.min, 42);
        assert_eq!(v.max, 42);
        assert_eq!(v.mean, 42);
    }

    #[test]
    fn duration_vector_roundtrip_header_and_payload() {
        use crate::params::Parameters;
        let mut v = LinkedDurationVector::new();
        for i in 0..10u64 {
            v.add(i * 7);
        }
        v.final_update_stats();

        let dir = tempfile::tempdir().unwrap();
        let value_path = dir.path().join("values.dat");
        let mut header_buf = Vec::new();
        let mut value_buf = Vec::new();
        let mut offset = 0u64;
        let params = Parameters::default();
        v.write(&mut header_buf, &mut value_buf, &mut offset, &params).unwrap();
        std::fs::write(&value_path, &value_buf).unwrap();

        let mut cursor = std::io::Cursor::new(header_buf);
        let loaded = LinkedDurationVector::read_header(&mut cursor, value_path, &params).unwrap();
        assert_eq!(loaded.size(), 10);
        assert_eq!(loaded.min, v.min);
        assert_eq!(loaded.max, v.max);
        assert_eq!(loaded.mean, v.mean);
        assert_eq!(loaded.to_vec(), v.to_vec());
    }
}
