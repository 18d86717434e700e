//! Document buffers and their device mirrors.
//!
//! A [`Buffer`] is a host-side batch of documents laid out as parallel token
//! arrays. Its device mirror lives in the engine's [`BufferArena`]; the two are
//! only synchronised by explicit uploads and copy-backs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::device::{DeviceContext, DeviceSlice};
use crate::error::{EngineError, Result};

/// Source of process-unique arena tokens.
static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);

/// Handle to a buffer's device mirror: the owning arena plus the slot in it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    arena: u64,
    index: usize,
}

impl BufferId {
    pub fn index(self) -> usize {
        self.index
    }

    /// Token of the arena that issued this id.
    pub fn arena(self) -> u64 {
        self.arena
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.arena, self.index)
    }
}

/// Host-side batch of documents.
///
/// A buffer holds at most `capacity` tokens and `doc_capacity` documents;
/// its device mirror is sized from both.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    /// Word id per token.
    pub w: Vec<u32>,
    /// Topic per token.
    pub z: Vec<u32>,
    /// Token count per document.
    pub d_len: Vec<u32>,
    /// Offset of each document's first token.
    pub d_idx: Vec<u32>,
    capacity: usize,
    doc_capacity: usize,
    id: Option<BufferId>,
}

impl Buffer {
    /// An empty buffer holding at most `capacity` tokens and as many
    /// documents.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacities(capacity, capacity)
    }

    /// An empty buffer with separate token and document bounds.
    pub fn with_capacities(capacity: usize, doc_capacity: usize) -> Self {
        Self {
            capacity,
            doc_capacity,
            ..Default::default()
        }
    }

    /// Build a buffer from documents of word ids, with every topic set to 0.
    /// The capacity is the token count; the document capacity is at least
    /// the document count.
    pub fn from_documents<D: AsRef<[u32]>>(docs: &[D]) -> Self {
        let size = docs.iter().map(|d| d.as_ref().len()).sum();
        let mut buffer = Self::with_capacities(size, docs.len().max(size));
        for doc in docs {
            buffer.push_document(doc.as_ref());
        }
        buffer
    }

    /// Append a document. Returns `false`, leaving the buffer unchanged, if it
    /// would exceed the token or document capacity.
    pub fn push_document(&mut self, words: &[u32]) -> bool {
        if self.size() + words.len() > self.capacity || self.n_docs() >= self.doc_capacity {
            return false;
        }
        self.d_idx.push(self.w.len() as u32);
        self.d_len.push(words.len() as u32);
        self.w.extend_from_slice(words);
        self.z.extend(std::iter::repeat_n(0, words.len()));
        true
    }

    /// Draw every topic uniformly from `[0, k)`.
    pub fn randomize_topics<R: Rng + ?Sized>(&mut self, k: u32, rng: &mut R) {
        for z in &mut self.z {
            *z = rng.random_range(0..k);
        }
    }

    /// Token count.
    pub fn size(&self) -> usize {
        self.w.len()
    }

    pub fn n_docs(&self) -> usize {
        self.d_len.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn doc_capacity(&self) -> usize {
        self.doc_capacity
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    /// The mirror this buffer is bound to, once an engine has initialized it.
    pub fn id(&self) -> Option<BufferId> {
        self.id
    }

    pub(crate) fn bind(&mut self, id: Option<BufferId>) {
        self.id = id;
    }

    /// Word and topic slices of document `doc`.
    pub fn document(&self, doc: usize) -> (&[u32], &[u32]) {
        let start = self.d_idx[doc] as usize;
        let end = start + self.d_len[doc] as usize;
        (&self.w[start..end], &self.z[start..end])
    }
}

/// Device-resident mirror of one buffer.
pub struct DeviceBuffer {
    pub(crate) w: DeviceSlice<u32>,
    pub(crate) z: DeviceSlice<u32>,
    pub(crate) d_len: DeviceSlice<u32>,
    pub(crate) d_idx: DeviceSlice<u32>,
    pub(crate) size: usize,
    pub(crate) n_docs: usize,
    /// Sampling sweeps run against this mirror.
    pub(crate) sweeps: u64,
}

impl DeviceBuffer {
    /// Allocate a mirror sized for `buffer`'s token and document capacity.
    pub fn new(ctx: &DeviceContext, buffer: &Buffer) -> Result<Self> {
        let tokens = buffer.capacity().max(buffer.size());
        let docs = buffer.doc_capacity().max(buffer.n_docs());
        Ok(Self {
            w: ctx.alloc_zeros(tokens, "buffer words")?,
            z: ctx.alloc_zeros(tokens, "buffer topics")?,
            d_len: ctx.alloc_zeros(docs, "buffer document lengths")?,
            d_idx: ctx.alloc_zeros(docs, "buffer document offsets")?,
            size: 0,
            n_docs: 0,
            sweeps: 0,
        })
    }

    /// Host-to-device copy of every array.
    pub fn upload(&mut self, buffer: &Buffer) -> Result<()> {
        self.w.copy_from_host(&buffer.w, "buffer words")?;
        self.z.copy_from_host(&buffer.z, "buffer topics")?;
        self.d_len.copy_from_host(&buffer.d_len, "buffer document lengths")?;
        self.d_idx.copy_from_host(&buffer.d_idx, "buffer document offsets")?;
        self.size = buffer.size();
        self.n_docs = buffer.n_docs();
        Ok(())
    }

    /// Device-to-host copy of the topic assignments.
    pub fn download(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.z.resize(self.size, 0);
        self.z.copy_to_host(&mut buffer.z, "buffer topics")
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn n_docs(&self) -> usize {
        self.n_docs
    }

    pub fn words(&self) -> &[u32] {
        self.w.view(0, self.size)
    }

    pub fn topics(&self) -> &[u32] {
        self.z.view(0, self.size)
    }

    /// Documents as `(doc, start, len)`, sorted by start offset.
    pub(crate) fn layout(&self) -> Vec<(usize, usize, usize)> {
        let lens = self.d_len.view(0, self.n_docs);
        let offsets = self.d_idx.view(0, self.n_docs);
        let mut docs: Vec<_> = (0..self.n_docs)
            .map(|d| (d, offsets[d] as usize, lens[d] as usize))
            .collect();
        docs.sort_unstable_by_key(|&(_, start, _)| start);
        docs
    }

    pub fn bytes(&self) -> usize {
        self.w.bytes() + self.z.bytes() + self.d_len.bytes() + self.d_idx.bytes()
    }
}

/// Engine-owned mirrors, indexed by [`BufferId`]. Every arena carries its own
/// token, so ids issued by another arena never resolve here.
pub struct BufferArena {
    token: u64,
    mirrors: Vec<Mutex<DeviceBuffer>>,
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferArena {
    pub fn new() -> Self {
        Self {
            token: NEXT_ARENA.fetch_add(1, Ordering::Relaxed),
            mirrors: Vec::new(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn insert(&mut self, mirror: DeviceBuffer) -> BufferId {
        self.mirrors.push(Mutex::new(mirror));
        BufferId {
            arena: self.token,
            index: self.mirrors.len() - 1,
        }
    }

    pub fn get(&self, buffer: &Buffer) -> Result<&Mutex<DeviceBuffer>> {
        buffer
            .id()
            .filter(|id| id.arena == self.token)
            .and_then(|id| self.mirrors.get(id.index))
            .ok_or_else(|| {
                EngineError::UnknownBuffer(
                    buffer
                        .id()
                        .map_or_else(|| "(unbound)".to_string(), |id| id.to_string()),
                )
            })
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<DeviceBuffer>> {
        self.mirrors.iter()
    }

    /// Tokens currently resident across all mirrors.
    pub fn resident_tokens(&self) -> u64 {
        self.mirrors.iter().map(|m| m.lock().size as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_push_document_respects_capacity() {
        let mut buffer = Buffer::with_capacity(5);
        assert!(buffer.push_document(&[1, 2, 3]));
        assert!(!buffer.push_document(&[4, 5, 6]));
        assert!(buffer.push_document(&[]));
        assert!(buffer.push_document(&[7, 8]));
        assert_eq!(buffer.size(), 5);
        assert_eq!(buffer.n_docs(), 3);
        assert_eq!(buffer.d_idx, vec![0, 3, 3]);
        assert_eq!(buffer.d_len, vec![3, 0, 2]);
        assert_eq!(buffer.document(2).0, &[7, 8]);
    }

    #[test]
    fn test_randomize_topics_in_range() {
        let mut buffer = Buffer::from_documents(&[vec![0u32; 50], vec![1u32; 50]]);
        let mut rng = StdRng::seed_from_u64(5);
        buffer.randomize_topics(4, &mut rng);
        assert!(buffer.z.iter().all(|&z| z < 4));
        assert!(buffer.z.iter().any(|&z| z != buffer.z[0]));
    }

    #[test]
    fn test_mirror_round_trip() {
        let ctx = DeviceContext::new(DeviceConfig::default().with_threads(1)).unwrap();
        let mut buffer = Buffer::from_documents(&[vec![3u32, 1], vec![2]]);
        buffer.z = vec![1, 0, 1];

        let mut arena = BufferArena::new();
        let mut mirror = DeviceBuffer::new(&ctx, &buffer).unwrap();
        mirror.upload(&buffer).unwrap();
        assert_eq!(mirror.words(), &[3, 1, 2]);
        assert_eq!(mirror.layout(), vec![(0, 0, 2), (1, 2, 1)]);
        let id = arena.insert(mirror);
        buffer.bind(Some(id));

        // Host edits are invisible until copied.
        buffer.z = vec![0, 0, 0];
        arena.get(&buffer).unwrap().lock().download(&mut buffer).unwrap();
        assert_eq!(buffer.z, vec![1, 0, 1]);
        assert_eq!(arena.resident_tokens(), 3);

        let stranger = Buffer::with_capacity(1);
        assert!(matches!(
            arena.get(&stranger),
            Err(EngineError::UnknownBuffer(_))
        ));

        // Same slot, different arena.
        let mut other = BufferArena::new();
        assert_ne!(other.token(), arena.token());
        let other_id = other.insert(DeviceBuffer::new(&ctx, &buffer).unwrap());
        assert_eq!(other_id.index(), id.index());
        assert!(matches!(
            other.get(&buffer),
            Err(EngineError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn test_document_capacity_bounds_empty_documents() {
        let mut buffer = Buffer::with_capacities(4, 2);
        assert!(buffer.push_document(&[]));
        assert!(buffer.push_document(&[1]));
        assert!(!buffer.push_document(&[]));
        assert_eq!(buffer.n_docs(), 2);

        let mut single = Buffer::from_documents(&[vec![0u32, 1]]);
        assert_eq!(single.doc_capacity(), 2);
        assert!(single.push_document(&[]));
        assert!(!single.push_document(&[]));

        let blanks = Buffer::from_documents(&[Vec::<u32>::new(), Vec::new(), Vec::new()]);
        assert_eq!(blanks.capacity(), 0);
        assert_eq!(blanks.n_docs(), 3);
    }

    #[test]
    fn test_mirror_fits_document_capacity() {
        let ctx = DeviceContext::new(DeviceConfig::default().with_threads(1)).unwrap();
        let mut buffer = Buffer::with_capacities(2, 5);
        assert!(buffer.push_document(&[0, 1]));
        let mut mirror = DeviceBuffer::new(&ctx, &buffer).unwrap();
        mirror.upload(&buffer).unwrap();
        while buffer.push_document(&[]) {}
        assert_eq!(buffer.n_docs(), 5);
        mirror.upload(&buffer).unwrap();
        assert_eq!(mirror.n_docs(), 5);
    }
}
