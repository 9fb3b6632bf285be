//! Segmented free-bitmap allocator.
//!
//! A pool's units (addresses, or delegated prefixes) can number far more
//! than a single flat bitmap can index: an IPv6 /64 address pool alone holds
//! 2^64 addresses. [`FreeList`] splits the unit domain into fixed-size
//! segments keyed by a `u128` segment number and creates each segment's
//! bitmap lazily on first touch, so memory tracks the number of units that
//! were ever handed out rather than the size of the pool.
//!
//! # Allocation order
//!
//! [`FreeList::allocate_next`] takes the first clear bit of the existing
//! segments in ascending order and only opens a new segment when every
//! existing one is full. Untouched units are therefore handed out in
//! increasing order over the lifetime of the process.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Default segment size: the largest native signed-integer range.
pub const DEFAULT_SEGMENT_SIZE: u64 = i32::MAX as u64;

const WORD_BITS: u64 = u64::BITS as u64;

/// Words per chunk: 4096 units in 512 bytes.
const CHUNK_WORDS: usize = 64;
const CHUNK_BITS: u64 = CHUNK_WORDS as u64 * WORD_BITS;

type Chunk = Box<[u64; CHUNK_WORDS]>;

/// One segment of the unit domain.
///
/// Bits live in fixed-size chunks created on first touch and dropped again
/// once they are all clear, so a single unit near the end of a segment costs
/// one chunk rather than the whole bitmap.
#[derive(Debug, Clone)]
struct Segment {
    /// Number of units this segment covers.
    len: u64,
    /// Number of set bits.
    used: u64,
    chunks: BTreeMap<u64, Chunk>,
}

fn split(bit: u64) -> (u64, usize, u64) {
    let chunk = bit / CHUNK_BITS;
    let offset = bit % CHUNK_BITS;
    (chunk, (offset / WORD_BITS) as usize, 1u64 << (offset % WORD_BITS))
}

impl Segment {
    fn new(len: u64) -> Self {
        Self {
            len,
            used: 0,
            chunks: BTreeMap::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.used >= self.len
    }

    fn get(&self, bit: u64) -> bool {
        let (chunk, word, mask) = split(bit);
        self.chunks
            .get(&chunk)
            .is_some_and(|words| words[word] & mask != 0)
    }

    /// Sets `bit`, returning false if it was already set.
    fn set(&mut self, bit: u64) -> bool {
        let (chunk, word, mask) = split(bit);
        let words = self
            .chunks
            .entry(chunk)
            .or_insert_with(|| Box::new([0; CHUNK_WORDS]));
        if words[word] & mask != 0 {
            return false;
        }
        words[word] |= mask;
        self.used += 1;
        true
    }

    /// Clears `bit`, returning false if it was already clear.
    fn clear(&mut self, bit: u64) -> bool {
        let (chunk, word, mask) = split(bit);
        let Some(words) = self.chunks.get_mut(&chunk) else {
            return false;
        };
        if words[word] & mask == 0 {
            return false;
        }
        words[word] &= !mask;
        self.used -= 1;
        if words.iter().all(|w| *w == 0) {
            self.chunks.remove(&chunk);
        }
        true
    }

    fn first_clear(&self) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        // Chunks are scanned in order; the first missing chunk is all clear.
        let mut expected = 0u64;
        for (&index, words) in &self.chunks {
            if index != expected {
                break;
            }
            if let Some((word, bits)) = words.iter().enumerate().find(|(_, w)| **w != u64::MAX) {
                let bit = index * CHUNK_BITS
                    + word as u64 * WORD_BITS
                    + u64::from(bits.trailing_ones());
                return (bit < self.len).then_some(bit);
            }
            expected += 1;
        }
        let bit = expected * CHUNK_BITS;
        (bit < self.len).then_some(bit)
    }

    #[cfg(test)]
    fn resident_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// Tracks the used/free state of the units `[start, end]` of one pool.
///
/// Not internally synchronized; pools wrap it in a mutex so that
/// [`try_mark_used`](Self::try_mark_used) and
/// [`allocate_next`](Self::allocate_next) act as test-and-set.
#[derive(Debug, Clone)]
pub struct FreeList {
    start: u128,
    end: u128,
    segment_size: u64,
    segments: BTreeMap<u128, Segment>,
}

impl FreeList {
    /// Creates an empty free list over the inclusive unit range.
    pub fn new(start: u128, end: u128) -> Result<Self> {
        Self::with_segment_size(start, end, DEFAULT_SEGMENT_SIZE)
    }

    /// Creates an empty free list with a custom segment size.
    pub fn with_segment_size(start: u128, end: u128, segment_size: u64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidConfig(format!(
                "allocator range start {} is greater than end {}",
                start, end
            )));
        }
        if segment_size == 0 {
            return Err(Error::InvalidConfig(
                "allocator segment size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            start,
            end,
            segment_size,
            segments: BTreeMap::new(),
        })
    }

    pub fn start(&self) -> u128 {
        self.start
    }

    pub fn end(&self) -> u128 {
        self.end
    }

    /// Number of allocatable units, saturating at `u128::MAX` for the full
    /// 128-bit domain.
    pub fn capacity(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }

    /// Number of units currently marked used.
    pub fn used_count(&self) -> u128 {
        self.segments
            .values()
            .map(|segment| u128::from(segment.used))
            .sum()
    }

    fn last_segment(&self) -> u128 {
        (self.end - self.start) / u128::from(self.segment_size)
    }

    fn segment_len(&self, index: u128) -> u64 {
        let size = u128::from(self.segment_size);
        let first = index * size;
        let remaining = (self.end - self.start) - first;
        // remaining + 1 may not fit a u128, so compare before adding.
        if remaining >= size - 1 {
            self.segment_size
        } else {
            remaining as u64 + 1
        }
    }

    fn locate(&self, unit: u128) -> Option<(u128, u64)> {
        if unit < self.start || unit > self.end {
            return None;
        }
        let offset = unit - self.start;
        let size = u128::from(self.segment_size);
        Some((offset / size, (offset % size) as u64))
    }

    fn unit_at(&self, index: u128, bit: u64) -> u128 {
        self.start + index * u128::from(self.segment_size) + u128::from(bit)
    }

    /// Marks and returns the next free unit, or `None` when every unit is used.
    pub fn allocate_next(&mut self) -> Option<u128> {
        let found = self
            .segments
            .iter()
            .find_map(|(&index, segment)| segment.first_clear().map(|bit| (index, bit)));
        if let Some((index, bit)) = found {
            if let Some(segment) = self.segments.get_mut(&index) {
                segment.set(bit);
            }
            return Some(self.unit_at(index, bit));
        }

        // Every existing segment is full: open the lowest missing one.
        let mut index = 0u128;
        for &existing in self.segments.keys() {
            if existing != index {
                break;
            }
            index += 1;
        }
        if index > self.last_segment() {
            return None;
        }
        let mut segment = Segment::new(self.segment_len(index));
        segment.set(0);
        self.segments.insert(index, segment);
        Some(self.unit_at(index, 0))
    }

    /// Marks `unit` used. Units outside the domain are ignored.
    pub fn mark_used(&mut self, unit: u128) {
        self.try_mark_used(unit);
    }

    /// Marks `unit` used, returning false if it was already used or lies
    /// outside the domain.
    pub fn try_mark_used(&mut self, unit: u128) -> bool {
        let Some((index, bit)) = self.locate(unit) else {
            return false;
        };
        let len = self.segment_len(index);
        self.segments
            .entry(index)
            .or_insert_with(|| Segment::new(len))
            .set(bit)
    }

    /// Marks `unit` free. Units outside the domain are ignored.
    pub fn mark_free(&mut self, unit: u128) {
        let Some((index, bit)) = self.locate(unit) else {
            return;
        };
        if let Some(segment) = self.segments.get_mut(&index) {
            segment.clear(bit);
        }
    }

    /// Returns true if `unit` is inside the domain and marked used.
    pub fn is_used(&self, unit: u128) -> bool {
        self.locate(unit).is_some_and(|(index, bit)| {
            self.segments
                .get(&index)
                .is_some_and(|segment| segment.get(bit))
        })
    }
}
