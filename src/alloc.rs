// alloc.rs — Host allocators for per-call transient buffers.
//
// Two strategies behind one `Allocator` trait:
//
//   HeapAllocator  plain heap blocks plus a running byte count, so a
//                  leak shows up as a non-zero `allocated()` at the end.
//   ScratchArena   a fixed-capacity ring. Blocks are carved from the
//                  front of the free space; when a block would run
//                  past the end the arena wraps to the beginning. If
//                  the wrapped block would overwrite data that is still
//                  live, the request is served by the backing allocator
//                  instead.
//
// The ring's bookkeeping is a queue of slots in allocation order. Each
// slot carries its size and a `SlotState` tag, so freeing a block only
// flips the tag; the queue front is then popped for as long as it holds
// freed slots, which is what moves the ring's free pointer forward.
//
// NEW RUST CONCEPTS:
// - `VecDeque` as a ring of records: push at the back on allocation,
//   pop from the front as the oldest blocks become free.
// - Returning `&mut [T]` tied to two borrows (`'a` on both the arena and
//   the block) so the caller cannot keep a view after deallocating.
// - `bytemuck::cast_slice_mut` to view the word storage as `f32`/`i32`
//   without `unsafe`.

use std::collections::VecDeque;

use bytemuck::Pod;

/// Storage granularity. Every block is rounded up to whole 32-bit words,
/// which keeps `f32`/`i32` views aligned.
const WORD: usize = std::mem::size_of::<u32>();

fn words_for(bytes: usize) -> usize {
    (bytes + WORD - 1) / WORD
}

/// A block handed out by an [`Allocator`].
///
/// Blocks must be returned to the allocator that produced them through
/// [`Allocator::dealloc`]. Dropping a `Ring` block without doing so leaks
/// its slot until the arena itself is dropped.
#[derive(Debug)]
pub enum Block {
    /// Heap-backed block owning its storage.
    Heap { words: Vec<u32>, bytes: usize },
    /// Region of a [`ScratchArena`] ring, `offset` and `words` in words.
    Ring { offset: usize, words: usize, bytes: usize },
}

impl Block {
    /// Requested size in bytes (before rounding to words).
    pub fn bytes(&self) -> usize {
        match self {
            Block::Heap { bytes, .. } | Block::Ring { bytes, .. } => *bytes,
        }
    }

    /// True if the block lives inside a scratch ring.
    pub fn is_ring(&self) -> bool {
        matches!(self, Block::Ring { .. })
    }
}

/// Allocation strategy for host-side transient buffers.
pub trait Allocator {
    /// Allocate a zero-initialised block of at least `bytes` bytes.
    fn alloc(&mut self, bytes: usize) -> Block;

    /// Return a block to the allocator.
    fn dealloc(&mut self, block: Block);

    /// Mutable word view of a block.
    fn words_mut<'a>(&'a mut self, block: &'a mut Block) -> &'a mut [u32];

    /// Mutable typed view of a block (`T` must be 4 bytes wide or divide it).
    fn slice_mut<'a, T: Pod>(&'a mut self, block: &'a mut Block) -> &'a mut [T] {
        bytemuck::cast_slice_mut(self.words_mut(block))
    }
}

// ---------------------------------------------------------------------------
// HeapAllocator
// ---------------------------------------------------------------------------

/// Heap allocator that counts outstanding bytes.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    allocated: usize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        HeapAllocator { allocated: 0 }
    }

    /// Bytes currently allocated and not yet returned.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&mut self, bytes: usize) -> Block {
        let words = words_for(bytes);
        self.allocated += words * WORD;
        Block::Heap { words: vec![0; words], bytes }
    }

    fn dealloc(&mut self, block: Block) {
        match block {
            Block::Heap { words, .. } => {
                let size = words.len() * WORD;
                assert!(
                    size <= self.allocated,
                    "heap dealloc of {size} bytes exceeds the {} allocated",
                    self.allocated
                );
                self.allocated -= size;
            }
            Block::Ring { .. } => panic!("ring block returned to a heap allocator"),
        }
    }

    fn words_mut<'a>(&'a mut self, block: &'a mut Block) -> &'a mut [u32] {
        match block {
            Block::Heap { words, .. } => words.as_mut_slice(),
            Block::Ring { .. } => panic!("ring block accessed through a heap allocator"),
        }
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        if self.allocated != 0 {
            tracing::warn!(leaked = self.allocated, "heap allocator dropped with live blocks");
        }
    }
}

// ---------------------------------------------------------------------------
// ScratchArena
// ---------------------------------------------------------------------------

/// Liveness tag of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live,
    Free,
}

/// A ring slot: `size` words starting at `offset`, tagged live or free.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    size: usize,
    state: SlotState,
}

/// Fixed-capacity ring allocator with wrap-around and backing fallback.
///
/// Not synchronised: one arena per thread of control.
pub struct ScratchArena<B: Allocator = HeapAllocator> {
    memory: Vec<u32>,
    /// Slots in allocation order; the front is the oldest.
    slots: VecDeque<Slot>,
    /// Word index where the next block starts.
    allocate: usize,
    backing: B,
    fallbacks: usize,
}

impl ScratchArena<HeapAllocator> {
    /// Arena of `capacity` bytes falling back to a fresh heap allocator.
    pub fn new(capacity: usize) -> Self {
        Self::with_backing(capacity, HeapAllocator::new())
    }
}

impl<B: Allocator> ScratchArena<B> {
    pub fn with_backing(capacity: usize, backing: B) -> Self {
        ScratchArena {
            memory: vec![0; words_for(capacity)],
            slots: VecDeque::new(),
            allocate: 0,
            backing,
            fallbacks: 0,
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory.len() * WORD
    }

    /// Number of requests served by the backing allocator so far.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }

    /// True when no ring slot is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Word index of the oldest live data (the ring's free pointer).
    fn free(&self) -> usize {
        self.slots.front().map_or(self.allocate, |s| s.offset)
    }

    /// Does `[start, end)` overlap data that is still live?
    fn in_use(&self, start: usize, end: usize) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let free = self.free();
        if free < self.allocate {
            start < self.allocate && end > free
        } else {
            // Live data wraps: [free, cap) and [0, allocate).
            end > free || start < self.allocate
        }
    }
}

impl<B: Allocator> Allocator for ScratchArena<B> {
    fn alloc(&mut self, bytes: usize) -> Block {
        let words = words_for(bytes);
        let cap = self.memory.len();
        if words == 0 || words > cap {
            self.fallbacks += usize::from(words > 0);
            return self.backing.alloc(bytes);
        }

        let mut start = self.allocate;
        let wrapped = start + words > cap;
        if wrapped {
            start = 0;
        }
        if self.in_use(start, start + words) {
            self.fallbacks += 1;
            tracing::trace!(bytes, "scratch ring full, using backing allocator");
            return self.backing.alloc(bytes);
        }

        if wrapped && self.allocate < cap {
            // Tail the block could not use; freed together with its predecessor.
            self.slots.push_back(Slot {
                offset: self.allocate,
                size: cap - self.allocate,
                state: SlotState::Free,
            });
        }
        self.slots.push_back(Slot { offset: start, size: words, state: SlotState::Live });
        self.allocate = start + words;
        self.memory[start..start + words].fill(0);
        Block::Ring { offset: start, words, bytes }
    }

    fn dealloc(&mut self, block: Block) {
        let (offset, words) = match block {
            Block::Ring { offset, words, .. } => (offset, words),
            heap => return self.backing.dealloc(heap),
        };
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.offset == offset && s.state == SlotState::Live)
            .unwrap_or_else(|| panic!("scratch dealloc of unknown block at word {offset}"));
        assert_eq!(slot.size, words, "scratch block at word {offset} has the wrong size");
        slot.state = SlotState::Free;

        while matches!(self.slots.front(), Some(s) if s.state == SlotState::Free) {
            self.slots.pop_front();
        }
        if self.slots.is_empty() {
            self.allocate = 0;
        }
    }

    fn words_mut<'a>(&'a mut self, block: &'a mut Block) -> &'a mut [u32] {
        match block {
            Block::Ring { offset, words, .. } => &mut self.memory[*offset..*offset + *words],
            heap => self.backing.words_mut(heap),
        }
    }
}

impl<B: Allocator> Drop for ScratchArena<B> {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            tracing::warn!(live = self.slots.len(), "scratch arena dropped with live blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_counts_bytes() {
        let mut heap = HeapAllocator::new();
        let a = heap.alloc(10);
        let b = heap.alloc(8);
        assert_eq!(heap.allocated(), 12 + 8);
        heap.dealloc(a);
        assert_eq!(heap.allocated(), 8);
        heap.dealloc(b);
        assert_eq!(heap.allocated(), 0);
    }

    #[test]
    fn test_heap_blocks_are_zeroed_and_typed() {
        let mut heap = HeapAllocator::new();
        let mut block = heap.alloc(16);
        {
            let f: &mut [f32] = heap.slice_mut(&mut block);
            assert_eq!(f.len(), 4);
            assert!(f.iter().all(|&v| v == 0.0));
            f[3] = 1.5;
        }
        assert_eq!(heap.slice_mut::<f32>(&mut block)[3], 1.5);
        heap.dealloc(block);
    }

    #[test]
    fn test_scratch_serves_from_ring() {
        let mut arena = ScratchArena::new(64);
        let mut a = arena.alloc(16);
        let b = arena.alloc(16);
        assert!(a.is_ring() && b.is_ring());
        arena.slice_mut::<i32>(&mut a)[0] = 7;
        assert_eq!(arena.slice_mut::<i32>(&mut a)[0], 7);
        arena.dealloc(a);
        arena.dealloc(b);
        assert!(arena.is_empty());
        assert_eq!(arena.fallbacks(), 0);
    }

    #[test]
    fn test_scratch_wraps_when_front_is_free() {
        let mut arena = ScratchArena::new(32);
        let a = arena.alloc(12);
        let b = arena.alloc(12);
        // Free the oldest block: the ring can now reuse the front.
        arena.dealloc(a);
        let c = arena.alloc(12);
        assert!(c.is_ring(), "wrapped block should land at the ring start");
        assert!(matches!(c, Block::Ring { offset: 0, .. }));
        arena.dealloc(b);
        arena.dealloc(c);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_scratch_falls_back_when_wrap_hits_live_data() {
        let mut arena = ScratchArena::new(32);
        let a = arena.alloc(12);
        let b = arena.alloc(12);
        // Only 8 bytes remain at the tail and the front is still live.
        let c = arena.alloc(12);
        assert!(!c.is_ring());
        assert_eq!(arena.fallbacks(), 1);
        assert_eq!(arena.backing().allocated(), 12);
        arena.dealloc(c);
        assert_eq!(arena.backing().allocated(), 0);
        arena.dealloc(a);
        arena.dealloc(b);
    }

    #[test]
    fn test_scratch_out_of_order_free() {
        let mut arena = ScratchArena::new(48);
        let a = arena.alloc(16);
        let b = arena.alloc(16);
        let c = arena.alloc(16);
        // Freeing the middle block does not move the free pointer.
        arena.dealloc(b);
        assert!(!arena.alloc_would_fit_after_free_for_test(16));
        arena.dealloc(a);
        // a and b are now both reclaimed.
        let d = arena.alloc(32);
        assert!(d.is_ring());
        arena.dealloc(c);
        arena.dealloc(d);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_scratch_oversized_request_uses_backing() {
        let mut arena = ScratchArena::new(16);
        let big = arena.alloc(64);
        assert!(!big.is_ring());
        arena.dealloc(big);
        assert_eq!(arena.backing().allocated(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown block")]
    fn test_scratch_double_free_panics() {
        let mut arena = ScratchArena::new(16);
        let a = arena.alloc(4);
        let again = Block::Ring { offset: 0, words: 1, bytes: 4 };
        arena.dealloc(a);
        arena.dealloc(again);
    }

    #[test]
    #[should_panic(expected = "wrong size")]
    fn test_scratch_dealloc_checks_block_size() {
        let mut arena = ScratchArena::new(64);
        let _a = arena.alloc(8);
        arena.dealloc(Block::Ring { offset: 0, words: 3, bytes: 12 });
    }

    impl<B: Allocator> ScratchArena<B> {
        fn alloc_would_fit_after_free_for_test(&self, bytes: usize) -> bool {
            let words = words_for(bytes);
            let mut start = self.allocate;
            if start + words > self.memory.len() {
                start = 0;
            }
            !self.in_use(start, start + words)
        }
    }
}
