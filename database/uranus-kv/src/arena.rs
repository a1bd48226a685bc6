//! Bump allocation for skiplist nodes.
//!
//! Memory handed out by an [`Allocator`] stays valid until the allocator itself
//! is dropped. There is no way to give back a single allocation: a memtable
//! and every node inside it are retired as one unit.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use tracing::trace;

/// Size of a regular arena block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Alignment of every block the arena requests from the system.
const BLOCK_ALIGN: usize = 16;

/// Memory source for skiplist nodes.
///
/// Implementations must be usable from several threads at once and must keep
/// every returned region alive, unmoved, until they are dropped.
pub trait Allocator: Send + Sync {
    /// Returns a region that fits `layout`, aligned to `layout.align()`.
    fn allocate_aligned(&self, layout: Layout) -> NonNull<u8>;

    /// Total bytes reserved from the system so far.
    fn memory_usage(&self) -> usize;
}

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct ArenaState {
    /// Bump pointer inside the current block.
    cursor: *mut u8,
    remaining: usize,
    blocks: Vec<Block>,
}

// the raw pointers only ever point into `blocks`, which the state owns.
unsafe impl Send for ArenaState {}

/// A block allocator in the style of LevelDB's `Arena`.
///
/// Small requests are carved out of the current block; a request larger than a
/// quarter of a block gets a block of its own so the tail of the current block
/// is not wasted.
pub struct Arena {
    state: Mutex<ArenaState>,
    memory_usage: AtomicUsize,
    block_size: usize,
}

impl Arena {
    pub fn new() -> Arena {
        Arena::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Arena {
        Arena {
            state: Mutex::new(ArenaState {
                cursor: std::ptr::null_mut(),
                remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
            block_size: block_size.max(BLOCK_ALIGN),
        }
    }

    /// Number of blocks reserved so far.
    pub fn block_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .len()
    }

    fn allocate_block(&self, state: &mut ArenaState, size: usize, align: usize) -> *mut u8 {
        let layout = match Layout::from_size_align(size, align.max(BLOCK_ALIGN)) {
            Ok(layout) => layout,
            Err(_) => panic!("arena block of {} bytes overflows the address space", size),
        };
        // Safety: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout)
        };
        state.blocks.push(Block { ptr, layout });
        self.memory_usage
            .fetch_add(size + std::mem::size_of::<Block>(), Ordering::Relaxed);
        trace!(size, blocks = state.blocks.len(), "arena reserved a new block");
        ptr.as_ptr()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for Arena {
    fn allocate_aligned(&self, layout: Layout) -> NonNull<u8> {
        // zero sized requests still get a distinct, aligned address
        let size = layout.size().max(1);
        let align = layout.align();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if !state.cursor.is_null() {
            let padding = state.cursor.align_offset(align);
            if padding != usize::MAX && padding + size <= state.remaining {
                // Safety: `padding + size` bytes past the cursor are inside the block.
                let ptr = unsafe { state.cursor.add(padding) };
                state.cursor = unsafe { ptr.add(size) };
                state.remaining -= padding + size;
                // Safety: derived from a non-null block pointer.
                return unsafe { NonNull::new_unchecked(ptr) };
            }
        }

        if size > self.block_size / 4 || align > BLOCK_ALIGN {
            // dedicated block, the current one keeps serving small requests
            let ptr = self.allocate_block(&mut state, size, align);
            // Safety: `allocate_block` never returns null.
            return unsafe { NonNull::new_unchecked(ptr) };
        }

        let block = self.allocate_block(&mut state, self.block_size, BLOCK_ALIGN);
        // Safety: a fresh block is aligned to BLOCK_ALIGN >= align and holds `size` bytes.
        state.cursor = unsafe { block.add(size) };
        state.remaining = self.block_size - size;
        unsafe { NonNull::new_unchecked(block) }
    }

    fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for block in state.blocks.drain(..) {
            // Safety: every block was allocated with exactly this layout.
            unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}
