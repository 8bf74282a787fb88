use std::cell::{Cell, UnsafeCell};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Bump arena for short-lived allocations inside a job.
///
/// Allocations live until the next `reset`; the owning worker resets the
/// arena when the job it is running completes. Not `Sync`: one arena per
/// worker thread.
pub struct ScratchArena {
    chunks: UnsafeCell<Vec<Box<[u8]>>>,
    chunk_size: usize,
    /// Offset into the last chunk.
    offset: Cell<usize>,
    /// Actual bytes held by every chunk except the current bump chunk;
    /// dedicated oversized chunks are larger than `chunk_size`.
    retired_chunk_bytes: Cell<usize>,
}

impl std::fmt::Debug for ScratchArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchArena")
            .field("chunk_size", &self.chunk_size)
            .field("offset", &self.offset.get())
            .field("retired_chunk_bytes", &self.retired_chunk_bytes.get())
            .finish()
    }
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl ScratchArena {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunks: UnsafeCell::new(vec![vec![0u8; chunk_size].into_boxed_slice()]),
            chunk_size,
            offset: Cell::new(0),
            retired_chunk_bytes: Cell::new(0),
        }
    }

    /// Allocate a zeroed slice of `count` elements.
    ///
    /// Oversized requests get a dedicated chunk; everything else bumps the
    /// current chunk. Returned slices are disjoint and stay alive until
    /// `reset`.
    pub fn alloc_slice<T: bytemuck::Zeroable>(&self, count: usize) -> &mut [T] {
        let size = count * std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        let bytes = self.alloc_bytes(size, align);
        // Alignment and size were honored by alloc_bytes and the memory is
        // zeroed, which is a valid bit pattern for T.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, count) }
    }

    pub fn alloc_bytes(&self, size: usize, align: usize) -> &mut [u8] {
        assert!(align.is_power_of_two());
        let chunks = unsafe { &mut *self.chunks.get() };

        if size + align > self.chunk_size {
            // Dedicated chunk; does not disturb the bump offset.
            let mut chunk = vec![0u8; size + align].into_boxed_slice();
            let base = chunk.as_mut_ptr() as usize;
            let aligned = (base + align - 1) & !(align - 1);
            let start = aligned - base;
            self.retired_chunk_bytes
                .set(self.retired_chunk_bytes.get() + chunk.len());
            let insert_at = chunks.len() - 1;
            chunks.insert(insert_at, chunk);
            let chunk = chunks[insert_at].as_mut_ptr();
            return unsafe { std::slice::from_raw_parts_mut(chunk.add(start), size) };
        }

        let current = chunks.last_mut().unwrap();
        let base = current.as_mut_ptr() as usize;
        let aligned = (base + self.offset.get() + align - 1) & !(align - 1);
        let start = aligned - base;

        if start + size > self.chunk_size {
            // the current bump chunk retires at its full length
            self.retired_chunk_bytes
                .set(self.retired_chunk_bytes.get() + chunks.last().map(|chunk| chunk.len()).unwrap_or(0));
            chunks.push(vec![0u8; self.chunk_size].into_boxed_slice());
            self.offset.set(0);
            return self.alloc_bytes(size, align);
        }

        self.offset.set(start + size);
        let current = chunks.last_mut().unwrap();
        unsafe { std::slice::from_raw_parts_mut(current.as_mut_ptr().add(start), size) }
    }

    /// Drop every chunk but the first and rewind. Invalidates outstanding
    /// borrows, hence `&mut self`.
    pub fn reset(&mut self) {
        let chunks = self.chunks.get_mut();
        chunks.truncate(1);
        chunks[0].fill(0);
        self.offset.set(0);
        self.retired_chunk_bytes.set(0);
    }

    /// Bytes held by retired chunks plus the used portion of the current
    /// bump chunk.
    pub fn bytes_in_use(&self) -> usize {
        self.retired_chunk_bytes.get() + self.offset.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_disjoint_and_zeroed() {
        let arena = ScratchArena::with_chunk_size(256);
        let a = arena.alloc_slice::<u32>(8);
        let b = arena.alloc_slice::<u32>(8);
        a.fill(1);
        b.fill(2);
        assert!(a.iter().all(|&v| v == 1));
        assert!(b.iter().all(|&v| v == 2));
    }

    #[test]
    fn overflow_grows_a_new_chunk() {
        let arena = ScratchArena::with_chunk_size(64);
        let _a = arena.alloc_bytes(48, 1);
        let _b = arena.alloc_bytes(48, 1);
        assert!(arena.bytes_in_use() >= 96);
    }

    #[test]
    fn oversized_allocation_gets_its_own_chunk() {
        let arena = ScratchArena::with_chunk_size(64);
        let big = arena.alloc_bytes(1024, 16);
        assert_eq!(big.len(), 1024);
        // the dedicated chunk counts at its real length, not chunk_size
        assert_eq!(arena.bytes_in_use(), 1024 + 16);
        let small = arena.alloc_bytes(16, 1);
        assert_eq!(small.len(), 16);
        assert_eq!(arena.bytes_in_use(), 1024 + 16 + 16);
    }

    #[test]
    fn oversized_chunks_reset_like_the_rest() {
        let mut arena = ScratchArena::with_chunk_size(64);
        arena.alloc_bytes(4096, 8);
        assert!(arena.bytes_in_use() >= 4096);
        arena.reset();
        assert_eq!(arena.bytes_in_use(), 0);
    }

    #[test]
    fn reset_rewinds() {
        let mut arena = ScratchArena::with_chunk_size(128);
        arena.alloc_bytes(100, 1);
        arena.alloc_bytes(100, 1);
        arena.reset();
        assert_eq!(arena.bytes_in_use(), 0);
    }

    #[test]
    fn alignment_is_honored() {
        let arena = ScratchArena::with_chunk_size(256);
        arena.alloc_bytes(1, 1);
        let aligned = arena.alloc_bytes(32, 64);
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
    }
}
