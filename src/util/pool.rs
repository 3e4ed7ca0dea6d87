/// Append-only byte arena backing term text in the indexing hash. Slices
/// never move, so `(offset, len)` handles stay valid until `reset`.
pub struct BytePool {
    blocks: Vec<Box<[u8]>>,
    block_size: usize,
    used_in_last: usize,
}

/// Handle to bytes stored in a [`BytePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolSlice {
    block: u32,
    offset: u32,
    pub len: u32,
}

const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

impl BytePool {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size,
            used_in_last: 0,
        }
    }

    /// Copies `bytes` into the pool. Oversized values get a dedicated block.
    pub fn append(&mut self, bytes: &[u8]) -> PoolSlice {
        if bytes.len() > self.block_size {
            let block = bytes.to_vec().into_boxed_slice();
            let len = block.len();
            self.blocks.push(block);
            // the dedicated block is full; force a fresh tail next time
            self.used_in_last = self.block_size;
            return PoolSlice {
                block: (self.blocks.len() - 1) as u32,
                offset: 0,
                len: len as u32,
            };
        }
        if self.blocks.is_empty() || self.used_in_last + bytes.len() > self.block_size {
            self.blocks
                .push(vec![0u8; self.block_size].into_boxed_slice());
            self.used_in_last = 0;
        }
        let block_idx = self.blocks.len() - 1;
        let offset = self.used_in_last;
        self.blocks[block_idx][offset..offset + bytes.len()].copy_from_slice(bytes);
        self.used_in_last += bytes.len();
        PoolSlice {
            block: block_idx as u32,
            offset: offset as u32,
            len: bytes.len() as u32,
        }
    }

    pub fn get(&self, slice: PoolSlice) -> &[u8] {
        let start = slice.offset as usize;
        &self.blocks[slice.block as usize][start..start + slice.len as usize]
    }

    pub fn bytes_allocated(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    /// Drops every block. Outstanding handles become invalid.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.used_in_last = 0;
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_get() {
        let mut pool = BytePool::with_block_size(16);
        let a = pool.append(b"hello");
        let b = pool.append(b"world!!");
        let c = pool.append(b"spills to next block");
        assert_eq!(pool.get(a), b"hello");
        assert_eq!(pool.get(b), b"world!!");
        assert_eq!(pool.get(c), b"spills to next block");
        assert_eq!(pool.get(a), b"hello");
    }

    #[test]
    fn reset_releases_memory() {
        let mut pool = BytePool::with_block_size(8);
        pool.append(b"12345678");
        assert!(pool.bytes_allocated() >= 8);
        pool.reset();
        assert_eq!(pool.bytes_allocated(), 0);
    }
}
