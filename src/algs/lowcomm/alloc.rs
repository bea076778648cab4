//! Pluggable allocators for message buffers.

/// Source of message buffers. Returning `None` triggers the transport's
/// low-memory backoff (drain receives, reclaim finished sends, retry).
pub trait BufferAllocator {
    /// A zeroed buffer of exactly `size` bytes, or `None` when out of memory.
    fn allocate(&mut self, size: usize) -> Option<Vec<u8>>;
    /// Give a buffer back.
    fn release(&mut self, buf: Vec<u8>);
}

/// Plain heap allocation; never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; size])
    }

    fn release(&mut self, _buf: Vec<u8>) {}
}

/// Heap allocation bounded by a byte budget.
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    limit: usize,
    in_use: usize,
}

impl BudgetAllocator {
    pub fn new(limit: usize) -> Self {
        Self { limit, in_use: 0 }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl BufferAllocator for BudgetAllocator {
    fn allocate(&mut self, size: usize) -> Option<Vec<u8>> {
        let next = self.in_use.checked_add(size)?;
        if next > self.limit {
            return None;
        }
        self.in_use = next;
        Some(vec![0u8; size])
    }

    fn release(&mut self, buf: Vec<u8>) {
        self.in_use = self.in_use.saturating_sub(buf.len());
    }
}
