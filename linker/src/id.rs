// id.rs — Session-scoped kernel identifiers
//
// IDs are allocated in link order by an allocator owned by the linking
// session. There is no process-wide counter: a new session starts from zero.

use std::fmt;

/// Position of a kernel in the link order. Also the "kernel index" the
/// memory model uses to order variable accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for kernel IDs. Produces monotonically increasing IDs in
/// allocation order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_kernel: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_kernel(&mut self) -> KernelId {
        let id = KernelId(self.next_kernel);
        self.next_kernel += 1;
        id
    }

    /// The ID the next `alloc_kernel` call will return.
    pub fn peek_kernel(&self) -> KernelId {
        KernelId(self.next_kernel)
    }

    /// Number of kernel IDs handed out so far.
    pub fn kernels_allocated(&self) -> u32 {
        self.next_kernel
    }
}
