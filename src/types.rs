use bitflags::bitflags;

/// Process-unique name of an agent participating in the transfer protocol.
pub type AgentName = String;

/// Dense index of a rail within an engine's rail bank.
pub type RailId = usize;

/// Process-unique 32-bit identifier attached to each data sub-request.
pub type XferId = u32;

/// Kind of memory a descriptor points at.
///
/// fabrix defines its own kind enum so it remains a standalone library
/// usable by any Rust project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemKind {
    /// Host DRAM.
    Dram = 0,
    /// GPU device memory.
    Vram = 1,
    /// Block storage.
    Blk = 2,
    /// File-backed storage.
    File = 3,
}

impl MemKind {
    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            MemKind::Dram => "DRAM",
            MemKind::Vram => "VRAM",
            MemKind::Blk => "BLK",
            MemKind::File => "FILE",
        }
    }
}

impl std::fmt::Display for MemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable description of a contiguous memory region.
///
/// `dev_id` names the GPU ordinal for [`MemKind::Vram`] and serves as the
/// NUMA-node hint for [`MemKind::Dram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    pub virt_addr: u64,
    pub length: usize,
    pub dev_id: u32,
    pub mem_kind: MemKind,
}

impl MemDesc {
    pub fn new(virt_addr: u64, length: usize, dev_id: u32, mem_kind: MemKind) -> Self {
        Self {
            virt_addr,
            length,
            dev_id,
            mem_kind,
        }
    }

    /// Descriptor for a host slice. The slice must stay pinned by the caller
    /// for the lifetime of the registration derived from this descriptor.
    pub fn for_slice(buf: &[u8]) -> Self {
        Self::new(buf.as_ptr() as u64, buf.len(), 0, MemKind::Dram)
    }
}

/// Direction of a one-sided transfer, from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XferOp {
    /// Pull remote bytes into local memory.
    Read,
    /// Push local bytes into remote memory.
    Write,
}

impl std::fmt::Display for XferOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XferOp::Read => f.write_str("READ"),
            XferOp::Write => f.write_str("WRITE"),
        }
    }
}

/// Outcome of a post or poll on an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// All sub-requests have completed.
    Complete,
    /// Still running; poll again via `check_xfer` or `take_notifs`.
    InProgress,
}

impl XferStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, XferStatus::Complete)
    }
}

bitflags! {
    /// Access rights requested when mapping memory with the transport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u32 {
        const LOCAL_READ = 1 << 0;
        const LOCAL_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

impl MemAccess {
    /// The full access set engines request for transfer buffers.
    pub const fn rdma_default() -> Self {
        Self::LOCAL_READ
            .union(Self::LOCAL_WRITE)
            .union(Self::REMOTE_READ)
            .union(Self::REMOTE_WRITE)
    }
}

/// How a cost estimate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostMethod {
    /// Derived from the transport's analytical performance model.
    Analytical,
}

/// Estimated cost of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    pub duration: std::time::Duration,
    pub err_margin: std::time::Duration,
    pub method: CostMethod,
}
