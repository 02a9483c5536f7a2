//! Growable, sub-allocating buffer pool.
//!
//! The pool owns one large purpose-tagged device buffer per [`BufferKind`]
//! and hands out aligned sub-regions from it. Allocation is append-only:
//! offsets never move and freed space is never reused. When a buffer runs
//! out of room it is grown to the next power of two, its occupied bytes are
//! copied to the new allocation, and the old buffer is destroyed — issued
//! offsets stay valid, only the `vk::Buffer` handle changes, so callers
//! must re-query [`BufferPool::buffer`] after any allocation instead of
//! caching the handle.

use crate::command::{self, CommandPool};
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Purpose tag of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum BufferKind {
    /// Device-local vertex data.
    Vertex = 0,
    /// Device-local index data.
    Index = 1,
    /// Device-local uniform data, filled through staging.
    Uniform = 2,
    /// Host-visible uniform data, permanently mapped and updated per frame.
    UniformMappable = 3,
    /// Device-local storage data for compute.
    Storage = 4,
    /// Host-visible staging area used as the hop for device-local
    /// transfers.
    Staging = 5,
}

impl BufferKind {
    /// All kinds, in slot order.
    pub const ALL: [Self; 6] = [
        Self::Vertex,
        Self::Index,
        Self::Uniform,
        Self::UniformMappable,
        Self::Storage,
        Self::Staging,
    ];

    /// Initial capacity of the pooled buffer.
    const fn default_size(self) -> u64 {
        match self {
            Self::Vertex | Self::Storage | Self::Staging => 1 << 24,
            Self::Index => 1 << 22,
            Self::Uniform | Self::UniformMappable => 1 << 20,
        }
    }

    const fn usage(self) -> vk::BufferUsageFlags {
        // Every pooled buffer is copyable in both directions so that growth
        // and transfers always work.
        let transferable = vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
            | vk::BufferUsageFlags::TRANSFER_DST.as_raw();
        let specific = match self {
            Self::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
                    | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
            }
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER.as_raw(),
            Self::Uniform | Self::UniformMappable => vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw(),
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
            Self::Staging => 0,
        };
        vk::BufferUsageFlags::from_raw(transferable | specific)
    }

    const fn location(self) -> MemoryLocation {
        match self {
            Self::UniformMappable => MemoryLocation::CpuToGpu,
            Self::Staging => MemoryLocation::CpuToGpu,
            _ => MemoryLocation::GpuOnly,
        }
    }

    /// Whether the pooled buffer is permanently mapped on the host.
    pub const fn host_visible(self) -> bool {
        matches!(self, Self::UniformMappable | Self::Staging)
    }

    const fn needs_uniform_alignment(self) -> bool {
        matches!(self, Self::Uniform | Self::UniformMappable)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Vertex => "pool.vertex",
            Self::Index => "pool.index",
            Self::Uniform => "pool.uniform",
            Self::UniformMappable => "pool.uniform_mappable",
            Self::Storage => "pool.storage",
            Self::Staging => "pool.staging",
        }
    }
}

/// Smallest power of two at or above `n`.
pub(crate) const fn next_pow2(n: u64) -> u64 {
    n.next_power_of_two()
}

const fn align_up(n: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        n
    } else {
        n.div_ceil(alignment) * alignment
    }
}

/// Result of carving regions out of a ledger.
#[derive(Debug)]
pub(crate) struct Carve {
    /// Byte offset of each region.
    pub offsets: Vec<u64>,
    /// Aligned per-region stride actually reserved.
    pub aligned_size: u64,
    /// New capacity to grow the backing buffer to, if it was exceeded.
    pub grow_to: Option<u64>,
}

/// Append-only allocation bookkeeping for one pooled buffer.
///
/// Pure: holds no device objects, so carving and growth sizing are testable
/// without a GPU.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionLedger {
    capacity: u64,
    allocated: u64,
}

impl RegionLedger {
    pub(crate) const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    pub(crate) const fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) const fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Reserve `count` regions of `size` bytes each, aligned to
    /// `alignment`. Offsets are contiguous and start at the previous
    /// allocation end; they never reuse freed space.
    pub(crate) fn carve(&mut self, count: u32, size: u64, alignment: u64) -> Carve {
        debug_assert!(count > 0 && size > 0);
        debug_assert!(self.allocated % alignment.max(1) == 0);

        let aligned_size = align_up(size, alignment);
        let total = aligned_size * u64::from(count);

        let offsets = (0..u64::from(count))
            .map(|i| self.allocated + i * aligned_size)
            .collect();

        let end = self.allocated + total;
        let grow_to = if end > self.capacity {
            let new_capacity = next_pow2(end);
            self.capacity = new_capacity;
            Some(new_capacity)
        } else {
            None
        };
        self.allocated = end;

        Carve {
            offsets,
            aligned_size,
            grow_to,
        }
    }
}

/// A set of equal-size regions carved from one pooled buffer.
///
/// This is a logical view: it records the buffer *kind*, never the
/// `vk::Buffer` handle, so it stays valid across pool growth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSet {
    /// Kind of the backing pooled buffer.
    pub kind: BufferKind,
    /// Number of regions.
    pub count: u32,
    /// Byte offset of each region in the backing buffer.
    pub offsets: Vec<u64>,
    /// Usable size of each region.
    pub size: u64,
    /// Aligned stride each region actually occupies.
    pub aligned_size: u64,
}

impl RegionSet {
    /// Validate that `offset + size` fits inside each region.
    pub fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| GpuError::Validation("region offset overflow".to_string()))?;
        if size == 0 {
            return Err(GpuError::Validation("empty transfer".to_string()));
        }
        if end > self.size {
            return Err(GpuError::Validation(format!(
                "range {offset}..{end} exceeds region size {}",
                self.size
            )));
        }
        Ok(())
    }
}

struct PoolSlot {
    buffer: GpuBuffer,
    ledger: RegionLedger,
}

/// One growable device buffer per [`BufferKind`].
pub struct BufferPool {
    device: Arc<ash::Device>,
    slots: Vec<PoolSlot>,
    uniform_alignment: u64,
    transfer_queue: vk::Queue,
    transfer_pool: CommandPool,
}

impl BufferPool {
    /// Create the pool with its default per-kind buffers.
    ///
    /// # Safety
    /// All handles must be valid; `transfer_queue` must belong to
    /// `transfer_queue_family`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        allocator: &mut GpuAllocator,
        uniform_alignment: u64,
        transfer_queue_family: u32,
        transfer_queue: vk::Queue,
    ) -> Result<Self> {
        let transfer_pool = unsafe {
            CommandPool::new(
                &device,
                transfer_queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };

        let mut slots = Vec::with_capacity(BufferKind::ALL.len());
        for kind in BufferKind::ALL {
            let size = kind.default_size();
            let buffer = allocator.create_buffer(size, kind.usage(), kind.location(), kind.name())?;
            tracing::debug!(?kind, size, "created pooled buffer");
            slots.push(PoolSlot {
                buffer,
                ledger: RegionLedger::new(size),
            });
        }

        Ok(Self {
            device,
            slots,
            uniform_alignment,
            transfer_queue,
            transfer_pool,
        })
    }

    fn slot(&self, kind: BufferKind) -> &PoolSlot {
        &self.slots[kind as usize]
    }

    /// Current `vk::Buffer` handle backing a kind.
    ///
    /// Re-query after every allocation: growth replaces the handle.
    pub fn buffer(&self, kind: BufferKind) -> vk::Buffer {
        self.slot(kind).buffer.buffer
    }

    /// Bytes currently sub-allocated from a kind's buffer.
    pub fn allocated(&self, kind: BufferKind) -> u64 {
        self.slot(kind).ledger.allocated()
    }

    /// Capacity of a kind's buffer.
    pub fn capacity(&self, kind: BufferKind) -> u64 {
        self.slot(kind).ledger.capacity()
    }

    /// Mapped host access to a host-visible pooled buffer.
    pub fn mapped(&self, kind: BufferKind) -> Result<&GpuBuffer> {
        let slot = self.slot(kind);
        if !kind.host_visible() {
            return Err(GpuError::InvalidState(format!(
                "{kind:?} buffer is not host-visible"
            )));
        }
        Ok(&slot.buffer)
    }

    /// Carve `count` regions of `size` bytes out of the `kind` buffer,
    /// growing it (and preserving its contents) if needed.
    pub fn allocate(
        &mut self,
        allocator: &mut GpuAllocator,
        kind: BufferKind,
        count: u32,
        size: u64,
    ) -> Result<RegionSet> {
        if count == 0 || size == 0 {
            return Err(GpuError::Validation(
                "region count and size must be non-zero".to_string(),
            ));
        }

        let alignment = if kind.needs_uniform_alignment() {
            self.uniform_alignment
        } else {
            0
        };

        // Snapshot before carving: the carve commits new capacity and
        // cursor to the ledger, but the grown buffer only exists once
        // `grow` succeeds. On failure the ledger is rolled back so the
        // offsets it hands out keep matching the buffer that exists.
        let snapshot = self.slots[kind as usize].ledger;
        let carve = self.slots[kind as usize].ledger.carve(count, size, alignment);

        if let Some(new_capacity) = carve.grow_to {
            // Only the bytes occupied before this carve survive the copy.
            if let Err(err) = self.grow(allocator, kind, new_capacity, snapshot.allocated()) {
                self.slots[kind as usize].ledger = snapshot;
                return Err(err);
            }
        }

        tracing::debug!(?kind, count, size, offset = carve.offsets[0], "allocated regions");

        Ok(RegionSet {
            kind,
            count,
            offsets: carve.offsets,
            size,
            aligned_size: carve.aligned_size,
        })
    }

    /// Make sure the staging buffer can hold `size` bytes, growing it if
    /// needed. Staging is reused as scratch, not sub-allocated, so growth
    /// here does not copy old contents.
    pub fn reserve_staging(&mut self, allocator: &mut GpuAllocator, size: u64) -> Result<()> {
        let kind = BufferKind::Staging;
        let slot = &mut self.slots[kind as usize];
        if slot.buffer.size >= size {
            return Ok(());
        }

        let new_size = next_pow2(size);
        tracing::info!(new_size, "growing staging buffer");
        let new_buffer =
            allocator.create_buffer(new_size, kind.usage(), kind.location(), kind.name())?;
        let mut old = std::mem::replace(&mut slot.buffer, new_buffer);
        slot.ledger = RegionLedger::new(new_size);
        allocator.free_buffer(&mut old)?;
        Ok(())
    }

    /// Replace a kind's buffer with a larger one, copying the occupied
    /// prefix `[0, occupied)` on the transfer queue before destroying the
    /// old buffer.
    fn grow(
        &mut self,
        allocator: &mut GpuAllocator,
        kind: BufferKind,
        new_capacity: u64,
        occupied: u64,
    ) -> Result<()> {
        tracing::info!(?kind, new_capacity, "growing pooled buffer");

        let new_buffer =
            allocator.create_buffer(new_capacity, kind.usage(), kind.location(), kind.name())?;

        let slot = &mut self.slots[kind as usize];
        if occupied > 0 {
            let copy = vk::BufferCopy::default().size(occupied);
            let src = slot.buffer.buffer;
            let dst = new_buffer.buffer;
            unsafe {
                command::one_time_submit(
                    &self.device,
                    &self.transfer_pool,
                    self.transfer_queue,
                    |cmd| {
                        self.device.cmd_copy_buffer(cmd, src, dst, &[copy]);
                    },
                )?;
            }
        }

        let mut old = std::mem::replace(&mut slot.buffer, new_buffer);
        allocator.free_buffer(&mut old)?;
        Ok(())
    }

    /// Destroy all pooled buffers and the transfer command pool.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, allocator: &mut GpuAllocator) {
        for slot in &mut self.slots {
            if let Err(err) = allocator.free_buffer(&mut slot.buffer) {
                tracing::warn!(%err, "failed to free pooled buffer");
            }
        }
        unsafe { self.transfer_pool.destroy(&self.device) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_contiguous_and_monotonic() {
        let mut ledger = RegionLedger::new(1024);

        let a = ledger.carve(3, 100, 0);
        assert_eq!(a.offsets, vec![0, 100, 200]);
        assert!(a.grow_to.is_none());

        let b = ledger.carve(2, 50, 0);
        assert_eq!(b.offsets, vec![300, 350]);

        // No free list: a later carve never revisits earlier offsets.
        let c = ledger.carve(1, 10, 0);
        assert_eq!(c.offsets, vec![400]);
        assert!(ledger.allocated() <= ledger.capacity());
    }

    #[test]
    fn alignment_pads_stride_and_offsets() {
        let mut ledger = RegionLedger::new(4096);
        let carve = ledger.carve(3, 100, 256);
        assert_eq!(carve.aligned_size, 256);
        assert_eq!(carve.offsets, vec![0, 256, 512]);
        for offset in &carve.offsets {
            assert_eq!(offset % 256, 0);
        }
        assert_eq!(ledger.allocated(), 768);
    }

    #[test]
    fn growth_doubles_to_next_pow2() {
        let mut ledger = RegionLedger::new(256);
        let a = ledger.carve(1, 256, 0);
        assert!(a.grow_to.is_none());
        assert_eq!(ledger.allocated(), 256);

        // 256 occupied + 256 requested exceeds 256 and grows to 512.
        let b = ledger.carve(1, 256, 0);
        assert_eq!(b.grow_to, Some(512));
        assert_eq!(b.offsets, vec![256]);
        assert_eq!(ledger.capacity(), 512);

        // A large request jumps straight past doubling.
        let c = ledger.carve(1, 3000, 0);
        assert_eq!(c.grow_to, Some(4096));
        assert_eq!(c.offsets, vec![512]);
    }

    #[test]
    fn growth_preserves_prior_bytes() {
        // Growth copies [0, occupied) into the new buffer; simulate the
        // backing store to check byte-for-byte preservation and that new
        // offsets land after the old allocation end.
        let mut ledger = RegionLedger::new(256);
        let mut store = vec![0_u8; 256];

        let first = ledger.carve(1, 256, 0);
        for (i, byte) in store.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(first.offsets[0], 0);

        let second = ledger.carve(1, 256, 0);
        let new_capacity = second.grow_to.expect("must grow");
        let mut grown = vec![0_u8; new_capacity as usize];
        grown[..store.len()].copy_from_slice(&store);
        store = grown;

        assert_eq!(second.offsets[0], 256);
        for (i, byte) in store[..256].iter().enumerate() {
            assert_eq!(*byte, i as u8);
        }
    }

    #[test]
    fn ledger_rolls_back_when_growth_cannot_commit() {
        // A carve that requires growth commits capacity and cursor to the
        // ledger up front. If the grown buffer cannot be created the caller
        // restores the snapshot; the restored ledger must hand out the very
        // same growth target and offsets on retry, never phantom capacity.
        let mut ledger = RegionLedger::new(256);
        ledger.carve(1, 200, 0);
        assert_eq!(ledger.allocated(), 200);

        let snapshot = ledger;
        let failed = ledger.carve(1, 200, 0);
        assert_eq!(failed.grow_to, Some(512));

        // Buffer creation failed; roll back.
        ledger = snapshot;
        assert_eq!(ledger.capacity(), 256);
        assert_eq!(ledger.allocated(), 200);

        let retry = ledger.carve(1, 200, 0);
        assert_eq!(retry.grow_to, Some(512));
        assert_eq!(retry.offsets, vec![200]);
    }

    #[test]
    fn region_range_validation() {
        let region = RegionSet {
            kind: BufferKind::Vertex,
            count: 1,
            offsets: vec![0],
            size: 64,
            aligned_size: 64,
        };
        assert!(region.check_range(0, 64).is_ok());
        assert!(region.check_range(32, 32).is_ok());
        assert!(region.check_range(32, 33).is_err());
        assert!(region.check_range(0, 0).is_err());
        assert!(region.check_range(u64::MAX, 2).is_err());
    }

    #[test]
    fn next_pow2_rounds_up() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(255), 256);
        assert_eq!(next_pow2(256), 256);
        assert_eq!(next_pow2(257), 512);
    }
}
