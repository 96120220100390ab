use crate::{
    arch::{mmu::Sv39Table, mmu::PAGE_SIZE, trap::TrapFrame},
    bsp,
    heap::Heap,
    mmu::{Memory, Permissions, UserSpace},
    util::{KernelError, KernelResult},
};

/// One past the highest user stack address.
pub const USER_STACK_TOP: u64 = 0x7fff_f000;

/// First virtual address handed to the user heap. An image mapped at or
/// above it pushes the heap past its highest segment instead.
pub const USER_FREE_ADDRESS_START: u64 = 0x0040_0000;

/// The heap grows up to the user stack page and no further.
pub const USER_HEAP_LIMIT: u64 = USER_STACK_TOP - PAGE_SIZE as u64;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentType {
    Code = 1,
    Data = 2,
}

/// A loaded segment. A slot whose `va` is 0 is free.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedRegion {
    pub va: u64,
    pub npages: u64,
    pub seg_type: SegmentType,
}

impl MappedRegion {
    pub const EMPTY: Self = Self {
        va: 0,
        npages: 0,
        seg_type: SegmentType::Code,
    };

    pub fn is_free(&self) -> bool {
        self.va == 0
    }
}

/// As many descriptors as fit in one page.
pub const MAX_MAPPED_REGIONS: usize = PAGE_SIZE / core::mem::size_of::<MappedRegion>();

/// A user process. Each hart owns exactly one, created at boot and reused by exec.
pub struct Process {
    /// Top of this process's kernel stack.
    pub kstack: u64,
    pub pagetable: Sv39Table,
    pub trapframe: TrapFrame,
    pub mapped_info: [MappedRegion; MAX_MAPPED_REGIONS],
    pub total_mapped_region: usize,
    pub heap: Heap,
    loaded: bool,
}

impl Process {
    /// Builds an empty address space: kernel gigapage, one user stack page,
    /// and a kernel stack frame.
    pub fn new<M: Memory + ?Sized>(hartid: usize, mem: &mut M) -> KernelResult<Self> {
        let pagetable = Sv39Table::new(mem)?;
        pagetable.map_gigapage(mem, bsp::DRAM_BASE, bsp::DRAM_BASE, Permissions::RWX);

        let kstack = mem.alloc_zeroed_frame().ok_or(KernelError::OutOfMemory)?;

        let stack_page = mem.alloc_zeroed_frame().ok_or(KernelError::OutOfMemory)?;
        pagetable.map_page(
            mem,
            USER_STACK_TOP - PAGE_SIZE as u64,
            stack_page,
            Permissions::RW | Permissions::User,
        )?;

        let mut trapframe = TrapFrame::new();
        trapframe.regs.sp = USER_STACK_TOP;
        trapframe.hartid = hartid as u64;

        Ok(Self {
            kstack: kstack + PAGE_SIZE as u64,
            pagetable,
            trapframe,
            mapped_info: [MappedRegion::EMPTY; MAX_MAPPED_REGIONS],
            total_mapped_region: 0,
            heap: Heap::new(USER_FREE_ADDRESS_START, USER_HEAP_LIMIT),
            loaded: false,
        })
    }

    /// The process's address space, accessed through `mem`.
    pub fn space<'a, M: Memory + ?Sized>(&self, mem: &'a mut M) -> UserSpace<'a, M> {
        UserSpace::new(self.pagetable, mem)
    }

    /// Whether an image has been loaded and the process may be switched to.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Records `region` in the first free slot and returns the slot index.
    pub fn add_mapped_region(&mut self, region: MappedRegion) -> KernelResult<usize> {
        let pos = self
            .mapped_info
            .iter()
            .position(MappedRegion::is_free)
            .ok_or(KernelError::MappedRegionsExhausted)?;
        self.mapped_info[pos] = region;
        self.total_mapped_region += 1;
        Ok(pos)
    }

    pub fn mapped_regions(&self) -> impl Iterator<Item = &MappedRegion> {
        self.mapped_info.iter().filter(|r| !r.is_free())
    }

    /// One past the highest page any code or data region covers.
    pub fn image_end(&self) -> Option<u64> {
        self.mapped_regions()
            .map(|r| r.va + r.npages * PAGE_SIZE as u64)
            .max()
    }

    /// Unmaps every recorded code/data page, returns its frame and clears the table.
    pub fn release_segments<M: Memory + ?Sized>(&mut self, mem: &mut M) {
        for region in self.mapped_info.iter_mut().filter(|r| !r.is_free()) {
            for page in 0..region.npages {
                let va = region.va + page * PAGE_SIZE as u64;
                if let Some(pa) = self.pagetable.unmap_page(mem, va) {
                    mem.free_frame(pa);
                }
            }
            *region = MappedRegion::EMPTY;
        }
        self.total_mapped_region = 0;
    }

    /// Drops the old image before exec loads a new one: segments, heap pages
    /// and heap lists go; the stack page and the heap cursor stay.
    pub fn exec_clean<M: Memory + ?Sized>(&mut self, mem: &mut M) {
        self.release_segments(mem);
        let mut space = UserSpace::new(self.pagetable, mem);
        self.heap.release(&mut space);
        self.loaded = false;
    }
}
