use crate::arch::mmu::PAGE_SIZE;
use crate::mmu::FrameAllocator;

/// Page flags
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum PageFlags {
    Free = 1 << 0,
    Taken = 1 << 1,
}

impl PageFlags {
    pub const fn val(&self) -> u8 {
        *self as u8
    }
}

/// Physical page allocator over a fixed pool of `PAGES` page frames.
/// One descriptor byte tracks each frame.
pub struct PhysicalPageAllocator<const PAGES: usize> {
    start: usize,
    descriptors: [u8; PAGES],
}

impl<const PAGES: usize> PhysicalPageAllocator<PAGES> {
    pub const fn new() -> Self {
        Self {
            start: 0,
            descriptors: [PageFlags::Free.val(); PAGES],
        }
    }

    /// Initializes with the given start value.
    ///
    /// # Safety
    /// `[start, start + PAGES * PAGE_SIZE)` must be unused, page-aligned RAM.
    pub unsafe fn init(&mut self, start: usize) {
        assert!(start % PAGE_SIZE == 0, "frame pool must be page-aligned");
        self.start = start;
        self.descriptors = [PageFlags::Free.val(); PAGES];
    }

    pub fn get_base(&self) -> usize {
        self.start
    }

    pub fn free_pages(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| **d & PageFlags::Free.val() != 0)
            .count()
    }

    /// Try to allocate the contiguous region of pages, returning the address of the region if possible.
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        let pages = size_to_pages(size);
        assert!(pages > 0, "Can't make an empty allocation");
        let mut begin_index = 0;
        let mut matching = 0;
        let mut found = None;
        for (i, entry) in self.descriptors.iter().enumerate() {
            if *entry & PageFlags::Free.val() != 0 {
                if matching == 0 {
                    begin_index = i;
                }
                matching += 1;
            } else {
                matching = 0;
            }
            if matching >= pages {
                found = Some(begin_index);
                break;
            }
        }
        let begin_index = found?;
        // Mark all descriptors as taken and return value.
        for descriptor in self.descriptors[begin_index..begin_index + pages].iter_mut() {
            *descriptor = (*descriptor) & !PageFlags::Free.val() | PageFlags::Taken.val();
        }
        Some(self.start + begin_index * PAGE_SIZE)
    }

    /// Deallocates the given region of pages.
    pub fn deallocate(&mut self, addr: usize, size: usize) {
        let offset = addr - self.start;
        assert!(offset % PAGE_SIZE == 0, "freeing an unaligned frame");
        let pages = size_to_pages(size);
        let begin_index = offset / PAGE_SIZE;
        for descriptor in self.descriptors[begin_index..begin_index + pages].iter_mut() {
            assert!(
                *descriptor & PageFlags::Taken.val() != 0,
                "double free of frame 0x{:x}",
                addr
            );
            *descriptor = (*descriptor) & !PageFlags::Taken.val() | PageFlags::Free.val();
        }
    }
}

impl<const PAGES: usize> FrameAllocator for PhysicalPageAllocator<PAGES> {
    fn alloc_frame(&mut self) -> Option<u64> {
        self.try_allocate(PAGE_SIZE).map(|addr| addr as u64)
    }

    fn free_frame(&mut self, pa: u64) {
        self.deallocate(pa as usize, PAGE_SIZE);
    }
}

const fn size_to_pages(size: usize) -> usize {
    let u = size / PAGE_SIZE;
    if size % PAGE_SIZE > 0 {
        u + 1
    } else {
        u
    }
}
