//! Per-process user heap.
//!
//! Blocks live in the process's own virtual memory: each starts with a memory
//! control block (MCB) header followed by its payload. The kernel runs in a
//! different address space, so every header access goes through the
//! process's [`UserMemory`] translation, page by page.
//!
//! Header layout in user memory (little endian):
//!
//! | offset | field                                |
//! |--------|--------------------------------------|
//! | 0      | payload size in bytes                |
//! | 8      | next header va, `u64::MAX` when none |

use crate::{
    arch::mmu::PAGE_SIZE,
    mmu::{copy_from_user, copy_to_user, Permissions, UserMemory},
    util::{checked_align_up, ErrorExt, KernelError, KernelResult},
};

/// Size of the in-band header preceding every payload.
pub const MCB_SIZE: u64 = 16;

/// Payload sizes are rounded up to this.
pub const HEAP_ALIGN: u64 = 8;

/// Stored link value meaning "no next block". User addresses never reach it.
const NO_NEXT: u64 = u64::MAX;

const PAGE: u64 = PAGE_SIZE as u64;

/// A decoded header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mcb {
    pub size: u64,
    pub next: Option<u64>,
}

impl Mcb {
    pub fn load<S: UserMemory + ?Sized>(space: &S, va: u64) -> KernelResult<Self> {
        let mut raw = [0u8; MCB_SIZE as usize];
        copy_from_user(space, va, &mut raw)?;
        let mut size = [0u8; 8];
        let mut next = [0u8; 8];
        size.copy_from_slice(&raw[..8]);
        next.copy_from_slice(&raw[8..]);
        Ok(Self {
            size: u64::from_le_bytes(size),
            next: match u64::from_le_bytes(next) {
                NO_NEXT => None,
                va => Some(va),
            },
        })
    }

    pub fn store<S: UserMemory + ?Sized>(&self, space: &mut S, va: u64) -> KernelResult<()> {
        let mut raw = [0u8; MCB_SIZE as usize];
        raw[..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..].copy_from_slice(&self.next.unwrap_or(NO_NEXT).to_le_bytes());
        copy_to_user(space, va, &raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapList {
    Used,
    Free,
}

/// Totals over both lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub used_blocks: u64,
    pub used_bytes: u64,
    pub free_blocks: u64,
    pub free_bytes: u64,
}

impl HeapStats {
    /// Payload plus header bytes accounted for by the lists.
    pub fn total(&self) -> u64 {
        self.used_bytes + self.free_bytes + (self.used_blocks + self.free_blocks) * MCB_SIZE
    }
}

/// Closest-fit allocator state: two list heads and the growth cursor.
///
/// The free list is sorted by ascending size, so its first fit is the
/// closest fit. The used list is unordered. Blocks are never coalesced.
///
/// Headers sit in memory the process can write, so every link is checked
/// to land inside the arena before it is followed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heap {
    used: Option<u64>,
    free: Option<u64>,
    /// First page mapped since the last release.
    arena_start: u64,
    /// Next unused heap page. Only moves up.
    cursor: u64,
    /// Growth never maps at or above this.
    limit: u64,
}

/// Follows `next` links from a list head. Gives up after more nodes than
/// the arena can hold, so a cycle cannot spin forever.
struct Chain {
    cur: Option<u64>,
    left: u64,
}

impl Chain {
    fn next<S: UserMemory + ?Sized>(&mut self, heap: &Heap, space: &S) -> KernelResult<Option<(u64, Mcb)>> {
        let va = match self.cur {
            Some(va) => va,
            None => return Ok(None),
        };
        self.left = self.left.checked_sub(1).ok_or(KernelError::HeapCorrupted(va))?;
        let mcb = heap.load(space, va)?;
        self.cur = mcb.next;
        Ok(Some((va, mcb)))
    }
}

impl Heap {
    /// An empty heap growing from `base` towards `limit`.
    pub const fn new(base: u64, limit: u64) -> Self {
        Self {
            used: None,
            free: None,
            arena_start: base,
            cursor: base,
            limit,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Bytes mapped for the heap since the last release.
    pub fn mapped_bytes(&self) -> u64 {
        self.cursor - self.arena_start
    }

    /// Moves an empty arena up so growth starts at or above `va`, clear of
    /// whatever the image mapped there. Does nothing once pages are mapped.
    pub fn start_above(&mut self, va: u64) {
        if self.cursor != self.arena_start {
            return;
        }
        if let Some(va) = checked_align_up(va, PAGE) {
            if va > self.cursor {
                self.arena_start = va;
                self.cursor = va;
            }
        }
    }

    /// Allocates `size` bytes and returns the payload address. Fails with
    /// `OutOfMemory` if the heap cannot grow, including requests too large
    /// to fit below the limit; nothing is left mapped then.
    pub fn allocate<S: UserMemory + ?Sized>(&mut self, space: &mut S, size: u64) -> KernelResult<u64> {
        let n = checked_align_up(core::cmp::max(size, 1), HEAP_ALIGN)
            .ok_or(KernelError::OutOfMemory)?;

        let (va, mut mcb) = match self.take_fit(space, n)? {
            Some(found) => found,
            None => {
                self.grow(space, n)?;
                self.take_fit(space, n)?
                    .context("heap grew without producing a fitting block")?
            }
        };

        if mcb.size - n > MCB_SIZE {
            let rest = va + MCB_SIZE + n;
            self.insert_free(space, rest, mcb.size - n - MCB_SIZE)?;
            mcb.size = n;
        }

        mcb.next = self.used;
        mcb.store(space, va)?;
        self.used = Some(va);
        Ok(va + MCB_SIZE)
    }

    /// Returns the block whose payload starts at `payload` to the free list.
    pub fn free<S: UserMemory + ?Sized>(&mut self, space: &mut S, payload: u64) -> KernelResult<()> {
        let va = payload
            .checked_sub(MCB_SIZE)
            .ok_or(KernelError::InvalidFree(payload))?;

        let mut prev = None;
        let mut chain = self.chain(self.used);
        while let Some((node, mcb)) = chain.next(self, &*space)? {
            if node == va {
                self.link(space, HeapList::Used, prev, mcb.next)?;
                return self.insert_free(space, va, mcb.size);
            }
            prev = Some(node);
        }
        Err(KernelError::InvalidFree(payload))
    }

    /// Calls `f` with the header address and header of every block on `list`.
    pub fn walk<S, F>(&self, space: &S, list: HeapList, mut f: F) -> KernelResult<()>
    where
        S: UserMemory + ?Sized,
        F: FnMut(u64, &Mcb),
    {
        let mut chain = self.chain(self.head(list));
        while let Some((va, mcb)) = chain.next(self, space)? {
            f(va, &mcb);
        }
        Ok(())
    }

    pub fn stats<S: UserMemory + ?Sized>(&self, space: &S) -> KernelResult<HeapStats> {
        let mut stats = HeapStats::default();
        self.walk(space, HeapList::Used, |_, mcb| {
            stats.used_blocks += 1;
            stats.used_bytes += mcb.size;
        })?;
        self.walk(space, HeapList::Free, |_, mcb| {
            stats.free_blocks += 1;
            stats.free_bytes += mcb.size;
        })?;
        Ok(stats)
    }

    /// Unmaps every heap page and empties both lists. The cursor keeps its
    /// value, so later growth starts at fresh virtual pages.
    pub fn release<S: UserMemory + ?Sized>(&mut self, space: &mut S) {
        let mut va = self.arena_start;
        while va < self.cursor {
            space.unmap(va);
            va += PAGE;
        }
        self.used = None;
        self.free = None;
        self.arena_start = self.cursor;
    }

    fn chain(&self, head: Option<u64>) -> Chain {
        Chain {
            cur: head,
            // every block holds at least a header and HEAP_ALIGN bytes
            left: self.mapped_bytes() / (MCB_SIZE + HEAP_ALIGN),
        }
    }

    /// Loads the header at `va`. It and its payload must lie inside the
    /// arena, otherwise the process has overwritten heap metadata.
    fn load<S: UserMemory + ?Sized>(&self, space: &S, va: u64) -> KernelResult<Mcb> {
        if va < self.arena_start || va >= self.cursor {
            return Err(KernelError::HeapCorrupted(va));
        }
        let mcb = Mcb::load(space, va)?;
        match va.checked_add(MCB_SIZE).and_then(|p| p.checked_add(mcb.size)) {
            Some(end) if end <= self.cursor => Ok(mcb),
            _ => Err(KernelError::HeapCorrupted(va)),
        }
    }

    fn head(&self, list: HeapList) -> Option<u64> {
        match list {
            HeapList::Used => self.used,
            HeapList::Free => self.free,
        }
    }

    /// Points `prev` (or the list head when `prev` is `None`) at `next`.
    fn link<S: UserMemory + ?Sized>(
        &mut self,
        space: &mut S,
        list: HeapList,
        prev: Option<u64>,
        next: Option<u64>,
    ) -> KernelResult<()> {
        match prev {
            None => {
                match list {
                    HeapList::Used => self.used = next,
                    HeapList::Free => self.free = next,
                }
                Ok(())
            }
            Some(va) => {
                let mut mcb = self.load(&*space, va)?;
                mcb.next = next;
                mcb.store(space, va)
            }
        }
    }

    /// Unlinks and returns the smallest free block of at least `n` bytes.
    fn take_fit<S: UserMemory + ?Sized>(&mut self, space: &mut S, n: u64) -> KernelResult<Option<(u64, Mcb)>> {
        let mut prev = None;
        let mut chain = self.chain(self.free);
        while let Some((va, mcb)) = chain.next(self, &*space)? {
            if mcb.size >= n {
                self.link(space, HeapList::Free, prev, mcb.next)?;
                return Ok(Some((va, mcb)));
            }
            prev = Some(va);
        }
        Ok(None)
    }

    /// Writes a header at `va` and links it in after every free block of
    /// equal or smaller size.
    fn insert_free<S: UserMemory + ?Sized>(&mut self, space: &mut S, va: u64, size: u64) -> KernelResult<()> {
        let mut prev = None;
        let mut next = None;
        let mut chain = self.chain(self.free);
        while let Some((node, mcb)) = chain.next(self, &*space)? {
            if mcb.size > size {
                next = Some(node);
                break;
            }
            prev = Some(node);
        }
        Mcb { size, next }.store(space, va)?;
        self.link(space, HeapList::Free, prev, Some(va))
    }

    fn free_tail<S: UserMemory + ?Sized>(&self, space: &S) -> KernelResult<Option<(u64, Mcb)>> {
        let mut tail = None;
        self.walk(space, HeapList::Free, |va, mcb| tail = Some((va, *mcb)))?;
        Ok(tail)
    }

    /// Maps enough pages at the cursor for an `n` byte block. When the
    /// largest free block ends at the cursor it is extended in place,
    /// otherwise a new block covers the fresh pages.
    fn grow<S: UserMemory + ?Sized>(&mut self, space: &mut S, n: u64) -> KernelResult<()> {
        let cursor = self.cursor;
        let extend = self
            .free_tail(&*space)?
            .filter(|(va, mcb)| va + MCB_SIZE + mcb.size == cursor);

        let needed = match extend {
            Some((_, mcb)) => Some(n - mcb.size),
            None => n.checked_add(MCB_SIZE),
        };
        let added = needed
            .and_then(|needed| checked_align_up(needed, PAGE))
            .filter(|added| cursor.checked_add(*added).map_or(false, |end| end <= self.limit))
            .ok_or(KernelError::OutOfMemory)?;
        self.map_pages(space, added / PAGE)?;
        self.cursor += added;

        match extend {
            // still the largest block, so it stays at the tail
            Some((va, mut mcb)) => {
                mcb.size += added;
                mcb.store(space, va)
            }
            None => self.insert_free(space, cursor, added - MCB_SIZE),
        }
    }

    fn map_pages<S: UserMemory + ?Sized>(&mut self, space: &mut S, pages: u64) -> KernelResult<()> {
        for i in 0..pages {
            let va = self.cursor + i * PAGE;
            if let Err(e) = space.map_zeroed(va, Permissions::RW | Permissions::User) {
                for j in 0..i {
                    space.unmap(self.cursor + j * PAGE);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}
