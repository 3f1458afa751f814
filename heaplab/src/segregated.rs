//                      Segregated Free-List Allocator
// ---------------------------------------------------------------------------
//
// One contiguous arena is reserved from the host at creation time and
// never grows. Requests that fit a size class are served from one of
// eight per-class free lists; everything else, including the virgin
// arena itself, lives on a single `large` list that is walked first-fit.
//
// Free regions keep their own bookkeeping: a `{size, next}` descriptor is
// written into the first bytes of the region, so the lists cost no memory
// beyond the arena. The smallest size class (16 bytes) is exactly one
// descriptor, which is why nothing smaller than that is ever threaded
// onto a list; a carve remainder below 16 bytes is unreachable until the
// allocator is dropped.
//
// There is no coalescing. A region freed at a class size goes back to its
// class list and is reused verbatim; odd-sized regions accumulate on the
// `large` list. This trades long-run fragmentation for an O(1) fast path
// on class-sized churn.

use core::mem::size_of;
use core::ptr;
use std::alloc::{alloc, dealloc, Layout};

use static_assertions::const_assert;

use crate::error::{Error, Result};
use crate::stats::AllocStats;

pub const NUM_SIZE_CLASSES: usize = 8;
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [16, 32, 64, 128, 256, 512, 1024, 2048];

const ALIGN: usize = 8;
const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;
const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Header written at the start of every live block; the pointer handed to
/// the caller is the first byte after it. The magic abuts the payload, so
/// a one-byte underrun lands in it.
#[repr(C)]
struct BlockHeader {
    size: usize,
    _pad: [u8; 4],
    magic: u32,
}

/// Descriptor living in the first bytes of every free region.
#[repr(C)]
struct FreeRegion {
    size: usize,
    next: *mut FreeRegion,
}

const_assert!(size_of::<FreeRegion>() <= SIZE_CLASSES[0]);
const_assert!(HEADER_SIZE % ALIGN == 0);
const_assert!(HEADER_SIZE < SIZE_CLASSES[NUM_SIZE_CLASSES - 1]);

fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Smallest class that holds `total` bytes, or `None` above the largest.
fn class_index(total: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| total <= class)
}

pub struct SegregatedFreeList {
    arena: *mut u8,
    heap_size: usize,
    sized: [*mut FreeRegion; NUM_SIZE_CLASSES],
    large: *mut FreeRegion,
    stats: AllocStats,
}

impl SegregatedFreeList {
    /// Reserves `heap_size` bytes from the host and installs the whole
    /// arena as a single free region on the large list.
    pub fn new(heap_size: usize) -> Result<Self> {
        // The arena must at least hold one free-region descriptor.
        if heap_size < size_of::<FreeRegion>() {
            return Err(Error::ArenaReserve(heap_size));
        }
        let layout = Layout::from_size_align(heap_size, ALIGN)
            .map_err(|_| Error::ArenaReserve(heap_size))?;
        let arena = unsafe { alloc(layout) };
        if arena.is_null() {
            return Err(Error::ArenaReserve(heap_size));
        }

        let head = arena.cast::<FreeRegion>();
        unsafe {
            head.write(FreeRegion {
                size: heap_size,
                next: ptr::null_mut(),
            });
        }

        Ok(Self {
            arena,
            heap_size,
            sized: [ptr::null_mut(); NUM_SIZE_CLASSES],
            large: head,
            stats: AllocStats::default(),
        })
    }

    /// Returns a pointer with `size` writable bytes, or null when `size`
    /// is zero, the request exceeds every class and no large region fits,
    /// or the arena is exhausted.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let total = align_up(size + HEADER_SIZE);
        let region = match class_index(total) {
            Some(idx) => self.take_sized(idx),
            None => self.carve_large(total),
        };
        let Some(region) = region else {
            self.stats.failed_allocations += 1;
            return ptr::null_mut();
        };

        unsafe {
            region.cast::<BlockHeader>().write(BlockHeader {
                size: total,
                _pad: [0; 4],
                magic: BLOCK_MAGIC,
            });
            self.stats.charge(total);
            region.cast::<u8>().add(HEADER_SIZE)
        }
    }

    /// Releases a live block back to the matching list.
    ///
    /// A magic mismatch is reported and the call returns without touching
    /// any list or counter, leaving the block unreachable.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`alloc`]
    /// on this allocator and not freed since.
    ///
    /// [`alloc`]: Self::alloc
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let region = ptr.sub(HEADER_SIZE);
        let header = region.cast::<BlockHeader>();
        if (*header).magic != BLOCK_MAGIC {
            log::error!(
                "segregated free list: bad magic {:#010x} behind {:p}, dropping free",
                (*header).magic,
                ptr,
            );
            return;
        }

        let total = (*header).size;
        self.stats.release(total);

        // Only exact class widths go back to a class list; everything
        // else, e.g. a block whose header recorded less than the carved
        // width, joins the large list.
        let region = region.cast::<FreeRegion>();
        match class_index(total) {
            Some(idx) if SIZE_CLASSES[idx] == total => {
                region.write(FreeRegion {
                    size: total,
                    next: self.sized[idx],
                });
                self.sized[idx] = region;
            }
            _ => {
                region.write(FreeRegion {
                    size: total,
                    next: self.large,
                });
                self.large = region;
            }
        }
    }

    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = AllocStats::default();
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Pops the head of a class list, falling back to carving a region of
    /// exactly the class width off the large list.
    fn take_sized(&mut self, idx: usize) -> Option<*mut FreeRegion> {
        let head = self.sized[idx];
        if !head.is_null() {
            self.sized[idx] = unsafe { (*head).next };
            return Some(head);
        }
        self.carve_large(SIZE_CLASSES[idx])
    }

    /// First-fit walk of the large list for a region of at least `want`
    /// bytes. The carved block is exactly `want` bytes wide; a remainder
    /// big enough for a descriptor is threaded back onto the list front,
    /// anything smaller is abandoned until drop.
    fn carve_large(&mut self, want: usize) -> Option<*mut FreeRegion> {
        unsafe {
            let mut prev: *mut *mut FreeRegion = &mut self.large;
            let mut curr = self.large;
            while !curr.is_null() {
                if (*curr).size >= want {
                    *prev = (*curr).next;
                    let remaining = (*curr).size - want;
                    if remaining >= SIZE_CLASSES[0] {
                        let rest = curr.cast::<u8>().add(want).cast::<FreeRegion>();
                        rest.write(FreeRegion {
                            size: remaining,
                            next: self.large,
                        });
                        self.large = rest;
                    }
                    return Some(curr);
                }
                prev = &mut (*curr).next;
                curr = (*curr).next;
            }
            None
        }
    }
}

impl Drop for SegregatedFreeList {
    fn drop(&mut self) {
        // Live blocks dangle from here on; none of them needs teardown.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.heap_size, ALIGN);
            dealloc(self.arena, layout);
        }
    }
}
