//                      McKusick-Karels Allocator
// ---------------------------------------------------------------------------
//
// Small requests are routed to one of eight power-of-two buckets. Each
// bucket owns a list of partially filled slab pages; a page is a
// descriptor plus a separately held data buffer of `num_objects` equally
// sized slots and a bitmap with one free-bit per slot.
//
// The head of a bucket list is the allocation fast path. The moment a
// page runs out of free slots it is moved aside onto `full_pages`, so a
// bucket list never holds anything an allocation would have to skip. The
// first free after that moves the page back to its bucket.
//
// Pages are requested from the host on demand and only returned when the
// allocator is dropped. The configured heap size is recorded on the
// handle but does not bound page creation.

use core::mem::size_of;
use core::ptr;
use std::alloc::{alloc, dealloc, Layout};

use static_assertions::const_assert;

use crate::stats::AllocStats;

pub const NUM_BUCKETS: usize = 8;
pub const BUCKET_SIZES: [usize; NUM_BUCKETS] = [16, 32, 64, 128, 256, 512, 1024, 2048];
pub const PAGE_SIZE: usize = 4096;

const ALIGN: usize = 8;
const SLOT_MAGIC: u32 = 0xBEEF_CAFE;
const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>();

/// Per-page descriptor. Lives outside the slab buffer it describes.
#[repr(C)]
struct PageDesc {
    next: *mut PageDesc,
    bucket_size: usize,
    bitmap: *mut u8,
    num_objects: usize,
    free_count: usize,
    data: *mut u8,
}

/// Written at the start of every slot so a bare payload pointer can be
/// traced back to its page in O(1). The magic abuts the payload.
#[repr(C)]
struct SlotHeader {
    page: *mut PageDesc,
    object_index: usize,
    _pad: [u8; 4],
    magic: u32,
}

const_assert!(SLOT_HEADER_SIZE % ALIGN == 0);
const_assert!(size_of::<PageDesc>() < PAGE_SIZE);

/// Smallest bucket that holds `size` bytes, or `None` above the largest.
fn bucket_index(size: usize) -> Option<usize> {
    BUCKET_SIZES.iter().position(|&bucket| size <= bucket)
}

fn slot_count_for(bucket_size: usize) -> usize {
    let slot_size = bucket_size + SLOT_HEADER_SIZE;
    ((PAGE_SIZE - size_of::<PageDesc>()) / slot_size).max(1)
}

unsafe fn bit_is_set(bitmap: *const u8, idx: usize) -> bool {
    *bitmap.add(idx / 8) & (1 << (idx % 8)) != 0
}

unsafe fn set_bit(bitmap: *mut u8, idx: usize) {
    *bitmap.add(idx / 8) |= 1 << (idx % 8);
}

unsafe fn clear_bit(bitmap: *mut u8, idx: usize) {
    *bitmap.add(idx / 8) &= !(1 << (idx % 8));
}

pub struct McKusickKarels {
    heap_size: usize,
    buckets: [*mut PageDesc; NUM_BUCKETS],
    full_pages: *mut PageDesc,
    stats: AllocStats,
}

impl McKusickKarels {
    /// Creates an empty allocator. `heap_size` is recorded for parity
    /// with the arena-backed back-end; pages come from the host.
    pub fn new(heap_size: usize) -> Self {
        Self {
            heap_size,
            buckets: [ptr::null_mut(); NUM_BUCKETS],
            full_pages: ptr::null_mut(),
            stats: AllocStats::default(),
        }
    }

    /// Returns a pointer with `size` writable bytes, or null when `size`
    /// is zero, exceeds the largest bucket, or the host refuses a page.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        // Routing is done on the raw requested size; slot placement plus
        // the slot header keep payloads 8-aligned.
        let Some(bucket_idx) = bucket_index(size) else {
            self.stats.failed_allocations += 1;
            return ptr::null_mut();
        };

        unsafe {
            let mut page = self.buckets[bucket_idx];
            if page.is_null() || (*page).free_count == 0 {
                page = match self.create_page(bucket_idx) {
                    Some(page) => page,
                    None => {
                        self.stats.failed_allocations += 1;
                        return ptr::null_mut();
                    }
                };
            }

            let Some(obj_idx) = lowest_free_slot(page) else {
                // Unreachable while the head discipline holds; counted
                // rather than trusted.
                self.stats.failed_allocations += 1;
                return ptr::null_mut();
            };
            clear_bit((*page).bitmap, obj_idx);
            (*page).free_count -= 1;

            let slot_size = (*page).bucket_size + SLOT_HEADER_SIZE;
            let slot = (*page).data.add(obj_idx * slot_size);
            slot.cast::<SlotHeader>().write(SlotHeader {
                page,
                object_index: obj_idx,
                _pad: [0; 4],
                magic: SLOT_MAGIC,
            });

            self.stats.charge((*page).bucket_size);

            if (*page).free_count == 0 {
                self.retire_full(bucket_idx, page);
            }

            slot.add(SLOT_HEADER_SIZE)
        }
    }

    /// Releases a slot back to its page, pulling the page off
    /// `full_pages` first when this is the first free after fullness.
    ///
    /// A magic mismatch is reported and the call returns without touching
    /// any page or counter.
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

        let header = ptr.sub(SLOT_HEADER_SIZE).cast::<SlotHeader>();
        if (*header).magic != SLOT_MAGIC {
            log::error!(
                "mckusick-karels: bad magic {:#010x} behind {:p}, dropping free",
                (*header).magic,
                ptr,
            );
            return;
        }

        let page = (*header).page;
        let obj_idx = (*header).object_index;
        debug_assert!(obj_idx < (*page).num_objects);
        debug_assert!(!bit_is_set((*page).bitmap, obj_idx));

        if (*page).free_count == 0 {
            self.unretire(page);
        }

        set_bit((*page).bitmap, obj_idx);
        (*page).free_count += 1;
        self.stats.release((*page).bucket_size);
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

    /// Requests descriptor, slab buffer, and bitmap from the host and
    /// pushes the fresh page onto its bucket list. Partially acquired
    /// memory is released on failure.
    fn create_page(&mut self, bucket_idx: usize) -> Option<*mut PageDesc> {
        let bucket_size = BUCKET_SIZES[bucket_idx];
        let slot_size = bucket_size + SLOT_HEADER_SIZE;
        let num_objects = slot_count_for(bucket_size);
        let bitmap_len = num_objects.div_ceil(8);

        let desc_layout = Layout::new::<PageDesc>();
        let data_layout = Layout::from_size_align(num_objects * slot_size, ALIGN).ok()?;
        let bitmap_layout = Layout::from_size_align(bitmap_len, 1).ok()?;

        unsafe {
            let desc = alloc(desc_layout).cast::<PageDesc>();
            if desc.is_null() {
                return None;
            }
            let data = alloc(data_layout);
            if data.is_null() {
                dealloc(desc.cast(), desc_layout);
                return None;
            }
            let bitmap = alloc(bitmap_layout);
            if bitmap.is_null() {
                dealloc(data, data_layout);
                dealloc(desc.cast(), desc_layout);
                return None;
            }

            // All slots start free. Set bits past `num_objects` in the
            // last byte are initialization slack, never handed out.
            ptr::write_bytes(bitmap, 0xFF, bitmap_len);

            desc.write(PageDesc {
                next: self.buckets[bucket_idx],
                bucket_size,
                bitmap,
                num_objects,
                free_count: num_objects,
                data,
            });
            self.buckets[bucket_idx] = desc;

            Some(desc)
        }
    }

    /// Moves the bucket-list head, just drained by an allocation, onto
    /// `full_pages`.
    unsafe fn retire_full(&mut self, bucket_idx: usize, page: *mut PageDesc) {
        debug_assert!(self.buckets[bucket_idx] == page);
        self.buckets[bucket_idx] = (*page).next;
        (*page).next = self.full_pages;
        self.full_pages = page;
    }

    /// Unlinks `page` from `full_pages` and pushes it back onto its
    /// bucket list.
    unsafe fn unretire(&mut self, page: *mut PageDesc) {
        let mut prev: *mut *mut PageDesc = &mut self.full_pages;
        let mut curr = self.full_pages;
        while !curr.is_null() {
            if curr == page {
                *prev = (*curr).next;
                break;
            }
            prev = &mut (*curr).next;
            curr = (*curr).next;
        }

        let bucket_idx = bucket_index((*page).bucket_size)
            .expect("page bucket size is always a registered bucket");
        (*page).next = self.buckets[bucket_idx];
        self.buckets[bucket_idx] = page;
    }
}

/// Lowest-indexed free slot on `page`, scanning the bitmap a byte at a
/// time.
unsafe fn lowest_free_slot(page: *mut PageDesc) -> Option<usize> {
    let bitmap = (*page).bitmap;
    let num_objects = (*page).num_objects;
    for byte_idx in 0..num_objects.div_ceil(8) {
        let byte = *bitmap.add(byte_idx);
        if byte == 0 {
            continue;
        }
        let idx = byte_idx * 8 + byte.trailing_zeros() as usize;
        // A hit past `num_objects` can only be initialization slack in
        // the last byte, meaning no real slot below it is free.
        return (idx < num_objects).then_some(idx);
    }
    None
}

impl Drop for McKusickKarels {
    fn drop(&mut self) {
        unsafe {
            for head in self.buckets {
                release_page_list(head);
            }
            release_page_list(self.full_pages);
        }
    }
}

unsafe fn release_page_list(mut head: *mut PageDesc) {
    while !head.is_null() {
        let next = (*head).next;
        let slot_size = (*head).bucket_size + SLOT_HEADER_SIZE;
        let data_layout =
            Layout::from_size_align_unchecked((*head).num_objects * slot_size, ALIGN);
        let bitmap_layout =
            Layout::from_size_align_unchecked((*head).num_objects.div_ceil(8), 1);
        dealloc((*head).data, data_layout);
        dealloc((*head).bitmap, bitmap_layout);
        dealloc(head.cast(), Layout::new::<PageDesc>());
        head = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    impl McKusickKarels {
        /// Checks that every page sits on exactly one list and that list
        /// membership and free counts agree with the bitmap.
        fn assert_page_invariants(&self) {
            let mut seen = HashSet::new();
            unsafe {
                for (idx, &head) in self.buckets.iter().enumerate() {
                    let mut page = head;
                    while !page.is_null() {
                        assert!(seen.insert(page), "page on two lists");
                        assert_eq!((*page).bucket_size, BUCKET_SIZES[idx]);
                        assert!((*page).free_count > 0, "full page on a bucket list");
                        assert_eq!((*page).free_count, bitmap_popcount(page));
                        page = (*page).next;
                    }
                }
                let mut page = self.full_pages;
                while !page.is_null() {
                    assert!(seen.insert(page), "page on two lists");
                    assert_eq!((*page).free_count, 0);
                    assert_eq!(bitmap_popcount(page), 0);
                    page = (*page).next;
                }
            }
        }
    }

    unsafe fn bitmap_popcount(page: *mut PageDesc) -> usize {
        (0..(*page).num_objects)
            .filter(|&idx| bit_is_set((*page).bitmap, idx))
            .count()
    }

    #[test]
    fn alloc_zero_returns_null() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        assert!(mk.alloc(0).is_null());
        assert_eq!(mk.stats().total_allocations, 0);
    }

    #[test]
    fn oversized_request_fails_without_a_large_path() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        assert!(mk.alloc(2049).is_null());
        assert_eq!(mk.stats().failed_allocations, 1);
    }

    #[test]
    fn stats_charge_the_bucket_size() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        let p = mk.alloc(100);
        assert!(!p.is_null());
        assert_eq!(mk.stats().current_allocated, 128);
        unsafe { mk.free(p) };
        assert_eq!(mk.stats().current_allocated, 0);
    }

    #[test]
    fn freed_slot_is_the_next_one_handed_out() {
        let mut mk = McKusickKarels::new(1024 * 1024);

        let p = mk.alloc(100);
        assert!(!p.is_null());
        unsafe { mk.free(p) };

        // First-free scan lands on the slot `p` occupied.
        let q = mk.alloc(100);
        assert_eq!(q, p);
    }

    #[test]
    fn slot_count_accounts_for_the_descriptor_overhead() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        let p = mk.alloc(16);
        assert!(!p.is_null());

        unsafe {
            let page = (*p.sub(SLOT_HEADER_SIZE).cast::<SlotHeader>()).page;
            let slot_size = 16 + SLOT_HEADER_SIZE;
            assert_eq!(
                (*page).num_objects,
                (PAGE_SIZE - size_of::<PageDesc>()) / slot_size,
            );
        }
    }

    #[test]
    fn drained_page_moves_to_full_and_back() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        let num_objects = slot_count_for(16);

        let blocks: Vec<*mut u8> = (0..num_objects).map(|_| mk.alloc(16)).collect();
        assert!(blocks.iter().all(|ptr| !ptr.is_null()));

        // The drained page left its bucket list for `full_pages`.
        let page = mk.full_pages;
        assert!(!page.is_null());
        assert!(mk.buckets[0].is_null());
        mk.assert_page_invariants();

        let victim = blocks[num_objects / 2];
        unsafe { mk.free(victim) };
        assert!(mk.full_pages.is_null());
        assert_eq!(mk.buckets[0], page);
        mk.assert_page_invariants();

        // The next allocation reuses the freed slot instead of growing.
        let q = mk.alloc(16);
        assert_eq!(q, victim);
        assert!(mk.buckets[0].is_null());
        assert_eq!(mk.full_pages, page);
    }

    #[test]
    fn single_object_pages_cycle_between_lists() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        assert_eq!(slot_count_for(2048), 1);

        let p = mk.alloc(2048);
        assert!(!p.is_null());
        assert!(!mk.full_pages.is_null());
        mk.assert_page_invariants();

        unsafe { mk.free(p) };
        assert!(mk.full_pages.is_null());
        mk.assert_page_invariants();

        let q = mk.alloc(2048);
        assert_eq!(q, p);
    }

    #[test]
    fn corrupted_magic_is_reported_and_skipped() {
        let mut mk = McKusickKarels::new(1024 * 1024);

        let p = mk.alloc(64);
        assert!(!p.is_null());

        unsafe {
            let saved = *p.sub(1);
            *p.sub(1) = 0;
            mk.free(p);
            assert_eq!(mk.stats().total_frees, 0);

            *p.sub(1) = saved;
            mk.free(p);
            assert_eq!(mk.stats().total_frees, 1);
        }
    }

    #[test]
    fn seeded_churn_keeps_page_lists_consistent() {
        let mut mk = McKusickKarels::new(1024 * 1024);
        let mut rng = StdRng::seed_from_u64(11);
        let mut live = Vec::new();

        for round in 0..4000 {
            if rng.gen_range(0..2) == 0 && live.len() < 300 {
                let ptr = mk.alloc(rng.gen_range(1..=2048));
                if !ptr.is_null() {
                    live.push(ptr);
                }
            } else if !live.is_empty() {
                let idx = rng.gen_range(0..live.len());
                unsafe { mk.free(live.swap_remove(idx)) };
            }
            if round % 512 == 0 {
                mk.assert_page_invariants();
            }
        }
        for ptr in live.drain(..) {
            unsafe { mk.free(ptr) };
        }

        let stats = mk.stats();
        assert_eq!(stats.total_allocations, stats.total_frees);
        assert_eq!(stats.current_allocated, 0);
        mk.assert_page_invariants();
    }
}
