use core::ptr;

use crate::error::Result;
use crate::mckusick::McKusickKarels;
use crate::segregated::SegregatedFreeList;
use crate::stats::AllocStats;

/// Selects the back-end a [`Heap`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Segregated,
    McKusick,
}

/// Polymorphic front-end over the two back-ends.
///
/// Every operation dispatches on the variant tag and forwards; the
/// back-ends never see each other. A `Heap` is a single-threaded object:
/// raw pointers inside the back-ends keep it out of `Send`/`Sync`, and
/// callers sharing one across threads must serialize externally.
pub enum Heap {
    Segregated(SegregatedFreeList),
    McKusick(McKusickKarels),
}

impl Heap {
    /// Builds a back-end of the requested kind over `heap_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails when the host refuses the segregated arena; anything
    /// partially acquired is released before returning.
    pub fn new(kind: AllocatorKind, heap_size: usize) -> Result<Self> {
        match kind {
            AllocatorKind::Segregated => {
                Ok(Heap::Segregated(SegregatedFreeList::new(heap_size)?))
            }
            AllocatorKind::McKusick => Ok(Heap::McKusick(McKusickKarels::new(heap_size))),
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        match self {
            Heap::Segregated(_) => AllocatorKind::Segregated,
            Heap::McKusick(_) => AllocatorKind::McKusick,
        }
    }

    /// Returns a pointer with `size` writable bytes, or null on failure.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        match self {
            Heap::Segregated(sfl) => sfl.alloc(size),
            Heap::McKusick(mk) => mk.alloc(size),
        }
    }

    /// Releases a live block. Null is ignored; a corrupted header is
    /// reported and skipped.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`alloc`]/[`realloc`] on this heap and not freed since.
    ///
    /// [`alloc`]: Self::alloc
    /// [`realloc`]: Self::realloc
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        match self {
            Heap::Segregated(sfl) => sfl.free(ptr),
            Heap::McKusick(mk) => mk.free(ptr),
        }
    }

    /// Exchanges `ptr` for a fresh block of `new_size` bytes.
    ///
    /// Contents are NOT preserved: the block header does not record the
    /// usable payload size, so this allocates new, frees old, and hands
    /// back uninitialized memory. A null `ptr` degenerates to [`alloc`];
    /// a zero `new_size` degenerates to [`free`] and returns null. When
    /// the new allocation fails the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`].
    ///
    /// [`alloc`]: Self::alloc
    /// [`free`]: Self::free
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let new_ptr = self.alloc(new_size);
        if !new_ptr.is_null() {
            self.free(ptr);
        }
        new_ptr
    }

    /// Snapshot of the live back-end counters.
    pub fn stats(&self) -> AllocStats {
        match self {
            Heap::Segregated(sfl) => sfl.stats(),
            Heap::McKusick(mk) => mk.stats(),
        }
    }

    pub fn reset_stats(&mut self) {
        match self {
            Heap::Segregated(sfl) => sfl.reset_stats(),
            Heap::McKusick(mk) => mk.reset_stats(),
        }
    }

    /// The heap size the handle was created with.
    pub fn heap_size(&self) -> usize {
        match self {
            Heap::Segregated(sfl) => sfl.heap_size(),
            Heap::McKusick(mk) => mk.heap_size(),
        }
    }
}
