// lets collections like `allocator_api2::vec::Vec` allocate straight out of
// a region, so compilation-lifetime data structures need no individual frees.
//
// the allocator is `&Region`, never the region itself. small blocks live in
// the segment embedded in the region value, so a collection owning the region
// would carry its allocator away from its own buffer when moved. a borrow
// pins the region for as long as the collection exists.
//
// - alignment is capped at the 16 byte region granule
// - `deallocate` is a no-op, memory comes back when the region drops
// - growing a collection leaves its old buffer behind as dead space

use core::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator, Layout};

use super::Region;

// SAFETY: `try_allocate_aligned` returns granule aligned memory that stays
// valid until the region drops. the handle borrows the region, which can
// therefore neither move nor drop while a block is in use
unsafe impl Allocator for &Region<'_> {
    #[track_caller]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            let dangling = NonNull::new(core::ptr::without_provenance_mut::<u8>(layout.align()))
                .ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let ptr = self
            .try_allocate_aligned(layout.size(), layout.align())
            .map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        Region::deallocate(self, ptr, layout.size());
    }
}
