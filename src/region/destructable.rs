//! type erased destruction chain threaded through region storage
//!
//! each object created in a region is written as an `Instance<T>`: a header
//! holding the link to the previously created instance and a monomorphized
//! destroy function, followed by the value itself

use core::ptr::{NonNull, drop_in_place};

/// Link to a chain node.
///
/// nodes in the inline segment are stored as offsets so a region can be
/// moved before anything borrows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestructableLink {
    Inline(usize),
    Segment(NonNull<DestructableHeader>),
}

#[repr(C)]
pub(crate) struct DestructableHeader {
    prev: Option<DestructableLink>,
    destroy: unsafe fn(NonNull<DestructableHeader>),
}

impl DestructableHeader {
    /// Drop the instance owning `header` and return its predecessor.
    ///
    /// # Safety
    ///
    /// `header` must point at the header of a live `Instance<T>` written by
    /// [`Instance::new`], and the instance must not be used afterwards.
    pub(crate) unsafe fn destroy(header: NonNull<DestructableHeader>) -> Option<DestructableLink> {
        // SAFETY: upheld by the caller
        let (prev, destroy) = unsafe {
            let header = header.as_ref();
            (header.prev, header.destroy)
        };
        // SAFETY: `destroy` was monomorphized for the instance's real type
        unsafe { destroy(header) };
        prev
    }
}

#[repr(C)]
pub(crate) struct Instance<T> {
    header: DestructableHeader,
    value: T,
}

impl<T> Instance<T> {
    pub(crate) fn new(prev: Option<DestructableLink>, value: T) -> Self {
        Self {
            header: DestructableHeader {
                prev,
                destroy: destroy_instance::<T>,
            },
            value,
        }
    }

    /// # Safety
    ///
    /// `this` must point at a live instance that outlives `'a` and is not
    /// otherwise borrowed.
    pub(crate) unsafe fn value_mut<'a>(this: NonNull<Self>) -> &'a mut T {
        // SAFETY: upheld by the caller
        unsafe { &mut (*this.as_ptr()).value }
    }
}

unsafe fn destroy_instance<T>(header: NonNull<DestructableHeader>) {
    // SAFETY: the header is the first field of a `repr(C)` `Instance<T>`
    unsafe { drop_in_place(header.cast::<Instance<T>>().as_ptr()) }
}
