//! Type descriptors and box sizing
//!
//! Generated code hands the runtime a pointer to a type descriptor with every
//! allocation request. The runtime reads exactly two fields from it, `size`
//! and `align`; the glue pointers belong to generated code.
//!
//! ## Box Layout
//!
//! ```text
//! ┌──────────────────────────┬─────────┬───────────────────────────┐
//! │ BoxHeader (4 words)      │ padding │ body (requested size)     │
//! └──────────────────────────┴─────────┴───────────────────────────┘
//! ^ header pointer                     ^ header + align_to(HEADER_SIZE, align)
//! ```
//!
//! The allocation itself is aligned to `max(align, align_of::<BoxHeader>())`,
//! so the body offset alone is enough to satisfy the body's alignment.

use crate::boxed::BoxHeader;
use crate::error::RuntimeError;
use std::ffi::c_void;
use std::ptr;

/// Type descriptor emitted by the compiler for every boxed type.
#[repr(C)]
#[derive(Debug)]
pub struct TypeDesc {
    /// Size of a value of the type, in bytes
    pub size: usize,
    /// Required alignment of a value of the type
    pub align: usize,
    pub take_glue: *const c_void,
    pub drop_glue: *const c_void,
    pub free_glue: *const c_void,
    pub visit_glue: *const c_void,
}

// Descriptors are immutable statics emitted by the compiler; the glue pointers
// are never dereferenced by the runtime.
unsafe impl Sync for TypeDesc {}
unsafe impl Send for TypeDesc {}

impl TypeDesc {
    /// A descriptor with no glue
    pub const fn new(size: usize, align: usize) -> Self {
        TypeDesc {
            size,
            align,
            take_glue: ptr::null(),
            drop_glue: ptr::null(),
            free_glue: ptr::null(),
            visit_glue: ptr::null(),
        }
    }

    /// A glue-less descriptor matching a Rust type's layout
    pub const fn of<T>() -> Self {
        Self::new(std::mem::size_of::<T>(), std::mem::align_of::<T>())
    }

    /// Body alignment, treating a zero alignment as byte alignment
    #[inline]
    pub fn body_align(&self) -> usize {
        self.align.max(1)
    }
}

/// Size of the header prepended to every box
pub const HEADER_SIZE: usize = std::mem::size_of::<BoxHeader>();

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_to(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Offset of the body from the header for a given body alignment
#[inline]
pub const fn body_offset(body_align: usize) -> usize {
    align_to(HEADER_SIZE, body_align)
}

/// Total footprint of a box: the header padded to the body alignment, plus
/// the body.
#[inline]
pub const fn box_size(body_size: usize, body_align: usize) -> usize {
    body_offset(body_align) + body_size
}

/// Size and allocation alignment of a box for `td` with a body of
/// `body_size` bytes.
///
/// Rejects non power-of-two alignments and footprints that overflow.
pub fn box_footprint(td: &TypeDesc, body_size: usize) -> Result<(usize, usize), RuntimeError> {
    let align = td.body_align();
    if !align.is_power_of_two() {
        return Err(RuntimeError::InvalidLayout {
            size: body_size,
            align,
        });
    }

    let total = HEADER_SIZE
        .checked_add(align - 1)
        .map(|n| n & !(align - 1))
        .and_then(|offset| offset.checked_add(body_size))
        .filter(|&total| total <= isize::MAX as usize)
        .ok_or(RuntimeError::InvalidLayout {
            size: body_size,
            align,
        })?;

    Ok((total, align.max(std::mem::align_of::<BoxHeader>())))
}
