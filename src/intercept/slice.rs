//! Mirrors of the gRPC core structures the unary call receives.
//!
//! Only the leading fields are described. A `grpc_byte_buffer` starts with a
//! reserved pointer, the buffer type and the compression algorithm (each enum
//! padded to a pointer slot) followed by the slice buffer, whose first field is
//! the pointer to its slices. A refcounted `grpc_slice` is
//! `{ refcount, length, bytes }`, with `bytes` pointing inside the block that
//! `refcount` heads.

use crate::error::{NativeError, Result};
use libc::c_void;
use std::mem::{offset_of, size_of};
use std::ptr;

/// Field offsets, in bytes, of the structures below for the supported gRPC builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLayout {
    pub revision: &'static str,
    pub byte_buffer_slices: usize,
    pub slice_refcount: usize,
    pub slice_length: usize,
    pub slice_data: usize,
    pub slice_size: usize,
}

const WORD: usize = size_of::<usize>();

/// Largest refcount header a rebuilt slice may carry. Anything further from
/// the payload is a refcount allocated apart from its bytes.
pub const MAX_SLICE_HEADER: usize = 4096;

pub const GRPC_SLICE_LAYOUT: SliceLayout = SliceLayout {
    revision: "grpc-core 1.x refcounted slice",
    byte_buffer_slices: 3 * WORD,
    slice_refcount: 0,
    slice_length: WORD,
    slice_data: 2 * WORD,
    slice_size: 3 * WORD,
};

#[repr(C)]
pub struct GrpcSlice {
    pub refcount: *mut c_void,
    pub length: usize,
    pub data: *mut u8,
}

#[repr(C)]
pub struct GrpcByteBuffer {
    pub reserved: *mut c_void,
    pub kind: usize,
    pub compression: usize,
    pub slices: *mut GrpcSlice,
}

impl SliceLayout {
    /// Whether the `#[repr(C)]` mirrors agree with this description.
    pub const fn matches_mirrors(&self) -> bool {
        self.byte_buffer_slices == offset_of!(GrpcByteBuffer, slices)
            && self.slice_refcount == offset_of!(GrpcSlice, refcount)
            && self.slice_length == offset_of!(GrpcSlice, length)
            && self.slice_data == offset_of!(GrpcSlice, data)
            && self.slice_size == size_of::<GrpcSlice>()
    }
}

const _: () = assert!(GRPC_SLICE_LAYOUT.matches_mirrors());

impl GrpcByteBuffer {
    /// The first slice of `*buffer_ptr`, or null if any link in the chain is null.
    pub unsafe fn first_slice(buffer_ptr: *mut *mut GrpcByteBuffer) -> *mut GrpcSlice {
        if buffer_ptr.is_null() || (*buffer_ptr).is_null() {
            return ptr::null_mut();
        }
        (**buffer_ptr).slices
    }
}

impl GrpcSlice {
    /// Slices without a refcount block are inlined or static and are left alone.
    pub fn is_refcounted(&self) -> bool {
        !self.refcount.is_null()
    }

    /// Bytes between the start of the refcount block and the payload, if the
    /// payload sits inside that block.
    pub fn header_len(&self) -> Option<usize> {
        if !self.is_refcounted() || self.data.is_null() {
            return None;
        }
        (self.data as usize)
            .checked_sub(self.refcount as usize)
            .filter(|&len| len <= MAX_SLICE_HEADER)
    }

    pub unsafe fn payload(&self) -> &[u8] {
        if self.data.is_null() || self.length == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.data, self.length)
    }

    /// Moves the slice onto a new block holding the old header followed by `payload`.
    ///
    /// The slice is only modified once the new block is fully written; the old
    /// block is freed afterwards. On error the slice is untouched.
    ///
    /// # Safety
    /// `refcount` must be a `malloc` allocation that `data` points into, and no
    /// other reference to the old block may be used after this returns.
    pub unsafe fn replace_payload(&mut self, payload: &[u8]) -> Result<()> {
        let header_len = self.header_len().ok_or_else(|| {
            NativeError::HookFailed("slice payload lies outside its refcount block".to_string())
        })?;
        let total = header_len
            .checked_add(payload.len())
            .ok_or(NativeError::AllocationFailed(usize::MAX))?;

        let block = libc::malloc(total.max(1)) as *mut u8;
        if block.is_null() {
            return Err(NativeError::AllocationFailed(total));
        }

        ptr::copy_nonoverlapping(self.refcount as *const u8, block, header_len);
        ptr::copy_nonoverlapping(payload.as_ptr(), block.add(header_len), payload.len());

        let old = std::mem::replace(&mut self.refcount, block as *mut c_void);
        self.data = block.add(header_len);
        self.length = payload.len();
        libc::free(old);

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const HEADER: [u8; 16] = [0xA5; 16];

    /// A slice laid out the way gRPC allocates one: header then payload in one block.
    pub(crate) unsafe fn refcounted_slice(payload: &[u8]) -> GrpcSlice {
        let block = libc::malloc(HEADER.len() + payload.len()) as *mut u8;
        assert!(!block.is_null());
        ptr::copy_nonoverlapping(HEADER.as_ptr(), block, HEADER.len());
        ptr::copy_nonoverlapping(payload.as_ptr(), block.add(HEADER.len()), payload.len());

        GrpcSlice {
            refcount: block as *mut c_void,
            length: payload.len(),
            data: block.add(HEADER.len()),
        }
    }

    pub(crate) unsafe fn free_slice(slice: &GrpcSlice) {
        libc::free(slice.refcount);
    }

    unsafe fn header_of(slice: &GrpcSlice) -> &[u8] {
        std::slice::from_raw_parts(slice.refcount as *const u8, slice.header_len().unwrap())
    }

    #[test]
    fn layout_description_matches_mirrors() {
        assert!(GRPC_SLICE_LAYOUT.matches_mirrors());
        assert_eq!(GRPC_SLICE_LAYOUT.slice_size, 3 * size_of::<*mut c_void>());
    }

    #[test]
    fn header_length_is_distance_from_block_start() {
        unsafe {
            let slice = refcounted_slice(b"payload");
            assert_eq!(slice.header_len(), Some(HEADER.len()));
            assert_eq!(slice.payload(), b"payload");
            free_slice(&slice);
        }
    }

    #[test]
    fn slice_without_refcount_has_no_header() {
        let mut bytes = *b"inline";
        let slice = GrpcSlice {
            refcount: ptr::null_mut(),
            length: bytes.len(),
            data: bytes.as_mut_ptr(),
        };
        assert!(!slice.is_refcounted());
        assert_eq!(slice.header_len(), None);
    }

    #[test]
    fn replace_keeps_header_and_swaps_payload() {
        unsafe {
            let mut slice = refcounted_slice(b"short");
            let old_block = slice.refcount;

            let replacement = b"a considerably longer replacement payload";
            slice.replace_payload(replacement).unwrap();

            assert_ne!(slice.refcount, old_block);
            assert_eq!(slice.length, replacement.len());
            assert_eq!(header_of(&slice), &HEADER);
            assert_eq!(slice.payload(), replacement);
            assert_eq!(slice.data as usize - slice.refcount as usize, HEADER.len());
            free_slice(&slice);
        }
    }

    #[test]
    fn replace_with_empty_payload() {
        unsafe {
            let mut slice = refcounted_slice(b"something");
            slice.replace_payload(&[]).unwrap();

            assert_eq!(slice.length, 0);
            assert_eq!(header_of(&slice), &HEADER);
            assert!(slice.payload().is_empty());
            free_slice(&slice);
        }
    }

    #[test]
    fn replace_refuses_payload_outside_block() {
        unsafe {
            let mut slice = refcounted_slice(b"abc");
            let block = slice.refcount;
            // data before the block start cannot be described by a header length
            slice.refcount = (block as *mut u8).add(HEADER.len() + 1) as *mut c_void;

            assert!(matches!(
                slice.replace_payload(b"x"),
                Err(NativeError::HookFailed(_))
            ));
            assert_eq!(slice.length, 3);

            slice.refcount = block;
            free_slice(&slice);
        }
    }

    #[test]
    fn replace_refuses_detached_refcount() {
        unsafe {
            let mut slice = refcounted_slice(b"abc");
            let block = slice.refcount;
            // a refcount far below the payload is not a header of its block
            slice.refcount = slice.data.wrapping_sub(MAX_SLICE_HEADER + 1) as *mut c_void;

            assert_eq!(slice.header_len(), None);
            assert!(matches!(
                slice.replace_payload(b"x"),
                Err(NativeError::HookFailed(_))
            ));
            assert_eq!(slice.length, 3);
            assert_eq!(slice.payload(), b"abc");

            slice.refcount = block;
            free_slice(&slice);
        }
    }

    #[test]
    fn header_of_one_page_is_accepted() {
        let mut block = vec![0u8; MAX_SLICE_HEADER + 4];
        let slice = GrpcSlice {
            refcount: block.as_mut_ptr() as *mut c_void,
            length: 4,
            data: unsafe { block.as_mut_ptr().add(MAX_SLICE_HEADER) },
        };
        assert_eq!(slice.header_len(), Some(MAX_SLICE_HEADER));
    }

    #[test]
    fn first_slice_tolerates_null_links() {
        unsafe {
            assert!(GrpcByteBuffer::first_slice(ptr::null_mut()).is_null());

            let mut empty: *mut GrpcByteBuffer = ptr::null_mut();
            assert!(GrpcByteBuffer::first_slice(&mut empty).is_null());

            let mut slice = refcounted_slice(b"abc");
            let mut buffer = GrpcByteBuffer {
                reserved: ptr::null_mut(),
                kind: 0,
                compression: 0,
                slices: &mut slice,
            };
            let mut buffer_ptr: *mut GrpcByteBuffer = &mut buffer;
            assert_eq!(GrpcByteBuffer::first_slice(&mut buffer_ptr), &mut slice as *mut _);
            free_slice(&slice);
        }
    }
}
