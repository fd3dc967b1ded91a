//! Contiguous datatype helpers used by `Copy` and `Unpack` records.
//!
//! Every [`DataType`] is a contiguous element type, so extents are element
//! sizes and a copy is a byte move. The external32 representation is the
//! big-endian canonical layout; unpacking converts it to native byte order.

use crate::error::{Result, RmaCollError};
use crate::types::DataType;

/// Extent in bytes of `count` elements of `dtype`.
pub fn extent(dtype: DataType, count: usize) -> usize {
    count * dtype.size_in_bytes()
}

/// Copy `src_count` elements of `src_dtype` into a destination described by
/// `dst_count` elements of `dst_dtype`.
///
/// The destination must be at least as large as the source; a smaller
/// destination is `BufferSizeMismatch`.
///
/// # Safety
/// `src_ptr` must be valid for reads of the source extent and `dst_ptr` valid
/// for writes of the destination extent. The ranges must not overlap.
pub unsafe fn copy_raw(
    src_ptr: u64,
    src_count: usize,
    src_dtype: DataType,
    dst_ptr: u64,
    dst_count: usize,
    dst_dtype: DataType,
) -> Result<()> {
    let src_bytes = extent(src_dtype, src_count);
    let dst_bytes = extent(dst_dtype, dst_count);
    if dst_bytes < src_bytes {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: src_bytes,
            actual: dst_bytes,
        });
    }
    if src_bytes == 0 || src_ptr == dst_ptr {
        return Ok(());
    }
    unsafe {
        std::ptr::copy_nonoverlapping(src_ptr as *const u8, dst_ptr as *mut u8, src_bytes);
    }
    Ok(())
}

/// Convert `count` native elements to external32 (big-endian) in place of `dst`.
pub fn pack_external32(src: &[u8], count: usize, dtype: DataType, dst: &mut [u8]) -> Result<()> {
    convert_external32(src, count, dtype, dst)
}

/// Convert `count` external32 (big-endian) elements to native byte order.
pub fn unpack_external32(src: &[u8], count: usize, dtype: DataType, dst: &mut [u8]) -> Result<()> {
    convert_external32(src, count, dtype, dst)
}

/// Raw-address form of [`unpack_external32`].
///
/// # Safety
/// `src_ptr` must be valid for reads and `dst_ptr` for writes of
/// `extent(dtype, count)` bytes. The ranges must not partially overlap.
pub unsafe fn unpack_external32_raw(
    src_ptr: u64,
    count: usize,
    dtype: DataType,
    dst_ptr: u64,
) -> Result<()> {
    let bytes = extent(dtype, count);
    if bytes == 0 {
        return Ok(());
    }
    let elem = dtype.size_in_bytes();
    let src = src_ptr as *const u8;
    let dst = dst_ptr as *mut u8;
    let mut scratch = [0u8; 8];
    for i in 0..count {
        let off = i * elem;
        unsafe {
            std::ptr::copy(src.add(off), scratch.as_mut_ptr(), elem);
        }
        if cfg!(target_endian = "little") {
            scratch[..elem].reverse();
        }
        unsafe {
            std::ptr::copy(scratch.as_ptr(), dst.add(off), elem);
        }
    }
    Ok(())
}

/// Unpack `count` external32 elements from `inbuf` starting at `*position`,
/// advancing `*position` past them.
///
/// Reading past the end of `inbuf` is `BufferSizeMismatch` and leaves
/// `*position` unchanged.
pub fn unpack(
    inbuf: &[u8],
    position: &mut usize,
    outbuf: &mut [u8],
    count: usize,
    dtype: DataType,
) -> Result<()> {
    let bytes = extent(dtype, count);
    let end = position.checked_add(bytes).ok_or_else(|| {
        RmaCollError::invalid(format!("unpack position {position} overflows"))
    })?;
    if end > inbuf.len() {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: end,
            actual: inbuf.len(),
        });
    }
    unpack_external32(&inbuf[*position..end], count, dtype, outbuf)?;
    *position = end;
    Ok(())
}

// Big-endian <-> native is the same byte swap both ways.
fn convert_external32(src: &[u8], count: usize, dtype: DataType, dst: &mut [u8]) -> Result<()> {
    let bytes = extent(dtype, count);
    if src.len() < bytes {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: bytes,
            actual: src.len(),
        });
    }
    if dst.len() < bytes {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: bytes,
            actual: dst.len(),
        });
    }
    let elem = dtype.size_in_bytes();
    for (s, d) in src[..bytes]
        .chunks_exact(elem)
        .zip(dst[..bytes].chunks_exact_mut(elem))
    {
        d.copy_from_slice(s);
        if cfg!(target_endian = "little") {
            d.reverse();
        }
    }
    Ok(())
}
