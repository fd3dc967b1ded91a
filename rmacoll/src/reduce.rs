//! Element-wise reduction primitives executed by `Reduce` records.

use crate::error::{Result, RmaCollError};
use crate::types::{DataType, ReduceOp};

/// Trait for types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

// ── Half precision ──────────────────────────────────────────────────

/// bfloat16 bits: sign(1) + exponent(8) + mantissa(7).
#[derive(Clone, Copy, Debug, PartialEq)]
struct Bf16(u16);

impl Bf16 {
    fn from_f32(v: f32) -> Self {
        let bits = v.to_bits();
        if v.is_nan() {
            // Keep a mantissa bit so truncation cannot turn NaN into Inf.
            return Bf16(((bits >> 16) as u16) | 0x0040);
        }
        // Round to nearest, ties to even.
        let rounded = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
        Bf16((rounded >> 16) as u16)
    }

    fn to_f32(self) -> f32 {
        f32::from_bits(u32::from(self.0) << 16)
    }
}

/// IEEE 754 binary16 bits: sign(1) + exponent(5) + mantissa(10).
#[derive(Clone, Copy, Debug, PartialEq)]
struct F16(u16);

impl F16 {
    fn from_f32(v: f32) -> Self {
        let bits = v.to_bits();
        let sign = (bits >> 16) & 0x8000;
        let exponent = ((bits >> 23) & 0xFF) as i32;
        let mantissa = bits & 0x007F_FFFF;

        if exponent == 0xFF {
            let nan = if mantissa != 0 { 0x0200 } else { 0 };
            return F16((sign | 0x7C00 | nan) as u16);
        }
        let unbiased = exponent - 127;
        if unbiased > 15 {
            return F16((sign | 0x7C00) as u16);
        }
        if unbiased < -25 {
            return F16(sign as u16);
        }
        if unbiased < -14 {
            // Subnormal: shift the implicit bit into the 10-bit field.
            let full = mantissa | 0x0080_0000;
            let shift = (-unbiased - 1) as u32;
            let half = 1u32 << (shift - 1);
            let rest = full & ((1u32 << shift) - 1);
            let mut m = full >> shift;
            if rest > half || (rest == half && m & 1 == 1) {
                m += 1;
            }
            return F16((sign | m) as u16);
        }
        let mut h = (((unbiased + 15) as u32) << 10) | (mantissa >> 13);
        let rest = mantissa & 0x1FFF;
        if rest > 0x1000 || (rest == 0x1000 && h & 1 == 1) {
            // A carry out of the mantissa bumps the exponent, up to Inf.
            h += 1;
        }
        F16((sign | h) as u16)
    }

    fn to_f32(self) -> f32 {
        let h = u32::from(self.0);
        let sign = (h & 0x8000) << 16;
        let exponent = (h >> 10) & 0x1F;
        let mantissa = h & 0x03FF;
        match (exponent, mantissa) {
            (0, 0) => f32::from_bits(sign),
            (0, m) => {
                let magnitude = m as f32 * f32::from_bits(0x3380_0000); // 2^-24
                if sign != 0 { -magnitude } else { magnitude }
            }
            (31, 0) => f32::from_bits(sign | 0x7F80_0000),
            (31, m) => f32::from_bits(sign | 0x7FC0_0000 | (m << 13)),
            (e, m) => f32::from_bits(sign | ((e + 112) << 23) | (m << 13)),
        }
    }
}

impl Reducible for Bf16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        Bf16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

impl Reducible for F16 {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        F16::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
    }
}

/// `dst[i] = op(dst[i], src[i])` over byte slices holding `dtype` elements.
///
/// Both slices must hold at least `count` elements.
pub fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let bytes = count * dtype.size_in_bytes();
    if dst.len() < bytes || src.len() < bytes {
        return Err(RmaCollError::BufferSizeMismatch {
            expected: bytes,
            actual: dst.len().min(src.len()),
        });
    }
    // SAFETY: both slices were just checked to cover `count` elements.
    unsafe { reduce_raw(dst.as_mut_ptr() as u64, src.as_ptr() as u64, count, dtype, op) }
}

/// `dst[i] = op(dst[i], src[i])` on raw addresses. Unaligned addresses are fine.
///
/// # Safety
/// `dst_ptr` must be valid for reads and writes of `count` elements of `dtype`,
/// `src_ptr` valid for reads of the same. The two ranges may be identical but
/// must not partially overlap.
pub unsafe fn reduce_raw(
    dst_ptr: u64,
    src_ptr: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    unsafe {
        match dtype {
            DataType::F32 => reduce_raw_typed::<f32>(dst_ptr, src_ptr, count, op),
            DataType::F64 => reduce_raw_typed::<f64>(dst_ptr, src_ptr, count, op),
            DataType::I32 => reduce_raw_typed::<i32>(dst_ptr, src_ptr, count, op),
            DataType::I64 => reduce_raw_typed::<i64>(dst_ptr, src_ptr, count, op),
            DataType::U32 => reduce_raw_typed::<u32>(dst_ptr, src_ptr, count, op),
            DataType::U64 => reduce_raw_typed::<u64>(dst_ptr, src_ptr, count, op),
            DataType::I8 => reduce_raw_typed::<i8>(dst_ptr, src_ptr, count, op),
            DataType::U8 => reduce_raw_typed::<u8>(dst_ptr, src_ptr, count, op),
            DataType::F16 => reduce_raw_typed::<F16>(dst_ptr, src_ptr, count, op),
            DataType::BF16 => reduce_raw_typed::<Bf16>(dst_ptr, src_ptr, count, op),
        }
    }
    Ok(())
}

/// # Safety
/// See [`reduce_raw`].
unsafe fn reduce_raw_typed<T: Reducible>(dst_ptr: u64, src_ptr: u64, count: usize, op: ReduceOp) {
    let dst = dst_ptr as *mut T;
    let src = src_ptr as *const T;
    for i in 0..count {
        let d = unsafe { dst.add(i).read_unaligned() };
        let s = unsafe { src.add(i).read_unaligned() };
        unsafe { dst.add(i).write_unaligned(T::reduce(d, s, op)) };
    }
}
