/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Tag used to match two-sided messages belonging to one request.
pub type Tag = i32;

/// Element datatypes understood by the schedule.
///
/// A datatype here is contiguous: its extent is the element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataType::F32),
            1 => Some(DataType::F64),
            2 => Some(DataType::F16),
            3 => Some(DataType::BF16),
            4 => Some(DataType::I8),
            5 => Some(DataType::I32),
            6 => Some(DataType::I64),
            7 => Some(DataType::U8),
            8 => Some(DataType::U32),
            9 => Some(DataType::U64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations applied by `Reduce` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum = 0,
    /// Element-wise product.
    Prod = 1,
    /// Element-wise minimum.
    Min = 2,
    /// Element-wise maximum.
    Max = 3,
}

impl ReduceOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ReduceOp::Sum),
            1 => Some(ReduceOp::Prod),
            2 => Some(ReduceOp::Min),
            3 => Some(ReduceOp::Max),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Passive-target lock mode requested by a `TryGet` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockType {
    Exclusive = 0,
    Shared = 1,
}

impl LockType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LockType::Exclusive),
            1 => Some(LockType::Shared),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::F16.size_in_bytes(), 2);
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::I8.size_in_bytes(), 1);
        assert_eq!(DataType::I32.size_in_bytes(), 4);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U32.size_in_bytes(), 4);
        assert_eq!(DataType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_datatype_from_u8() {
        for v in 0u8..10 {
            let dt = DataType::from_u8(v).unwrap();
            assert_eq!(dt as u8, v);
        }
        assert_eq!(DataType::from_u8(10), None);
    }

    #[test]
    fn test_datatype_display() {
        assert_eq!(DataType::F32.to_string(), "f32");
        assert_eq!(DataType::BF16.to_string(), "bf16");
    }

    #[test]
    fn test_reduce_op_from_u8() {
        assert_eq!(ReduceOp::from_u8(0), Some(ReduceOp::Sum));
        assert_eq!(ReduceOp::from_u8(3), Some(ReduceOp::Max));
        assert_eq!(ReduceOp::from_u8(4), None);
        assert_eq!(ReduceOp::Prod.to_string(), "prod");
    }

    #[test]
    fn test_lock_type_from_u8() {
        assert_eq!(LockType::from_u8(0), Some(LockType::Exclusive));
        assert_eq!(LockType::from_u8(1), Some(LockType::Shared));
        assert_eq!(LockType::from_u8(2), None);
    }
}
