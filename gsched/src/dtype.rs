use std::fmt::Display;

/// Element type of tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    /// 16 bit float
    F16,
    /// 32 bit float
    F32,
    /// 32 bit signed integer
    I32,
}

impl DType {
    /// Size of one element in bytes
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }

    /// Reads one element from little endian bytes, converting it to f32
    pub(crate) fn read_f32(&self, bytes: &[u8]) -> f32 {
        match self {
            DType::F16 => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            DType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            DType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
        }
    }

    /// Writes one f32 value as this dtype into little endian bytes
    pub(crate) fn write_f32(&self, value: f32, bytes: &mut [u8]) {
        match self {
            DType::F16 => bytes[..2].copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
            DType::F32 => bytes[..4].copy_from_slice(&value.to_le_bytes()),
            DType::I32 => bytes[..4].copy_from_slice(&(value.round() as i32).to_le_bytes()),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::I32 => "i32",
        })
    }
}
