use std::fmt;

// DType: supported element types
//
// Every array carries a runtime DType that selects the concrete buffer
// variant backing it:
//
//   F32: 32-bit float, the default for parameters and activations
//   F64: 64-bit float, for gradient checking and high-precision work
//   I32: signed 32-bit int, for index arrays and integer arange tensors
//
// Kernels always compute in f64 and cast on store, so a float expression
// assigned into an I32 array truncates toward zero (69.1 stores 69).

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// The numpy `descr` string for little-endian storage.
    pub fn numpy_descr(&self) -> &'static str {
        match self {
            DType::F32 => "<f4",
            DType::F64 => "<f8",
            DType::I32 => "<i4",
        }
    }

    /// Parse a numpy `descr` string. Only little-endian (or byte-order
    /// agnostic) forms of the supported types are accepted.
    pub fn from_numpy_descr(descr: &str) -> Option<DType> {
        match descr {
            "<f4" | "=f4" | "|f4" | "f4" => Some(DType::F32),
            "<f8" | "=f8" | "|f8" | "f8" => Some(DType::F64),
            "<i4" | "=i4" | "|i4" | "i4" => Some(DType::I32),
            _ => None,
        }
    }

    /// Name of the matching C type, used when generating device kernels.
    pub fn c_type(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
            DType::I32 => "int",
        }
    }

    /// Cast an f64 into this dtype's value range and back. Integer dtypes
    /// truncate toward zero.
    pub fn round_trip(&self, v: f64) -> f64 {
        match self {
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
            DType::I32 => v as i32 as f64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
        };
        write!(f, "{}", s)
    }
}

// WithDType: connects Rust types to DType enum
//
// Implemented for f32, f64 and i32 so that constructors such as
// `Array::from_vec(vec![1.0f32, 2.0], (2,))` pick the dtype from the element
// type. The buffer hooks let generic code move a typed Vec in and out of the
// runtime-tagged HostBuffer without a match at every call site.

/// Trait implemented by Rust types that can be stored in an array.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug + PartialOrd
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// Wrap a typed vector into the runtime-tagged host buffer.
    fn into_host(data: Vec<Self>) -> crate::memory::HostBuffer;

    /// Borrow the typed slice if the buffer holds this element type.
    fn slice_of(buffer: &crate::memory::HostBuffer) -> Option<&[Self]>;

    /// The zero value.
    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    /// The one value.
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn into_host(data: Vec<Self>) -> crate::memory::HostBuffer {
        crate::memory::HostBuffer::F32(data)
    }
    fn slice_of(buffer: &crate::memory::HostBuffer) -> Option<&[Self]> {
        match buffer {
            crate::memory::HostBuffer::F32(v) => Some(v),
            _ => None,
        }
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn into_host(data: Vec<Self>) -> crate::memory::HostBuffer {
        crate::memory::HostBuffer::F64(data)
    }
    fn slice_of(buffer: &crate::memory::HostBuffer) -> Option<&[Self]> {
        match buffer {
            crate::memory::HostBuffer::F64(v) => Some(v),
            _ => None,
        }
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    fn into_host(data: Vec<Self>) -> crate::memory::HostBuffer {
        crate::memory::HostBuffer::I32(data)
    }
    fn slice_of(buffer: &crate::memory::HostBuffer) -> Option<&[Self]> {
        match buffer {
            crate::memory::HostBuffer::I32(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_cast_truncates() {
        assert_eq!(DType::I32.round_trip(69.1), 69.0);
        assert_eq!(DType::I32.round_trip(-2.7), -2.0);
        assert_eq!(i32::from_f64(69.1), 69);
    }

    #[test]
    fn test_numpy_descr_roundtrip() {
        for dtype in [DType::F32, DType::F64, DType::I32] {
            assert_eq!(DType::from_numpy_descr(dtype.numpy_descr()), Some(dtype));
        }
        assert_eq!(DType::from_numpy_descr(">f4"), None);
        assert_eq!(DType::from_numpy_descr("<i8"), None);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert!(!DType::I32.is_float());
    }
}
