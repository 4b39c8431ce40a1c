use crate::device::Device;
use crate::shape::Shape;

/// All errors that can occur within kestrel.
///
/// Usage mistakes (bad indices, mismatched shapes, a zero slice step, asking a
/// non-scalar for its gradient seed) and configuration mistakes (a GPU request
/// in a CPU-only build) are reported here rather than by panicking. Numerical
/// edge cases are never errors: they propagate as IEEE inf/nan.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two operands (e.g. assigning [2,3] into [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between operands of an expression or an assignment.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Axis index out of range for the array's rank.
    #[error("dimension out of range: dim {dim} for array with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element index out of range along one axis.
    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange {
        index: usize,
        axis: usize,
        size: usize,
    },

    /// Wrong number of indices for an element access.
    #[error("expected {expected} indices, got {got}")]
    IndexRankMismatch { expected: usize, got: usize },

    /// Narrow/slice bounds outside the axis.
    #[error("slice out of bounds: dim {dim}, start {start}, end {end}, dim_size {dim_size}")]
    SliceOutOfBounds {
        dim: usize,
        start: isize,
        end: isize,
        dim_size: usize,
    },

    /// A slice was built with step 0.
    #[error("slice step cannot be zero")]
    ZeroStep,

    /// `grad()` (or a scalar read) on a tensor with more than one element.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix product dimension mismatch.
    #[error("dot shape mismatch: [{m}x{k1}] . [{k2}x{n}], inner dims must match")]
    DotShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// The requested device is not compiled into this build or not present.
    #[error("device {device} is unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    /// A device setting that does not name a device.
    #[error("unrecognized device '{value}' (expected cpu, gpu or gpu:N)")]
    InvalidDevice { value: String },

    /// An initializer was combined with arguments it cannot honour.
    #[error("invalid initializer: {0}")]
    InvalidInitializer(String),

    /// Malformed or unsupported `.npy` content.
    #[error("npy: {0}")]
    Npy(String),

    /// Filesystem failure while reading or writing arrays.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub(crate) fn gpu_unavailable(device: Device) -> Self {
        Error::DeviceUnavailable {
            device,
            reason: "kestrel was built without the `cuda` feature".to_string(),
        }
    }
}

/// Convenience Result type used throughout kestrel.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
