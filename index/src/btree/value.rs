//! Key and value capabilities.
//!
//! The tree is generic over its key and value types. Keys need a total order,
//! values need equality, and both need a fixed-width little-endian encoding so
//! page stores can lay them out without a schema. The default instantiation is
//! `i32` keys with `i64` values.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

/// Loosely typed input arriving at an API boundary.
///
/// The command-line tool parses its arguments into scalars; the tree converts
/// them with [`FixedWidth::from_scalar`] before touching any node.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i128),
    Float(f64),
    Text(String),
}

impl FromStr for Scalar {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<i128>() {
            return Ok(Self::Int(value));
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            return Ok(Self::Float(value));
        }
        Ok(Self::Text(s.to_string()))
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// Why a scalar could not be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarError {
    /// An integer outside the target type's domain.
    OutOfRange,
    /// Not an integer at all.
    NotInteger,
}

/// Fixed-width binary encoding.
pub trait FixedWidth: Sized {
    /// Encoded size in bytes.
    const WIDTH: usize;

    /// Write `WIDTH` bytes at the start of `out`.
    fn write_to(self, out: &mut [u8]);

    /// Read from the first `WIDTH` bytes of `bytes`.
    fn read_from(bytes: &[u8]) -> Self;

    /// Convert boundary input, rejecting anything outside the domain.
    fn from_scalar(scalar: &Scalar) -> Result<Self, ScalarError>;
}

/// Capability required of tree keys.
pub trait TreeKey: FixedWidth + Copy + Ord + Debug + Send + Sync + 'static {}

impl<T> TreeKey for T where T: FixedWidth + Copy + Ord + Debug + Send + Sync + 'static {}

/// Capability required of tree values.
pub trait TreeValue: FixedWidth + Copy + Eq + Debug + Send + Sync + 'static {}

impl<T> TreeValue for T where T: FixedWidth + Copy + Eq + Debug + Send + Sync + 'static {}

macro_rules! impl_fixed_width {
    ($($ty:ty),*) => {$(
        impl FixedWidth for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn write_to(self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn read_from(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..Self::WIDTH]);
                Self::from_le_bytes(buf)
            }

            fn from_scalar(scalar: &Scalar) -> Result<Self, ScalarError> {
                match scalar {
                    Scalar::Int(v) => Self::try_from(*v).map_err(|_| ScalarError::OutOfRange),
                    Scalar::Float(_) | Scalar::Text(_) => Err(ScalarError::NotInteger),
                }
            }
        }
    )*};
}

impl_fixed_width!(i32, i64, u32, u64);
