//! Native scalar types.

use std::ffi::c_int;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EmberError;

/// Scalar types of native tensors, numbered as libtorch's `ScalarType`.
///
/// Only the codes the C wrapper can return are listed; anything else decodes
/// to [`EmberError::UnknownKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Uint8,
    Int8,
    Int16,
    Int,
    Int64,
    Half,
    Float,
    Double,
    ComplexHalf,
    ComplexFloat,
    ComplexDouble,
    Bool,
    QInt8,
    QUInt8,
    QInt32,
    BFloat16,
}

impl Kind {
    /// Code passed as `options_kind` to factory entry points.
    pub fn c_int(self) -> c_int {
        match self {
            Kind::Uint8 => 0,
            Kind::Int8 => 1,
            Kind::Int16 => 2,
            Kind::Int => 3,
            Kind::Int64 => 4,
            Kind::Half => 5,
            Kind::Float => 6,
            Kind::Double => 7,
            Kind::ComplexHalf => 8,
            Kind::ComplexFloat => 9,
            Kind::ComplexDouble => 10,
            Kind::Bool => 11,
            Kind::QInt8 => 12,
            Kind::QUInt8 => 13,
            Kind::QInt32 => 14,
            Kind::BFloat16 => 15,
        }
    }

    /// Decode the value returned by `at_scalar_type`.
    pub fn from_c_int(v: c_int) -> Result<Self, EmberError> {
        let kind = match v {
            0 => Kind::Uint8,
            1 => Kind::Int8,
            2 => Kind::Int16,
            3 => Kind::Int,
            4 => Kind::Int64,
            5 => Kind::Half,
            6 => Kind::Float,
            7 => Kind::Double,
            8 => Kind::ComplexHalf,
            9 => Kind::ComplexFloat,
            10 => Kind::ComplexDouble,
            11 => Kind::Bool,
            12 => Kind::QInt8,
            13 => Kind::QUInt8,
            14 => Kind::QInt32,
            15 => Kind::BFloat16,
            other => return Err(EmberError::UnknownKind(other)),
        };
        Ok(kind)
    }

    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            Kind::Uint8 | Kind::Int8 | Kind::Bool | Kind::QInt8 | Kind::QUInt8 => 1,
            Kind::Int16 | Kind::Half | Kind::BFloat16 => 2,
            Kind::Int | Kind::Float | Kind::QInt32 | Kind::ComplexHalf => 4,
            Kind::Int64 | Kind::Double | Kind::ComplexFloat => 8,
            Kind::ComplexDouble => 16,
        }
    }

    /// Whether this is a (real) floating-point kind.
    pub fn is_float(self) -> bool {
        matches!(self, Kind::Half | Kind::BFloat16 | Kind::Float | Kind::Double)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Uint8 => "u8",
            Kind::Int8 => "i8",
            Kind::Int16 => "i16",
            Kind::Int => "i32",
            Kind::Int64 => "i64",
            Kind::Half => "f16",
            Kind::Float => "f32",
            Kind::Double => "f64",
            Kind::ComplexHalf => "c32",
            Kind::ComplexFloat => "c64",
            Kind::ComplexDouble => "c128",
            Kind::Bool => "bool",
            Kind::QInt8 => "qi8",
            Kind::QUInt8 => "qu8",
            Kind::QInt32 => "qi32",
            Kind::BFloat16 => "bf16",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Kind; 16] = [
        Kind::Uint8,
        Kind::Int8,
        Kind::Int16,
        Kind::Int,
        Kind::Int64,
        Kind::Half,
        Kind::Float,
        Kind::Double,
        Kind::ComplexHalf,
        Kind::ComplexFloat,
        Kind::ComplexDouble,
        Kind::Bool,
        Kind::QInt8,
        Kind::QUInt8,
        Kind::QInt32,
        Kind::BFloat16,
    ];

    #[test]
    fn test_codes_are_dense_and_decodable() {
        for (code, kind) in ALL.iter().enumerate() {
            assert_eq!(kind.c_int(), code as c_int);
            assert_eq!(Kind::from_c_int(code as c_int).unwrap(), *kind);
        }
    }

    #[test]
    fn test_unknown_code() {
        assert!(matches!(Kind::from_c_int(16), Err(EmberError::UnknownKind(16))));
        assert!(matches!(Kind::from_c_int(-1), Err(EmberError::UnknownKind(-1))));
    }

    #[test]
    fn test_properties() {
        assert_eq!(Kind::Float.element_size(), 4);
        assert_eq!(Kind::BFloat16.element_size(), 2);
        assert!(Kind::Double.is_float());
        assert!(!Kind::Int64.is_float());
        assert_eq!(Kind::Float.to_string(), "f32");
    }
}
