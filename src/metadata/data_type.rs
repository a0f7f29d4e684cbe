use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A data type of a crop store array.
///
/// Serialised as a Zarr V2 `dtype` string. Multi-byte types are always little endian.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum DataType {
    /// `uint8` (`|u1`).
    #[display("uint8")]
    UInt8,
    /// `uint16` (`<u2`).
    #[display("uint16")]
    UInt16,
    /// `float64` (`<f8`).
    #[display("float64")]
    Float64,
}

/// An unsupported data type error.
#[derive(Debug, Error)]
#[error("data type {0:?} is not supported")]
pub struct UnsupportedDataTypeError(String);

impl DataType {
    /// The size in bytes of one element.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::UInt16 => 2,
            Self::Float64 => 8,
        }
    }

    /// The Zarr V2 `dtype` string.
    #[must_use]
    pub const fn as_v2_str(&self) -> &'static str {
        match self {
            Self::UInt8 => "|u1",
            Self::UInt16 => "<u2",
            Self::Float64 => "<f8",
        }
    }

    /// Parse a Zarr V2 `dtype` string.
    ///
    /// Big endian types are rejected since chunks are always written little endian.
    ///
    /// # Errors
    /// Returns [`UnsupportedDataTypeError`] if `dtype` is not one of `|u1`, `<u2`, or `<f8`.
    pub fn from_v2_str(dtype: &str) -> Result<Self, UnsupportedDataTypeError> {
        match dtype {
            "|u1" | "<u1" => Ok(Self::UInt8),
            "<u2" => Ok(Self::UInt16),
            "<f8" => Ok(Self::Float64),
            _ => Err(UnsupportedDataTypeError(dtype.to_string())),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_v2_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let dtype = String::deserialize(d)?;
        Self::from_v2_str(&dtype).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_v2_strings() {
        for data_type in [DataType::UInt8, DataType::UInt16, DataType::Float64] {
            assert_eq!(
                DataType::from_v2_str(data_type.as_v2_str()).unwrap(),
                data_type
            );
        }
        assert_eq!(DataType::UInt16.size(), 2);
        assert_eq!(DataType::Float64.to_string(), "float64");
        assert!(DataType::from_v2_str(">u2").is_err());
        assert_eq!(
            DataType::from_v2_str("<i4").unwrap_err().to_string(),
            r#"data type "<i4" is not supported"#
        );
    }

    #[test]
    fn data_type_serde() {
        let json = serde_json::to_string(&DataType::UInt16).unwrap();
        assert_eq!(json, r#""<u2""#);
        let data_type: DataType = serde_json::from_str(r#""|u1""#).unwrap();
        assert_eq!(data_type, DataType::UInt8);
        assert!(serde_json::from_str::<DataType>(r#""<c8""#).is_err());
    }
}
