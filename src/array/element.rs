use serde::Serialize;

use crate::metadata::DataType;

use super::ArrayError;

/// A type that can be stored as an element of an array.
///
/// Elements are stored little endian regardless of the host.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    /// The array data type of the element.
    const DATA_TYPE: DataType;

    /// Convert from host to little endian byte order.
    #[must_use]
    fn to_little_endian(self) -> Self;

    /// Convert from little endian to host byte order.
    #[must_use]
    fn from_little_endian(self) -> Self;

    /// Convert to `f64`.
    fn as_f64(self) -> f64;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::UInt8;

    fn to_little_endian(self) -> Self {
        self
    }

    fn from_little_endian(self) -> Self {
        self
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Element for u16 {
    const DATA_TYPE: DataType = DataType::UInt16;

    fn to_little_endian(self) -> Self {
        self.to_le()
    }

    fn from_little_endian(self) -> Self {
        u16::from_le(self)
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::Float64;

    fn to_little_endian(self) -> Self {
        f64::from_bits(self.to_bits().to_le())
    }

    fn from_little_endian(self) -> Self {
        f64::from_bits(u64::from_le(self.to_bits()))
    }

    fn as_f64(self) -> f64 {
        self
    }
}

/// Decode little endian bytes into elements.
///
/// # Errors
/// Returns [`ArrayError::InvalidElementCount`] if the length of `bytes` is not a multiple of the element size.
pub fn elements_from_le_bytes<T: Element>(bytes: &[u8]) -> Result<Vec<T>, ArrayError> {
    let element_size = std::mem::size_of::<T>();
    if bytes.len() % element_size != 0 {
        return Err(ArrayError::InvalidElementCount(
            bytes.len() / element_size,
            bytes.len().div_ceil(element_size) as u64,
        ));
    }
    let mut elements: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
    for element in &mut elements {
        *element = element.from_little_endian();
    }
    Ok(elements)
}

/// Encode elements as little endian bytes.
#[must_use]
pub fn elements_to_le_bytes<T: Element>(elements: &[T]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice(elements).to_vec()
    } else {
        let elements: Vec<T> = elements.iter().map(|e| e.to_little_endian()).collect();
        bytemuck::cast_slice(&elements).to_vec()
    }
}

/// The elements of a chunk with a data type known at runtime.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArrayElements {
    /// `uint8` elements.
    UInt8(Vec<u8>),
    /// `uint16` elements.
    UInt16(Vec<u16>),
    /// `float64` elements.
    Float64(Vec<f64>),
}

impl ArrayElements {
    /// Decode little endian `bytes` as elements of `data_type`.
    ///
    /// # Errors
    /// Returns [`ArrayError::InvalidElementCount`] if the length of `bytes` is not a multiple of the element size.
    pub fn from_le_bytes(data_type: DataType, bytes: &[u8]) -> Result<Self, ArrayError> {
        Ok(match data_type {
            DataType::UInt8 => Self::UInt8(elements_from_le_bytes(bytes)?),
            DataType::UInt16 => Self::UInt16(elements_from_le_bytes(bytes)?),
            DataType::Float64 => Self::Float64(elements_from_le_bytes(bytes)?),
        })
    }

    /// Encode the elements as little endian bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::UInt8(elements) => elements_to_le_bytes(elements),
            Self::UInt16(elements) => elements_to_le_bytes(elements),
            Self::Float64(elements) => elements_to_le_bytes(elements),
        }
    }

    /// The data type of the elements.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::UInt8(_) => DataType::UInt8,
            Self::UInt16(_) => DataType::UInt16,
            Self::Float64(_) => DataType::Float64,
        }
    }

    /// The number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::UInt8(elements) => elements.len(),
            Self::UInt16(elements) => elements.len(),
            Self::Float64(elements) => elements.len(),
        }
    }

    /// Returns true if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element at `index` as `f64`.
    #[must_use]
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::UInt8(elements) => elements.get(index).copied().map(Element::as_f64),
            Self::UInt16(elements) => elements.get(index).copied().map(Element::as_f64),
            Self::Float64(elements) => elements.get(index).copied(),
        }
    }

    /// Convert all elements to `f64`.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::UInt8(elements) => elements.iter().copied().map(Element::as_f64).collect(),
            Self::UInt16(elements) => elements.iter().copied().map(Element::as_f64).collect(),
            Self::Float64(elements) => elements.clone(),
        }
    }

    /// The minimum and maximum element as `f64`, ignoring NaN. [`None`] if there are no comparable elements.
    #[must_use]
    pub fn min_max_f64(&self) -> Option<(f64, f64)> {
        fn fold<T: Element>(elements: &[T]) -> Option<(f64, f64)> {
            elements
                .iter()
                .map(|e| e.as_f64())
                .filter(|v| !v.is_nan())
                .fold(None, |acc, v| match acc {
                    None => Some((v, v)),
                    Some((min, max)) => Some((min.min(v), max.max(v))),
                })
        }
        match self {
            Self::UInt8(elements) => fold(elements),
            Self::UInt16(elements) => fold(elements),
            Self::Float64(elements) => fold(elements),
        }
    }

    /// Extract the `w` x `h` rectangle at (`x`, `y`) from row-major elements with rows of `row_length`.
    ///
    /// The rectangle must lie within the elements.
    #[must_use]
    pub fn extract_rect(&self, row_length: usize, x: usize, y: usize, w: usize, h: usize) -> Self {
        fn extract<T: Copy>(
            elements: &[T],
            row_length: usize,
            x: usize,
            y: usize,
            w: usize,
            h: usize,
        ) -> Vec<T> {
            let mut rect = Vec::with_capacity(w * h);
            for row in y..y + h {
                let start = row * row_length + x;
                rect.extend_from_slice(&elements[start..start + w]);
            }
            rect
        }
        match self {
            Self::UInt8(elements) => Self::UInt8(extract(elements, row_length, x, y, w, h)),
            Self::UInt16(elements) => Self::UInt16(extract(elements, row_length, x, y, w, h)),
            Self::Float64(elements) => Self::Float64(extract(elements, row_length, x, y, w, h)),
        }
    }
}

impl From<Vec<u8>> for ArrayElements {
    fn from(elements: Vec<u8>) -> Self {
        Self::UInt8(elements)
    }
}

impl From<Vec<u16>> for ArrayElements {
    fn from(elements: Vec<u16>) -> Self {
        Self::UInt16(elements)
    }
}

impl From<Vec<f64>> for ArrayElements {
    fn from(elements: Vec<f64>) -> Self {
        Self::Float64(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elements_le_bytes() {
        let bytes = elements_to_le_bytes(&[0x0102u16, 0xfffe]);
        assert_eq!(bytes, [0x02, 0x01, 0xfe, 0xff]);
        assert_eq!(
            elements_from_le_bytes::<u16>(&bytes).unwrap(),
            [0x0102, 0xfffe]
        );
        assert!(elements_from_le_bytes::<u16>(&bytes[..3]).is_err());

        let bytes = elements_to_le_bytes(&[1.5f64]);
        assert_eq!(bytes, 1.5f64.to_le_bytes());
    }

    #[test]
    fn array_elements_dynamic() {
        let elements = ArrayElements::from_le_bytes(DataType::UInt16, &[1, 0, 0, 1]).unwrap();
        assert_eq!(elements, ArrayElements::UInt16(vec![1, 256]));
        assert_eq!(elements.data_type(), DataType::UInt16);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements.to_f64_vec(), [1.0, 256.0]);
        assert_eq!(elements.get_f64(1), Some(256.0));
        assert_eq!(elements.get_f64(2), None);
        assert_eq!(elements.min_max_f64(), Some((1.0, 256.0)));
        assert_eq!(elements.to_le_bytes(), [1, 0, 0, 1]);
        assert_eq!(ArrayElements::UInt8(vec![]).min_max_f64(), None);
        assert_eq!(
            ArrayElements::Float64(vec![f64::NAN, 2.0, -1.0]).min_max_f64(),
            Some((-1.0, 2.0))
        );
    }

    #[test]
    fn array_elements_extract_rect() {
        // 4x3 frame
        let frame = ArrayElements::UInt8((0..12).collect());
        assert_eq!(
            frame.extract_rect(4, 1, 1, 2, 2),
            ArrayElements::UInt8(vec![5, 6, 9, 10])
        );
        assert_eq!(frame.extract_rect(4, 0, 0, 4, 3), frame);
    }
}
