// rust/hgdata-core/src/array.rs

//! Typed n-dimensional arrays as stored in fields.
//!
//! A field holds a sequence of samples that share one element type and one
//! per-sample shape. Arrays handed to the saver and batches produced by the
//! parser are [`ArrayData`] values whose first axis is the sample axis.
//! Elements are always stored little-endian.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DataError, Result};

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::I32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::U8 => "u8",
            Dtype::I32 => "i32",
            Dtype::I64 => "i64",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dtype {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "uint8" => Ok(Dtype::U8),
            "i32" | "int32" => Ok(Dtype::I32),
            "i64" | "int64" => Ok(Dtype::I64),
            "f32" | "float32" => Ok(Dtype::F32),
            "f64" | "float64" => Ok(Dtype::F64),
            other => Err(DataError::config(format!("unknown dtype '{other}'"))),
        }
    }
}

/// Element type and per-sample shape of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub dtype: Dtype,
    pub sample_shape: Vec<usize>,
}

impl FieldSpec {
    pub fn new(dtype: Dtype, sample_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            sample_shape: sample_shape.into(),
        }
    }

    /// Number of elements in one sample.
    pub fn sample_len(&self) -> usize {
        self.sample_shape.iter().product()
    }

    /// Number of bytes in one encoded sample.
    pub fn sample_bytes(&self) -> usize {
        self.sample_len() * self.dtype.size()
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.sample_shape)
    }
}

/// A scalar type that can be stored in a field.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: Dtype;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `DTYPE.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    fn wrap(array: ArrayD<Self>) -> ArrayData;

    fn unwrap_ref(data: &ArrayData) -> Option<&ArrayD<Self>>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $n:expr) => {
        impl Element for $t {
            const DTYPE: Dtype = Dtype::$variant;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(&bytes[..$n]);
                <$t>::from_le_bytes(buf)
            }

            fn wrap(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$variant(array)
            }

            fn unwrap_ref(data: &ArrayData) -> Option<&ArrayD<Self>> {
                match data {
                    ArrayData::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }

        impl From<ArrayD<$t>> for ArrayData {
            fn from(array: ArrayD<$t>) -> Self {
                ArrayData::$variant(array)
            }
        }
    };
}

/// A dynamically typed n-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(ArrayD<u8>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl_element!(u8, U8, 1);
impl_element!(i32, I32, 4);
impl_element!(i64, I64, 8);
impl_element!(f32, F32, 4);
impl_element!(f64, F64, 8);

macro_rules! with_array {
    ($data:expr, $a:ident => $body:expr) => {
        match $data {
            ArrayData::U8($a) => $body,
            ArrayData::I32($a) => $body,
            ArrayData::I64($a) => $body,
            ArrayData::F32($a) => $body,
            ArrayData::F64($a) => $body,
        }
    };
}

fn encode<T: Element>(array: &ArrayD<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(array.len() * T::DTYPE.size());
    for &value in array.iter() {
        value.write_le(&mut out);
    }
    out
}

fn decode<T: Element>(shape: &[usize], bytes: &[u8]) -> Result<ArrayData> {
    let values: Vec<T> = bytes
        .chunks_exact(T::DTYPE.size())
        .map(T::read_le)
        .collect();
    let array = ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|e| DataError::shape_mismatch(e.to_string()))?;
    Ok(T::wrap(array))
}

fn stack_typed<T: Element>(spec: &FieldSpec, samples: &[ArrayData]) -> Result<ArrayData> {
    let mut views: Vec<ArrayViewD<'_, T>> = Vec::with_capacity(samples.len());
    for sample in samples {
        let array = T::unwrap_ref(sample).ok_or_else(|| {
            DataError::shape_mismatch(format!(
                "expected {} sample, got {}",
                T::DTYPE,
                sample.dtype()
            ))
        })?;
        if array.shape() != spec.sample_shape.as_slice() {
            return Err(DataError::shape_mismatch(format!(
                "expected sample shape {:?}, got {:?}",
                spec.sample_shape,
                array.shape()
            )));
        }
        views.push(array.view());
    }
    if views.is_empty() {
        let mut shape = vec![0];
        shape.extend_from_slice(&spec.sample_shape);
        let empty = ArrayD::from_shape_vec(IxDyn(&shape), Vec::new())
            .map_err(|e| DataError::shape_mismatch(e.to_string()))?;
        return Ok(T::wrap(empty));
    }
    let stacked = ndarray::stack(Axis(0), &views)
        .map_err(|e| DataError::shape_mismatch(e.to_string()))?;
    Ok(T::wrap(stacked))
}

impl ArrayData {
    /// Builds an array of `dtype` with the given shape from little-endian bytes.
    pub fn from_le_bytes(dtype: Dtype, shape: &[usize], bytes: &[u8]) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if bytes.len() != expected {
            return Err(DataError::format(format!(
                "expected {} bytes for {} array of shape {:?}, got {}",
                expected,
                dtype,
                shape,
                bytes.len()
            )));
        }
        match dtype {
            Dtype::U8 => decode::<u8>(shape, bytes),
            Dtype::I32 => decode::<i32>(shape, bytes),
            Dtype::I64 => decode::<i64>(shape, bytes),
            Dtype::F32 => decode::<f32>(shape, bytes),
            Dtype::F64 => decode::<f64>(shape, bytes),
        }
    }

    /// Stacks per-sample arrays along a new leading sample axis.
    ///
    /// An empty slice yields an array of shape `[0, sample_shape..]`.
    pub fn stack(spec: &FieldSpec, samples: &[ArrayData]) -> Result<Self> {
        match spec.dtype {
            Dtype::U8 => stack_typed::<u8>(spec, samples),
            Dtype::I32 => stack_typed::<i32>(spec, samples),
            Dtype::I64 => stack_typed::<i64>(spec, samples),
            Dtype::F32 => stack_typed::<f32>(spec, samples),
            Dtype::F64 => stack_typed::<f64>(spec, samples),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::U8(_) => Dtype::U8,
            ArrayData::I32(_) => Dtype::I32,
            ArrayData::I64(_) => Dtype::I64,
            ArrayData::F32(_) => Dtype::F32,
            ArrayData::F64(_) => Dtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Length of the leading sample axis.
    pub fn num_samples(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Shape of one sample (all axes after the first).
    pub fn sample_shape(&self) -> &[usize] {
        let shape = self.shape();
        if shape.is_empty() {
            shape
        } else {
            &shape[1..]
        }
    }

    /// Field spec for the samples in this array.
    ///
    /// Fails for zero-dimensional arrays, which have no sample axis.
    pub fn field_spec(&self) -> Result<FieldSpec> {
        if self.ndim() == 0 {
            return Err(DataError::shape_mismatch(
                "array has no sample axis (zero dimensions)",
            ));
        }
        Ok(FieldSpec::new(self.dtype(), self.sample_shape()))
    }

    /// Spec describing this whole array as a single sample.
    pub fn as_sample_spec(&self) -> FieldSpec {
        FieldSpec::new(self.dtype(), self.shape())
    }

    /// Little-endian bytes of all elements in logical (row-major) order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        with_array!(self, a => encode(a))
    }

    /// Copies out sample `index` along the leading axis.
    pub fn sample(&self, index: usize) -> Result<ArrayData> {
        let count = self.num_samples();
        if self.ndim() == 0 || index >= count {
            return Err(DataError::out_of_range(
                "array",
                index as u64,
                1,
                count as u64,
            ));
        }
        Ok(with_array!(self, a => a.index_axis(Axis(0), index).to_owned().into()))
    }

    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        u8::unwrap_ref(self)
    }

    pub fn as_i32(&self) -> Option<&ArrayD<i32>> {
        i32::unwrap_ref(self)
    }

    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        i64::unwrap_ref(self)
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        f32::unwrap_ref(self)
    }

    pub fn as_f64(&self) -> Option<&ArrayD<f64>> {
        f64::unwrap_ref(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn images(n: usize) -> ArrayData {
        let values: Vec<f32> = (0..n * 6).map(|v| v as f32).collect();
        ArrayD::from_shape_vec(IxDyn(&[n, 2, 3]), values)
            .unwrap()
            .into()
    }

    #[test]
    fn test_dtype_parse_and_size() {
        assert_eq!("float32".parse::<Dtype>().unwrap(), Dtype::F32);
        assert_eq!("U8".parse::<Dtype>().unwrap(), Dtype::U8);
        assert!("complex64".parse::<Dtype>().is_err());
        assert_eq!(Dtype::I64.size(), 8);
        assert_eq!(Dtype::U8.to_string(), "u8");
    }

    #[test]
    fn test_field_spec_sizes() {
        let spec = FieldSpec::new(Dtype::F32, vec![28, 28, 1]);
        assert_eq!(spec.sample_len(), 784);
        assert_eq!(spec.sample_bytes(), 3136);
        assert_eq!(spec.to_string(), "f32[28, 28, 1]");

        // Scalar samples still have one element.
        assert_eq!(FieldSpec::new(Dtype::I64, vec![]).sample_bytes(), 8);
    }

    #[test]
    fn test_bytes_roundtrip_keeps_values() {
        let data = images(4);
        let bytes = data.to_le_bytes();
        assert_eq!(bytes.len(), 4 * 6 * 4);
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());

        let back = ArrayData::from_le_bytes(Dtype::F32, &[4, 2, 3], &bytes).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_from_le_bytes_rejects_wrong_length() {
        let err = ArrayData::from_le_bytes(Dtype::I32, &[2], &[0u8; 7]).unwrap_err();
        assert!(matches!(err, DataError::Format { .. }));
    }

    #[test]
    fn test_sample_and_stack() {
        let data = images(3);
        let spec = data.field_spec().unwrap();
        assert_eq!(spec.sample_shape, vec![2, 3]);

        let second = data.sample(1).unwrap();
        assert_eq!(second.shape(), &[2, 3]);
        assert_eq!(second.as_f32().unwrap()[[0, 0]], 6.0);

        let samples: Vec<_> = (0..3).map(|i| data.sample(i).unwrap()).collect();
        let stacked = ArrayData::stack(&spec, &samples).unwrap();
        assert_eq!(stacked, data);

        assert!(data.sample(3).is_err());
    }

    #[test]
    fn test_stack_empty_has_zero_samples() {
        let spec = FieldSpec::new(Dtype::U8, vec![5]);
        let empty = ArrayData::stack(&spec, &[]).unwrap();
        assert_eq!(empty.shape(), &[0, 5]);
        assert_eq!(empty.dtype(), Dtype::U8);
        assert_eq!(empty.num_samples(), 0);
    }

    #[test]
    fn test_stack_rejects_mismatched_samples() {
        let spec = FieldSpec::new(Dtype::F32, vec![2, 3]);
        let wrong_type: ArrayData = ArrayD::<i32>::zeros(IxDyn(&[2, 3])).into();
        assert!(ArrayData::stack(&spec, &[wrong_type]).is_err());

        let wrong_shape: ArrayData = ArrayD::<f32>::zeros(IxDyn(&[3, 2])).into();
        assert!(ArrayData::stack(&spec, &[wrong_shape]).is_err());
    }

    #[test]
    fn test_zero_dimensional_has_no_field_spec() {
        let scalar: ArrayData = ArrayD::<f64>::zeros(IxDyn(&[])).into();
        assert!(scalar.field_spec().is_err());
        assert_eq!(scalar.as_sample_spec(), FieldSpec::new(Dtype::F64, vec![]));
    }
}
