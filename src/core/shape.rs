use crate::core::error::{ExportError, TraceError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float16,
    Float32,
}

impl DType {
    pub fn is_int(&self) -> bool {
        matches!(self, DType::Int64)
    }

    pub fn to_candle(self) -> candle_core::DType {
        match self {
            DType::Int64 => candle_core::DType::I64,
            DType::Float16 => candle_core::DType::F16,
            DType::Float32 => candle_core::DType::F32,
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Option<Self> {
        match dtype {
            candle_core::DType::I64 => Some(DType::Int64),
            candle_core::DType::F16 => Some(DType::Float16),
            candle_core::DType::F32 => Some(DType::Float32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
        };
        f.write_str(name)
    }
}

/// Extent of one tensor axis as declared for export.
///
/// The variants are public so job tables can be written as plain data;
/// [`ShapeRange::validate`] enforces `1 <= min <= max` and is run by
/// every `ShapeContract` before anything else touches the ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeRange {
    Fixed(usize),
    Range { min: usize, max: usize },
}

impl ShapeRange {
    pub fn fixed(size: usize) -> Result<Self, ExportError> {
        let range = ShapeRange::Fixed(size);
        range.validate()?;
        Ok(range)
    }

    pub fn range(min: usize, max: usize) -> Result<Self, ExportError> {
        let range = ShapeRange::Range { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        match *self {
            ShapeRange::Fixed(0) => Err(ExportError::InvalidShape(
                "fixed axis must be positive".to_string(),
            )),
            ShapeRange::Range { min, max } if min == 0 || min > max => {
                Err(ExportError::InvalidShape(format!(
                    "range {}..{} must satisfy 1 <= min <= max",
                    min, max
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        match *self {
            ShapeRange::Fixed(size) => (size, size),
            ShapeRange::Range { min, max } => (min, max),
        }
    }

    pub fn contains(&self, size: usize) -> bool {
        let (min, max) = self.bounds();
        size >= min && size <= max
    }

    /// Picks a concrete extent for a dummy input, clamped into the range.
    pub fn sample(&self, preferred: usize) -> usize {
        let (min, max) = self.bounds();
        preferred.clamp(min, max)
    }
}

impl fmt::Display for ShapeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeRange::Fixed(size) => write!(f, "{}", size),
            ShapeRange::Range { min, max } => write!(f, "{}..{}", min, max),
        }
    }
}

/// Axis extent of a traced value.
///
/// Ranged input axes enter the graph as symbols; a symbol keeps the concrete
/// sample extent it was traced with together with the declared bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dim {
    Fixed(usize),
    Symbol {
        name: String,
        sample: usize,
        min: usize,
        max: usize,
    },
}

impl Dim {
    pub fn symbol(name: impl Into<String>, sample: usize, min: usize, max: usize) -> Self {
        Dim::Symbol {
            name: name.into(),
            sample,
            min,
            max,
        }
    }

    pub fn sample(&self) -> usize {
        match self {
            Dim::Fixed(size) => *size,
            Dim::Symbol { sample, .. } => *sample,
        }
    }

    pub fn as_fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(size) => Some(*size),
            Dim::Symbol { .. } => None,
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        match self {
            Dim::Fixed(size) => (*size, *size),
            Dim::Symbol { min, max, .. } => (*min, *max),
        }
    }

    /// Output length of an unpadded 1-D convolution over this axis.
    pub fn conv_out(&self, op: &str, kernel: usize, stride: usize) -> Result<Dim, TraceError> {
        match self {
            Dim::Fixed(len) => {
                if *len < kernel || stride == 0 {
                    return Err(TraceError::InvalidOperand {
                        op: op.to_string(),
                        reason: format!(
                            "axis of length {} is shorter than kernel {} (stride {})",
                            len, kernel, stride
                        ),
                    });
                }
                Ok(Dim::Fixed((len - kernel) / stride + 1))
            }
            Dim::Symbol { name, .. } => Err(TraceError::SymbolicShape {
                op: op.to_string(),
                symbol: name.clone(),
            }),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(size) => write!(f, "{}", size),
            Dim::Symbol { name, min, max, .. } => write!(f, "{}[{}..{}]", name, min, max),
        }
    }
}

pub fn format_dims(dims: &[Dim]) -> String {
    let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(ShapeRange::range(1, 2048).is_ok());
        assert!(ShapeRange::range(4, 4).is_ok());
        assert!(ShapeRange::range(0, 10).is_err());
        assert!(ShapeRange::range(10, 2).is_err());
        assert!(ShapeRange::fixed(0).is_err());
        assert!(ShapeRange::fixed(512).is_ok());
    }

    #[test]
    fn test_range_contains_and_sample() {
        let seq = ShapeRange::range(1, 2048).unwrap();
        assert!(seq.contains(1));
        assert!(seq.contains(2048));
        assert!(!seq.contains(2049));
        assert_eq!(seq.sample(10), 10);
        assert_eq!(seq.sample(5000), 2048);

        let width = ShapeRange::Fixed(512);
        assert_eq!(width.sample(10), 512);
        assert_eq!(width.to_string(), "512");
        assert_eq!(seq.to_string(), "1..2048");
    }

    #[test]
    fn test_conv_out() {
        let samples = Dim::Fixed(16000);
        let frames = samples.conv_out("conv1d", 10, 5).unwrap();
        assert_eq!(frames, Dim::Fixed(3199));

        let short = Dim::Fixed(4);
        assert!(matches!(
            short.conv_out("conv1d", 10, 5),
            Err(TraceError::InvalidOperand { .. })
        ));

        let symbolic = Dim::symbol("audio:1", 16000, 1, 32000);
        assert!(matches!(
            symbolic.conv_out("conv1d", 10, 5),
            Err(TraceError::SymbolicShape { .. })
        ));
    }

    #[test]
    fn test_dtype_candle_mapping() {
        for dtype in [DType::Int64, DType::Float16, DType::Float32] {
            assert_eq!(DType::from_candle(dtype.to_candle()), Some(dtype));
        }
        assert_eq!(DType::from_candle(candle_core::DType::U8), None);
    }
}
