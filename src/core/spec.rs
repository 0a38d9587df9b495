use crate::core::error::ExportError;
use crate::core::graph::Graph;
use crate::core::shape::{format_dims, DType, Dim, ShapeRange};
use crate::core::wrapper::{AxisConstraint, PortSignature, Signature, TraceableWrapper};
use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_SAMPLE_EXTENT: usize = 10;
const DEFAULT_INT_RANGE: (i64, i64) = (0, 100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<ShapeRange>,
}

impl std::fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}{}", self.name, self.dtype, format_shape(&self.shape))
    }
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<ShapeRange>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn accepts(&self, dims: &[usize]) -> bool {
        dims.len() == self.rank()
            && self
                .shape
                .iter()
                .zip(dims)
                .all(|(range, &size)| range.contains(size))
    }

    pub fn sample_shape(&self, extent: usize) -> Vec<usize> {
        self.shape.iter().map(|r| r.sample(extent)).collect()
    }

    /// Traced dims for a concrete sample: ranged axes become symbols.
    pub fn symbolic_dims(&self, sample: &[usize]) -> Vec<Dim> {
        self.shape
            .iter()
            .zip(sample)
            .enumerate()
            .map(|(axis, (range, &size))| match *range {
                ShapeRange::Fixed(n) => Dim::Fixed(n),
                ShapeRange::Range { min, max } => {
                    Dim::symbol(format!("{}:{}", self.name, axis), size, min, max)
                }
            })
            .collect()
    }
}

fn format_shape(shape: &[ShapeRange]) -> String {
    let parts: Vec<String> = shape.iter().map(|r| r.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Declared inputs and outputs of one export, with the extent used for
/// ranged axes of the dummy input.
#[derive(Debug, Clone)]
pub struct ShapeContract {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    sample_extent: usize,
}

impl ShapeContract {
    pub fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Result<Self, ExportError> {
        let mut seen = HashSet::new();
        for spec in inputs.iter().chain(&outputs) {
            if !seen.insert(spec.name.as_str()) {
                return Err(ExportError::InvalidShape(format!(
                    "tensor name `{}` is declared twice",
                    spec.name
                )));
            }
            if spec.shape.is_empty() {
                return Err(ExportError::InvalidShape(format!(
                    "tensor `{}` declares no axes",
                    spec.name
                )));
            }
            for range in &spec.shape {
                range.validate().map_err(|e| match e {
                    ExportError::InvalidShape(reason) => {
                        ExportError::InvalidShape(format!("`{}`: {}", spec.name, reason))
                    }
                    other => other,
                })?;
            }
        }

        Ok(Self {
            inputs,
            outputs,
            sample_extent: DEFAULT_SAMPLE_EXTENT,
        })
    }

    pub fn with_sample_extent(mut self, extent: usize) -> Self {
        self.sample_extent = extent;
        self
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    pub fn sample_extent(&self) -> usize {
        self.sample_extent
    }

    /// Checks the declaration against what the wrapper says its model needs.
    /// Runs before tracing so configuration errors never reach the tracer.
    pub fn check_signature(&self, signature: &Signature) -> Result<(), ExportError> {
        check_ports("input", &self.inputs, &signature.inputs)?;
        check_ports("output", &self.outputs, &signature.outputs)
    }

    /// Dummy inputs at the contract's sample extent.
    ///
    /// The symbolic tracer binds only their dims and dtype. Values are drawn
    /// from `rng` inside each wrapper's accepted range (token ids below the
    /// vocabulary size) so the same samples can also feed a numeric forward
    /// pass, and a fixed seed reproduces them exactly.
    pub fn sample_inputs<R: Rng>(
        &self,
        wrapper: &dyn TraceableWrapper,
        rng: &mut R,
    ) -> Result<Vec<(String, Tensor)>, ExportError> {
        self.inputs
            .iter()
            .map(|spec| {
                let shape = spec.sample_shape(self.sample_extent);
                let count: usize = shape.iter().product();
                let tensor = if spec.dtype.is_int() {
                    let (lo, hi) = wrapper
                        .sample_value_range(&spec.name)
                        .unwrap_or(DEFAULT_INT_RANGE);
                    let hi = hi.max(lo + 1);
                    let values: Vec<i64> = (0..count).map(|_| rng.gen_range(lo..hi)).collect();
                    Tensor::from_vec(values, shape, &Device::Cpu)
                } else {
                    let values: Vec<f32> =
                        (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                    Tensor::from_vec(values, shape, &Device::Cpu)
                        .and_then(|t| t.to_dtype(spec.dtype.to_candle()))
                };
                tensor
                    .map(|t| (spec.name.clone(), t))
                    .map_err(|e| ExportError::Conversion(format!("dummy `{}`: {}", spec.name, e)))
            })
            .collect()
    }

    pub fn check_sample(&self, samples: &[(String, Tensor)]) -> Result<(), ExportError> {
        if samples.len() != self.inputs.len() {
            return Err(ExportError::shape_mismatch(
                "<inputs>",
                format!(
                    "expected {} sample inputs, got {}",
                    self.inputs.len(),
                    samples.len()
                ),
            ));
        }
        for (spec, (name, tensor)) in self.inputs.iter().zip(samples) {
            if &spec.name != name {
                return Err(ExportError::shape_mismatch(
                    name.as_str(),
                    format!("sample bound where `{}` is declared", spec.name),
                ));
            }
            if DType::from_candle(tensor.dtype()) != Some(spec.dtype) {
                return Err(ExportError::shape_mismatch(
                    name.as_str(),
                    format!("sample dtype {:?} is not {}", tensor.dtype(), spec.dtype),
                ));
            }
            if !spec.accepts(tensor.dims()) {
                return Err(ExportError::shape_mismatch(
                    name.as_str(),
                    format!(
                        "sample shape {:?} outside {}",
                        tensor.dims(),
                        format_shape(&spec.shape)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Validates traced outputs against the declared output specs.
    pub fn check_outputs(&self, graph: &Graph) -> Result<(), ExportError> {
        let declared: Vec<&str> = self.outputs.iter().map(|s| s.name.as_str()).collect();
        if graph.output_names() != declared {
            return Err(ExportError::shape_mismatch(
                "<outputs>",
                format!(
                    "graph produces {:?} but {:?} are declared",
                    graph.output_names(),
                    declared
                ),
            ));
        }

        for spec in &self.outputs {
            let value = graph.output(&spec.name).ok_or_else(|| {
                ExportError::shape_mismatch(spec.name.as_str(), "missing from graph")
            })?;
            if value.dtype != spec.dtype {
                return Err(ExportError::shape_mismatch(
                    spec.name.as_str(),
                    format!("graph dtype {} is not {}", value.dtype, spec.dtype),
                ));
            }
            if value.dims.len() != spec.rank() {
                return Err(ExportError::shape_mismatch(
                    spec.name.as_str(),
                    format!(
                        "graph shape {} has rank {}, declared {}",
                        format_dims(&value.dims),
                        value.dims.len(),
                        format_shape(&spec.shape)
                    ),
                ));
            }
            for (axis, (range, dim)) in spec.shape.iter().zip(&value.dims).enumerate() {
                let ok = match (*range, dim) {
                    (ShapeRange::Fixed(n), Dim::Fixed(m)) => n == *m,
                    (ShapeRange::Fixed(_), Dim::Symbol { .. }) => false,
                    (ShapeRange::Range { min, max }, dim) => {
                        let (lo, hi) = dim.bounds();
                        lo >= min && hi <= max
                    }
                };
                if !ok {
                    return Err(ExportError::shape_mismatch(
                        spec.name.as_str(),
                        format!(
                            "axis {} traced as {} but declared {}",
                            axis, dim, range
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_ports(
    kind: &str,
    specs: &[TensorSpec],
    ports: &[PortSignature],
) -> Result<(), ExportError> {
    let declared: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    let expected: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
    if declared != expected {
        return Err(ExportError::shape_mismatch(
            format!("<{}s>", kind),
            format!("declared {:?} but the wrapper {}s are {:?}", declared, kind, expected),
        ));
    }

    for (spec, port) in specs.iter().zip(ports) {
        if spec.dtype != port.dtype {
            return Err(ExportError::shape_mismatch(
                spec.name.as_str(),
                format!("declared {} but the wrapper uses {}", spec.dtype, port.dtype),
            ));
        }
        if spec.rank() != port.axes.len() {
            return Err(ExportError::shape_mismatch(
                spec.name.as_str(),
                format!(
                    "declared rank {} but the wrapper uses rank {}",
                    spec.rank(),
                    port.axes.len()
                ),
            ));
        }
        for (axis, (range, constraint)) in spec.shape.iter().zip(&port.axes).enumerate() {
            let reason = match (*constraint, *range) {
                (AxisConstraint::Any, _) => None,
                (AxisConstraint::Static, ShapeRange::Fixed(_)) => None,
                (AxisConstraint::Static, r) => Some(format!(
                    "axis {} must be fixed for this model, declared {}",
                    axis, r
                )),
                (AxisConstraint::Exact(n), ShapeRange::Fixed(m)) if n == m => None,
                // An output may leave an extent to whichever checkpoint gets
                // resolved; the traced value is checked against the range.
                (AxisConstraint::Exact(n), ShapeRange::Range { min, max })
                    if kind == "output" && (min..=max).contains(&n) =>
                {
                    None
                }
                (AxisConstraint::Exact(n), r) => {
                    Some(format!("axis {} must be {}, declared {}", axis, n, r))
                }
                (AxisConstraint::AtMost(n), r) if r.bounds().1 <= n => None,
                (AxisConstraint::AtMost(n), r) => Some(format!(
                    "axis {} allows at most {}, declared {}",
                    axis, n, r
                )),
            };
            if let Some(reason) = reason {
                return Err(ExportError::shape_mismatch(spec.name.as_str(), reason));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TraceError;
    use crate::core::graph::{Bindings, TraceScope, Traced};
    use crate::core::wrapper::Capability;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Scorer;

    impl TraceableWrapper for Scorer {
        fn family(&self) -> &'static str {
            "scorer"
        }

        fn capability(&self) -> Capability {
            Capability::SingleStep
        }

        fn signature(&self) -> Signature {
            Signature {
                inputs: vec![PortSignature::new(
                    "input_ids",
                    DType::Int64,
                    vec![AxisConstraint::Any, AxisConstraint::AtMost(4096)],
                )],
                outputs: vec![PortSignature::new(
                    "logits",
                    DType::Float32,
                    vec![
                        AxisConstraint::Any,
                        AxisConstraint::AtMost(4096),
                        AxisConstraint::Exact(32),
                    ],
                )],
            }
        }

        fn sample_value_range(&self, _input: &str) -> Option<(i64, i64)> {
            Some((0, 32))
        }

        fn forward(
            &self,
            _scope: &mut TraceScope,
            _inputs: &Bindings,
        ) -> Result<Vec<(String, Traced)>, TraceError> {
            Ok(Vec::new())
        }
    }

    fn contract(vocab: usize, max_len: usize) -> ShapeContract {
        ShapeContract::new(
            vec![TensorSpec::new(
                "input_ids",
                DType::Int64,
                vec![ShapeRange::Fixed(1), ShapeRange::Range { min: 1, max: max_len }],
            )],
            vec![TensorSpec::new(
                "logits",
                DType::Float32,
                vec![
                    ShapeRange::Fixed(1),
                    ShapeRange::Range { min: 1, max: max_len },
                    ShapeRange::Fixed(vocab),
                ],
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_contract_rejects_duplicates_and_bad_ranges() {
        let dup = ShapeContract::new(
            vec![TensorSpec::new("x", DType::Float32, vec![ShapeRange::Fixed(1)])],
            vec![TensorSpec::new("x", DType::Float32, vec![ShapeRange::Fixed(1)])],
        );
        assert!(matches!(dup, Err(ExportError::InvalidShape(_))));

        let inverted = ShapeContract::new(
            vec![TensorSpec::new(
                "x",
                DType::Float32,
                vec![ShapeRange::Range { min: 8, max: 2 }],
            )],
            vec![],
        );
        assert!(matches!(inverted, Err(ExportError::InvalidShape(_))));
    }

    #[test]
    fn test_check_signature_accepts_matching_contract() {
        assert!(contract(32, 2048).check_signature(&Scorer.signature()).is_ok());
    }

    #[test]
    fn test_check_signature_catches_fixed_mismatch() {
        let err = contract(50, 2048)
            .check_signature(&Scorer.signature())
            .unwrap_err();
        match err {
            ExportError::ShapeMismatch { tensor, .. } => assert_eq!(tensor, "logits"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_signature_catches_range_beyond_model_limit() {
        let err = contract(32, 8192)
            .check_signature(&Scorer.signature())
            .unwrap_err();
        assert!(matches!(err, ExportError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_output_range_admits_exact_extent() {
        let mut contract = contract(32, 2048);
        contract.outputs[0].shape[2] = ShapeRange::Range { min: 1, max: 262144 };
        assert!(contract.check_signature(&Scorer.signature()).is_ok());

        contract.outputs[0].shape[2] = ShapeRange::Range { min: 64, max: 262144 };
        assert!(contract.check_signature(&Scorer.signature()).is_err());
    }

    #[test]
    fn test_sample_inputs_follow_contract() {
        let contract = contract(32, 2048);
        let mut rng = StdRng::seed_from_u64(7);
        let samples = contract.sample_inputs(&Scorer, &mut rng).unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, "input_ids");
        assert_eq!(samples[0].1.dims(), &[1, 10]);
        let values = samples[0].1.flatten_all().unwrap().to_vec1::<i64>().unwrap();
        assert!(values.iter().all(|&v| (0..32).contains(&v)));
        assert!(contract.check_sample(&samples).is_ok());
    }

    #[test]
    fn test_check_sample_rejects_out_of_range() {
        let contract = contract(32, 16);
        let too_long = Tensor::zeros((1, 17), candle_core::DType::I64, &Device::Cpu).unwrap();
        let err = contract
            .check_sample(&[("input_ids".to_string(), too_long)])
            .unwrap_err();
        assert!(matches!(err, ExportError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_symbolic_dims() {
        let contract = contract(32, 2048);
        let spec = &contract.inputs()[0];
        let dims = spec.symbolic_dims(&[1, 10]);
        assert_eq!(dims[0], Dim::Fixed(1));
        assert_eq!(dims[1], Dim::symbol("input_ids:1", 10, 1, 2048));
    }
}
