use crate::core::error::ExportError;
use crate::core::graph::{Bindings, Graph, TraceScope};
use crate::core::spec::ShapeContract;
use crate::core::wrapper::TraceableWrapper;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

const DEFAULT_SEED: u64 = 299792458;

pub struct Tracer {
    seed: u64,
}

impl Tracer {
    pub fn new() -> Self {
        Self { seed: DEFAULT_SEED }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builds a dummy input from the contract and traces the wrapper with it.
    pub fn trace(
        &self,
        wrapper: &dyn TraceableWrapper,
        contract: &ShapeContract,
    ) -> Result<Graph, ExportError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let samples = contract.sample_inputs(wrapper, &mut rng)?;
        self.trace_with(wrapper, contract, &samples)
    }

    pub fn trace_with(
        &self,
        wrapper: &dyn TraceableWrapper,
        contract: &ShapeContract,
        samples: &[(String, Tensor)],
    ) -> Result<Graph, ExportError> {
        contract.check_sample(samples)?;

        let mut scope = TraceScope::new();
        let mut bindings = Bindings::default();
        for (spec, (name, tensor)) in contract.inputs().iter().zip(samples) {
            let dims = spec.symbolic_dims(tensor.dims());
            debug!("Binding {} {:?} as {:?}", name, tensor.dims(), dims);
            let value = scope.placeholder(name, spec.dtype, dims);
            bindings.insert(name.as_str(), value);
        }

        let outputs = wrapper.forward(&mut scope, &bindings)?;
        let graph = scope.finish(outputs);
        contract.check_outputs(&graph)?;

        info!(
            "Traced {} {} wrapper: {} nodes, outputs {:?}",
            wrapper.family(),
            wrapper.capability(),
            graph.nodes.len(),
            graph.output_names()
        );

        Ok(graph)
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TraceError;
    use crate::core::graph::Traced;
    use crate::core::shape::{DType, Dim, ShapeRange};
    use crate::core::spec::TensorSpec;
    use crate::core::wrapper::{AxisConstraint, Capability, PortSignature, Signature};

    struct Doubler {
        looped: bool,
    }

    impl TraceableWrapper for Doubler {
        fn family(&self) -> &'static str {
            "doubler"
        }

        fn capability(&self) -> Capability {
            if self.looped {
                Capability::FullGeneration
            } else {
                Capability::SingleStep
            }
        }

        fn signature(&self) -> Signature {
            Signature {
                inputs: vec![PortSignature::new(
                    "x",
                    DType::Float32,
                    vec![AxisConstraint::Any, AxisConstraint::Exact(4)],
                )],
                outputs: vec![PortSignature::new(
                    "y",
                    DType::Float32,
                    vec![AxisConstraint::Any, AxisConstraint::Exact(8)],
                )],
            }
        }

        fn forward(
            &self,
            scope: &mut TraceScope,
            inputs: &Bindings,
        ) -> Result<Vec<(String, Traced)>, TraceError> {
            let x = inputs.get("x")?;
            let y = scope
                .op("linear", &[x])
                .weights("proj.")
                .output(DType::Float32, vec![x.dim(0).clone(), Dim::Fixed(8)]);
            if self.looped {
                scope.read_value(&y, "until_converged")?;
            }
            Ok(vec![("y".to_string(), y)])
        }
    }

    fn contract() -> ShapeContract {
        ShapeContract::new(
            vec![TensorSpec::new(
                "x",
                DType::Float32,
                vec![ShapeRange::Range { min: 1, max: 64 }, ShapeRange::Fixed(4)],
            )],
            vec![TensorSpec::new(
                "y",
                DType::Float32,
                vec![ShapeRange::Range { min: 1, max: 64 }, ShapeRange::Fixed(8)],
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_trace_captures_symbolic_batch() {
        let graph = Tracer::new()
            .trace(&Doubler { looped: false }, &contract())
            .unwrap();

        let x = graph.input("x").unwrap();
        assert_eq!(x.dims[0], Dim::symbol("x:0", 10, 1, 64));
        let y = graph.output("y").unwrap();
        assert_eq!(y.dims[0].bounds(), (1, 64));
        assert_eq!(y.dims[1], Dim::Fixed(8));
    }

    #[test]
    fn test_trace_output_shape_holds_across_sample_sizes() {
        for extent in [1, 7, 64] {
            let contract = contract().with_sample_extent(extent);
            let graph = Tracer::new()
                .trace(&Doubler { looped: false }, &contract)
                .unwrap();
            assert_eq!(graph.output("y").unwrap().dims[0].sample(), extent);
        }
    }

    #[test]
    fn test_graph_depends_on_sample_dims_only() {
        let contract = contract();
        let wrapper = Doubler { looped: false };
        let seeded = Tracer::new().seed(1).trace(&wrapper, &contract).unwrap();

        let zeros = Tensor::zeros((10, 4), candle_core::DType::F32, &candle_core::Device::Cpu)
            .unwrap();
        let from_zeros = Tracer::new()
            .trace_with(&wrapper, &contract, &[("x".to_string(), zeros)])
            .unwrap();
        assert_eq!(seeded, from_zeros);
    }

    #[test]
    fn test_seed_reproduces_samples() {
        let contract = contract();
        let wrapper = Doubler { looped: false };
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let samples = contract.sample_inputs(&wrapper, &mut rng).unwrap();
            samples[0].1.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        assert_eq!(draw(3), draw(3));
        assert_ne!(draw(3), draw(4));
    }

    #[test]
    fn test_trace_rejects_data_dependent_loop() {
        let err = Tracer::new()
            .trace(&Doubler { looped: true }, &contract())
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            ExportError::Trace(TraceError::DataDependentControlFlow { .. })
        ));
    }
}
