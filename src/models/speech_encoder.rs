use super::{unsupported, LoadedModel, ModelFamily};
use crate::core::{
    AxisConstraint, Bindings, Capability, DType, Dim, ExportError, PortSignature, Signature,
    TraceError, TraceScope, TraceableWrapper, Traced,
};
use serde::Deserialize;

const PROJECTION_WEIGHT: &str = "wav2vec2.feature_projection.projection.weight";

/// Wav2Vec2-style encoder: a stack of strided 1-D convolutions over raw
/// audio followed by a transformer.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechEncoderConfig {
    #[serde(default = "default_conv_dim")]
    pub conv_dim: Vec<usize>,
    #[serde(default = "default_conv_kernel")]
    pub conv_kernel: Vec<usize>,
    #[serde(default = "default_conv_stride")]
    pub conv_stride: Vec<usize>,
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
}

fn default_conv_dim() -> Vec<usize> {
    vec![512; 7]
}

fn default_conv_kernel() -> Vec<usize> {
    vec![10, 3, 3, 3, 3, 2, 2]
}

fn default_conv_stride() -> Vec<usize> {
    vec![5, 2, 2, 2, 2, 2, 2]
}

fn default_hidden() -> usize {
    768
}

impl SpeechEncoderConfig {
    /// Number of frames produced for `samples` audio samples.
    pub fn frames_for(&self, samples: usize) -> Option<usize> {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .try_fold(samples, |len, (&kernel, &stride)| {
                (len >= kernel && stride > 0).then(|| (len - kernel) / stride + 1)
            })
    }
}

pub struct SpeechEncoderWrapper {
    config: SpeechEncoderConfig,
    capability: Capability,
}

impl SpeechEncoderWrapper {
    pub fn new(model: &LoadedModel, capability: Capability) -> Result<Self, ExportError> {
        if capability != Capability::Encode {
            return Err(unsupported(ModelFamily::SpeechEncoder, capability));
        }
        let config: SpeechEncoderConfig = model.parse_config()?;
        let layers = config.conv_dim.len();
        if config.conv_kernel.len() != layers || config.conv_stride.len() != layers {
            return Err(ExportError::Load {
                model: model.descriptor.id(),
                reason: format!(
                    "conv_dim, conv_kernel and conv_stride disagree on layer count ({}, {}, {})",
                    layers,
                    config.conv_kernel.len(),
                    config.conv_stride.len()
                ),
            });
        }
        if let Some(&channels) = config.conv_dim.last() {
            model.check_weight_shape(PROJECTION_WEIGHT, &[config.hidden_size, channels])?;
        }
        Ok(Self { config, capability })
    }

    pub fn config(&self) -> &SpeechEncoderConfig {
        &self.config
    }
}

impl TraceableWrapper for SpeechEncoderWrapper {
    fn family(&self) -> &'static str {
        "speech-encoder"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn signature(&self) -> Signature {
        Signature {
            inputs: vec![PortSignature::new(
                "audio",
                DType::Float32,
                vec![AxisConstraint::Any, AxisConstraint::Static],
            )],
            outputs: vec![PortSignature::new(
                "embedding",
                DType::Float32,
                vec![
                    AxisConstraint::Any,
                    AxisConstraint::Static,
                    AxisConstraint::Exact(self.config.hidden_size),
                ],
            )],
        }
    }

    fn forward(
        &self,
        scope: &mut TraceScope,
        inputs: &Bindings,
    ) -> Result<Vec<(String, Traced)>, TraceError> {
        let audio = inputs.get("audio")?;
        audio.expect_rank("feature_extractor", 2)?;
        let batch = audio.dim(0).clone();

        let mut features = scope.op("unsqueeze", &[audio]).attr("axis", 1).output(
            DType::Float32,
            vec![batch.clone(), Dim::Fixed(1), audio.dim(1).clone()],
        );

        let layers = self
            .config
            .conv_dim
            .iter()
            .zip(&self.config.conv_kernel)
            .zip(&self.config.conv_stride);
        for (index, ((&channels, &kernel), &stride)) in layers.enumerate() {
            let len = features.dim(2).conv_out("conv1d", kernel, stride)?;
            features = scope
                .op("conv1d", &[&features])
                .attr("kernel", kernel)
                .attr("stride", stride)
                .attr("activation", "gelu")
                .weights(format!(
                    "wav2vec2.feature_extractor.conv_layers.{}.",
                    index
                ))
                .output(DType::Float32, vec![batch.clone(), Dim::Fixed(channels), len]);
        }

        let frames = features.dim(2).clone();
        let features = scope.op("transpose", &[&features]).output(
            DType::Float32,
            vec![batch.clone(), frames.clone(), features.dim(1).clone()],
        );
        let hidden_dims = vec![batch, frames, Dim::Fixed(self.config.hidden_size)];
        let projected = scope
            .op("feature_projection", &[&features])
            .weights("wav2vec2.feature_projection.")
            .output(DType::Float32, hidden_dims.clone());
        let embedding = scope
            .op("transformer_encoder", &[&projected])
            .attr("positional", "conv")
            .weights("wav2vec2.encoder.")
            .output(DType::Float32, hidden_dims);

        Ok(vec![("embedding".to_string(), embedding)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ShapeContract, ShapeRange, TensorSpec, Tracer};
    use crate::models::testing;
    use serde_json::json;

    fn wav2vec2() -> LoadedModel {
        testing::model(
            json!({"architectures": ["Wav2Vec2ForCTC"]}),
            &[
                ("wav2vec2.feature_extractor.conv_layers.0.conv.weight", &[512, 1, 10]),
                ("wav2vec2.feature_projection.projection.weight", &[768, 512]),
                ("wav2vec2.encoder.layers.0.attention.q_proj.weight", &[768, 768]),
            ],
        )
    }

    fn contract(samples: ShapeRange, frames: ShapeRange) -> ShapeContract {
        ShapeContract::new(
            vec![TensorSpec::new(
                "audio",
                DType::Float32,
                vec![ShapeRange::Fixed(1), samples],
            )],
            vec![TensorSpec::new(
                "embedding",
                DType::Float32,
                vec![ShapeRange::Fixed(1), frames, ShapeRange::Fixed(768)],
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_one_second_yields_49_frames() {
        let model = wav2vec2();
        let wrapper = SpeechEncoderWrapper::new(&model, Capability::Encode).unwrap();
        assert_eq!(wrapper.config().frames_for(16000), Some(49));

        let contract = contract(ShapeRange::Fixed(16000), ShapeRange::Fixed(49));
        contract.check_signature(&wrapper.signature()).unwrap();
        let graph = Tracer::new().trace(&wrapper, &contract).unwrap();

        let embedding = graph.output("embedding").unwrap();
        assert_eq!(
            embedding.dims,
            vec![Dim::Fixed(1), Dim::Fixed(49), Dim::Fixed(768)]
        );
        assert_eq!(graph.ops().iter().filter(|op| **op == "conv1d").count(), 7);
    }

    #[test]
    fn test_ranged_audio_rejected_before_tracing() {
        let model = wav2vec2();
        let wrapper = SpeechEncoderWrapper::new(&model, Capability::Encode).unwrap();
        let contract = contract(
            ShapeRange::Range { min: 400, max: 16000 },
            ShapeRange::Fixed(49),
        );
        assert!(matches!(
            contract.check_signature(&wrapper.signature()),
            Err(ExportError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_too_short_audio() {
        let config: SpeechEncoderConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.frames_for(5), None);
        assert_eq!(config.frames_for(400), Some(1));
    }

    #[test]
    fn test_projection_disagreeing_with_conv_dim_is_rejected() {
        let model = testing::model(
            json!({"conv_dim": [256, 256, 256, 256, 256, 256, 256]}),
            &[("wav2vec2.feature_projection.projection.weight", &[768, 512])],
        );
        match SpeechEncoderWrapper::new(&model, Capability::Encode) {
            Err(ExportError::ShapeMismatch { tensor, reason }) => {
                assert_eq!(tensor, "wav2vec2.feature_projection.projection.weight");
                assert!(reason.contains("[768, 256]"), "{}", reason);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_generation_is_unsupported() {
        let model = wav2vec2();
        assert!(matches!(
            SpeechEncoderWrapper::new(&model, Capability::FullGeneration),
            Err(ExportError::UnsupportedCapability { .. })
        ));
    }
}
