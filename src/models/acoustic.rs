use super::{unsupported, LoadedModel, ModelFamily};
use crate::core::{
    AxisConstraint, Bindings, Capability, DType, Dim, ExportError, PortSignature, Signature,
    TraceError, TraceScope, TraceableWrapper, Traced,
};
use serde::Deserialize;

const ENCODER_PRENET: &str = "speecht5.encoder.prenet.";
const ENCODER: &str = "speecht5.encoder.wrapped_encoder.";
const DECODER_PRENET: &str = "speecht5.decoder.prenet.";
const DECODER: &str = "speecht5.decoder.wrapped_decoder.";
const FEAT_OUT: &str = "speech_decoder_postnet.feat_out.";
const PROB_OUT: &str = "speech_decoder_postnet.prob_out.";
const POSTNET_LAYERS: &str = "speech_decoder_postnet.layers.";
const FEAT_OUT_WEIGHT: &str = "speech_decoder_postnet.feat_out.weight";
const PROB_OUT_WEIGHT: &str = "speech_decoder_postnet.prob_out.weight";

/// SpeechT5-style acoustic model: text encoder, autoregressive mel decoder
/// and a postnet that emits `reduction_factor` frames per step.
#[derive(Debug, Clone, Deserialize)]
pub struct AcousticConfig {
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_mel_bins")]
    pub num_mel_bins: usize,
    #[serde(default = "default_reduction")]
    pub reduction_factor: usize,
    #[serde(default = "default_speaker_dim")]
    pub speaker_embedding_dim: usize,
    #[serde(default = "default_vocab")]
    pub vocab_size: usize,
    #[serde(default = "default_text_positions")]
    pub max_text_positions: usize,
    #[serde(default = "default_speech_positions")]
    pub max_speech_positions: usize,
}

fn default_hidden() -> usize {
    768
}

fn default_mel_bins() -> usize {
    80
}

fn default_reduction() -> usize {
    2
}

fn default_speaker_dim() -> usize {
    512
}

fn default_vocab() -> usize {
    81
}

fn default_text_positions() -> usize {
    450
}

fn default_speech_positions() -> usize {
    1876
}

pub struct AcousticWrapper {
    config: AcousticConfig,
    capability: Capability,
    has_postnet: bool,
}

impl AcousticWrapper {
    pub fn new(model: &LoadedModel, capability: Capability) -> Result<Self, ExportError> {
        if capability == Capability::Encode {
            return Err(unsupported(ModelFamily::TextToSpeech, capability));
        }
        let config: AcousticConfig = model.parse_config()?;
        let frames_per_step = config.reduction_factor * config.num_mel_bins;
        model.check_weight_shape(FEAT_OUT_WEIGHT, &[frames_per_step, config.hidden_size])?;
        model.check_weight_shape(
            PROB_OUT_WEIGHT,
            &[config.reduction_factor, config.hidden_size],
        )?;
        Ok(Self {
            config,
            capability,
            has_postnet: model.has_weight_prefix(POSTNET_LAYERS),
        })
    }

    pub fn config(&self) -> &AcousticConfig {
        &self.config
    }

    fn text_ids_port(&self) -> PortSignature {
        PortSignature::new(
            "input_ids",
            DType::Int64,
            vec![
                AxisConstraint::Any,
                AxisConstraint::AtMost(self.config.max_text_positions),
            ],
        )
    }

    fn speaker_port(&self) -> PortSignature {
        PortSignature::new(
            "speaker_embeddings",
            DType::Float32,
            vec![
                AxisConstraint::Any,
                AxisConstraint::Exact(self.config.speaker_embedding_dim),
            ],
        )
    }

    fn encode(&self, scope: &mut TraceScope, ids: &Traced) -> Result<Traced, TraceError> {
        ids.expect_rank("text_prenet", 2)?;
        let dims = vec![
            ids.dim(0).clone(),
            ids.dim(1).clone(),
            Dim::Fixed(self.config.hidden_size),
        ];
        let embedded = scope
            .op("text_prenet", &[ids])
            .weights(ENCODER_PRENET)
            .output(DType::Float32, dims.clone());
        Ok(scope
            .op("transformer_encoder", &[&embedded])
            .weights(ENCODER)
            .output(DType::Float32, dims))
    }

    /// One decoder pass over the frames produced so far. Returns the next
    /// `reduction_factor` mel frames and their stop logits.
    fn decode_step(
        &self,
        scope: &mut TraceScope,
        encoded: &Traced,
        speaker: &Traced,
        frames: &Traced,
    ) -> Result<(Traced, Traced), TraceError> {
        speaker.expect_rank("speech_prenet", 2)?;
        frames.expect_rank("speech_prenet", 3)?;
        let batch = frames.dim(0).clone();
        let hidden_dims = vec![
            batch.clone(),
            frames.dim(1).clone(),
            Dim::Fixed(self.config.hidden_size),
        ];

        let prenet = scope
            .op("speech_prenet", &[frames, speaker])
            .weights(DECODER_PRENET)
            .output(DType::Float32, hidden_dims.clone());
        let decoded = scope
            .op("transformer_decoder", &[&prenet, encoded])
            .attr("causal_mask", true)
            .weights(DECODER)
            .output(DType::Float32, hidden_dims);
        let last = scope
            .op("select_last", &[&decoded])
            .attr("axis", 1)
            .output(
                DType::Float32,
                vec![batch.clone(), Dim::Fixed(self.config.hidden_size)],
            );

        let reduction = self.config.reduction_factor;
        let flat = scope
            .op("linear", &[&last])
            .weights(FEAT_OUT)
            .output(
                DType::Float32,
                vec![batch.clone(), Dim::Fixed(reduction * self.config.num_mel_bins)],
            );
        let mut mel = scope
            .op("reshape", &[&flat])
            .output(
                DType::Float32,
                vec![
                    batch.clone(),
                    Dim::Fixed(reduction),
                    Dim::Fixed(self.config.num_mel_bins),
                ],
            );
        if self.has_postnet {
            mel = scope
                .op("postnet", &[&mel])
                .attr("residual", true)
                .weights(POSTNET_LAYERS)
                .output(DType::Float32, mel.dims().to_vec());
        }
        let stop = scope
            .op("linear", &[&last])
            .weights(PROB_OUT)
            .output(DType::Float32, vec![batch, Dim::Fixed(reduction)]);

        Ok((mel, stop))
    }
}

impl TraceableWrapper for AcousticWrapper {
    fn family(&self) -> &'static str {
        "text-to-speech"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn signature(&self) -> Signature {
        let mel = self.config.num_mel_bins;
        match self.capability {
            Capability::FullGeneration => Signature {
                inputs: vec![self.text_ids_port(), self.speaker_port()],
                outputs: vec![PortSignature::new(
                    "spectrogram",
                    DType::Float32,
                    vec![
                        AxisConstraint::Any,
                        AxisConstraint::AtMost(self.config.max_speech_positions),
                        AxisConstraint::Exact(mel),
                    ],
                )],
            },
            _ => Signature {
                inputs: vec![
                    self.text_ids_port(),
                    self.speaker_port(),
                    PortSignature::new(
                        "decoder_input",
                        DType::Float32,
                        vec![
                            AxisConstraint::Any,
                            AxisConstraint::AtMost(self.config.max_speech_positions),
                            AxisConstraint::Exact(mel),
                        ],
                    ),
                ],
                outputs: vec![
                    PortSignature::new(
                        "mel_frames",
                        DType::Float32,
                        vec![
                            AxisConstraint::Any,
                            AxisConstraint::Exact(self.config.reduction_factor),
                            AxisConstraint::Exact(mel),
                        ],
                    ),
                    PortSignature::new(
                        "stop_logits",
                        DType::Float32,
                        vec![
                            AxisConstraint::Any,
                            AxisConstraint::Exact(self.config.reduction_factor),
                        ],
                    ),
                ],
            },
        }
    }

    fn sample_value_range(&self, input: &str) -> Option<(i64, i64)> {
        (input == "input_ids").then_some((0, self.config.vocab_size as i64))
    }

    fn forward(
        &self,
        scope: &mut TraceScope,
        inputs: &Bindings,
    ) -> Result<Vec<(String, Traced)>, TraceError> {
        let ids = inputs.get("input_ids")?;
        let speaker = inputs.get("speaker_embeddings")?;
        let encoded = self.encode(scope, ids)?;

        if self.capability != Capability::FullGeneration {
            let frames = inputs.get("decoder_input")?;
            let (mel, stop) = self.decode_step(scope, &encoded, speaker, frames)?;
            return Ok(vec![
                ("mel_frames".to_string(), mel),
                ("stop_logits".to_string(), stop),
            ]);
        }

        // Generation starts from a single all-zero frame and stops once the
        // stop probability crosses the threshold.
        let mut spectrogram = scope.op("zeros", &[]).output(
            DType::Float32,
            vec![
                ids.dim(0).clone(),
                Dim::Fixed(1),
                Dim::Fixed(self.config.num_mel_bins),
            ],
        );
        loop {
            let (mel, stop) = self.decode_step(scope, &encoded, speaker, &spectrogram)?;
            let prob = scope
                .op("sigmoid", &[&stop])
                .output(DType::Float32, stop.dims().to_vec());
            if scope.read_value(&prob, "stop_threshold")? >= 0.5 {
                break;
            }
            spectrogram = scope.op("concat", &[&spectrogram, &mel]).attr("axis", 1).output(
                DType::Float32,
                vec![
                    ids.dim(0).clone(),
                    Dim::Fixed(spectrogram.dim(1).sample() + self.config.reduction_factor),
                    Dim::Fixed(self.config.num_mel_bins),
                ],
            );
        }
        Ok(vec![("spectrogram".to_string(), spectrogram)])
    }
}
