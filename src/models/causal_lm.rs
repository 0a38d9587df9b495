use super::{unsupported, LoadedModel, ModelFamily};
use crate::core::{
    AxisConstraint, Bindings, Capability, DType, Dim, ExportError, PortSignature, Signature,
    TraceError, TraceScope, TraceableWrapper, Traced,
};
use serde::Deserialize;
use tracing::debug;

const EMBED_PREFIX: &str = "model.embed_tokens.";
const LM_HEAD_PREFIX: &str = "lm_head.";
const EMBED_WEIGHT: &str = "model.embed_tokens.weight";
const LM_HEAD_WEIGHT: &str = "lm_head.weight";

/// The subset of a Llama-style `config.json` that decides tensor shapes.
#[derive(Debug, Clone, Deserialize)]
pub struct CausalLmConfig {
    pub hidden_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_max_positions() -> usize {
    2048
}

pub struct CausalLmWrapper {
    config: CausalLmConfig,
    capability: Capability,
    lm_head: &'static str,
    token_bound: i64,
}

impl CausalLmWrapper {
    pub fn new(model: &LoadedModel, capability: Capability) -> Result<Self, ExportError> {
        if capability == Capability::Encode {
            return Err(unsupported(ModelFamily::CausalLm, capability));
        }

        let config: CausalLmConfig = model.parse_config()?;
        let projection = [config.vocab_size, config.hidden_size];
        model.check_weight_shape(EMBED_WEIGHT, &projection)?;
        let lm_head = if model.has_weight_prefix(LM_HEAD_PREFIX) {
            model.check_weight_shape(LM_HEAD_WEIGHT, &projection)?;
            LM_HEAD_PREFIX
        } else if config.tie_word_embeddings {
            debug!("No lm_head weights, projecting through tied embeddings");
            EMBED_PREFIX
        } else {
            return Err(ExportError::shape_mismatch(
                LM_HEAD_WEIGHT,
                "missing from the checkpoint and tie_word_embeddings is false",
            ));
        };

        let token_bound = model
            .processor
            .vocab_size()
            .map(|v| v.min(config.vocab_size))
            .unwrap_or(config.vocab_size) as i64;

        Ok(Self {
            config,
            capability,
            lm_head,
            token_bound,
        })
    }

    pub fn config(&self) -> &CausalLmConfig {
        &self.config
    }

    fn logits(&self, scope: &mut TraceScope, ids: &Traced) -> Result<Traced, TraceError> {
        ids.expect_rank("embedding", 2)?;
        let batch = ids.dim(0).clone();
        let seq = ids.dim(1).clone();
        let hidden_dims = vec![batch.clone(), seq.clone(), Dim::Fixed(self.config.hidden_size)];

        let mut hidden = scope
            .op("embedding", &[ids])
            .weights(EMBED_PREFIX)
            .output(DType::Float32, hidden_dims.clone());

        for layer in 0..self.config.num_hidden_layers {
            hidden = scope
                .op("decoder_layer", &[&hidden])
                .attr("index", layer)
                .attr("causal_mask", true)
                .weights(format!("model.layers.{}.", layer))
                .output(DType::Float32, hidden_dims.clone());
        }

        let hidden = scope
            .op("rms_norm", &[&hidden])
            .weights("model.norm.")
            .output(DType::Float32, hidden_dims);

        Ok(scope
            .op("linear", &[&hidden])
            .attr("tied", self.lm_head == EMBED_PREFIX)
            .weights(self.lm_head)
            .output(
                DType::Float32,
                vec![batch, seq, Dim::Fixed(self.config.vocab_size)],
            ))
    }
}

impl TraceableWrapper for CausalLmWrapper {
    fn family(&self) -> &'static str {
        "causal-lm"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn signature(&self) -> Signature {
        let max_len = self.config.max_position_embeddings;
        let inputs = vec![PortSignature::new(
            "input_ids",
            DType::Int64,
            vec![AxisConstraint::Any, AxisConstraint::AtMost(max_len)],
        )];
        let outputs = match self.capability {
            Capability::FullGeneration => vec![PortSignature::new(
                "tokens",
                DType::Int64,
                vec![AxisConstraint::Any, AxisConstraint::AtMost(max_len)],
            )],
            _ => vec![PortSignature::new(
                "logits",
                DType::Float32,
                vec![
                    AxisConstraint::Any,
                    AxisConstraint::AtMost(max_len),
                    AxisConstraint::Exact(self.config.vocab_size),
                ],
            )],
        };
        Signature { inputs, outputs }
    }

    fn sample_value_range(&self, input: &str) -> Option<(i64, i64)> {
        (input == "input_ids").then_some((0, self.token_bound))
    }

    fn forward(
        &self,
        scope: &mut TraceScope,
        inputs: &Bindings,
    ) -> Result<Vec<(String, Traced)>, TraceError> {
        let ids = inputs.get("input_ids")?;
        let logits = self.logits(scope, ids)?;

        if self.capability != Capability::FullGeneration {
            return Ok(vec![("logits".to_string(), logits)]);
        }

        // Sampling loop: the number of steps depends on when EOS is drawn.
        let mut tokens = ids.clone();
        loop {
            let next = scope
                .op("argmax", &[&logits])
                .attr("axis", -1)
                .output(DType::Int64, vec![tokens.dim(0).clone(), Dim::Fixed(1)]);
            let token = scope.read_value(&next, "generate")?;
            if token < 0.0 {
                break;
            }
            tokens = scope.op("concat", &[&tokens, &next]).attr("axis", 1).output(
                DType::Int64,
                vec![tokens.dim(0).clone(), tokens.dim(1).clone()],
            );
        }
        Ok(vec![("tokens".to_string(), tokens)])
    }
}
