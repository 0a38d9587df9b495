use super::{ServiceContext, Shutdown};
use crate::infra::ModelFiles;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Llama, LlamaConfig, LlamaEosToks};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, error, info};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are PCPOS, a helpful AI companion.";

pub fn build_prompt(system: &str, prompt: &str) -> String {
    format!(
        "### System:\n{}\n\n### User:\n{}\n\n### Assistant:\n",
        system, prompt
    )
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

pub trait TextGenerator: Send {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<Generation>;
}

/// Llama-architecture chat model running on candle.
pub struct LlamaGenerator {
    model: Llama,
    config: candle_transformers::models::llama::Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl LlamaGenerator {
    pub fn load(files: &ModelFiles) -> Result<Self> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(0)?
        } else if candle_core::utils::metal_is_available() {
            Device::new_metal(0)?
        } else {
            Device::Cpu
        };
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };

        let raw = std::fs::read(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let config: LlamaConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid llama config {}", files.config.display()))?;
        let config = config.into_config(false);

        let tokenizer = Tokenizer::from_file(&files.processor).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {}", files.processor.display(), e)
        })?;

        info!(
            "Loading llama weights from {} file(s) on {:?}",
            files.weights.len(),
            device
        );
        // SAFETY: the weight files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            dtype,
        })
    }

    fn is_eos(&self, token: u32) -> bool {
        match &self.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => *id == token,
            Some(LlamaEosToks::Multiple(ids)) => ids.contains(&token),
            None => false,
        }
    }
}

impl TextGenerator for LlamaGenerator {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<Generation> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_tokens = tokens.len();

        let sampling = if params.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            Sampling::TopP {
                p: params.top_p,
                temperature: params.temperature,
            }
        };
        let mut sampler = LogitsProcessor::from_sampling(rand::random(), sampling);
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;

        let mut generated = Vec::new();
        let mut index_pos = 0;
        for step in 0..params.max_tokens {
            if tokens.len() >= self.config.max_position_embeddings {
                debug!("Context window full after {} tokens", tokens.len());
                break;
            }
            let context = if step == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos, &mut cache)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            index_pos += context.len();

            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                let start = tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &tokens[start..],
                )?
            };

            let next = sampler.sample(&logits)?;
            if self.is_eos(next) {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }

        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(anyhow::Error::msg)?;

        Ok(Generation {
            text: text.trim().to_string(),
            prompt_tokens,
            completion_tokens: generated.len(),
        })
    }
}

pub type SharedGenerator = Mutex<Box<dyn TextGenerator>>;

pub struct GenerationService {
    pub context: ServiceContext<SharedGenerator>,
    pub model_name: String,
}

impl GenerationService {
    pub fn new(model_name: impl Into<String>, shutdown: Shutdown) -> Self {
        Self {
            context: ServiceContext::new(shutdown),
            model_name: model_name.into(),
        }
    }

    pub fn install(&self, generator: Box<dyn TextGenerator>) -> bool {
        self.context.install(shared(generator))
    }
}

pub fn shared(generator: Box<dyn TextGenerator>) -> Arc<SharedGenerator> {
    Arc::new(Mutex::new(generator))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub response: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

pub fn router(service: Arc<GenerationService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}

async fn health(State(service): State<Arc<GenerationService>>) -> Json<serde_json::Value> {
    let status = if service.context.is_loaded() {
        "healthy"
    } else {
        "not_loaded"
    };
    Json(json!({ "status": status, "model": service.model_name }))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn generate(
    State(service): State<Arc<GenerationService>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let Some(generator) = service.context.get() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded");
    };

    let system = request
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let prompt = build_prompt(system, &request.prompt);
    let defaults = GenerationParams::default();
    let params = GenerationParams {
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: request.temperature.unwrap_or(defaults.temperature),
        ..defaults
    };

    let result =
        tokio::task::spawn_blocking(move || generator.lock().generate(&prompt, &params)).await;

    match result {
        Ok(Ok(generation)) => {
            debug!(
                "Generated {} tokens for a {}-token prompt",
                generation.completion_tokens, generation.prompt_tokens
            );
            Json(GenerateResponse {
                response: generation.text,
                prompt_tokens: generation.prompt_tokens,
                completion_tokens: generation.completion_tokens,
            })
            .into_response()
        }
        Ok(Err(e)) => {
            error!("Generation failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
        Err(e) => {
            error!("Generation task panicked: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn shutdown(State(service): State<Arc<GenerationService>>) -> &'static str {
    service.context.shutdown().trigger();
    "Server shutting down..."
}

#[cfg(test)]
mod tests {
    use super::super::testing::{get, json_body, post_json};
    use super::*;
    use tower::ServiceExt;

    /// Returns a canned reply and records each request.
    struct EchoGenerator {
        prompts: Requests,
        fail: bool,
    }

    impl TextGenerator for EchoGenerator {
        fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<Generation> {
            if self.fail {
                anyhow::bail!("out of memory");
            }
            self.prompts
                .lock()
                .push((prompt.to_string(), params.max_tokens, params.temperature));
            Ok(Generation {
                text: "hello there".to_string(),
                prompt_tokens: 12,
                completion_tokens: 2,
            })
        }
    }

    type Requests = Arc<Mutex<Vec<(String, usize, f64)>>>;

    fn service(loaded: bool, fail: bool) -> (Arc<GenerationService>, Requests) {
        let prompts = Requests::default();
        let service = Arc::new(GenerationService::new("tinyllama", Shutdown::new()));
        if loaded {
            service.install(Box::new(EchoGenerator {
                prompts: prompts.clone(),
                fail,
            }));
        }
        (service, prompts)
    }

    #[test]
    fn test_build_prompt() {
        assert_eq!(
            build_prompt("Be brief.", "Hi"),
            "### System:\nBe brief.\n\n### User:\nHi\n\n### Assistant:\n"
        );
    }

    #[tokio::test]
    async fn test_health_reports_loading_state() {
        let (service, _) = service(false, false);
        let response = router(service.clone()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "not_loaded");
        assert_eq!(body["model"], "tinyllama");

        service.install(Box::new(EchoGenerator {
            prompts: Arc::default(),
            fail: false,
        }));
        let body = json_body(router(service).oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_generate_without_model() {
        let (service, _) = service(false, false);
        let response = router(service)
            .oneshot(post_json("/generate", json!({ "prompt": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "Model not loaded");
    }

    #[tokio::test]
    async fn test_generate_applies_defaults() {
        let (service, prompts) = service(true, false);
        let response = router(service)
            .oneshot(post_json("/generate", json!({ "prompt": "What is Rust?" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["response"], "hello there");
        assert_eq!(body["prompt_tokens"], 12);
        assert_eq!(body["completion_tokens"], 2);

        let prompts = prompts.lock();
        let (prompt, max_tokens, temperature) = &prompts[0];
        assert_eq!(prompt, &build_prompt(DEFAULT_SYSTEM_PROMPT, "What is Rust?"));
        assert_eq!(*max_tokens, 100);
        assert!((temperature - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_generate_honours_request_options() {
        let (service, prompts) = service(true, false);
        router(service)
            .oneshot(post_json(
                "/generate",
                json!({
                    "prompt": "Hi",
                    "max_tokens": 8,
                    "temperature": 0.0,
                    "system_prompt": "Answer in French."
                }),
            ))
            .await
            .unwrap();

        let prompts = prompts.lock();
        assert!(prompts[0].0.starts_with("### System:\nAnswer in French.\n"));
        assert_eq!(prompts[0].1, 8);
    }

    #[tokio::test]
    async fn test_generation_failure_is_500() {
        let (service, _) = service(true, true);
        let response = router(service)
            .oneshot(post_json("/generate", json!({ "prompt": "hi" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "out of memory");
    }

    #[tokio::test]
    async fn test_shutdown_route_triggers_stop() {
        let (service, _) = service(false, false);
        let response = router(service.clone())
            .oneshot(post_json("/shutdown", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(service.context.shutdown().is_triggered());
    }
}
