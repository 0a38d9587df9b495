use super::{ServiceContext, Shutdown};
use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const DEFAULT_TTS_COMMAND: &str = "tts";
pub const DEFAULT_TTS_MODEL: &str = "tts_models/multilingual/multi-dataset/xtts_v2";
pub const DEFAULT_SPEAKER_WAV: &str = "reference_audio/pcpos_ref.wav";
pub const DEFAULT_LANGUAGE: &str = "en";

pub trait Synthesizer: Send + Sync {
    /// Where synthesis runs, reported by `/status`.
    fn device(&self) -> &str;

    /// Renders `text` in the voice of `speaker_wav` and returns WAV bytes.
    fn synthesize(&self, text: &str, speaker_wav: &Path, language: &str) -> Result<Vec<u8>>;
}

/// Voice cloning through an external TTS command line (Coqui `tts` by default).
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    model: String,
    device: String,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            device: "cpu".to_string(),
        }
    }

    pub fn device_name(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Fails when the program cannot be started at all.
    pub fn check(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--help")
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?
            .status;
        if !status.success() {
            bail!("{} --help exited with {}", self.program, status);
        }
        info!("Synthesizer ready: {} ({})", self.program, self.model);
        Ok(())
    }

    fn command(&self, text: &str, speaker_wav: &Path, language: &str, out: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--model_name")
            .arg(&self.model)
            .arg("--text")
            .arg(text)
            .arg("--speaker_wav")
            .arg(speaker_wav)
            .arg("--language_idx")
            .arg(language)
            .arg("--out_path")
            .arg(out);
        if self.device != "cpu" {
            command.arg("--use_cuda").arg("true");
        }
        command
    }
}

impl Synthesizer for CommandSynthesizer {
    fn device(&self) -> &str {
        &self.device
    }

    fn synthesize(&self, text: &str, speaker_wav: &Path, language: &str) -> Result<Vec<u8>> {
        let out = std::env::temp_dir().join(format!("forge-tts-{}.wav", uuid::Uuid::new_v4()));
        debug!("Synthesizing {} chars into {}", text.len(), out.display());

        let output = self
            .command(text, speaker_wav, language, &out)
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&out);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let audio = std::fs::read(&out)
            .with_context(|| format!("Synthesizer wrote no audio to {}", out.display()));
        let _ = std::fs::remove_file(&out);
        audio
    }
}

pub struct SpeechService {
    pub context: ServiceContext<dyn Synthesizer>,
    pub default_speaker_wav: PathBuf,
}

impl SpeechService {
    pub fn new(default_speaker_wav: impl Into<PathBuf>, shutdown: Shutdown) -> Self {
        Self {
            context: ServiceContext::new(shutdown),
            default_speaker_wav: default_speaker_wav.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: Option<String>,
    pub speaker_wav: Option<PathBuf>,
    pub language: Option<String>,
}

pub fn router(service: Arc<SpeechService>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/tts", post(tts))
        .with_state(service)
}

async fn status(State(service): State<Arc<SpeechService>>) -> Json<serde_json::Value> {
    match service.context.get() {
        Some(synthesizer) => Json(json!({ "status": "ready", "device": synthesizer.device() })),
        None => Json(json!({ "status": "loading", "device": "none" })),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn tts(
    State(service): State<Arc<SpeechService>>,
    Json(request): Json<SpeechRequest>,
) -> Response {
    let Some(synthesizer) = service.context.get() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded");
    };

    let text = match request.text {
        Some(text) if !text.trim().is_empty() => text,
        _ => return error_response(StatusCode::BAD_REQUEST, "Missing 'text' parameter"),
    };
    let speaker_wav = request
        .speaker_wav
        .unwrap_or_else(|| service.default_speaker_wav.clone());
    if !speaker_wav.exists() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Speaker reference file not found: {}", speaker_wav.display()),
        );
    }
    let language = request
        .language
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

    let result = tokio::task::spawn_blocking(move || {
        synthesizer.synthesize(&text, &speaker_wav, &language)
    })
    .await;

    match result {
        Ok(Ok(audio)) => ([(header::CONTENT_TYPE, "audio/wav")], audio).into_response(),
        Ok(Err(e)) => {
            error!("Synthesis failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
        Err(e) => {
            error!("Synthesis task panicked: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{get, json_body, post_json};
    use super::*;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeSynthesizer {
        calls: Mutex<Vec<(String, PathBuf, String)>>,
    }

    impl Synthesizer for FakeSynthesizer {
        fn device(&self) -> &str {
            "cpu"
        }

        fn synthesize(&self, text: &str, speaker_wav: &Path, language: &str) -> Result<Vec<u8>> {
            self.calls.lock().push((
                text.to_string(),
                speaker_wav.to_path_buf(),
                language.to_string(),
            ));
            Ok(b"RIFF....WAVE".to_vec())
        }
    }

    fn service(speaker: &Path) -> (Arc<SpeechService>, Arc<FakeSynthesizer>) {
        let synthesizer = Arc::new(FakeSynthesizer::default());
        let service = Arc::new(SpeechService::new(speaker, Shutdown::new()));
        service.context.install(synthesizer.clone());
        (service, synthesizer)
    }

    #[tokio::test]
    async fn test_status_while_loading() {
        let service = Arc::new(SpeechService::new(DEFAULT_SPEAKER_WAV, Shutdown::new()));
        let body = json_body(router(service).oneshot(get("/status")).await.unwrap()).await;
        assert_eq!(body, json!({ "status": "loading", "device": "none" }));
    }

    #[tokio::test]
    async fn test_status_when_ready() {
        let (service, _) = service(Path::new(DEFAULT_SPEAKER_WAV));
        let body = json_body(router(service).oneshot(get("/status")).await.unwrap()).await;
        assert_eq!(body, json!({ "status": "ready", "device": "cpu" }));
    }

    #[tokio::test]
    async fn test_tts_without_model() {
        let service = Arc::new(SpeechService::new(DEFAULT_SPEAKER_WAV, Shutdown::new()));
        let response = router(service)
            .oneshot(post_json("/tts", json!({ "text": "hello" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_text() {
        let dir = tempfile::tempdir().unwrap();
        let speaker = dir.path().join("ref.wav");
        std::fs::write(&speaker, b"RIFF").unwrap();
        let (service, synthesizer) = service(&speaker);

        for body in [json!({}), json!({ "text": "   " })] {
            let response = router(service.clone())
                .oneshot(post_json("/tts", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(response).await["error"], "Missing 'text' parameter");
        }
        assert!(synthesizer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_speaker_skips_model() {
        let (service, synthesizer) = service(Path::new(DEFAULT_SPEAKER_WAV));
        let response = router(service)
            .oneshot(post_json(
                "/tts",
                json!({ "text": "hello", "speaker_wav": "/no/such/voice.wav" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "Speaker reference file not found: /no/such/voice.wav"
        );
        assert!(synthesizer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tts_returns_wav() {
        let dir = tempfile::tempdir().unwrap();
        let speaker = dir.path().join("ref.wav");
        std::fs::write(&speaker, b"RIFF").unwrap();
        let (service, synthesizer) = service(&speaker);

        let response = router(service)
            .oneshot(post_json("/tts", json!({ "text": "hello", "language": "pt" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"RIFF....WAVE");

        let calls = synthesizer.calls.lock();
        assert_eq!(calls[0], ("hello".to_string(), speaker, "pt".to_string()));
    }

    #[test]
    fn test_command_arguments() {
        let synthesizer = CommandSynthesizer::new("tts", DEFAULT_TTS_MODEL);
        let command = synthesizer.command(
            "hi",
            Path::new("ref.wav"),
            "en",
            Path::new("/tmp/out.wav"),
        );
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--model_name",
                DEFAULT_TTS_MODEL,
                "--text",
                "hi",
                "--speaker_wav",
                "ref.wav",
                "--language_idx",
                "en",
                "--out_path",
                "/tmp/out.wav"
            ]
        );
    }

    #[test]
    fn test_missing_program_fails_check() {
        let synthesizer = CommandSynthesizer::new("forge-no-such-tts-binary", DEFAULT_TTS_MODEL);
        assert!(synthesizer.check().is_err());
    }
}
