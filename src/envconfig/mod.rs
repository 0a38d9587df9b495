use crate::app::catalog::LLAMA_FALLBACK;
use crate::app::server::speech::{DEFAULT_SPEAKER_WAV, DEFAULT_TTS_COMMAND, DEFAULT_TTS_MODEL};
use crate::infra::hub::DEFAULT_ENDPOINT;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_LLM_HOST: &str = "127.0.0.1:5001";
pub const DEFAULT_TTS_HOST: &str = "127.0.0.1:5002";

/// Process configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub output_dir: PathBuf,
    pub hf_token: Option<String>,
    pub hf_endpoint: String,
    pub cache_dir: Option<PathBuf>,
    pub llm_host: Host,
    pub llm_model: String,
    pub llm_model_dir: Option<PathBuf>,
    pub tts_host: Host,
    pub tts_command: String,
    pub tts_model: String,
    pub speaker_wav: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    pub port: u16,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            output_dir: var("FORGE_OUTPUT_DIR")
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| PathBuf::from(".")),
            hf_token: var("HF_TOKEN"),
            hf_endpoint: var("HF_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            cache_dir: var("FORGE_CACHE_DIR").map(|p| expand_home(&p)),
            llm_host: Host::parse(
                &var("FORGE_LLM_HOST").unwrap_or_else(|| DEFAULT_LLM_HOST.to_string()),
                5001,
            ),
            llm_model: var("FORGE_LLM_MODEL").unwrap_or_else(|| LLAMA_FALLBACK.to_string()),
            llm_model_dir: var("FORGE_LLM_MODEL_DIR").map(|p| expand_home(&p)),
            tts_host: Host::parse(
                &var("FORGE_TTS_HOST").unwrap_or_else(|| DEFAULT_TTS_HOST.to_string()),
                5002,
            ),
            tts_command: var("FORGE_TTS_COMMAND")
                .unwrap_or_else(|| DEFAULT_TTS_COMMAND.to_string()),
            tts_model: var("FORGE_TTS_MODEL").unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
            speaker_wav: var("FORGE_SPEAKER_WAV")
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SPEAKER_WAV)),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Host {
    /// Parses `host`, `host:port` or `:port`; an unparsable port falls back to
    /// `default_port`.
    pub fn parse(value: &str, default_port: u16) -> Self {
        let value = value.trim();
        let value = value
            .strip_prefix("http://")
            .or_else(|| value.strip_prefix("https://"))
            .unwrap_or(value);

        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(default_port)),
            None => (value, default_port),
        };
        let host = if host.is_empty() { "127.0.0.1" } else { host };

        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
