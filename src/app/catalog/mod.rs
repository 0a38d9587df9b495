use crate::app::job::ExportJob;
use crate::core::{
    Capability, DType, ExportError, ModelDescriptor, Precision, ShapeContract, ShapeRange,
    TensorSpec,
};
use crate::infra::{ComputeUnits, DeploymentTarget, ExportTarget};
use crate::models::ModelFamily;
use clap::ValueEnum;
use std::fmt;
use std::path::Path;

pub const LLAMA_PRIMARY: &str = "meta-llama/Llama-3.2-1B-Instruct";
pub const LLAMA_FALLBACK: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const SPEECHT5_TTS: &str = "microsoft/speecht5_tts";
pub const WAV2VEC2_BASE: &str = "facebook/wav2vec2-base-960h";

const LLAMA_MAX_TOKENS: usize = 2048;
// Wide enough for any current tokenizer; the loaded model fixes the extent.
const MAX_VOCAB: usize = 262144;
const SPEECHT5_MAX_TEXT: usize = 450;
const SPEECHT5_MAX_FRAMES: usize = 1876;
const SPEECHT5_MEL_BINS: usize = 80;
const SPEECHT5_REDUCTION: usize = 2;
const SPEAKER_EMBEDDING: usize = 512;
const AUDIO_SAMPLES: usize = 16000;
const WAV2VEC2_FRAMES: usize = 49;
const WAV2VEC2_HIDDEN: usize = 768;

/// The compiled-in conversion entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobName {
    /// Llama 3.2 1B Instruct next-token logits (TinyLlama when gated)
    Llama,
    /// SpeechT5 acoustic model through its full generation loop
    Tts,
    /// One SpeechT5 decoder step
    TtsStep,
    /// Wav2Vec2 speaker encoder over one second of 16 kHz audio
    SpeakerEncoder,
}

impl JobName {
    pub fn all() -> [JobName; 4] {
        [
            JobName::Llama,
            JobName::Tts,
            JobName::TtsStep,
            JobName::SpeakerEncoder,
        ]
    }

    pub fn package_name(&self) -> &'static str {
        match self {
            JobName::Llama => "Llama3_1B",
            JobName::Tts => "SpeechT5_Acoustic",
            JobName::TtsStep => "SpeechT5_DecoderStep",
            JobName::SpeakerEncoder => "SpeakerEncoder",
        }
    }

    pub fn build(&self, output_dir: &Path) -> Result<ExportJob, ExportError> {
        let job = match self {
            JobName::Llama => llama()?,
            JobName::Tts => tts(Capability::FullGeneration)?,
            JobName::TtsStep => tts(Capability::SingleStep)?,
            JobName::SpeakerEncoder => speaker_encoder()?,
        };
        Ok(job.output_dir(output_dir))
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => write!(f, "{:?}", self),
        }
    }
}

fn ranged(max: usize) -> Result<ShapeRange, ExportError> {
    ShapeRange::range(1, max)
}

fn fixed(size: usize) -> Result<ShapeRange, ExportError> {
    ShapeRange::fixed(size)
}

fn llama() -> Result<ExportJob, ExportError> {
    let contract = ShapeContract::new(
        vec![TensorSpec::new(
            "input_ids",
            DType::Int64,
            vec![fixed(1)?, ranged(LLAMA_MAX_TOKENS)?],
        )],
        vec![TensorSpec::new(
            "logits",
            DType::Float32,
            vec![fixed(1)?, ranged(LLAMA_MAX_TOKENS)?, ranged(MAX_VOCAB)?],
        )],
    )?;

    Ok(ExportJob::new(
        JobName::Llama.package_name(),
        ModelDescriptor::hub(LLAMA_PRIMARY).gated(),
        ModelFamily::CausalLm,
        Capability::SingleStep,
        contract,
    )
    .fallback(ModelDescriptor::hub(LLAMA_FALLBACK))
    .target(ExportTarget {
        compute_units: ComputeUnits::CpuAndNeuralEngine,
        deployment_target: DeploymentTarget::ios(16),
        precision: Precision::F16,
    }))
}

fn tts(capability: Capability) -> Result<ExportJob, ExportError> {
    let mut inputs = vec![
        TensorSpec::new(
            "input_ids",
            DType::Int64,
            vec![fixed(1)?, ranged(SPEECHT5_MAX_TEXT)?],
        ),
        TensorSpec::new(
            "speaker_embeddings",
            DType::Float32,
            vec![fixed(1)?, fixed(SPEAKER_EMBEDDING)?],
        ),
    ];

    let (name, outputs) = if capability == Capability::FullGeneration {
        (
            JobName::Tts.package_name(),
            vec![TensorSpec::new(
                "spectrogram",
                DType::Float32,
                vec![fixed(1)?, ranged(SPEECHT5_MAX_FRAMES)?, fixed(SPEECHT5_MEL_BINS)?],
            )],
        )
    } else {
        inputs.push(TensorSpec::new(
            "decoder_input",
            DType::Float32,
            vec![fixed(1)?, ranged(SPEECHT5_MAX_FRAMES)?, fixed(SPEECHT5_MEL_BINS)?],
        ));
        (
            JobName::TtsStep.package_name(),
            vec![
                TensorSpec::new(
                    "mel_frames",
                    DType::Float32,
                    vec![fixed(1)?, fixed(SPEECHT5_REDUCTION)?, fixed(SPEECHT5_MEL_BINS)?],
                ),
                TensorSpec::new(
                    "stop_logits",
                    DType::Float32,
                    vec![fixed(1)?, fixed(SPEECHT5_REDUCTION)?],
                ),
            ],
        )
    };

    Ok(ExportJob::new(
        name,
        ModelDescriptor::hub(SPEECHT5_TTS),
        ModelFamily::TextToSpeech,
        capability,
        ShapeContract::new(inputs, outputs)?,
    )
    .target(ExportTarget {
        compute_units: ComputeUnits::All,
        deployment_target: DeploymentTarget::ios(15),
        precision: Precision::F16,
    }))
}

fn speaker_encoder() -> Result<ExportJob, ExportError> {
    let contract = ShapeContract::new(
        vec![TensorSpec::new(
            "audio",
            DType::Float32,
            vec![fixed(1)?, fixed(AUDIO_SAMPLES)?],
        )],
        vec![TensorSpec::new(
            "embedding",
            DType::Float32,
            vec![fixed(1)?, fixed(WAV2VEC2_FRAMES)?, fixed(WAV2VEC2_HIDDEN)?],
        )],
    )?;

    Ok(ExportJob::new(
        JobName::SpeakerEncoder.package_name(),
        ModelDescriptor::hub(WAV2VEC2_BASE),
        ModelFamily::SpeechEncoder,
        Capability::Encode,
        contract,
    )
    .target(ExportTarget {
        compute_units: ComputeUnits::All,
        deployment_target: DeploymentTarget::ios(15),
        precision: Precision::F16,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_job_builds() {
        let dir = Path::new("/tmp/forge-out");
        for name in JobName::all() {
            let job = name.build(dir).unwrap();
            assert_eq!(job.name(), name.package_name());
            assert_eq!(
                job.output_path(),
                dir.join(format!("{}.modelpkg", name.package_name()))
            );
        }
    }

    #[test]
    fn test_llama_job() {
        let job = JobName::Llama.build(Path::new(".")).unwrap();
        assert!(job.primary().gated);
        assert_eq!(job.fallback_descriptor().unwrap().id(), LLAMA_FALLBACK);
        assert_eq!(
            job.export_target().compute_units,
            ComputeUnits::CpuAndNeuralEngine
        );
        assert_eq!(job.export_target().deployment_target.to_string(), "iOS16");
        let input = &job.contract().inputs()[0];
        assert_eq!(input.shape[1], ShapeRange::Range { min: 1, max: 2048 });
    }

    #[test]
    fn test_tts_jobs_differ_in_capability() {
        let full = JobName::Tts.build(Path::new(".")).unwrap();
        let step = JobName::TtsStep.build(Path::new(".")).unwrap();
        assert_eq!(full.capability(), Capability::FullGeneration);
        assert_eq!(step.capability(), Capability::SingleStep);
        assert_eq!(step.contract().inputs().len(), 3);
        assert!(full.fallback_descriptor().is_none());
    }

    #[test]
    fn test_display_matches_cli_names() {
        assert_eq!(JobName::TtsStep.to_string(), "tts-step");
        assert_eq!(JobName::SpeakerEncoder.to_string(), "speaker-encoder");
    }
}
