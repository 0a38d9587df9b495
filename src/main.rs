use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use companion_forge::app::server::generation::{self, GenerationService, LlamaGenerator};
use companion_forge::app::server::speech::{self, CommandSynthesizer, SpeechService, Synthesizer};
use companion_forge::app::server::{Server, Shutdown};
use companion_forge::app::JobName;
use companion_forge::envconfig::{EnvConfig, Host};
use companion_forge::infra::{package, HubSource, ModelFiles};
use companion_forge::models::ModelFamily;
use companion_forge::progress::StageSpinner;
use companion_forge::Tracer;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "companion-forge")]
#[command(version)]
#[command(about = "Convert pretrained models into on-device packages and serve them locally", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one conversion job
    Convert {
        #[arg(value_enum)]
        job: JobName,
    },
    /// List the conversion jobs
    Jobs,
    /// Verify a package and print its manifest summary
    Inspect { package: PathBuf },
    /// Start a local serving collaborator
    Serve {
        #[arg(value_enum)]
        service: Service,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Service {
    /// Text generation on FORGE_LLM_HOST
    Generation,
    /// Voice-cloning speech synthesis on FORGE_TTS_HOST
    Speech,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "companion_forge=debug"
    } else {
        "companion_forge=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EnvConfig::from_env();

    let result = match cli.command {
        Commands::Convert { job } => convert(job, &config),
        Commands::Jobs => {
            list_jobs();
            Ok(0)
        }
        Commands::Inspect { package } => inspect(&package),
        Commands::Serve { service } => serve(service, &config),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn convert(name: JobName, config: &EnvConfig) -> Result<i32> {
    let source = hub_source(config);
    let mut job = name.build(&config.output_dir)?;
    job.subscribe(StageSpinner::new());
    info!("Starting {} -> {}", name, job.output_path().display());

    let outcome = job.run(&source, &Tracer::new())?;
    if outcome.is_saved() {
        info!("{}: {}", name, outcome.diagnosis());
        println!("{}", outcome.diagnosis());
    } else {
        error!("{}: {}", name, outcome.diagnosis());
        eprintln!("{}", outcome.diagnosis());
    }
    Ok(outcome.exit_code())
}

fn hub_source(config: &EnvConfig) -> HubSource {
    HubSource::new()
        .endpoint(config.hf_endpoint.clone())
        .token(config.hf_token.clone())
        .cache_dir(config.cache_dir.clone())
        .with_cached_token()
}

fn list_jobs() {
    for name in JobName::all() {
        println!("{:<16} {}.{}", name, name.package_name(), package::PACKAGE_EXTENSION);
    }
}

fn inspect(path: &std::path::Path) -> Result<i32> {
    let manifest = package::verify(path)?;
    println!("{}", manifest.summary());
    for input in &manifest.inputs {
        println!("  in  {}", input);
    }
    for output in &manifest.outputs {
        println!("  out {}", output);
    }
    Ok(0)
}

fn serve(service: Service, config: &EnvConfig) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    let served = runtime.block_on(async {
        match service {
            Service::Generation => serve_generation(config).await,
            Service::Speech => serve_speech(config).await,
        }
    });
    // A model still loading on a blocking thread is abandoned.
    runtime.shutdown_background();
    served?;
    Ok(0)
}

fn server(host: &Host) -> Server {
    Server::new().host(host.host.clone()).port(host.port)
}

async fn serve_generation(config: &EnvConfig) -> Result<()> {
    let model_name = config
        .llm_model_dir
        .as_ref()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.llm_model.clone());
    let service = Arc::new(GenerationService::new(model_name, Shutdown::new()));
    let host = config.llm_host.clone();

    let config = config.clone();
    let model_name = service.model_name.clone();
    let load = async move {
        // The blocking hub client must be built and dropped off the runtime.
        let generator = tokio::task::spawn_blocking(move || {
            let files = match &config.llm_model_dir {
                Some(dir) => ModelFiles::in_dir(dir, ModelFamily::CausalLm)?,
                None => hub_source(&config).download(&config.llm_model, ModelFamily::CausalLm)?,
            };
            LlamaGenerator::load(&files)
        })
        .await??;
        info!("Generation model {} loaded", model_name);
        Ok::<_, anyhow::Error>(generation::shared(Box::new(generator)))
    };

    server(&host)
        .routes(generation::router(service.clone()))
        .run_with_loader(&service.context, load)
        .await
}

async fn serve_speech(config: &EnvConfig) -> Result<()> {
    let service = Arc::new(SpeechService::new(config.speaker_wav.clone(), Shutdown::new()));

    let synthesizer = CommandSynthesizer::new(config.tts_command.clone(), config.tts_model.clone());
    let load = async move {
        let synthesizer = tokio::task::spawn_blocking(move || {
            synthesizer.check()?;
            Ok::<_, anyhow::Error>(synthesizer)
        })
        .await??;
        Ok::<_, anyhow::Error>(Arc::new(synthesizer) as Arc<dyn Synthesizer>)
    };

    server(&config.tts_host)
        .routes(speech::router(service.clone()))
        .run_with_loader(&service.context, load)
        .await
}
