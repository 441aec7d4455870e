use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use video_orchestrator::pipeline::single::{image_to_video_profile, parse_binding};
use video_orchestrator::{
    AvatarRequest, GroupRequest, GroupStatus, MediaService, PromptSequenceRequest, SegmentRequest, Settings,
    SingleStageRequest, TransitionRequest,
};

/// How often the driver reports group progress
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "video_orchestrator")]
#[command(about = "Runs multi-stage media jobs across a pool of GPU workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging when RUST_LOG is not set
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Commands {
    /// Re-render a video segment by segment against a reference image
    Segment {
        /// Source video
        source: PathBuf,

        /// Reference image shared by every segment
        reference: PathBuf,

        /// Audio track laid under the joined result
        audio: Option<PathBuf>,

        /// Prompt passed to every segment job
        #[arg(short, long)]
        prompt: Option<String>,

        /// Segment length in seconds
        #[arg(long)]
        segment_seconds: Option<f64>,
    },

    /// Join clips with generated transitions between neighbours
    Transition {
        /// Anchor clips in playback order
        #[arg(required = true, num_args = 2..)]
        clips: Vec<PathBuf>,
    },

    /// Run one template once
    Single {
        /// Template name (`i2v` uses the built-in image-to-video slots)
        template: String,

        /// Slot bindings as slot=path-or-text
        #[arg(required = true)]
        pairs: Vec<String>,
    },

    /// Animate one image once per prompt and join the clips
    Sequence {
        /// Still image shared by every clip
        image: PathBuf,

        /// One clip per prompt
        #[arg(required = true)]
        prompts: Vec<String>,

        /// Audio track laid under the joined result
        #[arg(long)]
        audio: Option<PathBuf>,
    },

    /// Speak a text, then lip-sync a character image to it
    Avatar {
        /// Text to speak
        text: String,

        /// Character image
        image: PathBuf,

        /// Audio window per avatar job, in seconds
        #[arg(long)]
        segment_seconds: Option<f64>,
    },
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    match run(cli.command).await {
        Ok(artifact) => println!("{}", artifact),
        Err(e) => {
            tracing::error!("❌ {}", e);
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(command: Commands) -> Result<String, Box<dyn std::error::Error>> {
    let settings = Settings::from_env();
    tracing::info!(
        "Configuration - Workers: {}, Templates: {}, Storage: {}",
        settings.worker_endpoints.join(", "),
        settings.template_dir.display(),
        if settings.storage_base_url.is_some() { "✅" } else { "❌" }
    );

    if let Err(e) = tokio::fs::create_dir_all(&settings.work_dir).await {
        tracing::warn!("Failed to create work directory {}: {}", settings.work_dir.display(), e);
    }

    let service = MediaService::from_settings(&settings)?;
    let selection = service.select_worker().await;
    match &selection.error {
        None => tracing::info!("✅ Using worker {}", selection.endpoint),
        Some(reason) => tracing::warn!("⚠️ No worker answered ({}), trying {} anyway", reason, selection.endpoint),
    }
    let _sweeper = service.orchestrator().spawn_retention_sweeper();

    let group_id = match command {
        Commands::Segment {
            source,
            reference,
            audio,
            prompt,
            segment_seconds,
        } => {
            let mut request = SegmentRequest::new(source, reference);
            request.audio = audio;
            request.prompt = prompt;
            request.segment_seconds = segment_seconds;
            service.submit_group(GroupRequest::Segment(request)).await?
        }
        Commands::Transition { clips } => {
            let (first, rest) = clips.split_first().ok_or("transition needs clips")?;
            let group_id = service
                .submit_group(GroupRequest::Transition(TransitionRequest::new(first)))
                .await?;
            for clip in rest {
                service.add_anchor(&group_id, clip).await?;
            }
            service.finish_transition(&group_id).await?;
            group_id
        }
        Commands::Single { template, pairs } => {
            let bindings = pairs
                .iter()
                .map(|pair| parse_binding(pair))
                .collect::<Result<Vec<_>, _>>()?;
            let request = if template == "i2v" {
                SingleStageRequest::new(image_to_video_profile(), bindings)
            } else {
                SingleStageRequest::ad_hoc(&template, bindings)?
            };
            service.submit_group(GroupRequest::SingleStage(request)).await?
        }
        Commands::Sequence { image, prompts, audio } => {
            let mut request = PromptSequenceRequest::new(image, prompts);
            request.audio = audio;
            service.submit_group(GroupRequest::PromptSequence(request)).await?
        }
        Commands::Avatar {
            text,
            image,
            segment_seconds,
        } => {
            let mut request = AvatarRequest::new(text, image);
            request.segment_seconds = segment_seconds;
            let speech = service.submit_group(GroupRequest::Avatar(request)).await?;
            tracing::info!(group_id = %speech, "⏳ Waiting for speech track");
            let track = wait_for_group(&service, &speech).await?;
            tracing::info!(group_id = %speech, "🎵 Speech track: {}", track);
            follow_up(&service, &speech).await?
        }
    };

    tracing::info!(group_id = %group_id, "⏳ Waiting for group");
    wait_for_group(&service, &group_id).await
}

/// Avatar group started by the speech group, or why there is none.
async fn follow_up(service: &MediaService, speech: &str) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(group_id) = service.follow_up_of(speech).await {
        return Ok(group_id);
    }
    let snapshot = service.group_status(speech).await?;
    let mut reason = "no avatar group was started".to_string();
    for job in &snapshot.jobs {
        if let Some(error) = service.orchestrator().chain_link(&job.job_id).await.and_then(|l| l.error) {
            reason = error;
        }
    }
    Err(format!("speech group {}: {}", speech, reason).into())
}

/// Logs progress until the group is terminal. Ctrl-C cancels the group.
async fn wait_for_group(service: &MediaService, group_id: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut last_progress = None;
    let mut cancel_requested = false;
    loop {
        let snapshot = service.group_status(group_id).await?;
        if last_progress != Some((snapshot.completed, snapshot.total)) {
            tracing::info!(group_id = %group_id, "📊 {}/{} jobs finished", snapshot.completed, snapshot.total);
            last_progress = Some((snapshot.completed, snapshot.total));
        }

        match snapshot.status {
            GroupStatus::Completed => {
                let artifact = snapshot.final_artifact.unwrap_or_default();
                tracing::info!(group_id = %group_id, "✅ Final artifact: {}", artifact);
                return Ok(artifact);
            }
            GroupStatus::Failed => {
                let error = snapshot.error.unwrap_or_else(|| "unknown error".to_string());
                return Err(format!("group {} failed: {}", group_id, error).into());
            }
            GroupStatus::Processing => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(STATUS_INTERVAL) => {}
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                tracing::warn!(group_id = %group_id, "🛑 Interrupted, cancelling group");
                cancel_requested = true;
                service.cancel_group(group_id).await?;
            }
        }
    }
}

fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose || cfg!(debug_assertions) {
            "debug,video_orchestrator=trace,reqwest=info,hyper=info".to_string()
        } else {
            "info,video_orchestrator=info,reqwest=warn,hyper=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    tracing::info!("🎬 Video orchestrator starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);
    Ok(())
}
