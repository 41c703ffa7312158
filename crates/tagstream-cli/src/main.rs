use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgGroup, Args, Parser, Subcommand};
use tagstream::tracing::prefix;
use tagstream::{Error, Result};
use tagstream_detect::{
    spawn_detection_worker, CapturePipeline, DetectError, DetectorConfig, DetectorSession,
    Dialect, DylibLoader, FrameSource, ModuleLoader, OverlayConsumer, SimulatedModule,
};
use tracing::{info, warn};

mod overlay;
mod source;

use overlay::JsonLinesOverlay;
use source::{BlankSource, ImageSequenceSource};

#[derive(Parser, Debug)]
#[command(name = "tagstream")]
#[command(about = "Stream frames through an AprilTag detector of unknown build")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture/detect loop and print one JSON line per result batch
    Run(RunArgs),
    /// Resolve bindings against a detector build and print them
    Probe(ModuleArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("detector").required(true).args(["library", "simulate"])))]
struct ModuleArgs {
    /// Detector shared library to load
    #[arg(long)]
    library: Option<PathBuf>,

    /// Use the built-in simulated detector instead of a library
    #[arg(long)]
    simulate: bool,

    /// JSON detector config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tag families to try, in order (overrides config)
    #[arg(long, value_delimiter = ',')]
    families: Vec<String>,

    /// Dialects to try, in order: canonical, adapter (overrides config)
    #[arg(long, value_delimiter = ',')]
    dialects: Vec<String>,

    /// Milliseconds to wait for the detector to report ready
    #[arg(long)]
    init_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    module: ModuleArgs,

    /// Image files or directories of frames; a blank frame is used when empty
    #[arg(long, num_args = 1..)]
    frames: Vec<PathBuf>,

    /// Restart the frame sequence when it runs out
    #[arg(long = "loop")]
    looping: bool,

    /// Refresh rate of the capture loop
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Stop after this many refresh ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Blank frame size when no frames are given
    #[arg(long, default_value = "640")]
    width: u32,

    #[arg(long, default_value = "480")]
    height: u32,

    /// Emit image-info and timing debug messages from the detector
    #[arg(long)]
    debug_images: bool,
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tagstream::tracing::init_with_filter(&cli.log_level);

    match cli.command {
        Command::Run(args) => run(args)?,
        Command::Probe(args) => probe(args)?,
    }
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    if args.fps == 0 {
        return Err(Error::Config("fps must be positive".to_string()));
    }
    let mut config = detector_config(&args.module)?;
    config.debug_images |= args.debug_images;
    let loader = module_loader(&args.module, &config)?;
    info!("{} Detector: {}", prefix::OPEN, loader.describe());

    let refresh = Duration::from_millis(1000 / u64::from(args.fps)).max(Duration::from_millis(1));
    let (transport, worker) = spawn_detection_worker(loader, config).map_err(to_error)?;
    let overlay = JsonLinesOverlay::new(BufWriter::new(io::stdout()));

    let outcome = if args.frames.is_empty() {
        let source = BlankSource::new(args.width, args.height);
        drive(CapturePipeline::new(source, overlay, transport, refresh), args.ticks, |_| false)
    } else {
        let source = ImageSequenceSource::new(&args.frames, args.looping)?;
        info!("{} {} input frames", prefix::CAPTURE, source.len());
        drive(
            CapturePipeline::new(source, overlay, transport, refresh),
            args.ticks,
            ImageSequenceSource::is_exhausted,
        )
    };

    // the pipeline (and its request sender) is gone; the worker drains and exits
    worker.join();
    outcome
}

/// Tick until `max_ticks`, until `done` reports the source finished and the
/// last result is in, or until the link fails.
fn drive<S, O>(
    mut pipeline: CapturePipeline<S, O>,
    max_ticks: Option<u64>,
    done: impl Fn(&S) -> bool,
) -> Result<()>
where
    S: FrameSource,
    O: OverlayConsumer,
{
    pipeline.start().map_err(pipeline_error)?;
    let mut ticks = 0u64;
    let result = loop {
        if let Err(e) = pipeline.run(Some(1)) {
            break Err(pipeline_error(e));
        }
        ticks += 1;
        if max_ticks.is_some_and(|max| ticks >= max) {
            break Ok(());
        }
        if done(pipeline.source()) && !pipeline.transport().in_flight() {
            break Ok(());
        }
    };
    pipeline.stop();

    let capture = pipeline.stats();
    let transport = pipeline.transport().stats();
    info!(
        "{} {} frames sent, {} batches rendered, {} dropped in flight, {} dropped before ready",
        prefix::CLOSE,
        capture.frames_sent,
        capture.batches_rendered,
        transport.dropped_in_flight,
        transport.dropped_not_ready
    );
    if capture.conversion_errors > 0 {
        warn!("{} {} frames failed conversion", prefix::CLOSE, capture.conversion_errors);
    }
    result
}

fn probe(args: ModuleArgs) -> Result<()> {
    let config = detector_config(&args)?;
    let loader = module_loader(&args, &config)?;
    let module = loader.load().map_err(to_error)?;
    let (session, diagnostics) = DetectorSession::open(module, &config).map_err(to_error)?;

    println!("module:  {}", loader.describe());
    println!("dialect: {}", session.bindings().dialect());
    println!("detector: {:?}", session.detector());
    for bound in session.bindings().iter() {
        println!(
            "  {:<16} {:<40} {:?} {}",
            bound.op().as_str(),
            bound.export(),
            bound.resolution(),
            bound.signature()
        );
    }
    for diagnostic in &diagnostics {
        println!("  note: {diagnostic}");
    }
    Ok(())
}

fn detector_config(args: &ModuleArgs) -> Result<DetectorConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => DetectorConfig::default(),
    };
    if !args.families.is_empty() {
        config.families = args.families.clone();
    }
    if !args.dialects.is_empty() {
        config.dialects = args
            .dialects
            .iter()
            .map(|d| parse_dialect(d))
            .collect::<Result<_>>()?;
    }
    if let Some(ms) = args.init_timeout_ms {
        config.init_timeout_ms = ms;
    }
    config.validate().map_err(Error::Config)?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<DetectorConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(DetectorConfig::from_json(&text)?)
}

fn parse_dialect(name: &str) -> Result<Dialect> {
    match name.trim().to_ascii_lowercase().as_str() {
        "canonical" => Ok(Dialect::Canonical),
        "adapter" => Ok(Dialect::Adapter),
        other => Err(Error::Config(format!("unknown dialect `{other}`"))),
    }
}

fn module_loader(args: &ModuleArgs, config: &DetectorConfig) -> Result<Box<dyn ModuleLoader>> {
    match (&args.library, args.simulate) {
        (Some(path), false) => Ok(Box::new(DylibLoader::new(path, config))),
        (None, true) => Ok(Box::new(SimulatedModule::demo().loader())),
        _ => Err(Error::Config(
            "exactly one of --library or --simulate is required".to_string(),
        )),
    }
}

fn to_error(e: DetectError) -> Error {
    Error::Pipeline(e.to_string())
}

fn pipeline_error(e: DetectError) -> Error {
    if e.is_init_failure() {
        Error::Pipeline(format!("detector unavailable: {e}"))
    } else {
        to_error(e)
    }
}
