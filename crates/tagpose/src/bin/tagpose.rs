//! tagpose CLI: inspect calibration records, undistort images, calibrate the
//! camera and run the tag pose loop.

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;
use tagpose::calib::{CalibrationStore, FileCalibrationStore};
use tagpose::core::{ColorFrame, Undistorter};
use tagpose::PipelineConfig;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "tagpose")]
#[command(about = "Calibrated AprilTag pose pipeline")]
#[command(version)]
struct Cli {
    /// Pipeline configuration (JSON). Missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Calibration record path, overriding `calibration_path`.
    #[arg(long, global = true)]
    calibration: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Emit tracing events as JSON.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON.
    Config,

    /// Print the stored calibration record.
    Show,

    /// Remove lens distortion from an image file.
    Undistort(UndistortArgs),

    /// Collect checkerboard views and store a new calibration record.
    #[cfg(feature = "chessboard")]
    Calibrate(CalibrateArgs),

    /// Calibrate if needed, then detect tags frame by frame.
    #[cfg(feature = "apriltag")]
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
struct UndistortArgs {
    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    output: PathBuf,

    /// Override `undistort_alpha` (0 = valid pixels only, 1 = keep all).
    #[arg(long)]
    alpha: Option<f64>,
}

#[cfg(feature = "chessboard")]
#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Accept every detected board without asking.
    #[arg(long)]
    yes: bool,
}

#[cfg(feature = "apriltag")]
#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Send the X coordinate of each reported tag here (serial device node
    /// or file).
    #[arg(long)]
    transport: Option<PathBuf>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<usize>,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Config => run_config(&config),
        Commands::Show => run_show(&config),
        Commands::Undistort(args) => run_undistort(&config, args),
        #[cfg(feature = "chessboard")]
        Commands::Calibrate(args) => run_calibrate(&config, args),
        #[cfg(feature = "apriltag")]
        Commands::Run(args) => run_pipeline(config, args),
    }
}

#[cfg(feature = "tracing")]
fn init_logging(cli: &Cli) {
    let _ = tracing_log::LogTracer::init();
    tagpose::core::init_tracing(cli.json_logs);
    log::set_max_level(cli.log_level.into());
}

#[cfg(not(feature = "tracing"))]
fn init_logging(cli: &Cli) {
    let _ = tagpose::core::init_with_level(cli.log_level.into());
}

fn load_config(cli: &Cli) -> CliResult<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_json(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(path) = &cli.calibration {
        config.calibration_path = path.clone();
    }
    Ok(config)
}

// ── config ────────────────────────────────────────────────────────────

fn run_config(config: &PipelineConfig) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

// ── show ──────────────────────────────────────────────────────────────

fn run_show(config: &PipelineConfig) -> CliResult<()> {
    let store = FileCalibrationStore::new(&config.calibration_path);
    let Some(record) = store.load() else {
        return Err(format!(
            "no calibration record at {}",
            config.calibration_path.display()
        )
        .into());
    };

    let cam = record.camera_params();
    println!("calibration record: {}", config.calibration_path.display());
    println!("  fx, fy:     {:.3}, {:.3}", cam.fx, cam.fy);
    println!("  cx, cy:     {:.3}, {:.3}", cam.cx, cam.cy);
    println!("  distortion: {:?}", record.distortion);
    if let Some([w, h]) = record.image_size {
        println!("  image size: {w}x{h}");
    }
    if let Some(rms) = record.rms_error {
        println!("  rms error:  {rms:.4} px");
    }
    if let Some(views) = record.views {
        println!("  views:      {views}");
    }
    Ok(())
}

// ── undistort ─────────────────────────────────────────────────────────

fn run_undistort(config: &PipelineConfig, args: &UndistortArgs) -> CliResult<()> {
    let store = FileCalibrationStore::new(&config.calibration_path);
    let record = store.load().ok_or_else(|| {
        format!(
            "no calibration record at {}",
            config.calibration_path.display()
        )
    })?;

    let rgb = image::open(&args.input)?.to_rgb8();
    let (w, h) = rgb.dimensions();
    let frame = ColorFrame::from_rgb(w as usize, h as usize, rgb.into_raw())
        .ok_or("decoded image has an unexpected buffer size")?;

    let alpha = args.alpha.unwrap_or(config.undistort_alpha);
    let undistorter = Undistorter::new(&record, (frame.width, frame.height), alpha)?;
    let out = undistorter.apply(&frame)?;

    let img = image::RgbImage::from_raw(w, h, out.data)
        .ok_or("undistorted frame has an unexpected buffer size")?;
    img.save(&args.output)?;
    log::info!("undistorted image written to {}", args.output.display());
    Ok(())
}

// ── calibrate ─────────────────────────────────────────────────────────

#[cfg(feature = "chessboard")]
fn run_calibrate(config: &PipelineConfig, args: &CalibrateArgs) -> CliResult<()> {
    use tagpose::calib::{
        AcceptAll, CalibrationSession, Calibrator, ChessCornerFinder, ConsoleReview,
        ObservationReview,
    };

    let mut source = tagpose::open_capture(config)?;
    let mut store = FileCalibrationStore::new(&config.calibration_path);
    let review: Box<dyn ObservationReview> = if args.yes {
        Box::new(AcceptAll)
    } else {
        Box::new(ConsoleReview::stdin())
    };
    let mut session =
        CalibrationSession::new(ChessCornerFinder::new(), review, config.calibration_options());

    let report = session.calibrate(source.as_mut(), config.checker_square_size, &mut store)?;
    let cam = report.parameters.camera_params();
    println!(
        "calibrated from {} views ({} frames read): rms {:.4} px",
        report.views, report.frames_read, report.rms_error
    );
    println!(
        "  fx={:.3} fy={:.3} cx={:.3} cy={:.3}",
        cam.fx, cam.fy, cam.cx, cam.cy
    );
    println!("  record written to {}", config.calibration_path.display());
    Ok(())
}

// ── run ───────────────────────────────────────────────────────────────

#[cfg(feature = "apriltag")]
fn run_pipeline(config: PipelineConfig, args: &RunArgs) -> CliResult<()> {
    use tagpose::core::CaptureError;
    use tagpose::{AprilTagDetector, LineTransport, PipelineError, PosePipeline, Transport};

    let source = tagpose::open_capture(&config)?;
    let detector = AprilTagDetector::new(
        &config.tag_family,
        config.detector_threads,
        config.quad_decimate,
    )?;
    let mut pipeline = PosePipeline::new(config, source, detector)?;
    if !pipeline.calibrate() {
        log::warn!("camera is not calibrated; frames will be captured but no tags reported");
    }

    let mut transport = match &args.transport {
        Some(path) => Some(LineTransport::open(path)?),
        None => None,
    };

    let mut frames = 0usize;
    while args.frames.is_none_or(|n| frames < n) {
        frames += 1;
        let tags = match pipeline.get_tags() {
            Ok(tags) => tags,
            Err(PipelineError::Capture(CaptureError::Exhausted)) => {
                log::info!("capture exhausted after {} frame(s)", frames - 1);
                break;
            }
            Err(e) => {
                log::warn!("frame {frames} skipped: {e}");
                continue;
            }
        };

        // Only the first tag with a pose is reported each frame.
        let Some((id, t)) = tags
            .iter()
            .find_map(|tag| tag.translation_mm_display().map(|t| (tag.id, t)))
        else {
            continue;
        };
        println!("Tag {id} detected! X: {:.1} Y: {:.1} Z: {:.1}", t.x, t.y, t.z);
        if let Some(link) = transport.as_mut() {
            link.send(&format!("{:.1}", t.x))?;
        }
    }

    if let Some(link) = transport.as_mut() {
        link.finish()?;
    }
    Ok(())
}
