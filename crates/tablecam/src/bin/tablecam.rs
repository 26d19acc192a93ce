//! tablecam CLI: calibrate a session, rectify frames, map markers onto the surface plane.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tablecam::{MarkerList, PipelineConfig, Roi, Session};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "tablecam")]
#[command(about = "Calibrate a table camera, rectify its frames and map surface markers")]
#[command(version)]
struct Cli {
    /// Log progress to stderr (repeat for debug output).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate a session directory (or load its cached calibration).
    Calibrate {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Rotate, undistort and crop one frame.
    Rectify {
        #[command(flatten)]
        session: SessionArgs,

        /// Raw camera frame.
        frame: PathBuf,

        /// Output image path.
        out: PathBuf,

        /// Write the full undistorted frame instead of the ROI crop.
        #[arg(long)]
        uncropped: bool,

        /// Crop rectangle `x,y,width,height` replacing the calibrated ROI.
        #[arg(long, value_parser = parse_roi)]
        roi: Option<Roi>,
    },

    /// Print canonical-plane coordinates of the session markers as JSON.
    MapMarkers {
        #[command(flatten)]
        session: SessionArgs,

        /// JSON list of the four surface corners (top-left, top-right,
        /// bottom-right, bottom-left).
        #[arg(long)]
        corners: PathBuf,

        /// Markers to map (default: `<session_dir>/markers.json`, else the corners).
        #[arg(long)]
        markers: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct SessionArgs {
    /// Session directory holding the calibration photos; its name is the session id.
    session_dir: PathBuf,

    /// Pipeline config (JSON). Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frames are rotated 90 degrees clockwise before processing.
    #[arg(long)]
    rotate: bool,

    /// Calibration cache directory (overrides the config).
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl SessionArgs {
    fn open(&self) -> CliResult<Session> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load_json(path)?,
            None => PipelineConfig::default(),
        };
        config.rotate |= self.rotate;
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        let dir = self.session_dir.canonicalize()?;
        Ok(Session::open(dir, &config)?)
    }
}

fn parse_roi(s: &str) -> Result<Roi, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid ROI {s:?}: {e}"))?;
    match parts.as_slice() {
        &[x, y, w, h] if w > 0 && h > 0 => Ok(Roi::new(x, y, w, h)),
        _ => Err(format!("expected x,y,width,height with positive size, got {s:?}")),
    }
}

#[derive(Serialize)]
struct CalibrationSummary<'a> {
    session: &'a str,
    rotate: bool,
    camera_matrix: [[f64; 3]; 3],
    distortion: Vec<f64>,
    optimal_camera_matrix: [[f64; 3]; 3],
    valid_roi: Roi,
}

fn rows(m: &nalgebra::Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

fn run_calibrate(args: &SessionArgs) -> CliResult<()> {
    let session = args.open()?;
    let params = session.params();
    let summary = CalibrationSummary {
        session: session.id(),
        rotate: params.rotate,
        camera_matrix: rows(&params.camera_matrix),
        distortion: params.distortion_coeffs(),
        optimal_camera_matrix: rows(&params.optimal_camera_matrix),
        valid_roi: params.valid_roi,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_rectify(
    args: &SessionArgs,
    frame: &Path,
    out: &Path,
    uncropped: bool,
    roi: Option<Roi>,
) -> CliResult<()> {
    let session = args.open()?;
    if let Some(roi) = roi {
        session.override_roi(roi);
    }
    let img = image::open(frame)?.to_rgb8();
    let rectified = session.rectify(&img);
    let result = if uncropped {
        &rectified.uncropped
    } else {
        &rectified.cropped
    };
    result.save(out)?;
    println!(
        "wrote {} ({}x{})",
        out.display(),
        result.width(),
        result.height()
    );
    Ok(())
}

fn run_map_markers(args: &SessionArgs, corners: &Path, markers: Option<&Path>) -> CliResult<()> {
    let session = args.open()?;
    let corner_list = MarkerList::load(corners)?;
    session.set_surface(&corner_list)?;

    let default_markers = args.session_dir.join("markers.json");
    let list = match markers {
        Some(path) => MarkerList::load(path)?,
        None if default_markers.is_file() => MarkerList::load(&default_markers)?,
        None => corner_list,
    };
    let mapped = session.map_markers(&list)?;
    println!("{}", serde_json::to_string_pretty(&mapped)?);
    Ok(())
}

fn level_filter(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

// stdout carries the JSON reports, so every subscriber writes to stderr
#[cfg(feature = "tracing")]
fn init_logging(verbose: u8) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(verbose).as_str().to_ascii_lowercase()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
fn init_logging(verbose: u8) {
    let _ = env_logger::Builder::new()
        .filter_level(level_filter(verbose))
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match &cli.command {
        Commands::Calibrate { session } => run_calibrate(session),
        Commands::Rectify {
            session,
            frame,
            out,
            uncropped,
            roi,
        } => run_rectify(session, frame, out, *uncropped, *roi),
        Commands::MapMarkers {
            session,
            corners,
            markers,
        } => run_map_markers(session, corners, markers.as_deref()),
    }
}
