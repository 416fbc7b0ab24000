use clap::Parser;
use std::error::Error as _;
use std::path::PathBuf;

use connectome_core::gradients::DEFAULT_B0_THRESHOLD;
use connectome_core::pipeline::{Pipeline, PipelineConfig, PipelineInputs};
use connectome_core::register::RegistrationParams;
use connectome_core::track::{TensorFitParams, TrackingParams};

#[derive(Parser)]
#[command(name = "connectome")]
#[command(about = "Estimate a structural connectome from diffusion MRI", long_about = None)]
#[command(version)]
struct Cli {
    /// Diffusion-weighted 4-D volume
    #[arg(value_name = "DWI")]
    dwi: PathBuf,

    /// b-value file (FSL format)
    #[arg(value_name = "BVALS")]
    bvals: PathBuf,

    /// b-vector file (FSL format)
    #[arg(value_name = "BVECS")]
    bvecs: PathBuf,

    /// Structural (T1-weighted) volume
    #[arg(value_name = "STRUCTURAL")]
    structural: PathBuf,

    /// Atlas template volume defining the target grid
    #[arg(value_name = "ATLAS")]
    atlas: PathBuf,

    /// Brain mask on the atlas grid
    #[arg(value_name = "MASK")]
    mask: PathBuf,

    /// Region labels on the atlas grid
    #[arg(value_name = "LABELS")]
    labels: PathBuf,

    /// Output root directory
    #[arg(value_name = "OUTDIR")]
    output_dir: PathBuf,

    // ===== Tracking Options =====
    /// Number of tractography seeds
    #[arg(short = 's', long, value_name = "INT", default_value_t = 1_000_000)]
    seeds: usize,

    /// Stop tracking below this fractional anisotropy
    #[arg(short = 'f', long, value_name = "FLOAT", default_value_t = 0.1)]
    fa_threshold: f64,

    /// Step length in voxels
    #[arg(long, value_name = "FLOAT", default_value_t = 0.5)]
    step_size: f64,

    /// Largest turn between steps, in degrees
    #[arg(short = 'a', long, value_name = "DEG", default_value_t = 60.0)]
    angle_threshold: f64,

    /// Maximum points per streamline
    #[arg(long, value_name = "INT", default_value_t = 1000)]
    max_points: usize,

    // ===== Input Options =====
    /// Largest b-value treated as unweighted
    #[arg(short = 'b', long, value_name = "FLOAT", default_value_t = DEFAULT_B0_THRESHOLD)]
    b0_threshold: f64,

    // ===== Run Options =====
    /// Reuse aligned and tracked artifacts already present in OUTDIR
    #[arg(long)]
    resume: bool,

    /// Number of threads (default: all cores)
    #[arg(short = 't', long, value_name = "INT")]
    threads: Option<usize>,

    /// Verbose level: 1=error, 2=warning, 3=message, 4+=debugging
    #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
    verbosity: i32,
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    if let Some(threads) = cli.threads {
        let threads = threads.max(1);
        match rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            Ok(_) => log::debug!("Using {} threads", threads),
            Err(e) => log::warn!("Failed to configure thread pool: {}", e),
        }
    }

    let config = PipelineConfig {
        b0_threshold: cli.b0_threshold,
        registration: RegistrationParams::default(),
        tensor_fit: TensorFitParams::default(),
        tracking: TrackingParams {
            seed_count: cli.seeds,
            fa_threshold: cli.fa_threshold,
            step_size: cli.step_size,
            angle_threshold_deg: cli.angle_threshold,
            max_points: cli.max_points,
        },
    };
    let inputs = PipelineInputs {
        dwi: cli.dwi,
        bvals: cli.bvals,
        bvecs: cli.bvecs,
        structural: cli.structural,
        atlas: cli.atlas,
        mask: cli.mask,
        labels: cli.labels,
        output_dir: cli.output_dir,
    };

    match Pipeline::native(config).with_resume(cli.resume).run(&inputs) {
        Ok(report) => {
            println!("{}", report.summary);
            println!("Graph saved to {}", report.artifacts.graph.display());
            println!("{}", report.completion_message());
        }
        Err(failure) => {
            log::error!("{}", failure);
            let mut cause = failure.source.source();
            while let Some(err) = cause {
                log::error!("  caused by: {}", err);
                cause = err.source();
            }
            std::process::exit(1);
        }
    }
}
