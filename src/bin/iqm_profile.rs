//! `iqm-profile`: runs the chosen metric `--iterations` times against one
//! pair, reporting a minimal timing readout (§4.1, §6, §9) -- there is no
//! real swapchain here, just a host timing loop around the same `GpuRuntime`
//! headless path `iqm` uses.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use iqm::config::{FlipArguments, PsnrVariant};
use iqm::gpu::GpuRuntime;
use iqm::metrics::lpips::LpipsWeights;
use iqm::metrics::{flip, fsim, lpips, psnr, ssim, svd};
use iqm::Error;
use log::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "UPPERCASE")]
enum Method {
	Psnr,
	Ssim,
	Svd,
	Fsim,
	Flip,
	Lpips,
}

#[derive(Parser)]
#[command(name = "iqm-profile", about = "Repeatedly runs one image quality metric for timing")]
struct Cli {
	#[arg(long)]
	method: Method,

	#[arg(long)]
	input: PathBuf,

	#[arg(long = "ref")]
	reference: PathBuf,

	#[arg(short, long)]
	verbose: bool,

	#[arg(short, long)]
	colorize: bool,

	#[arg(long, default_value = "luma")]
	psnr_variant: PsnrVariant,

	#[arg(long, default_value_t = FlipArguments::default().monitor_width)]
	flip_width: f32,

	#[arg(long, default_value_t = FlipArguments::default().monitor_resolution_x)]
	flip_res: f32,

	#[arg(long, default_value_t = FlipArguments::default().monitor_distance)]
	flip_distance: f32,

	#[arg(long)]
	lpips_weights: Option<PathBuf>,

	#[arg(long, default_value_t = 100)]
	iterations: u32,
}

fn run_once(cli: &Cli, gpu: &GpuRuntime, test: &image::RgbaImage, reference: &image::RgbaImage) -> iqm::Result<f32> {
	match cli.method {
		Method::Psnr => psnr::compute(gpu, cli.psnr_variant, test, reference),
		Method::Ssim => ssim::compute(gpu, test, reference),
		Method::Svd => svd::compute(gpu, test, reference),
		Method::Fsim => fsim::compute(gpu, false, test, reference),
		Method::Flip => {
			let args = FlipArguments {
				monitor_resolution_x: cli.flip_res,
				monitor_distance: cli.flip_distance,
				monitor_width: cli.flip_width,
			};
			flip::compute(gpu, args, test, reference, cli.colorize)
		}
		Method::Lpips => {
			let weights_path = cli
				.lpips_weights
				.as_ref()
				.ok_or_else(|| Error::ArgError("--lpips-weights is required for --method LPIPS".into()))?;
			// Reloaded every iteration: a profiling run measures the same
			// cold-start cost `iqm` would pay per invocation, not a
			// benefit from a cache this tool doesn't otherwise have.
			let weights = LpipsWeights::load(weights_path)?;
			lpips::compute(gpu, weights, test, reference)
		}
	}
}

fn main() -> ExitCode {
	env_logger::init();
	let cli = Cli::parse();

	let gpu = match GpuRuntime::new() {
		Ok(gpu) => gpu,
		Err(err) => {
			error!("{err}");
			return ExitCode::from(255);
		}
	};

	if cli.verbose {
		info!("using device {}", gpu.selected_device_name);
	}

	let test = match image::open(&cli.input).map_err(|source| Error::Image { path: cli.input.clone(), source }) {
		Ok(img) => img.into_rgba8(),
		Err(err) => {
			error!("{}: {err}", cli.input.display());
			return ExitCode::from(255);
		}
	};
	let reference =
		match image::open(&cli.reference).map_err(|source| Error::Image { path: cli.reference.clone(), source }) {
			Ok(img) => img.into_rgba8(),
			Err(err) => {
				error!("{}: {err}", cli.reference.display());
				return ExitCode::from(255);
			}
		};

	let start = Instant::now();
	let mut last_value = 0.0f32;
	for iteration in 0..cli.iterations {
		match run_once(&cli, &gpu, &test, &reference) {
			Ok(value) => last_value = value,
			Err(err) => {
				error!("{}: iteration {iteration}: {err}", cli.input.display());
				return ExitCode::from(255);
			}
		}
	}
	let elapsed = start.elapsed();
	let per_iteration_ms = elapsed.as_secs_f64() * 1000.0 / cli.iterations.max(1) as f64;

	println!(
		"{}: {last_value:.6} ({} iterations, {per_iteration_ms:.3} ms/iteration)",
		cli.input.display(),
		cli.iterations
	);
	ExitCode::SUCCESS
}
