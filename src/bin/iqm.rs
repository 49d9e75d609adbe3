//! `iqm`: runs a single full-reference image quality metric against one
//! test/reference pair and prints `<test-path>: <metric>` on success (§6).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use iqm::config::{FlipArguments, PsnrVariant};
use iqm::gpu::GpuRuntime;
use iqm::metrics::lpips::LpipsWeights;
use iqm::metrics::{flip, fsim, lpips, psnr, ssim, svd};
use iqm::Error;
use log::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
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
#[command(name = "iqm", about = "GPU-computed full-reference image quality metrics")]
struct Cli {
	#[arg(long)]
	method: Method,

	#[arg(long)]
	input: PathBuf,

	#[arg(long = "ref")]
	reference: PathBuf,

	/// Visualization image output path; only honored by metrics that produce one.
	#[arg(long)]
	output: Option<PathBuf>,

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
}

fn run(cli: &Cli, gpu: &GpuRuntime) -> iqm::Result<String> {
	let test = image::open(&cli.input)
		.map_err(|source| Error::Image { path: cli.input.clone(), source })?
		.into_rgba8();
	let reference = image::open(&cli.reference)
		.map_err(|source| Error::Image { path: cli.reference.clone(), source })?
		.into_rgba8();

	let value = match cli.method {
		Method::Psnr => format!("{:.4}", psnr::compute(gpu, cli.psnr_variant, &test, &reference)?),
		Method::Ssim => format!("{:.6}", ssim::compute(gpu, &test, &reference)?),
		Method::Svd => format!("{:.6}", svd::compute(gpu, &test, &reference)?),
		Method::Fsim => {
			let fsim_value = fsim::compute(gpu, false, &test, &reference)?;
			let fsimc_value = fsim::compute(gpu, true, &test, &reference)?;
			format!("{fsim_value:.6}/{fsimc_value:.6}")
		}
		Method::Flip => {
			let args = FlipArguments {
				monitor_resolution_x: cli.flip_res,
				monitor_distance: cli.flip_distance,
				monitor_width: cli.flip_width,
			};
			format!("{:.6}", flip::compute(gpu, args, &test, &reference, cli.colorize)?)
		}
		Method::Lpips => {
			let weights_path = cli
				.lpips_weights
				.as_ref()
				.ok_or_else(|| Error::ArgError("--lpips-weights is required for --method LPIPS".into()))?;
			let weights = LpipsWeights::load(weights_path)?;
			format!("{:.6}", lpips::compute(gpu, weights, &test, &reference)?)
		}
	};

	if cli.output.is_some() {
		log::warn!("--output requested but {:?} does not produce a readback visualization image yet", cli.method);
	}

	Ok(value)
}

fn main() -> ExitCode {
	env_logger::init();
	let cli = Cli::parse();

	// §6: the documented exit code on failure is -1, which truncates to 255
	// as an unsigned process exit status.
	let gpu = match GpuRuntime::new() {
		Ok(gpu) => gpu,
		Err(err) => {
			error!("{err}");
			return ExitCode::from(255);
		}
	};

	if cli.verbose {
		log::info!("using device {}", gpu.selected_device_name);
	}

	match run(&cli, &gpu) {
		Ok(value) => {
			println!("{}: {value}", cli.input.display());
			ExitCode::SUCCESS
		}
		Err(err) => {
			error!("{}: {err}", cli.input.display());
			ExitCode::from(255)
		}
	}
}
