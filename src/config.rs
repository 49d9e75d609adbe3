//! Per-metric configuration that is either CLI-exposed or a published constant.

use clap::ValueEnum;

/// PSNR color-channel variant (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PsnrVariant {
	Luma,
	Rgb,
	Yuv,
}

impl Default for PsnrVariant {
	fn default() -> Self {
		PsnrVariant::Luma
	}
}

/// SSIM constants (§4.4). Kernel size and Gaussian σ are fixed by the
/// published definition, not CLI-exposed.
pub struct SsimConfig {
	pub kernel_size: u32,
	pub k1: f32,
	pub k2: f32,
	pub sigma: f32,
}

impl Default for SsimConfig {
	fn default() -> Self {
		Self { kernel_size: 11, k1: 0.01, k2: 0.03, sigma: 1.5 }
	}
}

impl SsimConfig {
	pub fn c1(&self) -> f32 {
		self.k1 * self.k1
	}

	pub fn c2(&self) -> f32 {
		self.k2 * self.k2
	}
}

/// Display-geometry parameters for FLIP (§4.7). Defaults reproduced verbatim
/// from the reference implementation.
#[derive(Debug, Clone, Copy)]
pub struct FlipArguments {
	pub monitor_resolution_x: f32,
	pub monitor_distance: f32,
	pub monitor_width: f32,
}

impl Default for FlipArguments {
	fn default() -> Self {
		Self { monitor_resolution_x: 2560.0, monitor_distance: 0.7, monitor_width: 0.6 }
	}
}

impl FlipArguments {
	/// Pixels-per-degree: ppd = d · (res_x/width) · π/180.
	pub fn pixels_per_degree(&self) -> f32 {
		self.monitor_distance * (self.monitor_resolution_x / self.monitor_width)
			* std::f32::consts::PI
			/ 180.0
	}

	/// K_s = 2·ceil(3·√(0.04/(2π²))·ppd)+1.
	pub fn spatial_kernel_size(&self) -> u32 {
		let ppd = self.pixels_per_degree();
		let base = (0.04_f32 / (2.0 * std::f32::consts::PI.powi(2))).sqrt();
		2 * (3.0 * base * ppd).ceil() as u32 + 1
	}

	/// K_f = 2·ceil(3·0.5·0.082·ppd)+1.
	pub fn feature_kernel_size(&self) -> u32 {
		let ppd = self.pixels_per_degree();
		2 * (3.0 * 0.5 * 0.082 * ppd).ceil() as u32 + 1
	}
}

/// One LPIPS convolution block's shape (§4.8, §3).
#[derive(Debug, Clone, Copy)]
pub struct ConvParams {
	pub kernel_size: u32,
	pub in_channels: u32,
	pub out_channels: u32,
	pub padding: u32,
	pub stride: u32,
}

/// The five fixed LPIPS backbone blocks, in order.
pub const LPIPS_BLOCKS: [ConvParams; 5] = [
	ConvParams { kernel_size: 11, in_channels: 3, out_channels: 64, padding: 2, stride: 4 },
	ConvParams { kernel_size: 5, in_channels: 64, out_channels: 192, padding: 2, stride: 1 },
	ConvParams { kernel_size: 3, in_channels: 192, out_channels: 384, padding: 1, stride: 1 },
	ConvParams { kernel_size: 3, in_channels: 384, out_channels: 256, padding: 1, stride: 1 },
	ConvParams { kernel_size: 3, in_channels: 256, out_channels: 256, padding: 1, stride: 1 },
];

pub const FSIM_ORIENTATIONS: u32 = 4;
pub const FSIM_SCALES: u32 = 4;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flip_defaults_match_reference_implementation() {
		let args = FlipArguments::default();
		assert_eq!(args.monitor_resolution_x, 2560.0);
		assert_eq!(args.monitor_distance, 0.7);
		assert_eq!(args.monitor_width, 0.6);
	}

	#[test]
	fn ssim_constants_square_k1_k2() {
		let cfg = SsimConfig::default();
		assert!((cfg.c1() - 0.0001).abs() < 1e-6);
		assert!((cfg.c2() - 0.0009).abs() < 1e-6);
	}

	#[test]
	fn lpips_block_channels_chain() {
		for pair in LPIPS_BLOCKS.windows(2) {
			assert_eq!(pair[0].out_channels, pair[1].in_channels);
		}
	}
}
