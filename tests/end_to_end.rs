//! End-to-end scenarios that need a real Vulkan device and driver; ignored by
//! default since this environment never runs them against live hardware.

use iqm::config::{FlipArguments, PsnrVariant};
use iqm::gpu::GpuRuntime;
use iqm::metrics::lpips::LpipsWeights;
use iqm::metrics::{flip, fsim, lpips, psnr, ssim, svd};
use image::{Rgba, RgbaImage};

fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbaImage {
	RgbaImage::from_pixel(width, height, Rgba([color[0], color[1], color[2], 255]))
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn identical_gray_images_hit_every_metric_trivial_value() {
	let gpu = GpuRuntime::new().expect("vulkan device required");
	let test = solid(64, 64, [128, 128, 128]);
	let reference = test.clone();

	assert!(psnr::compute(&gpu, PsnrVariant::Luma, &test, &reference).unwrap().is_infinite());
	assert!((ssim::compute(&gpu, &test, &reference).unwrap() - 1.0).abs() < 1e-4);
	assert!(svd::compute(&gpu, &test, &reference).unwrap().abs() < 1e-4);
	assert!(flip::compute(&gpu, FlipArguments::default(), &test, &reference, false).unwrap().abs() < 1e-4);
	assert!((fsim::compute(&gpu, false, &test, &reference).unwrap() - 1.0).abs() < 1e-4);
	assert!((fsim::compute(&gpu, true, &test, &reference).unwrap() - 1.0).abs() < 1e-4);
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn one_gray_level_of_error_matches_the_published_psnr_formula() {
	let gpu = GpuRuntime::new().expect("vulkan device required");
	let test = solid(64, 64, [128, 128, 128]);
	let reference = solid(64, 64, [127, 127, 127]);

	let value = psnr::compute(&gpu, PsnrVariant::Luma, &test, &reference).unwrap();
	let expected = 10.0 * (1.0 / (1.0f32 / 255.0).powi(2)).log10();
	assert!((value - expected).abs() < 0.1);
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn shifted_noise_disagrees_with_the_reference() {
	let gpu = GpuRuntime::new().expect("vulkan device required");
	let width = 64u32;
	let height = 64u32;
	let mut reference = RgbaImage::new(width, height);
	for (x, y, pixel) in reference.enumerate_pixels_mut() {
		let v = ((x * 37 + y * 101) % 256) as u8;
		*pixel = Rgba([v, v, v, 255]);
	}
	let mut test = RgbaImage::new(width, height);
	for y in 0..height {
		for x in 0..width {
			let src_x = if x + 1 < width { x + 1 } else { x };
			*test.get_pixel_mut(x, y) = *reference.get_pixel(src_x, y);
		}
	}

	assert!(ssim::compute(&gpu, &test, &reference).unwrap() < 1.0);
	assert!(flip::compute(&gpu, FlipArguments::default(), &test, &reference, false).unwrap() > 0.0);
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn ssim_mssim_divisor_matches_the_interior_window_at_128() {
	// 128x128 with an 11x11 kernel: the valid interior is (128-10)x(128-10).
	let gpu = GpuRuntime::new().expect("vulkan device required");
	let test = solid(128, 128, [100, 150, 200]);
	let reference = test.clone();
	let value = ssim::compute(&gpu, &test, &reference).unwrap();
	assert!((value - 1.0).abs() < 1e-4);
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn svd_block_permutation_scores_zero() {
	let gpu = GpuRuntime::new().expect("vulkan device required");
	// Two 8x8 blocks side by side; the reference swaps them relative to test.
	let mut test = RgbaImage::new(16, 8);
	let mut reference = RgbaImage::new(16, 8);
	for y in 0..8u32 {
		for x in 0..8u32 {
			let v = ((x * 17 + y * 23) % 256) as u8;
			*test.get_pixel_mut(x, y) = Rgba([v, v, v, 255]);
			*test.get_pixel_mut(x + 8, y) = Rgba([255 - v, 255 - v, 255 - v, 255]);
			*reference.get_pixel_mut(x, y) = Rgba([255 - v, 255 - v, 255 - v, 255]);
			*reference.get_pixel_mut(x + 8, y) = Rgba([v, v, v, 255]);
		}
	}

	let value = svd::compute(&gpu, &test, &reference).unwrap();
	assert!(value.abs() < 1e-3);
}

#[test]
#[ignore = "requires a live Vulkan device"]
fn lpips_on_a_solid_pair_is_zero_regardless_of_weights() {
	let gpu = GpuRuntime::new().expect("vulkan device required");
	let test = solid(64, 64, [128, 128, 128]);
	let reference = test.clone();
	// Every conv output after preprocess is constant across the plane for a
	// solid image, so post-ReLU differences are zero in every block
	// irrespective of the weights' actual values.
	let weights = LpipsWeights::from_bytes(vec![0u8; LpipsWeights::model_size() as usize]).unwrap();

	let value = lpips::compute(&gpu, weights, &test, &reference).unwrap();
	assert!(value.abs() < 1e-4);
}
