//! One module per published metric (§4.3-§4.8). Each metric type owns its
//! pipelines/layouts and implements [`crate::orchestrator::MetricPipeline`];
//! `psnr_compute`-style free functions at the bottom of each file are the
//! entry points the CLI and `tests/` call.

pub mod flip;
pub mod fsim;
pub mod lpips;
pub mod psnr;
pub mod ssim;
pub mod svd;

use image::RgbaImage;

use crate::error::{Error, Result};

/// Checks the two inputs share identical dimensions (§7 `SizeMismatch`);
/// every metric performs this before allocating any GPU resource.
pub(crate) fn check_same_size(test: &RgbaImage, reference: &RgbaImage) -> Result<(u32, u32)> {
	let (tw, th) = test.dimensions();
	let (rw, rh) = reference.dimensions();
	if tw != rw || th != rh {
		return Err(Error::SizeMismatch { test_w: tw, test_h: th, ref_w: rw, ref_h: rh });
	}
	Ok((tw, th))
}
