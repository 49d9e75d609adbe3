//! GPU compute pipelines for full-reference image quality metrics (PSNR,
//! SSIM, M-SVD, FSIM/FSIMc, FLIP, LPIPS), built directly on Vulkan via `ash`.

pub mod config;
pub mod error;
pub mod fft;
pub mod gpu;
pub mod metrics;
pub mod orchestrator;
pub mod primitives;

pub use error::{Error, Result};
