use std::path::PathBuf;

/// Crate-wide error type. Every fallible boundary in `iqm` returns `Result<T, Error>`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	ArgError(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("image error for {path}: {source}")]
	Image {
		path: PathBuf,
		#[source]
		source: image::ImageError,
	},

	#[error("test and reference images differ in size: {test_w}x{test_h} vs {ref_w}x{ref_h}")]
	SizeMismatch {
		test_w: u32,
		test_h: u32,
		ref_w: u32,
		ref_h: u32,
	},

	#[error("GPU init error: {0}")]
	GpuInit(String),

	#[error("GPU resource error: {0}")]
	GpuResource(String),

	#[error("GPU execution error: {0}")]
	GpuExecution(String),

	#[error("FFT error: {0}")]
	FftError(String),

	#[error("unsupported: {0}")]
	Unsupported(String),
}

impl From<ash::vk::Result> for Error {
	fn from(result: ash::vk::Result) -> Self {
		Error::GpuExecution(result.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
