//! The FFT collaborator (§4.6a): an `FftPlanner` trait plus a `rustfft`-backed
//! implementation, since no GPU-native FFT crate is available. Call shape and
//! buffer-partition contract match what a true GPU FFT library would expose,
//! so `Fsim`'s dispatch graph does not special-case the host round-trip.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner as RustFftPlanner};

use crate::error::{Error, Result};
use crate::gpu::GpuRuntime;

/// Describes the disjoint byte ranges a single buffer is carved into for the
/// forward (2-batch) and inverse (48-batch) FFT calls. All descriptors that
/// bind a sub-range read their offset from here (§9).
#[derive(Debug, Clone, Copy)]
pub struct FftBufferPartitions {
	pub fft_offset: u64,
	pub fft_batch_stride: u64,
	pub fft_len: u64,
	pub ifft_offset: u64,
	pub ifft_batch_stride: u64,
	pub ifft_len: u64,
}

impl FftBufferPartitions {
	/// Builds the partition record for a downscaled `(width, height)`.
	/// Complex32 interleaved storage: 8 bytes/sample.
	pub fn new(width: u32, height: u32) -> Self {
		let samples = (width as u64) * (height as u64);
		let batch_bytes = samples * 8;
		Self {
			fft_offset: 0,
			fft_batch_stride: batch_bytes,
			fft_len: batch_bytes * 2,
			ifft_offset: 0,
			ifft_batch_stride: batch_bytes,
			ifft_len: batch_bytes * 48,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlanKey {
	width: u32,
	height: u32,
	batches: u32,
	inverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FftPlanHandle(u64);

pub trait FftPlanner {
	fn forward_plan(&mut self, width: u32, height: u32, batches: u32) -> Result<FftPlanHandle>;
	fn inverse_plan(&mut self, width: u32, height: u32, batches: u32) -> Result<FftPlanHandle>;

	/// Performs the forward transform in place over `buffer`'s forward
	/// partition, via a host round-trip through a transient staging buffer.
	fn append_forward(
		&self,
		gpu: &GpuRuntime,
		plan: FftPlanHandle,
		buffer: vk::Buffer,
		partitions: &FftBufferPartitions,
	) -> Result<()>;

	fn append_inverse(
		&self,
		gpu: &GpuRuntime,
		plan: FftPlanHandle,
		buffer: vk::Buffer,
		partitions: &FftBufferPartitions,
	) -> Result<()>;
}

struct CachedPlan {
	width: u32,
	height: u32,
	batches: u32,
	fft: Arc<dyn Fft<f32>>,
}

/// Host-executed FFT planner backed by `rustfft`. Plans are cached by
/// (width, height, batches, direction) exactly like the reference
/// implementation's plan cache, made an explicit owned object rather than a
/// process-global (§9).
pub struct RustfftPlanner {
	planner: RustFftPlanner<f32>,
	plans: HashMap<PlanKey, CachedPlan>,
	next_handle: u64,
	handles: HashMap<u64, PlanKey>,
}

impl RustfftPlanner {
	pub fn new() -> Self {
		Self {
			planner: RustFftPlanner::new(),
			plans: HashMap::new(),
			next_handle: 0,
			handles: HashMap::new(),
		}
	}

	fn plan_for(&mut self, width: u32, height: u32, batches: u32, inverse: bool) -> Result<FftPlanHandle> {
		let key = PlanKey { width, height, batches, inverse };
		if !self.plans.contains_key(&key) {
			let len = (width as usize) * (height as usize);
			if len == 0 {
				return Err(Error::FftError("zero-sized FFT plan requested".into()));
			}
			let fft = if inverse {
				self.planner.plan_fft_inverse(len)
			} else {
				self.planner.plan_fft_forward(len)
			};
			self.plans.insert(key, CachedPlan { width, height, batches, fft });
		}

		let handle = self.next_handle;
		self.next_handle += 1;
		self.handles.insert(handle, key);
		Ok(FftPlanHandle(handle))
	}

	fn resolve(&self, handle: FftPlanHandle) -> Result<&CachedPlan> {
		let key = self
			.handles
			.get(&handle.0)
			.ok_or_else(|| Error::FftError("unknown FFT plan handle".into()))?;
		self.plans
			.get(key)
			.ok_or_else(|| Error::FftError("FFT plan evicted".into()))
	}

	fn run(
		&self,
		gpu: &GpuRuntime,
		plan: &CachedPlan,
		buffer: vk::Buffer,
		offset: u64,
		batch_stride: u64,
		region_len: u64,
	) -> Result<()> {
		let samples = (plan.width as usize) * (plan.height as usize);

		let mut staging = gpu.create_buffer(
			region_len,
			vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
			gpu_allocator::MemoryLocation::CpuToGpu,
		)?;

		gpu.copy_device_buffer_to_staging_blocking(buffer, offset, staging.buffer, region_len)?;

		{
			let mapped = staging
				.allocation
				.as_mut()
				.and_then(|a| a.mapped_slice_mut())
				.ok_or_else(|| Error::GpuResource("staging buffer is not host-visible".into()))?;

			let complex: &mut [Complex32] = bytemuck::cast_slice_mut(mapped);

			for batch in 0..plan.batches as usize {
				let start = batch * samples;
				let end = start + samples;
				if end > complex.len() {
					return Err(Error::FftError(format!(
						"batch {batch} exceeds buffer of {} samples",
						complex.len()
					)));
				}
				plan.fft.process(&mut complex[start..end]);
			}
		}

		gpu.copy_staging_to_device_buffer_blocking(staging.buffer, buffer, offset, region_len)?;
		let _ = batch_stride;

		Ok(())
	}
}

impl FftPlanner for RustfftPlanner {
	fn forward_plan(&mut self, width: u32, height: u32, batches: u32) -> Result<FftPlanHandle> {
		self.plan_for(width, height, batches, false)
	}

	fn inverse_plan(&mut self, width: u32, height: u32, batches: u32) -> Result<FftPlanHandle> {
		self.plan_for(width, height, batches, true)
	}

	fn append_forward(
		&self,
		gpu: &GpuRuntime,
		plan: FftPlanHandle,
		buffer: vk::Buffer,
		partitions: &FftBufferPartitions,
	) -> Result<()> {
		let cached = self.resolve(plan)?;
		self.run(
			gpu,
			cached,
			buffer,
			partitions.fft_offset,
			partitions.fft_batch_stride,
			partitions.fft_len,
		)
	}

	fn append_inverse(
		&self,
		gpu: &GpuRuntime,
		plan: FftPlanHandle,
		buffer: vk::Buffer,
		partitions: &FftBufferPartitions,
	) -> Result<()> {
		let cached = self.resolve(plan)?;
		self.run(
			gpu,
			cached,
			buffer,
			partitions.ifft_offset,
			partitions.ifft_batch_stride,
			partitions.ifft_len,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partitions_scale_with_resolution() {
		let small = FftBufferPartitions::new(64, 64);
		let large = FftBufferPartitions::new(128, 128);
		assert_eq!(small.fft_batch_stride * 4, large.fft_batch_stride);
		assert_eq!(small.fft_len * 2, small.fft_batch_stride * 4);
		assert_eq!(small.ifft_len, small.ifft_batch_stride * 48);
	}

	#[test]
	fn plan_cache_reuses_handles_for_repeated_shape() {
		let mut planner = RustfftPlanner::new();
		let a = planner.forward_plan(64, 64, 2).unwrap();
		let b = planner.forward_plan(64, 64, 2).unwrap();
		assert_ne!(a.0, b.0, "each call mints a fresh handle");
		assert_eq!(planner.plans.len(), 1, "but the underlying rustfft plan is cached");
	}
}
