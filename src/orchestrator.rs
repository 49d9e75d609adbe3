//! Per-metric invocation orchestration (§4.9): allocates `Resources`,
//! uploads inputs on the transfer queue, records+submits the compute graph,
//! waits on the transfer fence, reads results back through host-visible
//! staging. The same five-step scaffolding serves every metric; each metric
//! plugs in its own compute graph, readback copies, and staging-to-result
//! mapping (the `MetricPipeline` trait), per the higher-order routine called
//! for in §9.

use ash::vk;
use gpu_allocator::MemoryLocation;
use image::RgbaImage;

use crate::error::{Error, Result};
use crate::gpu::{Buffer, GpuRuntime};

/// Each per-invocation `Resources` struct is the sole owner of its buffers,
/// images, semaphores and fence (§3, §9); nothing here is shared across
/// concurrent invocations.
pub struct Resources {
	pub staging_in: Buffer,
	pub staging_out: Buffer,
	pub upload_done: vk::Semaphore,
	pub compute_done: vk::Semaphore,
	pub fence: vk::Fence,
}

impl Resources {
	pub fn new(gpu: &GpuRuntime, staging_in_size: u64, staging_out_size: u64) -> Result<Self> {
		let staging_in = gpu.create_buffer(
			staging_in_size.max(4),
			vk::BufferUsageFlags::TRANSFER_SRC,
			MemoryLocation::CpuToGpu,
		)?;
		let staging_out = gpu.create_buffer(
			staging_out_size.max(4),
			vk::BufferUsageFlags::TRANSFER_DST,
			MemoryLocation::GpuToCpu,
		)?;

		let upload_done = unsafe { gpu.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
			.map_err(|e| Error::GpuResource(format!("semaphore creation failed: {e}")))?;
		let compute_done = unsafe { gpu.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
			.map_err(|e| Error::GpuResource(format!("semaphore creation failed: {e}")))?;
		let fence = unsafe {
			gpu.device.create_fence(&vk::FenceCreateInfo::default(), None)
		}
		.map_err(|e| Error::GpuResource(format!("fence creation failed: {e}")))?;

		Ok(Self { staging_in, staging_out, upload_done, compute_done, fence })
	}

	/// Copies `data` into `staging_in`'s mapped host memory at byte `offset`.
	pub fn write_staging_in(&mut self, offset: u64, data: &[u8]) -> Result<()> {
		let mapped = self
			.staging_in
			.allocation
			.as_mut()
			.and_then(|a| a.mapped_slice_mut())
			.ok_or_else(|| Error::GpuResource("staging_in is not host-visible".into()))?;
		let start = offset as usize;
		mapped[start..start + data.len()].copy_from_slice(data);
		Ok(())
	}

	/// Reads `len` bytes back out of `staging_out`'s mapped host memory.
	pub fn read_staging_out(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
		let mapped = self
			.staging_out
			.allocation
			.as_mut()
			.and_then(|a| a.mapped_slice_mut())
			.ok_or_else(|| Error::GpuResource("staging_out is not host-visible".into()))?;
		let start = offset as usize;
		Ok(mapped[start..start + len].to_vec())
	}

	pub fn destroy(&self, gpu: &GpuRuntime) {
		unsafe {
			gpu.device.destroy_semaphore(self.upload_done, None);
			gpu.device.destroy_semaphore(self.compute_done, None);
			gpu.device.destroy_fence(self.fence, None);
		}
	}
}

/// One metric's implementation plugs in these callbacks; the orchestrator
/// supplies the upload/submit/wait scaffolding around them (§4.9).
pub trait MetricPipeline {
	/// Allocates the device-local inputs/scratch sized for `width`x`height`,
	/// wires up descriptor sets, and returns the staging `Resources` the
	/// caller fills with the host image bytes before upload.
	fn prepare(&mut self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Resources>;

	/// Records the transfer-queue upload commands (staging -> device-local
	/// inputs): buffer-to-image copies and/or layout transitions.
	fn record_upload(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()>;

	/// Records the compute command buffer: the metric's full dispatch graph.
	fn record_compute(&mut self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()>;

	/// Records the readback copy (device result -> host-visible staging).
	fn record_readback(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()>;

	/// Maps `resources.staging_out` and extracts the final scalar result(s).
	fn map_result(&self, gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult>;

	/// Optional visualization image produced alongside the scalar result.
	fn visualization(&self) -> Option<&RgbaImage> {
		None
	}
}

#[derive(Debug, Clone, Copy)]
pub enum MetricResult {
	Scalar(f32),
	Pair(f32, f32),
}

impl std::fmt::Display for MetricResult {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			MetricResult::Scalar(v) => write!(f, "{v}"),
			MetricResult::Pair(a, b) => write!(f, "{a}/{b}"),
		}
	}
}

/// Runs the prepare -> fill -> upload -> compute -> readback sequence for
/// one metric invocation (§4.9). `fill_staging` writes the host image bytes
/// into `resources.staging_in`'s mapped memory (a plain host memcpy, no
/// command buffer); `metric.record_upload` then copies it onto the device.
pub fn run_invocation(
	gpu: &GpuRuntime,
	metric: &mut dyn MetricPipeline,
	width: u32,
	height: u32,
	fill_staging: impl FnOnce(&mut Resources) -> Result<()>,
) -> Result<MetricResult> {
	let mut resources = metric.prepare(gpu, width, height)?;
	fill_staging(&mut resources)?;

	// 1. Upload on the transfer queue, signalling upload-done + the transfer fence.
	gpu.begin_cmd(gpu.cmd_transfer)?;
	metric.record_upload(gpu, gpu.cmd_transfer, &resources)?;
	gpu.end_cmd(gpu.cmd_transfer)?;
	gpu.submit(gpu.transfer_queue, gpu.cmd_transfer, None, Some(resources.upload_done), resources.fence)?;

	// 2. Compute, waiting on upload-done, signalling compute-done.
	gpu.begin_cmd(gpu.cmd_compute)?;
	metric.record_compute(gpu, gpu.cmd_compute, &resources)?;
	gpu.end_cmd(gpu.cmd_compute)?;
	gpu.submit(
		gpu.compute_queue,
		gpu.cmd_compute,
		Some((resources.upload_done, vk::PipelineStageFlags::COMPUTE_SHADER)),
		Some(resources.compute_done),
		vk::Fence::null(),
	)?;

	// 3. Wait on the transfer fence so the transfer command buffer is safe to reuse.
	gpu.wait_for_fence(resources.fence)?;
	unsafe { gpu.device.reset_fences(&[resources.fence]) }
		.map_err(|e| Error::GpuExecution(format!("reset_fences failed: {e}")))?;

	// 4. Readback on the transfer queue, waiting on compute-done.
	gpu.begin_cmd(gpu.cmd_transfer)?;
	metric.record_readback(gpu, gpu.cmd_transfer, &resources)?;
	gpu.end_cmd(gpu.cmd_transfer)?;
	gpu.submit(
		gpu.transfer_queue,
		gpu.cmd_transfer,
		Some((resources.compute_done, vk::PipelineStageFlags::TRANSFER)),
		None,
		resources.fence,
	)?;
	gpu.wait_for_fence(resources.fence)?;
	unsafe { gpu.device.device_wait_idle() }
		.map_err(|e| Error::GpuExecution(format!("device_wait_idle failed: {e}")))?;

	// 5. Map staging and extract the result.
	let result = metric.map_result(gpu, &mut resources);
	resources.destroy(gpu);
	result
}
