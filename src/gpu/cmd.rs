//! Command-buffer recording helpers shared by every metric's dispatch graph.

use ash::vk;

use crate::error::{Error, Result};
use crate::gpu::GpuRuntime;

impl GpuRuntime {
	pub fn begin_cmd(&self, cmd: vk::CommandBuffer) -> Result<()> {
		unsafe { self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
			.map_err(|e| Error::GpuExecution(format!("reset_command_buffer failed: {e}")))?;

		unsafe {
			self.device.begin_command_buffer(
				cmd,
				&vk::CommandBufferBeginInfo::default()
					.flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
			)
		}
		.map_err(|e| Error::GpuExecution(format!("begin_command_buffer failed: {e}")))
	}

	pub fn end_cmd(&self, cmd: vk::CommandBuffer) -> Result<()> {
		unsafe { self.device.end_command_buffer(cmd) }
			.map_err(|e| Error::GpuExecution(format!("end_command_buffer failed: {e}")))
	}

	/// Binds `pipeline`/`descriptor_set`, pushes `push_constants` (if any),
	/// and dispatches `compute_2d_groups(width, height, tile)` workgroups.
	pub fn dispatch_2d(
		&self,
		cmd: vk::CommandBuffer,
		pipeline: vk::Pipeline,
		layout: vk::PipelineLayout,
		descriptor_set: vk::DescriptorSet,
		push_constants: &[u8],
		width: u32,
		height: u32,
		tile: u32,
	) {
		unsafe {
			self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
			self.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				layout,
				0,
				&[descriptor_set],
				&[],
			);
			if !push_constants.is_empty() {
				self.device.cmd_push_constants(
					cmd,
					layout,
					vk::ShaderStageFlags::COMPUTE,
					0,
					push_constants,
				);
			}
			let (gx, gy) = GpuRuntime::compute_2d_groups(width, height, tile);
			self.device.cmd_dispatch(cmd, gx, gy, 1);
		}
	}

	/// Dispatches a 1D workload of `groups` workgroups (used by tree-sum and
	/// the radix-sort passes, which are not tile-shaped).
	pub fn dispatch_1d(
		&self,
		cmd: vk::CommandBuffer,
		pipeline: vk::Pipeline,
		layout: vk::PipelineLayout,
		descriptor_set: vk::DescriptorSet,
		push_constants: &[u8],
		groups: u32,
	) {
		unsafe {
			self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
			self.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				layout,
				0,
				&[descriptor_set],
				&[],
			);
			if !push_constants.is_empty() {
				self.device.cmd_push_constants(
					cmd,
					layout,
					vk::ShaderStageFlags::COMPUTE,
					0,
					push_constants,
				);
			}
			self.device.cmd_dispatch(cmd, groups, 1, 1);
		}
	}

	/// Memory barrier between two compute dispatches where the producer
	/// writes a buffer/image the consumer reads (§5: srcStage=dstStage=
	/// COMPUTE_SHADER, srcAccess=SHADER_WRITE, dstAccess=SHADER_READ).
	pub fn barrier_compute_to_compute(&self, cmd: vk::CommandBuffer) {
		let barrier = vk::MemoryBarrier::default()
			.src_access_mask(vk::AccessFlags::SHADER_WRITE)
			.dst_access_mask(vk::AccessFlags::SHADER_READ);

		unsafe {
			self.device.cmd_pipeline_barrier(
				cmd,
				vk::PipelineStageFlags::COMPUTE_SHADER,
				vk::PipelineStageFlags::COMPUTE_SHADER,
				vk::DependencyFlags::empty(),
				&[barrier],
				&[],
				&[],
			);
		}
	}

	/// Memory barrier guarding a compute write that is about to be read back
	/// by a transfer-queue copy (§5: dstAccess adds TRANSFER_READ).
	pub fn barrier_compute_to_transfer(&self, cmd: vk::CommandBuffer) {
		let barrier = vk::MemoryBarrier::default()
			.src_access_mask(vk::AccessFlags::SHADER_WRITE)
			.dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ);

		unsafe {
			self.device.cmd_pipeline_barrier(
				cmd,
				vk::PipelineStageFlags::COMPUTE_SHADER,
				vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
				vk::DependencyFlags::empty(),
				&[barrier],
				&[],
				&[],
			);
		}
	}

	/// Transitions `image` to `TRANSFER_DST_OPTIMAL`, copies the whole image
	/// from `src` starting at `src_offset`, then transitions to `GENERAL` so a
	/// compute shader can `imageLoad`/`imageStore` it directly afterwards.
	pub fn cmd_upload_image(
		&self,
		cmd: vk::CommandBuffer,
		src: vk::Buffer,
		src_offset: u64,
		image: &crate::gpu::Image,
	) {
		let subresource = vk::ImageSubresourceRange {
			aspect_mask: vk::ImageAspectFlags::COLOR,
			base_mip_level: 0,
			level_count: 1,
			base_array_layer: 0,
			layer_count: 1,
		};

		let to_transfer_dst = vk::ImageMemoryBarrier::default()
			.old_layout(vk::ImageLayout::UNDEFINED)
			.new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
			.src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
			.dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
			.image(image.image)
			.subresource_range(subresource)
			.dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);

		unsafe {
			self.device.cmd_pipeline_barrier(
				cmd,
				vk::PipelineStageFlags::TOP_OF_PIPE,
				vk::PipelineStageFlags::TRANSFER,
				vk::DependencyFlags::empty(),
				&[],
				&[],
				&[to_transfer_dst],
			);

			let region = vk::BufferImageCopy {
				buffer_offset: src_offset,
				buffer_row_length: 0,
				buffer_image_height: 0,
				image_subresource: vk::ImageSubresourceLayers {
					aspect_mask: vk::ImageAspectFlags::COLOR,
					mip_level: 0,
					base_array_layer: 0,
					layer_count: 1,
				},
				image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
				image_extent: vk::Extent3D { width: image.width, height: image.height, depth: 1 },
			};
			self.device.cmd_copy_buffer_to_image(cmd, src, image.image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);

			// dst stage/access stay within what the transfer queue supports; the
			// upload-done semaphore (waited on at COMPUTE_SHADER) is what makes
			// this transition visible to the compute queue's imageLoad/Store.
			let to_general = vk::ImageMemoryBarrier::default()
				.old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
				.new_layout(vk::ImageLayout::GENERAL)
				.src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
				.dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
				.image(image.image)
				.subresource_range(subresource)
				.src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
				.dst_access_mask(vk::AccessFlags::empty());

			self.device.cmd_pipeline_barrier(
				cmd,
				vk::PipelineStageFlags::TRANSFER,
				vk::PipelineStageFlags::BOTTOM_OF_PIPE,
				vk::DependencyFlags::empty(),
				&[],
				&[],
				&[to_general],
			);
		}
	}

	pub fn cmd_copy_buffer(
		&self,
		cmd: vk::CommandBuffer,
		src: vk::Buffer,
		src_offset: u64,
		dst: vk::Buffer,
		dst_offset: u64,
		size: u64,
	) {
		unsafe {
			self.device.cmd_copy_buffer(
				cmd,
				src,
				dst,
				&[vk::BufferCopy { src_offset, dst_offset, size }],
			);
		}
	}

	/// Zero-fills `size` bytes of `buffer` at `offset` -- used to clear an
	/// accumulator before a sequence of additive dispatches writes into it.
	pub fn cmd_fill_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, size: u64) {
		unsafe {
			self.device.cmd_fill_buffer(cmd, buffer, offset, size, 0);
		}
	}

	/// One-shot blocking device<->host copy used by the FFT host round-trip
	/// (§4.6a). Records, submits, and waits on the compute queue via the
	/// dedicated `cmd_fft` buffer, kept separate from `cmd_transfer` since a
	/// metric's own upload/readback submission on that buffer may still be
	/// in flight while its compute stage (and thus the FFT round-trip) runs.
	pub fn copy_device_buffer_to_staging_blocking(
		&self,
		src: vk::Buffer,
		src_offset: u64,
		dst_staging: vk::Buffer,
		size: u64,
	) -> Result<()> {
		self.blocking_copy(src, src_offset, dst_staging, 0, size)
	}

	pub fn copy_staging_to_device_buffer_blocking(
		&self,
		src_staging: vk::Buffer,
		dst: vk::Buffer,
		dst_offset: u64,
		size: u64,
	) -> Result<()> {
		self.blocking_copy(src_staging, 0, dst, dst_offset, size)
	}

	/// One-shot blocking host->device image upload, used for GPU resources
	/// that are built once at pipeline-construction time (e.g. a colormap
	/// lookup texture) rather than per-invocation. Runs on the same dedicated
	/// `cmd_fft` buffer as the blocking buffer copies above.
	pub fn upload_image_blocking(&self, staging: vk::Buffer, staging_offset: u64, image: &crate::gpu::Image) -> Result<()> {
		let cmd = self.cmd_fft;
		self.begin_cmd(cmd)?;
		self.cmd_upload_image(cmd, staging, staging_offset, image);
		self.end_cmd(cmd)?;
		self.submit(self.compute_queue, cmd, None, None, vk::Fence::null())?;
		unsafe { self.device.queue_wait_idle(self.compute_queue) }
			.map_err(|e| Error::GpuExecution(format!("queue_wait_idle failed: {e}")))
	}

	fn blocking_copy(
		&self,
		src: vk::Buffer,
		src_offset: u64,
		dst: vk::Buffer,
		dst_offset: u64,
		size: u64,
	) -> Result<()> {
		let cmd = self.cmd_fft;
		self.begin_cmd(cmd)?;
		self.cmd_copy_buffer(cmd, src, src_offset, dst, dst_offset, size);
		self.end_cmd(cmd)?;
		self.submit(self.compute_queue, cmd, None, None, vk::Fence::null())?;
		unsafe { self.device.queue_wait_idle(self.compute_queue) }
			.map_err(|e| Error::GpuExecution(format!("queue_wait_idle failed: {e}")))
	}

	/// Submits `cmd` on `queue`, optionally waiting on `wait_semaphore` and
	/// signalling `signal_semaphore` and/or `fence`.
	pub fn submit(
		&self,
		queue: vk::Queue,
		cmd: vk::CommandBuffer,
		wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
		signal_semaphore: Option<vk::Semaphore>,
		fence: vk::Fence,
	) -> Result<()> {
		let cmds = [cmd];
		let waits: Vec<vk::Semaphore> = wait_semaphore.iter().map(|(s, _)| *s).collect();
		let wait_stages: Vec<vk::PipelineStageFlags> =
			wait_semaphore.iter().map(|(_, stage)| *stage).collect();
		let signals: Vec<vk::Semaphore> = signal_semaphore.into_iter().collect();

		let submit_info = vk::SubmitInfo::default()
			.command_buffers(&cmds)
			.wait_semaphores(&waits)
			.wait_dst_stage_mask(&wait_stages)
			.signal_semaphores(&signals);

		unsafe { self.device.queue_submit(queue, &[submit_info], fence) }
			.map_err(|e| Error::GpuExecution(format!("queue_submit failed: {e}")))
	}
}
