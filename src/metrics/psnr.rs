//! PSNR (§4.3): pack per-pixel squared distance, tree-sum to a single MSE
//! numerator, then postprocess into decibels. Three color-channel variants
//! share one pack shader, selected by a push-constant switch.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use image::RgbaImage;

use crate::config::PsnrVariant;
use crate::error::{Error, Result};
use crate::gpu::{Buffer, GpuRuntime, Image};
use crate::orchestrator::{self, MetricPipeline, MetricResult, Resources};
use crate::primitives::tree_sum::TreeSum;
use crate::primitives::{buffer_info, buffer_write, entry_point, image_info, image_write, load_shader};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PackPushConstants {
	width: u32,
	height: u32,
	variant: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PostprocessPushConstants {
	pixel_count: u32,
}

/// Per-invocation device resources; recreated whenever the image size changes.
struct Invocation {
	width: u32,
	height: u32,
	test_image: Image,
	ref_image: Image,
	diff: Buffer,
	pack_set: vk::DescriptorSet,
	tree_sum_set: vk::DescriptorSet,
	postprocess_set: vk::DescriptorSet,
}

pub struct Psnr {
	variant: PsnrVariant,

	pack_set_layout: vk::DescriptorSetLayout,
	pack_pipeline_layout: vk::PipelineLayout,
	pack_pipeline: vk::Pipeline,

	postprocess_set_layout: vk::DescriptorSetLayout,
	postprocess_pipeline_layout: vk::PipelineLayout,
	postprocess_pipeline: vk::Pipeline,

	descriptor_pool: vk::DescriptorPool,
	tree_sum: TreeSum,

	invocation: Option<Invocation>,
}

impl Psnr {
	pub fn new(gpu: &GpuRuntime, variant: PsnrVariant) -> Result<Self> {
		let pack_shader = load_shader(gpu, "psnr_pack")?;
		let pack_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let pack_pipeline_layout =
			gpu.create_pipeline_layout(&[pack_set_layout], std::mem::size_of::<PackPushConstants>() as u32)?;
		let pack_pipeline = gpu.create_compute_pipeline(pack_shader, pack_pipeline_layout, entry_point())?;

		let postprocess_shader = load_shader(gpu, "psnr_postprocess")?;
		let postprocess_set_layout = gpu.create_descriptor_set_layout(&[(vk::DescriptorType::STORAGE_BUFFER, 1)])?;
		let postprocess_pipeline_layout = gpu.create_pipeline_layout(
			&[postprocess_set_layout],
			std::mem::size_of::<PostprocessPushConstants>() as u32,
		)?;
		let postprocess_pipeline =
			gpu.create_compute_pipeline(postprocess_shader, postprocess_pipeline_layout, entry_point())?;

		let descriptor_pool = gpu.create_descriptor_pool(
			2,
			&[
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 2 },
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 2 },
			],
		)?;

		let tree_sum = TreeSum::new(gpu, 1)?;

		Ok(Self {
			variant,
			pack_set_layout,
			pack_pipeline_layout,
			pack_pipeline,
			postprocess_set_layout,
			postprocess_pipeline_layout,
			postprocess_pipeline,
			descriptor_pool,
			tree_sum,
			invocation: None,
		})
	}

	fn build_invocation(&self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Invocation> {
		let test_image = gpu.create_image(
			width,
			height,
			vk::Format::R8G8B8A8_UNORM,
			vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
		)?;
		let ref_image = gpu.create_image(
			width,
			height,
			vk::Format::R8G8B8A8_UNORM,
			vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
		)?;
		let diff_size = (width as u64) * (height as u64) * 4;
		let diff = gpu.create_buffer(
			diff_size,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			MemoryLocation::GpuOnly,
		)?;

		let pack_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.pack_set_layout])?[0];
		let img_infos = [image_info(test_image.view), image_info(ref_image.view)];
		let buf_infos = [buffer_info(diff.buffer, 0, diff_size)];
		let writes = [
			image_write(pack_set, 0, &img_infos[0..1]),
			image_write(pack_set, 1, &img_infos[1..2]),
			buffer_write(pack_set, 2, &buf_infos),
		];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };

		let tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, diff.buffer, diff_size, diff.buffer, diff_size)?;

		let postprocess_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.postprocess_set_layout])?[0];
		let pp_infos = [buffer_info(diff.buffer, 0, diff_size)];
		let pp_writes = [buffer_write(postprocess_set, 0, &pp_infos)];
		unsafe { gpu.device.update_descriptor_sets(&pp_writes, &[]) };

		Ok(Invocation { width, height, test_image, ref_image, diff, pack_set, tree_sum_set, postprocess_set })
	}
}

impl MetricPipeline for Psnr {
	fn prepare(&mut self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Resources> {
		let invocation = self.build_invocation(gpu, width, height)?;
		self.invocation = Some(invocation);

		let image_bytes = (width as u64) * (height as u64) * 4;
		Resources::new(gpu, image_bytes * 2, 4)
	}

	fn record_upload(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run before record_upload");
		let test_bytes = (invocation.width as u64) * (invocation.height as u64) * 4;
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, 0, &invocation.test_image);
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, test_bytes, &invocation.ref_image);
		Ok(())
	}

	fn record_compute(&mut self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, _resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run before record_compute");

		let pc = PackPushConstants { width: invocation.width, height: invocation.height, variant: self.variant as i32 };
		gpu.dispatch_2d(
			cmd,
			self.pack_pipeline,
			self.pack_pipeline_layout,
			invocation.pack_set,
			bytemuck::bytes_of(&pc),
			invocation.width,
			invocation.height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let pixel_count = invocation.width * invocation.height;
		for count in TreeSum::round_sizes(pixel_count) {
			self.tree_sum.record(gpu, cmd, invocation.tree_sum_set, count);
			gpu.barrier_compute_to_compute(cmd);
		}

		let pp = PostprocessPushConstants { pixel_count };
		unsafe {
			gpu.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.postprocess_pipeline);
			gpu.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				self.postprocess_pipeline_layout,
				0,
				&[invocation.postprocess_set],
				&[],
			);
			gpu.device.cmd_push_constants(
				cmd,
				self.postprocess_pipeline_layout,
				vk::ShaderStageFlags::COMPUTE,
				0,
				bytemuck::bytes_of(&pp),
			);
			gpu.device.cmd_dispatch(cmd, 1, 1, 1);
		}
		gpu.barrier_compute_to_transfer(cmd);

		Ok(())
	}

	fn record_readback(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run before record_readback");
		gpu.cmd_copy_buffer(cmd, invocation.diff.buffer, 0, resources.staging_out.buffer, 0, 4);
		Ok(())
	}

	fn map_result(&self, _gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult> {
		let bytes = resources.read_staging_out(0, 4)?;
		let value = f32::from_le_bytes(bytes.try_into().unwrap());
		Ok(MetricResult::Scalar(value))
	}
}

/// Uploads `test`/`reference` as RGBA8 and returns the PSNR value in dB.
pub fn compute(gpu: &GpuRuntime, variant: PsnrVariant, test: &RgbaImage, reference: &RgbaImage) -> Result<f32> {
	let (width, height) = super::check_same_size(test, reference)?;
	let mut psnr = Psnr::new(gpu, variant)?;

	let result = orchestrator::run_invocation(gpu, &mut psnr, width, height, |resources| {
		let test_bytes = (width as u64) * (height as u64) * 4;
		resources.write_staging_in(0, test.as_raw())?;
		resources.write_staging_in(test_bytes, reference.as_raw())?;
		Ok(())
	})?;

	match result {
		MetricResult::Scalar(value) => Ok(value),
		MetricResult::Pair(value, _) => Err(Error::Unsupported(format!("PSNR returned a pair: {value}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pack_push_constants_size_matches_shader_layout() {
		assert_eq!(std::mem::size_of::<PackPushConstants>(), 12);
	}
}
