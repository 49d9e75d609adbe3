//! Separable Gaussian blur (§4.2): two passes over a scratch image sharing
//! one pipeline, selected by a `horizontal` push-constant flag.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::{GpuRuntime, Image};

use super::{image_info, image_write};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PushConstants {
	kernel_size: i32,
	horizontal: i32,
	sigma: f32,
}

pub struct GaussianBlur {
	pub descriptor_set_layout: vk::DescriptorSetLayout,
	pub pipeline_layout: vk::PipelineLayout,
	pub pipeline: vk::Pipeline,
	descriptor_pool: vk::DescriptorPool,
}

impl GaussianBlur {
	pub fn new(gpu: &GpuRuntime, max_passes: u32) -> Result<Self> {
		let shader = super::load_shader(gpu, "gaussian_blur")?;

		let descriptor_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
		])?;

		let pipeline_layout = gpu.create_pipeline_layout(
			&[descriptor_set_layout],
			std::mem::size_of::<PushConstants>() as u32,
		)?;

		let pipeline =
			gpu.create_compute_pipeline(shader, pipeline_layout, super::entry_point())?;

		let descriptor_pool = gpu.create_descriptor_pool(
			max_passes,
			&[vk::DescriptorPoolSize {
				ty: vk::DescriptorType::STORAGE_IMAGE,
				descriptor_count: max_passes * 2,
			}],
		)?;

		Ok(Self { descriptor_set_layout, pipeline_layout, pipeline, descriptor_pool })
	}

	pub fn allocate_descriptor_set(
		&self,
		gpu: &GpuRuntime,
		input: &Image,
		output: &Image,
	) -> Result<vk::DescriptorSet> {
		let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.descriptor_set_layout])?[0];
		let infos = [image_info(input.view), image_info(output.view)];
		let writes = [image_write(set, 0, &infos[0..1]), image_write(set, 1, &infos[1..2])];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
		Ok(set)
	}

	/// Records one pass (horizontal or vertical) over `width`x`height`.
	pub fn record(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		descriptor_set: vk::DescriptorSet,
		width: u32,
		height: u32,
		kernel_size: u32,
		sigma: f32,
		horizontal: bool,
	) {
		let pc = PushConstants { kernel_size: kernel_size as i32, horizontal: horizontal as i32, sigma };
		gpu.dispatch_2d(
			cmd,
			self.pipeline,
			self.pipeline_layout,
			descriptor_set,
			bytemuck::bytes_of(&pc),
			width,
			height,
			16,
		);
	}
}
