//! 3x3 stride-2 max-pool (§4.2).

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::GpuRuntime;

use super::{buffer_info, buffer_write};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
	pub in_width: u32,
	pub in_height: u32,
	pub channels: u32,
	pub out_width: u32,
	pub out_height: u32,
}

pub struct MaxPool {
	descriptor_set_layout: vk::DescriptorSetLayout,
	pipeline_layout: vk::PipelineLayout,
	pipeline: vk::Pipeline,
	descriptor_pool: vk::DescriptorPool,
}

impl MaxPool {
	pub fn new(gpu: &GpuRuntime, max_sets: u32) -> Result<Self> {
		let shader = super::load_shader(gpu, "maxpool")?;

		let descriptor_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;

		let pipeline_layout = gpu.create_pipeline_layout(
			&[descriptor_set_layout],
			std::mem::size_of::<PushConstants>() as u32,
		)?;

		let pipeline =
			gpu.create_compute_pipeline(shader, pipeline_layout, super::entry_point())?;

		let descriptor_pool = gpu.create_descriptor_pool(
			max_sets,
			&[vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: max_sets * 2 }],
		)?;

		Ok(Self { descriptor_set_layout, pipeline_layout, pipeline, descriptor_pool })
	}

	pub fn allocate_descriptor_set(
		&self,
		gpu: &GpuRuntime,
		input: vk::Buffer,
		input_range: u64,
		output: vk::Buffer,
		output_range: u64,
	) -> Result<vk::DescriptorSet> {
		let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.descriptor_set_layout])?[0];
		let infos = [buffer_info(input, 0, input_range), buffer_info(output, 0, output_range)];
		let writes = [buffer_write(set, 0, &infos[0..1]), buffer_write(set, 1, &infos[1..2])];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
		Ok(set)
	}

	pub fn record(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, descriptor_set: vk::DescriptorSet, pc: PushConstants) {
		unsafe {
			gpu.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
			gpu.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				self.pipeline_layout,
				0,
				&[descriptor_set],
				&[],
			);
			gpu.device.cmd_push_constants(
				cmd,
				self.pipeline_layout,
				vk::ShaderStageFlags::COMPUTE,
				0,
				bytemuck::bytes_of(&pc),
			);
			let (gx, gy) = GpuRuntime::compute_2d_groups(pc.out_width, pc.out_height, 16);
			gpu.device.cmd_dispatch(cmd, gx, gy, pc.channels);
		}
	}

	/// (W-3)/2 + 1, (H-3)/2 + 1.
	pub fn output_size(in_size: u32) -> u32 {
		(in_size - 3) / 2 + 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn output_size_matches_formula() {
		assert_eq!(MaxPool::output_size(55), 27);
	}
}
