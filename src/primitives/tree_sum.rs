//! Tree-sum reduction (§4.2): repeatedly launched until the working range
//! collapses to one element. Ping-pongs between two buffer views of the
//! caller's scratch buffer (or the same buffer read/written in place, since
//! each dispatch only ever reads indices the prior dispatch fully wrote).

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::GpuRuntime;

use super::{buffer_info, buffer_write};

const WORKGROUP_SIZE: u32 = 1024;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PushConstants {
	count: u32,
}

pub struct TreeSum {
	pub descriptor_set_layout: vk::DescriptorSetLayout,
	pub pipeline_layout: vk::PipelineLayout,
	pub pipeline: vk::Pipeline,
	descriptor_pool: vk::DescriptorPool,
}

impl TreeSum {
	pub fn new(gpu: &GpuRuntime, max_sets: u32) -> Result<Self> {
		let shader = super::load_shader(gpu, "tree_sum")?;

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
			&[vk::DescriptorPoolSize {
				ty: vk::DescriptorType::STORAGE_BUFFER,
				descriptor_count: max_sets * 2,
			}],
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

	/// Number of dispatches needed to reduce `n` floats to one, and the
	/// element count remaining after each round (for sizing scratch ranges).
	pub fn round_sizes(n: u32) -> Vec<u32> {
		let mut sizes = Vec::new();
		let mut remaining = n;
		while remaining > 1 {
			sizes.push(remaining);
			remaining = remaining.div_ceil(WORKGROUP_SIZE);
		}
		sizes
	}

	/// Records one reduction dispatch over `count` elements, one workgroup
	/// per up-to-1024 elements; barrier insertion between rounds is the
	/// caller's responsibility (`GpuRuntime::barrier_compute_to_compute`).
	pub fn record(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, descriptor_set: vk::DescriptorSet, count: u32) {
		let groups = count.div_ceil(WORKGROUP_SIZE);
		let pc = PushConstants { count };
		gpu.dispatch_1d(
			cmd,
			self.pipeline,
			self.pipeline_layout,
			descriptor_set,
			bytemuck::bytes_of(&pc),
			groups,
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_sizes_converge_to_one() {
		let sizes = TreeSum::round_sizes(13924);
		assert_eq!(sizes[0], 13924);
		assert!(*sizes.last().unwrap() <= WORKGROUP_SIZE);
		// Every round divides the element count by up to WORKGROUP_SIZE.
		for pair in sizes.windows(2) {
			assert!(pair[1] <= pair[0].div_ceil(WORKGROUP_SIZE));
		}
	}
}
