//! 4-pass 8-bit radix sort over float-bit keys (§4.2). Even passes read set
//! A / write set B; odd passes read set B / write set A, via two dual
//! descriptor sets, matching the reference's `descSetSortEven/Odd` and
//! `descSetSortHistogramEven/Odd` pair.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::GpuRuntime;

use super::{buffer_info, buffer_write};

const BLOCK_SIZE: u32 = 32;
const HISTOGRAM_WORKGROUP: u32 = 256;
const DIGIT_BITS: u32 = 8;
const PASSES: u32 = 4;

/// Transforms an `f32` bit pattern so unsigned numeric order matches float
/// order: flip all bits if the sign bit is set, else flip just the sign bit.
pub fn float_sort_key(value: f32) -> u32 {
	let bits = value.to_bits();
	if bits & 0x8000_0000 != 0 {
		!bits
	} else {
		bits | 0x8000_0000
	}
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HistogramPushConstants {
	count: u32,
	pass_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ScatterPushConstants {
	count: u32,
	pass_index: u32,
}

pub struct RadixSort {
	histogram_set_layout: vk::DescriptorSetLayout,
	histogram_pipeline_layout: vk::PipelineLayout,
	histogram_pipeline: vk::Pipeline,

	scatter_set_layout: vk::DescriptorSetLayout,
	scatter_pipeline_layout: vk::PipelineLayout,
	scatter_pipeline: vk::Pipeline,

	descriptor_pool: vk::DescriptorPool,
}

impl RadixSort {
	pub fn new(gpu: &GpuRuntime, max_invocations: u32) -> Result<Self> {
		let hist_shader = super::load_shader(gpu, "radix_sort_histogram")?;
		let scatter_shader = super::load_shader(gpu, "radix_sort_scatter")?;

		let histogram_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let histogram_pipeline_layout = gpu.create_pipeline_layout(
			&[histogram_set_layout],
			std::mem::size_of::<HistogramPushConstants>() as u32,
		)?;
		let histogram_pipeline = gpu.create_compute_pipeline(
			hist_shader,
			histogram_pipeline_layout,
			super::entry_point(),
		)?;

		let scatter_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let scatter_pipeline_layout = gpu.create_pipeline_layout(
			&[scatter_set_layout],
			std::mem::size_of::<ScatterPushConstants>() as u32,
		)?;
		let scatter_pipeline =
			gpu.create_compute_pipeline(scatter_shader, scatter_pipeline_layout, super::entry_point())?;

		let sets_per_invocation = 2 /* histogram even/odd */ + 2 /* scatter even/odd */;
		let descriptor_pool = gpu.create_descriptor_pool(
			max_invocations * sets_per_invocation,
			&[vk::DescriptorPoolSize {
				ty: vk::DescriptorType::STORAGE_BUFFER,
				descriptor_count: max_invocations * sets_per_invocation * 5,
			}],
		)?;

		Ok(Self {
			histogram_set_layout,
			histogram_pipeline_layout,
			histogram_pipeline,
			scatter_set_layout,
			scatter_pipeline_layout,
			scatter_pipeline,
			descriptor_pool,
		})
	}

	pub fn workgroup_count(count: u32) -> u32 {
		count.div_ceil(HISTOGRAM_WORKGROUP * BLOCK_SIZE)
	}

	pub fn allocate_histogram_set(
		&self,
		gpu: &GpuRuntime,
		keys: vk::Buffer,
		keys_range: u64,
		histograms: vk::Buffer,
		histograms_range: u64,
	) -> Result<vk::DescriptorSet> {
		let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.histogram_set_layout])?[0];
		let infos = [buffer_info(keys, 0, keys_range), buffer_info(histograms, 0, histograms_range)];
		let writes = [buffer_write(set, 0, &infos[0..1]), buffer_write(set, 1, &infos[1..2])];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
		Ok(set)
	}

	#[allow(clippy::too_many_arguments)]
	pub fn allocate_scatter_set(
		&self,
		gpu: &GpuRuntime,
		src_keys: vk::Buffer,
		src_values: vk::Buffer,
		prefix_sums: vk::Buffer,
		dst_keys: vk::Buffer,
		dst_values: vk::Buffer,
		range: u64,
	) -> Result<vk::DescriptorSet> {
		let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.scatter_set_layout])?[0];
		let infos = [
			buffer_info(src_keys, 0, range),
			buffer_info(src_values, 0, range),
			buffer_info(prefix_sums, 0, range),
			buffer_info(dst_keys, 0, range),
			buffer_info(dst_values, 0, range),
		];
		let writes: Vec<_> =
			infos.iter().enumerate().map(|(i, info)| buffer_write(set, i as u32, std::slice::from_ref(info))).collect();
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
		Ok(set)
	}

	pub fn record_histogram(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		descriptor_set: vk::DescriptorSet,
		count: u32,
		pass_index: u32,
	) {
		let pc = HistogramPushConstants { count, pass_index };
		gpu.dispatch_1d(
			cmd,
			self.histogram_pipeline,
			self.histogram_pipeline_layout,
			descriptor_set,
			bytemuck::bytes_of(&pc),
			Self::workgroup_count(count),
		);
	}

	pub fn record_scatter(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		descriptor_set: vk::DescriptorSet,
		count: u32,
		pass_index: u32,
	) {
		let pc = ScatterPushConstants { count, pass_index };
		gpu.dispatch_1d(
			cmd,
			self.scatter_pipeline,
			self.scatter_pipeline_layout,
			descriptor_set,
			bytemuck::bytes_of(&pc),
			Self::workgroup_count(count),
		);
	}

	pub fn digit_bits() -> u32 {
		DIGIT_BITS
	}

	pub fn pass_count() -> u32 {
		PASSES
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn float_sort_key_preserves_order() {
		let values = [-100.0f32, -3.5, -0.0, 0.0, 1.0, 2.5, 100.0];
		let keys: Vec<u32> = values.iter().map(|v| float_sort_key(*v)).collect();
		for pair in keys.windows(2) {
			assert!(pair[0] <= pair[1]);
		}
	}

	#[test]
	fn four_passes_cover_32_bits() {
		assert_eq!(RadixSort::pass_count() * RadixSort::digit_bits(), 32);
	}
}
