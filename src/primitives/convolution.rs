//! 2D convolution with bias + ReLU (§4.2). Three pipeline variants share one
//! shader source, differing only in the `KERNEL_SIZE` specialization
//! constant (11, 5, 3); the K=11 variant is always invoked with stride 4.

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
	pub in_channels: u32,
	pub out_channels: u32,
	pub out_width: u32,
	pub out_height: u32,
	pub stride: u32,
	pub padding: u32,
}

pub enum KernelSize {
	Big11,
	Medium5,
	Small3,
}

impl KernelSize {
	fn value(&self) -> u32 {
		match self {
			KernelSize::Big11 => 11,
			KernelSize::Medium5 => 5,
			KernelSize::Small3 => 3,
		}
	}
}

pub struct Convolution {
	descriptor_set_layout: vk::DescriptorSetLayout,
	pipeline_layout: vk::PipelineLayout,
	big: vk::Pipeline,
	medium: vk::Pipeline,
	small: vk::Pipeline,
	descriptor_pool: vk::DescriptorPool,
}

impl Convolution {
	pub fn new(gpu: &GpuRuntime, max_sets: u32) -> Result<Self> {
		let shader = super::load_shader(gpu, "convolution")?;

		let descriptor_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;

		let pipeline_layout = gpu.create_pipeline_layout(
			&[descriptor_set_layout],
			std::mem::size_of::<PushConstants>() as u32,
		)?;

		// Each KernelSize variant needs its own pipeline object because the
		// loop bound is a specialization constant, not a push constant; the
		// shader module and pipeline layout are shared across all three.
		let big =
			gpu.create_compute_pipeline_specialized(shader, pipeline_layout, super::entry_point(), KernelSize::Big11.value())?;
		let medium = gpu.create_compute_pipeline_specialized(
			shader,
			pipeline_layout,
			super::entry_point(),
			KernelSize::Medium5.value(),
		)?;
		let small = gpu.create_compute_pipeline_specialized(
			shader,
			pipeline_layout,
			super::entry_point(),
			KernelSize::Small3.value(),
		)?;

		let descriptor_pool = gpu.create_descriptor_pool(
			max_sets,
			&[vk::DescriptorPoolSize {
				ty: vk::DescriptorType::STORAGE_BUFFER,
				descriptor_count: max_sets * 4,
			}],
		)?;

		Ok(Self { descriptor_set_layout, pipeline_layout, big, medium, small, descriptor_pool })
	}

	pub fn allocate_descriptor_set(
		&self,
		gpu: &GpuRuntime,
		input: vk::Buffer,
		input_range: u64,
		weights: vk::Buffer,
		weights_range: u64,
		bias: vk::Buffer,
		bias_range: u64,
		output: vk::Buffer,
		output_range: u64,
	) -> Result<vk::DescriptorSet> {
		let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.descriptor_set_layout])?[0];
		let infos = [
			buffer_info(input, 0, input_range),
			buffer_info(weights, 0, weights_range),
			buffer_info(bias, 0, bias_range),
			buffer_info(output, 0, output_range),
		];
		let writes: Vec<_> =
			infos.iter().enumerate().map(|(i, info)| buffer_write(set, i as u32, std::slice::from_ref(info))).collect();
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
		Ok(set)
	}

	pub fn record(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		descriptor_set: vk::DescriptorSet,
		kernel: KernelSize,
		pc: PushConstants,
	) {
		let pipeline = match kernel {
			KernelSize::Big11 => self.big,
			KernelSize::Medium5 => self.medium,
			KernelSize::Small3 => self.small,
		};
		let groups_z = pc.out_channels;
		let pc_bytes = bytemuck::bytes_of(&pc);

		unsafe {
			gpu.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
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
				pc_bytes,
			);
			let (gx, gy) = GpuRuntime::compute_2d_groups(pc.out_width, pc.out_height, 16);
			gpu.device.cmd_dispatch(cmd, gx, gy, groups_z);
		}
	}

	/// Output spatial size for a given input size, kernel, stride and
	/// padding, per §4.2's convolution formula.
	pub fn output_size(in_size: u32, kernel: &KernelSize, stride: u32, padding: u32) -> u32 {
		(in_size + 2 * padding - kernel.value()) / stride + 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn block0_output_size_matches_lpips_big_stride4() {
		// 224 input, kernel 11, pad 2, stride 4 -> (224+4-11)/4+1 = 55
		let size = Convolution::output_size(224, &KernelSize::Big11, 4, 2);
		assert_eq!(size, 55);
	}
}
