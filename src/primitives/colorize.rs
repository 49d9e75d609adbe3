//! Maps a single-channel float image through a 256x1 colormap to RGBA u8.
//! Grounded directly on the reference `Colorize` component: one descriptor
//! set layout (3 storage images), one push-constant range of 2 words.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::{GpuRuntime, Image};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PushConstants {
	invert: i32,
	scaler: f32,
}

pub struct Colorize {
	shader: vk::ShaderModule,
	pub descriptor_set_layout: vk::DescriptorSetLayout,
	pub pipeline_layout: vk::PipelineLayout,
	pub pipeline: vk::Pipeline,
	descriptor_pool: vk::DescriptorPool,
}

impl Colorize {
	pub fn new(gpu: &GpuRuntime) -> Result<Self> {
		let shader = super::load_shader(gpu, "colorize")?;

		let descriptor_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
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
			4,
			&[vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 12 }],
		)?;

		Ok(Self { shader, descriptor_set_layout, pipeline_layout, pipeline, descriptor_pool })
	}

	pub fn allocate_descriptor_set(
		&self,
		gpu: &GpuRuntime,
		input: &Image,
		output: &Image,
		colormap: &Image,
	) -> Result<vk::DescriptorSet> {
		let sets = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.descriptor_set_layout])?;
		let set = sets[0];

		let infos = [
			image_info(input.view),
			image_info(output.view),
			image_info(colormap.view),
		];
		let writes = [
			image_write(set, 0, std::slice::from_ref(&infos[0])),
			image_write(set, 1, std::slice::from_ref(&infos[1])),
			image_write(set, 2, std::slice::from_ref(&infos[2])),
		];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };

		Ok(set)
	}

	/// Records the dispatch: `p` in [0,1] -> colormap lookup, optionally
	/// inverted and rescaled by `scaler` before the lookup.
	pub fn record(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		descriptor_set: vk::DescriptorSet,
		width: u32,
		height: u32,
		invert: bool,
		scaler: f32,
	) {
		let pc = PushConstants { invert: invert as i32, scaler };
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

pub(crate) fn image_info(view: vk::ImageView) -> vk::DescriptorImageInfo {
	vk::DescriptorImageInfo {
		sampler: vk::Sampler::null(),
		image_view: view,
		image_layout: vk::ImageLayout::GENERAL,
	}
}

pub(crate) fn image_write<'a>(
	set: vk::DescriptorSet,
	binding: u32,
	infos: &'a [vk::DescriptorImageInfo],
) -> vk::WriteDescriptorSet<'a> {
	vk::WriteDescriptorSet::default()
		.dst_set(set)
		.dst_binding(binding)
		.descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
		.image_info(infos)
}
