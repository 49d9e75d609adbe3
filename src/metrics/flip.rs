//! FLIP (§4.7): sRGB -> YCxCz, separable CSF prefilter, HyAB spatial color
//! error, separable point/edge feature filters with a feature-error combine,
//! final weighted composite, tree-sum to mean FLIP. Optionally colorizes the
//! per-pixel composite through a viridis-style ramp for the visualization.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::config::FlipArguments;
use crate::error::{Error, Result};
use crate::gpu::{Buffer, GpuRuntime, Image};
use crate::orchestrator::{self, MetricPipeline, MetricResult, Resources};
use crate::primitives::colorize::Colorize;
use crate::primitives::tree_sum::TreeSum;
use crate::primitives::{buffer_info, buffer_write, entry_point, image_info, image_write, load_shader};

const VIRIDIS_STOPS: [[f32; 3]; 5] = [
	[0.267, 0.005, 0.329],
	[0.229, 0.322, 0.545],
	[0.128, 0.567, 0.551],
	[0.369, 0.789, 0.383],
	[0.993, 0.906, 0.144],
];

/// Builds the 256x1 RGBA32F viridis-style lookup texture `Colorize` samples
/// from, linearly interpolating the stops the combine shader used to embed
/// directly before colorization moved to the shared primitive.
fn build_colormap() -> Vec<f32> {
	let mut data = Vec::with_capacity(256 * 4);
	let stops = VIRIDIS_STOPS.len();
	for i in 0..256u32 {
		let t = (i as f32 / 255.0) * (stops - 1) as f32;
		let lo = t.floor() as usize;
		let hi = (lo + 1).min(stops - 1);
		let frac = t.fract();
		let a = VIRIDIS_STOPS[lo];
		let b = VIRIDIS_STOPS[hi];
		data.push(a[0] + (b[0] - a[0]) * frac);
		data.push(a[1] + (b[1] - a[1]) * frac);
		data.push(a[2] + (b[2] - a[2]) * frac);
		data.push(1.0);
	}
	data
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CsfPushConstants {
	width: u32,
	height: u32,
	ppd: f32,
	radius: u32,
	stage: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ColorErrorPushConstants {
	width: u32,
	height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FeatureErrorPushConstants {
	width: u32,
	height: u32,
	radius: u32,
	stage: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CombinePushConstants {
	width: u32,
	height: u32,
}

struct Invocation {
	width: u32,
	height: u32,
	radius_spatial: u32,
	radius_feature: u32,

	final_err: Buffer,

	csf_set: vk::DescriptorSet,
	color_error_set: vk::DescriptorSet,
	feature_error_set: vk::DescriptorSet,
	combine_set: vk::DescriptorSet,
	colorize_set: vk::DescriptorSet,
	tree_sum_set: vk::DescriptorSet,

	_ycc_test: Image,
	_ycc_ref: Image,
	_scratch_test: Image,
	_scratch_ref: Image,
	_combined: Image,
	_visualization: Image,
	_color_err: Buffer,
	_feature_kernels: Buffer,
	_point_test: Buffer,
	_point_ref: Buffer,
	_edge_test: Buffer,
	_edge_ref: Buffer,
	_feature_err: Buffer,

	test_image: Image,
	ref_image: Image,
}

pub struct Flip {
	args: FlipArguments,
	colorize: bool,

	csf_set_layout: vk::DescriptorSetLayout,
	csf_pipeline_layout: vk::PipelineLayout,
	csf_pipeline: vk::Pipeline,

	color_error_set_layout: vk::DescriptorSetLayout,
	color_error_pipeline_layout: vk::PipelineLayout,
	color_error_pipeline: vk::Pipeline,

	feature_error_set_layout: vk::DescriptorSetLayout,
	feature_error_pipeline_layout: vk::PipelineLayout,
	feature_error_pipeline: vk::Pipeline,

	combine_set_layout: vk::DescriptorSetLayout,
	combine_pipeline_layout: vk::PipelineLayout,
	combine_pipeline: vk::Pipeline,

	colorizer: Colorize,
	colormap: Image,

	tree_sum: TreeSum,

	descriptor_pool: vk::DescriptorPool,
	invocation: Option<Invocation>,
}

fn make_rgba32f(gpu: &GpuRuntime, width: u32, height: u32) -> Result<Image> {
	gpu.create_image(width, height, vk::Format::R32G32B32A32_SFLOAT, vk::ImageUsageFlags::STORAGE)
}

impl Flip {
	pub fn new(gpu: &GpuRuntime, args: FlipArguments, colorize: bool) -> Result<Self> {
		let csf_shader = load_shader(gpu, "flip_csf")?;
		let csf_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
		])?;
		let csf_pipeline_layout =
			gpu.create_pipeline_layout(&[csf_set_layout], std::mem::size_of::<CsfPushConstants>() as u32)?;
		let csf_pipeline = gpu.create_compute_pipeline(csf_shader, csf_pipeline_layout, entry_point())?;

		let color_error_shader = load_shader(gpu, "flip_color_error")?;
		let color_error_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let color_error_pipeline_layout = gpu.create_pipeline_layout(
			&[color_error_set_layout],
			std::mem::size_of::<ColorErrorPushConstants>() as u32,
		)?;
		let color_error_pipeline =
			gpu.create_compute_pipeline(color_error_shader, color_error_pipeline_layout, entry_point())?;

		let feature_error_shader = load_shader(gpu, "flip_feature_error")?;
		let feature_error_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let feature_error_pipeline_layout = gpu.create_pipeline_layout(
			&[feature_error_set_layout],
			std::mem::size_of::<FeatureErrorPushConstants>() as u32,
		)?;
		let feature_error_pipeline =
			gpu.create_compute_pipeline(feature_error_shader, feature_error_pipeline_layout, entry_point())?;

		let combine_shader = load_shader(gpu, "flip_combine")?;
		let combine_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
		])?;
		let combine_pipeline_layout = gpu.create_pipeline_layout(
			&[combine_set_layout],
			std::mem::size_of::<CombinePushConstants>() as u32,
		)?;
		let combine_pipeline = gpu.create_compute_pipeline(combine_shader, combine_pipeline_layout, entry_point())?;

		let colorizer = Colorize::new(gpu)?;
		let colormap = gpu.create_image(
			256,
			1,
			vk::Format::R32G32B32A32_SFLOAT,
			vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
		)?;
		{
			let data = build_colormap();
			let bytes = bytemuck::cast_slice(&data);
			let mut staging = gpu.create_buffer(
				bytes.len() as u64,
				vk::BufferUsageFlags::TRANSFER_SRC,
				gpu_allocator::MemoryLocation::CpuToGpu,
			)?;
			{
				let mapped = staging
					.allocation
					.as_mut()
					.and_then(|a| a.mapped_slice_mut())
					.ok_or_else(|| Error::GpuResource("staging buffer is not host-visible".into()))?;
				mapped[..bytes.len()].copy_from_slice(bytes);
			}
			gpu.upload_image_blocking(staging.buffer, 0, &colormap)?;
		}

		let tree_sum = TreeSum::new(gpu, 1)?;

		let descriptor_pool = gpu.create_descriptor_pool(
			4,
			&[
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 11 },
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 10 },
			],
		)?;

		Ok(Self {
			args,
			colorize,
			csf_set_layout,
			csf_pipeline_layout,
			csf_pipeline,
			color_error_set_layout,
			color_error_pipeline_layout,
			color_error_pipeline,
			feature_error_set_layout,
			feature_error_pipeline_layout,
			feature_error_pipeline,
			combine_set_layout,
			combine_pipeline_layout,
			combine_pipeline,
			colorizer,
			colormap,
			tree_sum,
			descriptor_pool,
			invocation: None,
		})
	}

	fn build_invocation(&self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Invocation> {
		let radius_spatial = (self.args.spatial_kernel_size() - 1) / 2;
		let radius_feature = (self.args.feature_kernel_size() - 1) / 2;

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
		let ycc_test = make_rgba32f(gpu, width, height)?;
		let ycc_ref = make_rgba32f(gpu, width, height)?;
		let scratch_test = make_rgba32f(gpu, width, height)?;
		let scratch_ref = make_rgba32f(gpu, width, height)?;
		let combined = gpu.create_image(width, height, vk::Format::R32_SFLOAT, vk::ImageUsageFlags::STORAGE)?;
		let visualization =
			gpu.create_image(width, height, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::STORAGE)?;

		let plane_bytes = (width as u64) * (height as u64) * 4;
		let color_err = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let feature_kernels = gpu.create_buffer(
			((2 * radius_feature + 1) as u64) * 2 * 4,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let point_test = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let point_ref = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let edge_test = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let edge_ref = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let feature_err = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let final_err = gpu.create_buffer(
			plane_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;

		let csf_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.csf_set_layout])?[0];
		let csf_img_infos = [
			image_info(test_image.view),
			image_info(ref_image.view),
			image_info(ycc_test.view),
			image_info(ycc_ref.view),
			image_info(scratch_test.view),
			image_info(scratch_ref.view),
		];
		let csf_writes: Vec<_> = csf_img_infos
			.iter()
			.enumerate()
			.map(|(i, info)| image_write(csf_set, i as u32, std::slice::from_ref(info)))
			.collect();
		unsafe { gpu.device.update_descriptor_sets(&csf_writes, &[]) };

		let color_error_set =
			gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.color_error_set_layout])?[0];
		let color_error_img_infos = [image_info(ycc_test.view), image_info(ycc_ref.view)];
		let color_error_buf_infos = [buffer_info(color_err.buffer, 0, plane_bytes)];
		let color_error_writes = [
			image_write(color_error_set, 0, &color_error_img_infos[0..1]),
			image_write(color_error_set, 1, &color_error_img_infos[1..2]),
			buffer_write(color_error_set, 2, &color_error_buf_infos),
		];
		unsafe { gpu.device.update_descriptor_sets(&color_error_writes, &[]) };

		let feature_error_set =
			gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.feature_error_set_layout])?[0];
		let feature_error_img_infos = [image_info(ycc_test.view), image_info(ycc_ref.view)];
		let feature_error_buf_infos = [
			buffer_info(feature_kernels.buffer, 0, ((2 * radius_feature + 1) as u64) * 2 * 4),
			buffer_info(point_test.buffer, 0, plane_bytes),
			buffer_info(point_ref.buffer, 0, plane_bytes),
			buffer_info(edge_test.buffer, 0, plane_bytes),
			buffer_info(edge_ref.buffer, 0, plane_bytes),
			buffer_info(feature_err.buffer, 0, plane_bytes),
		];
		let feature_error_writes = [
			image_write(feature_error_set, 0, &feature_error_img_infos[0..1]),
			image_write(feature_error_set, 1, &feature_error_img_infos[1..2]),
			buffer_write(feature_error_set, 2, &feature_error_buf_infos[0..1]),
			buffer_write(feature_error_set, 3, &feature_error_buf_infos[1..2]),
			buffer_write(feature_error_set, 4, &feature_error_buf_infos[2..3]),
			buffer_write(feature_error_set, 5, &feature_error_buf_infos[3..4]),
			buffer_write(feature_error_set, 6, &feature_error_buf_infos[4..5]),
			buffer_write(feature_error_set, 7, &feature_error_buf_infos[5..6]),
		];
		unsafe { gpu.device.update_descriptor_sets(&feature_error_writes, &[]) };

		let combine_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.combine_set_layout])?[0];
		let combine_buf_infos = [
			buffer_info(color_err.buffer, 0, plane_bytes),
			buffer_info(feature_err.buffer, 0, plane_bytes),
			buffer_info(final_err.buffer, 0, plane_bytes),
		];
		let combine_img_infos = [image_info(combined.view)];
		let combine_writes = [
			buffer_write(combine_set, 0, &combine_buf_infos[0..1]),
			buffer_write(combine_set, 1, &combine_buf_infos[1..2]),
			buffer_write(combine_set, 2, &combine_buf_infos[2..3]),
			image_write(combine_set, 3, &combine_img_infos),
		];
		unsafe { gpu.device.update_descriptor_sets(&combine_writes, &[]) };

		let colorize_set =
			self.colorizer.allocate_descriptor_set(gpu, &combined, &visualization, &self.colormap)?;

		let tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, final_err.buffer, plane_bytes, final_err.buffer, plane_bytes)?;

		Ok(Invocation {
			width,
			height,
			radius_spatial,
			radius_feature,
			final_err,
			csf_set,
			color_error_set,
			feature_error_set,
			combine_set,
			colorize_set,
			tree_sum_set,
			_ycc_test: ycc_test,
			_ycc_ref: ycc_ref,
			_scratch_test: scratch_test,
			_scratch_ref: scratch_ref,
			_combined: combined,
			_visualization: visualization,
			_color_err: color_err,
			_feature_kernels: feature_kernels,
			_point_test: point_test,
			_point_ref: point_ref,
			_edge_test: edge_test,
			_edge_ref: edge_ref,
			_feature_err: feature_err,
			test_image,
			ref_image,
		})
	}

	/// Dispatches `flip_feature_error` stage 1 or 2: one workgroup row per
	/// image row (`local_size_x = 64, local_size_y = 1`), so the usual square
	/// tile dispatch doesn't apply.
	fn dispatch_feature_rows(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		set: vk::DescriptorSet,
		pc: &FeatureErrorPushConstants,
		width: u32,
		height: u32,
	) {
		unsafe {
			gpu.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.feature_error_pipeline);
			gpu.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				self.feature_error_pipeline_layout,
				0,
				&[set],
				&[],
			);
			gpu.device.cmd_push_constants(
				cmd,
				self.feature_error_pipeline_layout,
				vk::ShaderStageFlags::COMPUTE,
				0,
				bytemuck::bytes_of(pc),
			);
			gpu.device.cmd_dispatch(cmd, width.div_ceil(64), height, 1);
		}
	}
}

impl MetricPipeline for Flip {
	fn prepare(&mut self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Resources> {
		self.invocation = Some(self.build_invocation(gpu, width, height)?);
		let image_bytes = (width as u64) * (height as u64) * 4;
		Resources::new(gpu, image_bytes * 2, 4)
	}

	fn record_upload(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let test_bytes = (invocation.width as u64) * (invocation.height as u64) * 4;
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, 0, &invocation.test_image);
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, test_bytes, &invocation.ref_image);
		Ok(())
	}

	fn record_compute(&mut self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, _resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let (width, height) = (invocation.width, invocation.height);
		let ppd = self.args.pixels_per_degree();

		let convert_pc = CsfPushConstants { width, height, ppd, radius: invocation.radius_spatial, stage: 0 };
		gpu.dispatch_2d(
			cmd,
			self.csf_pipeline,
			self.csf_pipeline_layout,
			invocation.csf_set,
			bytemuck::bytes_of(&convert_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let horizontal_pc = CsfPushConstants { width, height, ppd, radius: invocation.radius_spatial, stage: 1 };
		gpu.dispatch_2d(
			cmd,
			self.csf_pipeline,
			self.csf_pipeline_layout,
			invocation.csf_set,
			bytemuck::bytes_of(&horizontal_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let vertical_pc = CsfPushConstants { width, height, ppd, radius: invocation.radius_spatial, stage: 2 };
		gpu.dispatch_2d(
			cmd,
			self.csf_pipeline,
			self.csf_pipeline_layout,
			invocation.csf_set,
			bytemuck::bytes_of(&vertical_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let color_error_pc = ColorErrorPushConstants { width, height };
		gpu.dispatch_2d(
			cmd,
			self.color_error_pipeline,
			self.color_error_pipeline_layout,
			invocation.color_error_set,
			bytemuck::bytes_of(&color_error_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let build_kernels_pc =
			FeatureErrorPushConstants { width, height, radius: invocation.radius_feature, stage: 0 };
		let kernel_groups = (2 * invocation.radius_feature + 1).div_ceil(64);
		gpu.dispatch_1d(
			cmd,
			self.feature_error_pipeline,
			self.feature_error_pipeline_layout,
			invocation.feature_error_set,
			bytemuck::bytes_of(&build_kernels_pc),
			kernel_groups,
		);
		gpu.barrier_compute_to_compute(cmd);

		let convolve_pc =
			FeatureErrorPushConstants { width, height, radius: invocation.radius_feature, stage: 1 };
		self.dispatch_feature_rows(gpu, cmd, invocation.feature_error_set, &convolve_pc, width, height);
		gpu.barrier_compute_to_compute(cmd);

		let detect_pc = FeatureErrorPushConstants { width, height, radius: invocation.radius_feature, stage: 2 };
		self.dispatch_feature_rows(gpu, cmd, invocation.feature_error_set, &detect_pc, width, height);
		gpu.barrier_compute_to_compute(cmd);

		let combine_pc = CombinePushConstants { width, height };
		gpu.dispatch_2d(
			cmd,
			self.combine_pipeline,
			self.combine_pipeline_layout,
			invocation.combine_set,
			bytemuck::bytes_of(&combine_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		if self.colorize {
			self.colorizer.record(gpu, cmd, invocation.colorize_set, width, height, false, 1.0);
			gpu.barrier_compute_to_compute(cmd);
		}

		let pixel_count = width * height;
		for count in TreeSum::round_sizes(pixel_count) {
			self.tree_sum.record(gpu, cmd, invocation.tree_sum_set, count);
			gpu.barrier_compute_to_compute(cmd);
		}
		gpu.barrier_compute_to_transfer(cmd);

		Ok(())
	}

	fn record_readback(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		gpu.cmd_copy_buffer(cmd, invocation.final_err.buffer, 0, resources.staging_out.buffer, 0, 4);
		Ok(())
	}

	fn map_result(&self, _gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let bytes = resources.read_staging_out(0, 4)?;
		let sum = f32::from_le_bytes(bytes.try_into().unwrap());
		let pixel_count = (invocation.width as u64) * (invocation.height as u64);
		Ok(MetricResult::Scalar(sum / pixel_count as f32))
	}
}

/// Uploads `test`/`reference` and returns the mean FLIP value. `colorize`
/// additionally writes a per-pixel viridis-ramped visualization image on the
/// device, though it is not read back to the host by this entry point.
pub fn compute(
	gpu: &GpuRuntime,
	args: FlipArguments,
	test: &RgbaImage,
	reference: &RgbaImage,
	colorize: bool,
) -> Result<f32> {
	let (width, height) = super::check_same_size(test, reference)?;
	let mut flip = Flip::new(gpu, args, colorize)?;

	let result = orchestrator::run_invocation(gpu, &mut flip, width, height, |resources| {
		let test_bytes = (width as u64) * (height as u64) * 4;
		resources.write_staging_in(0, test.as_raw())?;
		resources.write_staging_in(test_bytes, reference.as_raw())?;
		Ok(())
	})?;

	match result {
		MetricResult::Scalar(value) => Ok(value),
		MetricResult::Pair(value, _) => Err(Error::Unsupported(format!("FLIP returned a pair: {value}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kernel_radii_are_symmetric_and_nonzero() {
		let args = FlipArguments::default();
		assert!(args.spatial_kernel_size() % 2 == 1);
		assert!(args.feature_kernel_size() % 2 == 1);
		assert!(args.spatial_kernel_size() >= 3);
		assert!(args.feature_kernel_size() >= 3);
	}
}
