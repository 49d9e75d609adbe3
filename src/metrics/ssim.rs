//! SSIM (§4.4): luma pack into five planes, separable Gaussian blur of each
//! plane to estimate local mean/variance/covariance, per-pixel SSIM combine,
//! tree-sum to MSSIM. Produces the per-pixel SSIM map as a visualization.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::config::SsimConfig;
use crate::error::{Error, Result};
use crate::gpu::{GpuRuntime, Image};
use crate::orchestrator::{self, MetricPipeline, MetricResult, Resources};
use crate::primitives::gaussian_blur::GaussianBlur;
use crate::primitives::tree_sum::TreeSum;
use crate::primitives::{buffer_info, buffer_write, entry_point, image_info, image_write, load_shader};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PackPushConstants {
	width: u32,
	height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CombinePushConstants {
	width: u32,
	height: u32,
	c1: f32,
	c2: f32,
	border: u32,
}

/// Five float planes carried through pack -> blur -> combine, named for what
/// they hold after the pack stage (raw) or after blurring (estimates).
struct Planes {
	x: Image,
	y: Image,
	x2: Image,
	y2: Image,
	xy: Image,
	blurred_x: Image,
	blurred_y: Image,
	blurred_x2: Image,
	blurred_y2: Image,
	blurred_xy: Image,
	temp: Image,
}

struct Invocation {
	width: u32,
	height: u32,
	interior_pixels: u32,
	test_image: Image,
	ref_image: Image,
	planes: Planes,
	ssim_map: crate::gpu::Buffer,
	pack_set: vk::DescriptorSet,
	combine_set: vk::DescriptorSet,
	tree_sum_set: vk::DescriptorSet,
}

pub struct Ssim {
	config: SsimConfig,

	pack_set_layout: vk::DescriptorSetLayout,
	pack_pipeline_layout: vk::PipelineLayout,
	pack_pipeline: vk::Pipeline,

	combine_set_layout: vk::DescriptorSetLayout,
	combine_pipeline_layout: vk::PipelineLayout,
	combine_pipeline: vk::Pipeline,

	blur: GaussianBlur,
	tree_sum: TreeSum,

	descriptor_pool: vk::DescriptorPool,
	invocation: Option<Invocation>,
}

fn make_plane(gpu: &GpuRuntime, width: u32, height: u32) -> Result<Image> {
	gpu.create_image(
		width,
		height,
		vk::Format::R32_SFLOAT,
		vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
	)
}

impl Ssim {
	pub fn new(gpu: &GpuRuntime) -> Result<Self> {
		let pack_shader = load_shader(gpu, "ssim_lumapack")?;
		let pack_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
		])?;
		let pack_pipeline_layout =
			gpu.create_pipeline_layout(&[pack_set_layout], std::mem::size_of::<PackPushConstants>() as u32)?;
		let pack_pipeline = gpu.create_compute_pipeline(pack_shader, pack_pipeline_layout, entry_point())?;

		let combine_shader = load_shader(gpu, "ssim_combine")?;
		let combine_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let combine_pipeline_layout = gpu.create_pipeline_layout(
			&[combine_set_layout],
			std::mem::size_of::<CombinePushConstants>() as u32,
		)?;
		let combine_pipeline = gpu.create_compute_pipeline(combine_shader, combine_pipeline_layout, entry_point())?;

		let blur = GaussianBlur::new(gpu, 10)?;
		let tree_sum = TreeSum::new(gpu, 1)?;

		let descriptor_pool = gpu.create_descriptor_pool(
			2,
			&[
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 14 },
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 2 },
			],
		)?;

		Ok(Self {
			config: SsimConfig::default(),
			pack_set_layout,
			pack_pipeline_layout,
			pack_pipeline,
			combine_set_layout,
			combine_pipeline_layout,
			combine_pipeline,
			blur,
			tree_sum,
			descriptor_pool,
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

		let planes = Planes {
			x: make_plane(gpu, width, height)?,
			y: make_plane(gpu, width, height)?,
			x2: make_plane(gpu, width, height)?,
			y2: make_plane(gpu, width, height)?,
			xy: make_plane(gpu, width, height)?,
			blurred_x: make_plane(gpu, width, height)?,
			blurred_y: make_plane(gpu, width, height)?,
			blurred_x2: make_plane(gpu, width, height)?,
			blurred_y2: make_plane(gpu, width, height)?,
			blurred_xy: make_plane(gpu, width, height)?,
			temp: make_plane(gpu, width, height)?,
		};

		let map_size = (width as u64) * (height as u64) * 4;
		let ssim_map = gpu.create_buffer(
			map_size,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;

		let pack_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.pack_set_layout])?[0];
		let pack_img_infos = [
			image_info(test_image.view),
			image_info(ref_image.view),
			image_info(planes.x.view),
			image_info(planes.y.view),
			image_info(planes.x2.view),
			image_info(planes.y2.view),
			image_info(planes.xy.view),
		];
		let pack_writes: Vec<_> = pack_img_infos
			.iter()
			.enumerate()
			.map(|(i, info)| image_write(pack_set, i as u32, std::slice::from_ref(info)))
			.collect();
		unsafe { gpu.device.update_descriptor_sets(&pack_writes, &[]) };

		let combine_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.combine_set_layout])?[0];
		let combine_img_infos = [
			image_info(planes.blurred_x.view),
			image_info(planes.blurred_y.view),
			image_info(planes.blurred_x2.view),
			image_info(planes.blurred_y2.view),
			image_info(planes.blurred_xy.view),
		];
		let combine_buf_infos = [buffer_info(ssim_map.buffer, 0, map_size)];
		let mut combine_writes: Vec<_> = combine_img_infos
			.iter()
			.enumerate()
			.map(|(i, info)| image_write(combine_set, i as u32, std::slice::from_ref(info)))
			.collect();
		combine_writes.push(buffer_write(combine_set, 5, &combine_buf_infos));
		unsafe { gpu.device.update_descriptor_sets(&combine_writes, &[]) };

		let tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, ssim_map.buffer, map_size, ssim_map.buffer, map_size)?;

		let border = (self.config.kernel_size - 1) / 2;
		let interior_pixels = (width - 2 * border) * (height - 2 * border);

		Ok(Invocation {
			width,
			height,
			interior_pixels,
			test_image,
			ref_image,
			planes,
			ssim_map,
			pack_set,
			combine_set,
			tree_sum_set,
		})
	}

	/// Blurs `src` into `dst` through `temp`, both passes at the fixed SSIM
	/// kernel size/sigma (§4.4).
	fn blur_plane(
		&self,
		gpu: &GpuRuntime,
		cmd: vk::CommandBuffer,
		src: &Image,
		temp: &Image,
		dst: &Image,
		width: u32,
		height: u32,
	) -> Result<()> {
		let horizontal_set = self.blur.allocate_descriptor_set(gpu, src, temp)?;
		self.blur.record(gpu, cmd, horizontal_set, width, height, self.config.kernel_size, self.config.sigma, true);
		gpu.barrier_compute_to_compute(cmd);

		let vertical_set = self.blur.allocate_descriptor_set(gpu, temp, dst)?;
		self.blur.record(gpu, cmd, vertical_set, width, height, self.config.kernel_size, self.config.sigma, false);
		gpu.barrier_compute_to_compute(cmd);
		Ok(())
	}
}

impl MetricPipeline for Ssim {
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

		let pc = PackPushConstants { width, height };
		gpu.dispatch_2d(cmd, self.pack_pipeline, self.pack_pipeline_layout, invocation.pack_set, bytemuck::bytes_of(&pc), width, height, 16);
		gpu.barrier_compute_to_compute(cmd);

		let planes = &invocation.planes;
		self.blur_plane(gpu, cmd, &planes.x, &planes.temp, &planes.blurred_x, width, height)?;
		self.blur_plane(gpu, cmd, &planes.y, &planes.temp, &planes.blurred_y, width, height)?;
		self.blur_plane(gpu, cmd, &planes.x2, &planes.temp, &planes.blurred_x2, width, height)?;
		self.blur_plane(gpu, cmd, &planes.y2, &planes.temp, &planes.blurred_y2, width, height)?;
		self.blur_plane(gpu, cmd, &planes.xy, &planes.temp, &planes.blurred_xy, width, height)?;

		let border = (self.config.kernel_size - 1) / 2;
		let combine_pc =
			CombinePushConstants { width, height, c1: self.config.c1(), c2: self.config.c2(), border };
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
		gpu.cmd_copy_buffer(cmd, invocation.ssim_map.buffer, 0, resources.staging_out.buffer, 0, 4);
		Ok(())
	}

	fn map_result(&self, _gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let bytes = resources.read_staging_out(0, 4)?;
		let sum = f32::from_le_bytes(bytes.try_into().unwrap());
		Ok(MetricResult::Scalar(sum / invocation.interior_pixels as f32))
	}
}

/// Uploads `test`/`reference` and returns the MSSIM value.
pub fn compute(gpu: &GpuRuntime, test: &RgbaImage, reference: &RgbaImage) -> Result<f32> {
	let (width, height) = super::check_same_size(test, reference)?;
	let mut ssim = Ssim::new(gpu)?;

	let result = orchestrator::run_invocation(gpu, &mut ssim, width, height, |resources| {
		let test_bytes = (width as u64) * (height as u64) * 4;
		resources.write_staging_in(0, test.as_raw())?;
		resources.write_staging_in(test_bytes, reference.as_raw())?;
		Ok(())
	})?;

	match result {
		MetricResult::Scalar(value) => Ok(value),
		MetricResult::Pair(value, _) => Err(Error::Unsupported(format!("SSIM returned a pair: {value}"))),
	}
}
