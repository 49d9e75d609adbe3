//! FSIM/FSIMc (§4.6): downscale, log-Gabor phase congruency via the host FFT
//! round-trip, gradient-magnitude similarity, optional chrominance
//! similarity, weighted by max phase congruency.
//!
//! The log-Gabor + angular filter bank depends only on the working
//! resolution, not on pixel content, so it is built once per invocation on
//! the host and uploaded alongside the images rather than recomputed on the
//! GPU every call.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::config::{FSIM_ORIENTATIONS, FSIM_SCALES};
use crate::error::{Error, Result};
use crate::fft::{FftBufferPartitions, FftPlanner, RustfftPlanner};
use crate::gpu::{Buffer, GpuRuntime, Image};
use crate::orchestrator::{self, MetricPipeline, MetricResult, Resources};
use crate::primitives::{buffer_info, buffer_write, entry_point, image_info, image_write, load_shader};

const MIN_WAVELENGTH: f32 = 6.0;
const SCALE_MULT: f32 = 2.1;
const SIGMA_ON_F: f32 = 0.55;
const D_THETA_SIGMA: f32 = 1.2;

/// Noise-rejection multiplier applied to the estimated noise standard
/// deviation before subtracting it from each orientation's energy (§4.6
/// step 11).
const NOISE_K: f32 = 2.0;

/// Ratio of a Rayleigh distribution's median to its mean, sqrt(2 ln4 / pi).
/// Used in place of an exact sorted median (§4.6 step 9) to turn the
/// tree-summed mean squared magnitude into a median estimate without a
/// full radix sort over every pixel.
const RAYLEIGH_MEDIAN_OVER_MEAN: f32 = 0.9394;

/// Builds the one-sided log-Gabor x angular filter bank (§4.6 step 2):
/// `scales * orientations` real-valued masks of `width * height` values
/// each, zeroed outside the frequency half-plane matching their
/// orientation so the later spectrum multiply produces an analytic
/// (complex) spatial signal once inverse-transformed.
fn build_filter_bank(width: u32, height: u32, scales: u32, orientations: u32) -> Vec<f32> {
	let (w, h) = (width as i32, height as i32);
	let mut bank = vec![0.0f32; (scales * orientations * width * height) as usize];
	let plane = (width * height) as usize;

	let angle_per_orientation = std::f32::consts::PI / orientations as f32;
	let theta_sigma = angle_per_orientation / D_THETA_SIGMA;

	for s in 0..scales {
		let wavelength = MIN_WAVELENGTH * SCALE_MULT.powi(s as i32);
		let f0 = 1.0 / wavelength;

		for o in 0..orientations {
			let filter_angle = o as f32 * angle_per_orientation;
			let filter_index = (s * orientations + o) as usize;
			let base = filter_index * plane;

			for y in 0..h {
				let fy = if y <= h / 2 { y as f32 } else { (y - h) as f32 } / h as f32;
				for x in 0..w {
					let fx = if x <= w / 2 { x as f32 } else { (x - w) as f32 } / w as f32;
					if fx == 0.0 && fy == 0.0 {
						continue; // DC term carries no phase information
					}

					let radius = (fx * fx + fy * fy).sqrt();
					let theta = fy.atan2(fx);

					// One-sided: zero on the half-plane the orientation doesn't own.
					let mut d_theta = theta - filter_angle;
					if d_theta > std::f32::consts::PI {
						d_theta -= 2.0 * std::f32::consts::PI;
					}
					if d_theta < -std::f32::consts::PI {
						d_theta += 2.0 * std::f32::consts::PI;
					}
					if d_theta.abs() > std::f32::consts::FRAC_PI_2 {
						continue;
					}

					let log_ratio = (radius / f0).ln();
					let radial = (-(log_ratio * log_ratio) / (2.0 * SIGMA_ON_F.ln().powi(2))).exp();
					let angular = (-(d_theta * d_theta) / (2.0 * theta_sigma * theta_sigma)).exp();

					let idx = base + (y as usize) * (width as usize) + (x as usize);
					bank[idx] = radial * angular;
				}
			}
		}
	}

	bank
}

/// Per-orientation summed squared filter-tap power (§4.6 step 6), the N_o
/// term each orientation's noise power is normalized against. A pure
/// function of the (content-independent) filter bank, so it is computed
/// alongside it rather than on the GPU.
fn filter_power_per_orientation(bank: &[f32], width: u32, height: u32, scales: u32, orientations: u32) -> Vec<f32> {
	let plane = (width * height) as usize;
	let mut power = vec![0.0f32; orientations as usize];
	for s in 0..scales {
		for o in 0..orientations {
			let base = ((s * orientations + o) as usize) * plane;
			let filter = &bank[base..base + plane];
			power[o as usize] += filter.iter().map(|v| v * v).sum::<f32>();
		}
	}
	power
}

/// Blocking device-to-host readback of `size` bytes starting at `buffer`'s
/// offset 0, via a transient staging buffer -- the same round-trip
/// primitive the FFT collaborator uses, reused here so the noise-power
/// estimate (§4.6 step 9) can read back a tree-summed scalar mid-dispatch.
fn read_buffer_f32(gpu: &GpuRuntime, buffer: vk::Buffer, size: u64) -> Result<Vec<f32>> {
	let mut staging = gpu.create_buffer(
		size,
		vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
		gpu_allocator::MemoryLocation::CpuToGpu,
	)?;
	gpu.copy_device_buffer_to_staging_blocking(buffer, 0, staging.buffer, size)?;
	let mapped = staging
		.allocation
		.as_mut()
		.and_then(|a| a.mapped_slice_mut())
		.ok_or_else(|| Error::GpuResource("staging buffer is not host-visible".into()))?;
	Ok(bytemuck::cast_slice(mapped).to_vec())
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DownscalePushConstants {
	src_width: u32,
	src_height: u32,
	dst_width: u32,
	dst_height: u32,
	factor: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FiltersPushConstants {
	width: u32,
	height: u32,
	scales: u32,
	orientations: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FinalPushConstants {
	width: u32,
	height: u32,
	chrominance: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NoisePackPushConstants {
	width: u32,
	height: u32,
	orientations: u32,
	orientation: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PcCombinePushConstants {
	width: u32,
	height: u32,
	orientations: u32,
	_pad: u32,
	threshold_test: [f32; 4],
	threshold_ref: [f32; 4],
}

struct Invocation {
	src_width: u32,
	src_height: u32,
	width: u32,
	height: u32,
	factor: u32,
	combos: u32,

	test_image: Image,
	ref_image: Image,
	chroma_test: Image,
	chroma_ref: Image,
	luma_test: Image,
	luma_ref: Image,

	spectrum: Buffer,
	filter_bank: Buffer,
	filtered: Buffer,
	energy_test: Buffer,
	energy_ref: Buffer,
	noise_mag_test: Vec<Buffer>,
	noise_mag_ref: Vec<Buffer>,
	pc_test: Buffer,
	pc_ref: Buffer,
	numerator: Buffer,
	denominator: Buffer,

	downscale_set: vk::DescriptorSet,
	filters_set: vk::DescriptorSet,
	phase_congruency_set: vk::DescriptorSet,
	noise_pack_sets: Vec<vk::DescriptorSet>,
	pc_combine_set: vk::DescriptorSet,
	final_set: vk::DescriptorSet,
	numerator_tree_sum_set: vk::DescriptorSet,
	denominator_tree_sum_set: vk::DescriptorSet,
	noise_tree_test_sets: Vec<vk::DescriptorSet>,
	noise_tree_ref_sets: Vec<vk::DescriptorSet>,

	filter_bank_bytes: u64,
	filter_power: Vec<f32>,
}

pub struct Fsim {
	chrominance: bool,

	downscale_set_layout: vk::DescriptorSetLayout,
	downscale_pipeline_layout: vk::PipelineLayout,
	downscale_pipeline: vk::Pipeline,

	filters_set_layout: vk::DescriptorSetLayout,
	filters_pipeline_layout: vk::PipelineLayout,
	filters_pipeline: vk::Pipeline,

	phase_congruency_set_layout: vk::DescriptorSetLayout,
	phase_congruency_pipeline_layout: vk::PipelineLayout,
	phase_congruency_pipeline: vk::Pipeline,

	noise_pack_set_layout: vk::DescriptorSetLayout,
	noise_pack_pipeline_layout: vk::PipelineLayout,
	noise_pack_pipeline: vk::Pipeline,

	pc_combine_set_layout: vk::DescriptorSetLayout,
	pc_combine_pipeline_layout: vk::PipelineLayout,
	pc_combine_pipeline: vk::Pipeline,

	final_set_layout: vk::DescriptorSetLayout,
	final_pipeline_layout: vk::PipelineLayout,
	final_pipeline: vk::Pipeline,

	tree_sum: crate::primitives::tree_sum::TreeSum,
	fft: RustfftPlanner,
	descriptor_pool: vk::DescriptorPool,
	/// Guards the intermediate submissions `record_compute` issues itself
	/// between dispatches that straddle a host FFT round-trip (§4.6a) --
	/// the single `cmd`/`compute_done` pair the orchestrator hands every
	/// metric isn't enough once part of the graph has to leave the device.
	step_fence: vk::Fence,
	invocation: Option<Invocation>,
}

impl Fsim {
	pub fn new(gpu: &GpuRuntime, chrominance: bool) -> Result<Self> {
		let downscale_shader = load_shader(gpu, "fsim_downscale")?;
		let downscale_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
		])?;
		let downscale_pipeline_layout = gpu.create_pipeline_layout(
			&[downscale_set_layout],
			std::mem::size_of::<DownscalePushConstants>() as u32,
		)?;
		let downscale_pipeline =
			gpu.create_compute_pipeline(downscale_shader, downscale_pipeline_layout, entry_point())?;

		let filters_shader = load_shader(gpu, "fsim_filters")?;
		let filters_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let filters_pipeline_layout =
			gpu.create_pipeline_layout(&[filters_set_layout], std::mem::size_of::<FiltersPushConstants>() as u32)?;
		let filters_pipeline = gpu.create_compute_pipeline(filters_shader, filters_pipeline_layout, entry_point())?;

		let pc_shader = load_shader(gpu, "fsim_phase_congruency")?;
		let phase_congruency_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let phase_congruency_pipeline_layout = gpu.create_pipeline_layout(
			&[phase_congruency_set_layout],
			std::mem::size_of::<FiltersPushConstants>() as u32,
		)?;
		let phase_congruency_pipeline =
			gpu.create_compute_pipeline(pc_shader, phase_congruency_pipeline_layout, entry_point())?;

		let noise_pack_shader = load_shader(gpu, "fsim_noise_pack")?;
		let noise_pack_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let noise_pack_pipeline_layout = gpu.create_pipeline_layout(
			&[noise_pack_set_layout],
			std::mem::size_of::<NoisePackPushConstants>() as u32,
		)?;
		let noise_pack_pipeline =
			gpu.create_compute_pipeline(noise_pack_shader, noise_pack_pipeline_layout, entry_point())?;

		let pc_combine_shader = load_shader(gpu, "fsim_pc_combine")?;
		let pc_combine_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let pc_combine_pipeline_layout = gpu.create_pipeline_layout(
			&[pc_combine_set_layout],
			std::mem::size_of::<PcCombinePushConstants>() as u32,
		)?;
		let pc_combine_pipeline =
			gpu.create_compute_pipeline(pc_combine_shader, pc_combine_pipeline_layout, entry_point())?;

		let final_shader = load_shader(gpu, "fsim_final")?;
		let final_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let final_pipeline_layout =
			gpu.create_pipeline_layout(&[final_set_layout], std::mem::size_of::<FinalPushConstants>() as u32)?;
		let final_pipeline = gpu.create_compute_pipeline(final_shader, final_pipeline_layout, entry_point())?;

		// 2 sets for the final S_PC/S_G tree-sums plus 2 per orientation (test
		// and reference noise-magnitude means, §4.6 step 9).
		let tree_sum = crate::primitives::tree_sum::TreeSum::new(gpu, 2 + 2 * FSIM_ORIENTATIONS)?;

		let descriptor_pool = gpu.create_descriptor_pool(
			9,
			&[
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 10 },
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: 40 },
			],
		)?;

		let step_fence = unsafe { gpu.device.create_fence(&vk::FenceCreateInfo::default(), None) }
			.map_err(|e| Error::GpuResource(format!("fence creation failed: {e}")))?;

		Ok(Self {
			chrominance,
			downscale_set_layout,
			downscale_pipeline_layout,
			downscale_pipeline,
			filters_set_layout,
			filters_pipeline_layout,
			filters_pipeline,
			phase_congruency_set_layout,
			phase_congruency_pipeline_layout,
			phase_congruency_pipeline,
			noise_pack_set_layout,
			noise_pack_pipeline_layout,
			noise_pack_pipeline,
			pc_combine_set_layout,
			pc_combine_pipeline_layout,
			pc_combine_pipeline,
			final_set_layout,
			final_pipeline_layout,
			final_pipeline,
			tree_sum,
			fft: RustfftPlanner::new(),
			descriptor_pool,
			step_fence,
			invocation: None,
		})
	}

	/// Ends `cmd`, submits it on the compute queue, and blocks until it has
	/// executed -- used between dispatches that the host FFT round-trip
	/// needs fully retired before it reads their output back. Leaves `cmd`
	/// ready to record into again.
	fn submit_and_wait(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer) -> Result<()> {
		gpu.end_cmd(cmd)?;
		gpu.submit(gpu.compute_queue, cmd, None, None, self.step_fence)?;
		gpu.wait_for_fence(self.step_fence)?;
		unsafe { gpu.device.reset_fences(&[self.step_fence]) }
			.map_err(|e| Error::GpuExecution(format!("reset_fences failed: {e}")))?;
		gpu.begin_cmd(cmd)
	}

	fn working_resolution(src_width: u32, src_height: u32) -> (u32, u32, u32) {
		let shortest = src_width.min(src_height);
		let factor = (shortest as f32 / 256.0).round().max(1.0) as u32;
		(src_width.div_ceil(factor), src_height.div_ceil(factor), factor)
	}

	fn build_invocation(&self, gpu: &GpuRuntime, src_width: u32, src_height: u32) -> Result<Invocation> {
		let (width, height, factor) = Self::working_resolution(src_width, src_height);
		let combos = FSIM_SCALES * FSIM_ORIENTATIONS * 2;
		let plane = (width as u64) * (height as u64);

		let test_image = gpu.create_image(
			src_width,
			src_height,
			vk::Format::R8G8B8A8_UNORM,
			vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
		)?;
		let ref_image = gpu.create_image(
			src_width,
			src_height,
			vk::Format::R8G8B8A8_UNORM,
			vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
		)?;
		let chroma_test = gpu.create_image(width, height, vk::Format::R32G32_SFLOAT, vk::ImageUsageFlags::STORAGE)?;
		let chroma_ref = gpu.create_image(width, height, vk::Format::R32G32_SFLOAT, vk::ImageUsageFlags::STORAGE)?;
		let luma_test = gpu.create_image(width, height, vk::Format::R32_SFLOAT, vk::ImageUsageFlags::STORAGE)?;
		let luma_ref = gpu.create_image(width, height, vk::Format::R32_SFLOAT, vk::ImageUsageFlags::STORAGE)?;

		let spectrum = gpu.create_buffer(
			plane * 8 * 2,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let filter_bank_bytes = plane * 4 * (FSIM_SCALES as u64) * (FSIM_ORIENTATIONS as u64);
		let filter_bank = gpu.create_buffer(
			filter_bank_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let filtered = gpu.create_buffer(
			plane * 8 * (combos as u64),
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let energy_test = gpu.create_buffer(
			plane * 8 * (FSIM_ORIENTATIONS as u64),
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let energy_ref = gpu.create_buffer(
			plane * 8 * (FSIM_ORIENTATIONS as u64),
			vk::BufferUsageFlags::STORAGE_BUFFER,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let mut noise_mag_test = Vec::with_capacity(FSIM_ORIENTATIONS as usize);
		let mut noise_mag_ref = Vec::with_capacity(FSIM_ORIENTATIONS as usize);
		for _ in 0..FSIM_ORIENTATIONS {
			noise_mag_test.push(gpu.create_buffer(
				plane * 4,
				vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
				gpu_allocator::MemoryLocation::GpuOnly,
			)?);
			noise_mag_ref.push(gpu.create_buffer(
				plane * 4,
				vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
				gpu_allocator::MemoryLocation::GpuOnly,
			)?);
		}
		let pc_test = gpu.create_buffer(plane * 4, vk::BufferUsageFlags::STORAGE_BUFFER, gpu_allocator::MemoryLocation::GpuOnly)?;
		let pc_ref = gpu.create_buffer(plane * 4, vk::BufferUsageFlags::STORAGE_BUFFER, gpu_allocator::MemoryLocation::GpuOnly)?;
		let numerator = gpu.create_buffer(
			plane * 4,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;
		let denominator = gpu.create_buffer(
			plane * 4,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;

		let downscale_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.downscale_set_layout])?[0];
		let downscale_img_infos = [
			image_info(test_image.view),
			image_info(ref_image.view),
			image_info(chroma_test.view),
			image_info(chroma_ref.view),
			image_info(luma_test.view),
			image_info(luma_ref.view),
		];
		let downscale_buf_infos = [buffer_info(spectrum.buffer, 0, plane * 8 * 2)];
		let downscale_writes = [
			image_write(downscale_set, 0, &downscale_img_infos[0..1]),
			image_write(downscale_set, 1, &downscale_img_infos[1..2]),
			buffer_write(downscale_set, 2, &downscale_buf_infos),
			image_write(downscale_set, 3, &downscale_img_infos[2..3]),
			image_write(downscale_set, 4, &downscale_img_infos[3..4]),
			image_write(downscale_set, 5, &downscale_img_infos[4..5]),
			image_write(downscale_set, 6, &downscale_img_infos[5..6]),
		];
		unsafe { gpu.device.update_descriptor_sets(&downscale_writes, &[]) };

		let filters_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.filters_set_layout])?[0];
		let filters_infos = [
			buffer_info(spectrum.buffer, 0, plane * 8 * 2),
			buffer_info(filter_bank.buffer, 0, filter_bank_bytes),
			buffer_info(filtered.buffer, 0, plane * 8 * (combos as u64)),
		];
		let filters_writes: Vec<_> = filters_infos
			.iter()
			.enumerate()
			.map(|(i, info)| buffer_write(filters_set, i as u32, std::slice::from_ref(info)))
			.collect();
		unsafe { gpu.device.update_descriptor_sets(&filters_writes, &[]) };

		let energy_bytes = plane * 8 * (FSIM_ORIENTATIONS as u64);
		let phase_congruency_set =
			gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.phase_congruency_set_layout])?[0];
		let pc_infos = [
			buffer_info(filtered.buffer, 0, plane * 8 * (combos as u64)),
			buffer_info(energy_test.buffer, 0, energy_bytes),
			buffer_info(energy_ref.buffer, 0, energy_bytes),
		];
		let pc_writes: Vec<_> = pc_infos
			.iter()
			.enumerate()
			.map(|(i, info)| buffer_write(phase_congruency_set, i as u32, std::slice::from_ref(info)))
			.collect();
		unsafe { gpu.device.update_descriptor_sets(&pc_writes, &[]) };

		let mut noise_pack_sets = Vec::with_capacity(FSIM_ORIENTATIONS as usize);
		for o in 0..FSIM_ORIENTATIONS as usize {
			let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.noise_pack_set_layout])?[0];
			let infos = [
				buffer_info(filtered.buffer, 0, plane * 8 * (combos as u64)),
				buffer_info(noise_mag_test[o].buffer, 0, plane * 4),
				buffer_info(noise_mag_ref[o].buffer, 0, plane * 4),
			];
			let writes: Vec<_> =
				infos.iter().enumerate().map(|(i, info)| buffer_write(set, i as u32, std::slice::from_ref(info))).collect();
			unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
			noise_pack_sets.push(set);
		}

		let pc_combine_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.pc_combine_set_layout])?[0];
		let pc_combine_infos = [
			buffer_info(energy_test.buffer, 0, energy_bytes),
			buffer_info(energy_ref.buffer, 0, energy_bytes),
			buffer_info(pc_test.buffer, 0, plane * 4),
			buffer_info(pc_ref.buffer, 0, plane * 4),
		];
		let pc_combine_writes: Vec<_> = pc_combine_infos
			.iter()
			.enumerate()
			.map(|(i, info)| buffer_write(pc_combine_set, i as u32, std::slice::from_ref(info)))
			.collect();
		unsafe { gpu.device.update_descriptor_sets(&pc_combine_writes, &[]) };

		let final_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.final_set_layout])?[0];
		let final_buf_infos = [
			buffer_info(pc_test.buffer, 0, plane * 4),
			buffer_info(pc_ref.buffer, 0, plane * 4),
		];
		let final_img_infos = [
			image_info(chroma_test.view),
			image_info(chroma_ref.view),
			image_info(luma_test.view),
			image_info(luma_ref.view),
		];
		let final_out_infos = [buffer_info(numerator.buffer, 0, plane * 4), buffer_info(denominator.buffer, 0, plane * 4)];
		let final_writes = [
			buffer_write(final_set, 0, &final_buf_infos[0..1]),
			buffer_write(final_set, 1, &final_buf_infos[1..2]),
			image_write(final_set, 2, &final_img_infos[0..1]),
			image_write(final_set, 3, &final_img_infos[1..2]),
			image_write(final_set, 4, &final_img_infos[2..3]),
			image_write(final_set, 5, &final_img_infos[3..4]),
			buffer_write(final_set, 6, &final_out_infos[0..1]),
			buffer_write(final_set, 7, &final_out_infos[1..2]),
		];
		unsafe { gpu.device.update_descriptor_sets(&final_writes, &[]) };

		let numerator_tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, numerator.buffer, plane * 4, numerator.buffer, plane * 4)?;
		let denominator_tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, denominator.buffer, plane * 4, denominator.buffer, plane * 4)?;

		let mut noise_tree_test_sets = Vec::with_capacity(FSIM_ORIENTATIONS as usize);
		let mut noise_tree_ref_sets = Vec::with_capacity(FSIM_ORIENTATIONS as usize);
		for o in 0..FSIM_ORIENTATIONS as usize {
			noise_tree_test_sets.push(self.tree_sum.allocate_descriptor_set(
				gpu,
				noise_mag_test[o].buffer,
				plane * 4,
				noise_mag_test[o].buffer,
				plane * 4,
			)?);
			noise_tree_ref_sets.push(self.tree_sum.allocate_descriptor_set(
				gpu,
				noise_mag_ref[o].buffer,
				plane * 4,
				noise_mag_ref[o].buffer,
				plane * 4,
			)?);
		}

		// The filter bank's content depends only on (width, height, scales,
		// orientations), never on pixel data, so recomputing it here to
		// derive N_o is cheap and avoids threading the upload closure's copy
		// through to this invocation.
		let filter_power_bank = build_filter_bank(width, height, FSIM_SCALES, FSIM_ORIENTATIONS);
		let filter_power =
			filter_power_per_orientation(&filter_power_bank, width, height, FSIM_SCALES, FSIM_ORIENTATIONS);

		Ok(Invocation {
			src_width,
			src_height,
			width,
			height,
			factor,
			combos,
			test_image,
			ref_image,
			chroma_test,
			chroma_ref,
			luma_test,
			luma_ref,
			spectrum,
			filter_bank,
			filtered,
			energy_test,
			energy_ref,
			noise_mag_test,
			noise_mag_ref,
			pc_test,
			pc_ref,
			numerator,
			denominator,
			downscale_set,
			filters_set,
			phase_congruency_set,
			noise_pack_sets,
			pc_combine_set,
			final_set,
			numerator_tree_sum_set,
			denominator_tree_sum_set,
			noise_tree_test_sets,
			noise_tree_ref_sets,
			filter_bank_bytes,
			filter_power,
		})
	}
}

impl MetricPipeline for Fsim {
	fn prepare(&mut self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Resources> {
		let invocation = self.build_invocation(gpu, width, height)?;
		let filter_bank_bytes = invocation.filter_bank_bytes;
		self.invocation = Some(invocation);

		let image_bytes = (width as u64) * (height as u64) * 4;
		Resources::new(gpu, image_bytes * 2 + filter_bank_bytes, 8)
	}

	fn record_upload(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let test_bytes = (invocation.src_width as u64) * (invocation.src_height as u64) * 4;
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, 0, &invocation.test_image);
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, test_bytes, &invocation.ref_image);
		gpu.cmd_copy_buffer(cmd, resources.staging_in.buffer, test_bytes * 2, invocation.filter_bank.buffer, 0, invocation.filter_bank_bytes);
		Ok(())
	}

	fn record_compute(&mut self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		// The forward/inverse FFT round-trips (below) read the spectrum
		// buffer back to the host between dispatches, so each GPU stage has
		// to have actually retired before the next one is recorded -- this
		// metric cannot rely solely on the orchestrator's single
		// record-then-submit cycle the way the others do. `resources.fence`
		// is signalled by the upload submission already queued ahead of
		// this call; waiting on it (without consuming `upload_done`, which
		// the orchestrator's own post-return submit still needs) confirms
		// the uploaded images and filter bank are visible before the first
		// dispatch below reads them.
		gpu.wait_for_fence(resources.fence)?;

		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let (width, height) = (invocation.width, invocation.height);

		let downscale_pc = DownscalePushConstants {
			src_width: invocation.src_width,
			src_height: invocation.src_height,
			dst_width: width,
			dst_height: height,
			factor: invocation.factor,
		};
		gpu.dispatch_2d(
			cmd,
			self.downscale_pipeline,
			self.downscale_pipeline_layout,
			invocation.downscale_set,
			bytemuck::bytes_of(&downscale_pc),
			width,
			height,
			16,
		);
		self.submit_and_wait(gpu, cmd)?;

		// Forward FFT: 2 batches (test, ref) in place in `spectrum`, via a
		// blocking device<->host round-trip now that the downscale dispatch
		// above has actually retired.
		let forward_plan = self.fft.forward_plan(width, height, 2)?;
		let forward_partitions = FftBufferPartitions {
			fft_offset: 0,
			fft_batch_stride: (width as u64) * (height as u64) * 8,
			fft_len: (width as u64) * (height as u64) * 8 * 2,
			ifft_offset: 0,
			ifft_batch_stride: 0,
			ifft_len: 0,
		};
		self.fft.append_forward(gpu, forward_plan, invocation.spectrum.buffer, &forward_partitions)?;

		let filters_pc =
			FiltersPushConstants { width, height, scales: FSIM_SCALES, orientations: FSIM_ORIENTATIONS };
		unsafe {
			gpu.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.filters_pipeline);
			gpu.device.cmd_bind_descriptor_sets(
				cmd,
				vk::PipelineBindPoint::COMPUTE,
				self.filters_pipeline_layout,
				0,
				&[invocation.filters_set],
				&[],
			);
			gpu.device.cmd_push_constants(
				cmd,
				self.filters_pipeline_layout,
				vk::ShaderStageFlags::COMPUTE,
				0,
				bytemuck::bytes_of(&filters_pc),
			);
			let (gx, gy) = GpuRuntime::compute_2d_groups(width, height, 16);
			gpu.device.cmd_dispatch(cmd, gx, gy, invocation.combos);
		}
		self.submit_and_wait(gpu, cmd)?;

		// Inverse FFT: one batch per (scale, orientation, image) combo, in
		// place, via another blocking round-trip now that the filter
		// multiply above has retired.
		let inverse_plan = self.fft.inverse_plan(width, height, invocation.combos)?;
		let plane_bytes = (width as u64) * (height as u64) * 8;
		let inverse_partitions = FftBufferPartitions {
			fft_offset: 0,
			fft_batch_stride: 0,
			fft_len: 0,
			ifft_offset: 0,
			ifft_batch_stride: plane_bytes,
			ifft_len: plane_bytes * (invocation.combos as u64),
		};
		self.fft.append_inverse(gpu, inverse_plan, invocation.filtered.buffer, &inverse_partitions)?;

		let pc_pc = filters_pc;
		gpu.dispatch_2d(
			cmd,
			self.phase_congruency_pipeline,
			self.phase_congruency_pipeline_layout,
			invocation.phase_congruency_set,
			bytemuck::bytes_of(&pc_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		for (o, &set) in invocation.noise_pack_sets.iter().enumerate() {
			let noise_pack_pc =
				NoisePackPushConstants { width, height, orientations: FSIM_ORIENTATIONS, orientation: o as u32 };
			gpu.dispatch_2d(
				cmd,
				self.noise_pack_pipeline,
				self.noise_pack_pipeline_layout,
				set,
				bytemuck::bytes_of(&noise_pack_pc),
				width,
				height,
				16,
			);
		}
		gpu.barrier_compute_to_compute(cmd);

		let pixel_count = width * height;
		for count in crate::primitives::tree_sum::TreeSum::round_sizes(pixel_count) {
			for o in 0..FSIM_ORIENTATIONS as usize {
				self.tree_sum.record(gpu, cmd, invocation.noise_tree_test_sets[o], count);
				self.tree_sum.record(gpu, cmd, invocation.noise_tree_ref_sets[o], count);
			}
			gpu.barrier_compute_to_compute(cmd);
		}

		// The noise floor per orientation gates the energy threshold in
		// fsim_pc_combine and has to be known on the host before that
		// dispatch is recorded, so this submission must retire before
		// continuing (same blocking-readback pattern as the FFT round-trip
		// above, via the independent `cmd_fft` buffer underlying
		// `read_buffer_f32`/`copy_device_buffer_to_staging_blocking`).
		self.submit_and_wait(gpu, cmd)?;

		let ln_half = 0.5f32.ln();
		let mut threshold_test = [0.0f32; 4];
		let mut threshold_ref = [0.0f32; 4];
		for o in 0..FSIM_ORIENTATIONS as usize {
			let mean_test = read_buffer_f32(gpu, invocation.noise_mag_test[o].buffer, 4)?[0] / pixel_count as f32;
			let mean_ref = read_buffer_f32(gpu, invocation.noise_mag_ref[o].buffer, 4)?[0] / pixel_count as f32;
			let median_test = mean_test * RAYLEIGH_MEDIAN_OVER_MEAN;
			let median_ref = mean_ref * RAYLEIGH_MEDIAN_OVER_MEAN;
			let filter_power = invocation.filter_power[o].max(1e-6);
			let noise_power_test = (-median_test / ln_half) / filter_power;
			let noise_power_ref = (-median_ref / ln_half) / filter_power;
			threshold_test[o] = NOISE_K * noise_power_test.max(0.0).sqrt();
			threshold_ref[o] = NOISE_K * noise_power_ref.max(0.0).sqrt();
		}

		let pc_combine_pc = PcCombinePushConstants {
			width,
			height,
			orientations: FSIM_ORIENTATIONS,
			_pad: 0,
			threshold_test,
			threshold_ref,
		};
		gpu.dispatch_2d(
			cmd,
			self.pc_combine_pipeline,
			self.pc_combine_pipeline_layout,
			invocation.pc_combine_set,
			bytemuck::bytes_of(&pc_combine_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		let final_pc = FinalPushConstants { width, height, chrominance: self.chrominance as i32 };
		gpu.dispatch_2d(
			cmd,
			self.final_pipeline,
			self.final_pipeline_layout,
			invocation.final_set,
			bytemuck::bytes_of(&final_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		for count in crate::primitives::tree_sum::TreeSum::round_sizes(pixel_count) {
			self.tree_sum.record(gpu, cmd, invocation.numerator_tree_sum_set, count);
			self.tree_sum.record(gpu, cmd, invocation.denominator_tree_sum_set, count);
			gpu.barrier_compute_to_compute(cmd);
		}
		gpu.barrier_compute_to_transfer(cmd);

		let _ = (&invocation.pc_test, &invocation.pc_ref, &invocation.chroma_test, &invocation.chroma_ref, &invocation.luma_test, &invocation.luma_ref);
		Ok(())
	}

	fn record_readback(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		gpu.cmd_copy_buffer(cmd, invocation.numerator.buffer, 0, resources.staging_out.buffer, 0, 4);
		gpu.cmd_copy_buffer(cmd, invocation.denominator.buffer, 0, resources.staging_out.buffer, 4, 4);
		Ok(())
	}

	fn map_result(&self, _gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult> {
		let bytes = resources.read_staging_out(0, 8)?;
		let numerator = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
		let denominator = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
		Ok(MetricResult::Scalar(numerator / denominator.max(1e-6)))
	}
}

/// Uploads `test`/`reference` and returns the FSIM (or FSIMc) score.
pub fn compute(gpu: &GpuRuntime, chrominance: bool, test: &RgbaImage, reference: &RgbaImage) -> Result<f32> {
	let (src_width, src_height) = super::check_same_size(test, reference)?;
	let mut fsim = Fsim::new(gpu, chrominance)?;
	let (width, height, _) = Fsim::working_resolution(src_width, src_height);

	let result = orchestrator::run_invocation(gpu, &mut fsim, src_width, src_height, |resources| {
		let test_bytes = (src_width as u64) * (src_height as u64) * 4;
		let filter_bank = build_filter_bank(width, height, FSIM_SCALES, FSIM_ORIENTATIONS);
		resources.write_staging_in(0, test.as_raw())?;
		resources.write_staging_in(test_bytes, reference.as_raw())?;
		resources.write_staging_in(test_bytes * 2, bytemuck::cast_slice(&filter_bank))?;
		Ok(())
	})?;

	match result {
		MetricResult::Scalar(value) => Ok(value),
		MetricResult::Pair(value, _) => Err(Error::Unsupported(format!("FSIM returned a pair: {value}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn working_resolution_leaves_small_images_unscaled() {
		assert_eq!(Fsim::working_resolution(128, 128), (128, 128, 1));
	}

	#[test]
	fn working_resolution_downscales_large_images() {
		let (w, h, factor) = Fsim::working_resolution(1024, 512);
		assert_eq!(factor, 2);
		assert_eq!(w, 512);
		assert_eq!(h, 256);
	}

	#[test]
	fn filter_bank_is_zero_at_dc() {
		let bank = build_filter_bank(16, 16, 1, 1);
		assert_eq!(bank[0], 0.0);
	}

	#[test]
	fn filter_power_is_positive_per_orientation() {
		let bank = build_filter_bank(16, 16, FSIM_SCALES, FSIM_ORIENTATIONS);
		let power = filter_power_per_orientation(&bank, 16, 16, FSIM_SCALES, FSIM_ORIENTATIONS);
		assert_eq!(power.len(), FSIM_ORIENTATIONS as usize);
		assert!(power.iter().all(|&p| p > 0.0));
	}
}
