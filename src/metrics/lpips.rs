//! LPIPS (§4.8): a fixed five-block convolutional backbone over test and
//! reference images; after each block's ReLU the two feature maps are
//! L2-normalized per spatial location, compared channel-weighted, and
//! accumulated into a layer-map; the five layer-maps (taken at five
//! different spatial resolutions, since max-pool follows blocks 0 and 1) are
//! nearest-neighbor upsampled to block 0's resolution, summed, and
//! tree-summed to a mean distance.
//!
//! Model weights are consumed as a flat blob (§6 `lpips.dat`), not trained
//! here; `LpipsWeights` only parses and validates that blob's shape.

use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;

use crate::config::{ConvParams, LPIPS_BLOCKS};
use crate::error::{Error, Result};
use crate::gpu::{Buffer, GpuRuntime, Image};
use crate::orchestrator::{self, MetricPipeline, MetricResult, Resources};
use crate::primitives::convolution::{Convolution, KernelSize};
use crate::primitives::maxpool::{self, MaxPool};
use crate::primitives::tree_sum::TreeSum;
use crate::primitives::{buffer_info, buffer_write, entry_point, image_info, image_write, load_shader};

const BLOCK_COUNT: usize = LPIPS_BLOCKS.len();
const POOLED_BLOCKS: [usize; 2] = [0, 1];

#[derive(Clone, Copy, Default)]
struct BlockLayout {
	weight_offset: u64,
	weight_len: u64,
	bias_offset: u64,
	bias_len: u64,
	compare_offset: u64,
	compare_len: u64,
}

fn compute_layout() -> [BlockLayout; BLOCK_COUNT] {
	let mut layouts = [BlockLayout::default(); BLOCK_COUNT];

	let mut cursor = 0u64;
	for (i, block) in LPIPS_BLOCKS.iter().enumerate() {
		let weight_len =
			(block.out_channels as u64) * (block.in_channels as u64) * (block.kernel_size as u64) * (block.kernel_size as u64);
		layouts[i].weight_offset = cursor;
		layouts[i].weight_len = weight_len;
		cursor += weight_len;

		let bias_len = block.out_channels as u64;
		layouts[i].bias_offset = cursor;
		layouts[i].bias_len = bias_len;
		cursor += bias_len;
	}
	for (i, block) in LPIPS_BLOCKS.iter().enumerate() {
		let compare_len = block.out_channels as u64;
		layouts[i].compare_offset = cursor;
		layouts[i].compare_len = compare_len;
		cursor += compare_len;
	}

	layouts
}

/// A parsed, length-validated LPIPS weights blob (§6 `lpips.dat`): per-block
/// convolution weights and biases followed by five compare-weight vectors.
pub struct LpipsWeights {
	bytes: Vec<u8>,
	layout: [BlockLayout; BLOCK_COUNT],
}

impl LpipsWeights {
	/// Total blob length, in bytes, the runtime expects (mirrors the
	/// reference implementation's `model_size()` query).
	pub fn model_size() -> u64 {
		let layout = compute_layout();
		let last = layout[BLOCK_COUNT - 1];
		(last.compare_offset + last.compare_len) * 4
	}

	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
		let expected = Self::model_size();
		if bytes.len() as u64 != expected {
			return Err(Error::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidData,
				format!("lpips weights blob is {} bytes, expected {expected}", bytes.len()),
			)));
		}
		Ok(Self { bytes, layout: compute_layout() })
	}

	pub fn load(path: &Path) -> Result<Self> {
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes)
	}

	fn weight_byte_range(&self, block: usize) -> (u64, u64) {
		let l = self.layout[block];
		(l.weight_offset * 4, l.weight_len * 4)
	}

	fn bias_byte_range(&self, block: usize) -> (u64, u64) {
		let l = self.layout[block];
		(l.bias_offset * 4, l.bias_len * 4)
	}

	fn compare_byte_range(&self, block: usize) -> (u64, u64) {
		let l = self.layout[block];
		(l.compare_offset * 4, l.compare_len * 4)
	}
}

/// Byte size of the two ping-pong NHWC buffers one image needs across the
/// whole backbone (mirrors the reference implementation's `bufferSizes`
/// query): the largest of the preprocessed input and every block's
/// conv/pool output.
pub fn buffer_sizes(width: u32, height: u32) -> u64 {
	let mut max_bytes = (width as u64) * (height as u64) * 3 * 4;
	let mut w = width;
	let mut h = height;
	for (i, block) in LPIPS_BLOCKS.iter().enumerate() {
		let kernel = kernel_size_for(block.kernel_size);
		w = Convolution::output_size(w, &kernel, block.stride, block.padding);
		h = Convolution::output_size(h, &kernel, block.stride, block.padding);
		max_bytes = max_bytes.max((w as u64) * (h as u64) * (block.out_channels as u64) * 4);
		if POOLED_BLOCKS.contains(&i) {
			w = MaxPool::output_size(w);
			h = MaxPool::output_size(h);
			max_bytes = max_bytes.max((w as u64) * (h as u64) * (block.out_channels as u64) * 4);
		}
	}
	max_bytes
}

fn kernel_size_for(k: u32) -> KernelSize {
	match k {
		11 => KernelSize::Big11,
		5 => KernelSize::Medium5,
		3 => KernelSize::Small3,
		other => unreachable!("unsupported LPIPS kernel size {other}"),
	}
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PreprocessPushConstants {
	width: u32,
	height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ComparePushConstants {
	width: u32,
	height: u32,
	channels: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ReconstructPushConstants {
	src_width: u32,
	src_height: u32,
	dst_width: u32,
	dst_height: u32,
}

/// Per-block geometry and the descriptor sets/buffers wired up for it.
struct BlockPlan {
	params: ConvParams,
	out_width: u32,
	out_height: u32,
	pool_width: u32,
	pool_height: u32,
	pooled: bool,

	test_conv_set: vk::DescriptorSet,
	ref_conv_set: vk::DescriptorSet,
	test_pool_set: Option<vk::DescriptorSet>,
	ref_pool_set: Option<vk::DescriptorSet>,
	compare_set: vk::DescriptorSet,

	layer_map: Buffer,
}

struct Invocation {
	width: u32,
	height: u32,

	test_image: Image,
	ref_image: Image,
	test_buf_a: Buffer,
	test_buf_b: Buffer,
	ref_buf_a: Buffer,
	ref_buf_b: Buffer,

	weights: Buffer,
	weights_bytes: u64,

	preprocess_test_set: vk::DescriptorSet,
	preprocess_ref_set: vk::DescriptorSet,

	blocks: Vec<BlockPlan>,
	reconstruct_sets: Vec<vk::DescriptorSet>,

	accum: Buffer,
	accum_pixels: u32,
	tree_sum_set: vk::DescriptorSet,
}

pub struct Lpips {
	weights: LpipsWeights,

	preprocess_set_layout: vk::DescriptorSetLayout,
	preprocess_pipeline_layout: vk::PipelineLayout,
	preprocess_pipeline: vk::Pipeline,

	compare_set_layout: vk::DescriptorSetLayout,
	compare_pipeline_layout: vk::PipelineLayout,
	compare_pipeline: vk::Pipeline,

	reconstruct_set_layout: vk::DescriptorSetLayout,
	reconstruct_pipeline_layout: vk::PipelineLayout,
	reconstruct_pipeline: vk::Pipeline,

	convolution: Convolution,
	maxpool: MaxPool,
	tree_sum: TreeSum,

	descriptor_pool: vk::DescriptorPool,
	invocation: Option<Invocation>,
}

impl Lpips {
	pub fn new(gpu: &GpuRuntime, weights: LpipsWeights) -> Result<Self> {
		let preprocess_shader = load_shader(gpu, "lpips_preprocess")?;
		let preprocess_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_IMAGE, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let preprocess_pipeline_layout = gpu.create_pipeline_layout(
			&[preprocess_set_layout],
			std::mem::size_of::<PreprocessPushConstants>() as u32,
		)?;
		let preprocess_pipeline =
			gpu.create_compute_pipeline(preprocess_shader, preprocess_pipeline_layout, entry_point())?;

		let compare_shader = load_shader(gpu, "lpips_compare")?;
		let compare_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let compare_pipeline_layout = gpu.create_pipeline_layout(
			&[compare_set_layout],
			std::mem::size_of::<ComparePushConstants>() as u32,
		)?;
		let compare_pipeline = gpu.create_compute_pipeline(compare_shader, compare_pipeline_layout, entry_point())?;

		let reconstruct_shader = load_shader(gpu, "lpips_reconstruct")?;
		let reconstruct_set_layout = gpu.create_descriptor_set_layout(&[
			(vk::DescriptorType::STORAGE_BUFFER, 1),
			(vk::DescriptorType::STORAGE_BUFFER, 1),
		])?;
		let reconstruct_pipeline_layout = gpu.create_pipeline_layout(
			&[reconstruct_set_layout],
			std::mem::size_of::<ReconstructPushConstants>() as u32,
		)?;
		let reconstruct_pipeline =
			gpu.create_compute_pipeline(reconstruct_shader, reconstruct_pipeline_layout, entry_point())?;

		let convolution = Convolution::new(gpu, (BLOCK_COUNT * 2) as u32)?;
		let maxpool = MaxPool::new(gpu, (POOLED_BLOCKS.len() * 2) as u32)?;
		let tree_sum = TreeSum::new(gpu, 1)?;

		let descriptor_pool = gpu.create_descriptor_pool(
			(2 + BLOCK_COUNT + BLOCK_COUNT) as u32,
			&[
				vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: 2 },
				vk::DescriptorPoolSize {
					ty: vk::DescriptorType::STORAGE_BUFFER,
					descriptor_count: 2 + (BLOCK_COUNT as u32) * 4 + (BLOCK_COUNT as u32) * 2,
				},
			],
		)?;

		Ok(Self {
			weights,
			preprocess_set_layout,
			preprocess_pipeline_layout,
			preprocess_pipeline,
			compare_set_layout,
			compare_pipeline_layout,
			compare_pipeline,
			reconstruct_set_layout,
			reconstruct_pipeline_layout,
			reconstruct_pipeline,
			convolution,
			maxpool,
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

		let half_bytes = buffer_sizes(width, height);
		let make_half = |gpu: &GpuRuntime| -> Result<Buffer> {
			gpu.create_buffer(half_bytes, vk::BufferUsageFlags::STORAGE_BUFFER, gpu_allocator::MemoryLocation::GpuOnly)
		};
		let test_buf_a = make_half(gpu)?;
		let test_buf_b = make_half(gpu)?;
		let ref_buf_a = make_half(gpu)?;
		let ref_buf_b = make_half(gpu)?;

		let weights_bytes = LpipsWeights::model_size();
		let weights = gpu.create_buffer(
			weights_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;

		let preprocess_test_set =
			gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.preprocess_set_layout])?[0];
		let preprocess_img_infos = [image_info(test_image.view)];
		let preprocess_buf_infos = [buffer_info(test_buf_a.buffer, 0, half_bytes)];
		let preprocess_writes = [
			image_write(preprocess_test_set, 0, &preprocess_img_infos),
			buffer_write(preprocess_test_set, 1, &preprocess_buf_infos),
		];
		unsafe { gpu.device.update_descriptor_sets(&preprocess_writes, &[]) };

		let preprocess_ref_set =
			gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.preprocess_set_layout])?[0];
		let preprocess_ref_img_infos = [image_info(ref_image.view)];
		let preprocess_ref_buf_infos = [buffer_info(ref_buf_a.buffer, 0, half_bytes)];
		let preprocess_ref_writes = [
			image_write(preprocess_ref_set, 0, &preprocess_ref_img_infos),
			buffer_write(preprocess_ref_set, 1, &preprocess_ref_buf_infos),
		];
		unsafe { gpu.device.update_descriptor_sets(&preprocess_ref_writes, &[]) };

		// Walk the backbone once, building each block's geometry, picking
		// which ping-pong half is the input vs output (alternating every
		// stage -- conv and pool alike -- starting from `buf_a` after
		// preprocess), and wiring its descriptor sets.
		let mut blocks = Vec::with_capacity(BLOCK_COUNT);
		let mut cur_w = width;
		let mut cur_h = height;
		let mut cur_channels = 3u32;
		let mut input_is_a = true;

		for (i, params) in LPIPS_BLOCKS.iter().enumerate() {
			let kernel = kernel_size_for(params.kernel_size);
			let out_w = Convolution::output_size(cur_w, &kernel, params.stride, params.padding);
			let out_h = Convolution::output_size(cur_h, &kernel, params.stride, params.padding);

			let (test_in, test_out) =
				if input_is_a { (&test_buf_a, &test_buf_b) } else { (&test_buf_b, &test_buf_a) };
			let (ref_in, ref_out) = if input_is_a { (&ref_buf_a, &ref_buf_b) } else { (&ref_buf_b, &ref_buf_a) };

			let in_bytes = (cur_w as u64) * (cur_h as u64) * (cur_channels as u64) * 4;
			let out_bytes = (out_w as u64) * (out_h as u64) * (params.out_channels as u64) * 4;
			let (weight_offset, weight_len) = self.weights.weight_byte_range(i);
			let (bias_offset, bias_len) = self.weights.bias_byte_range(i);

			let test_conv_set = self.convolution.allocate_descriptor_set(
				gpu,
				test_in.buffer,
				in_bytes,
				weights.buffer,
				weight_offset,
				weights.buffer,
				bias_offset,
				test_out.buffer,
				out_bytes,
			)?;
			// `allocate_descriptor_set` binds ranges starting at the given
			// buffer's offset 0; weight/bias ranges live deeper in the
			// shared `weights` buffer, so patch those two bindings in place.
			Self::rebind_weight_bias(gpu, test_conv_set, weights.buffer, weight_offset, weight_len, bias_offset, bias_len);

			let ref_conv_set = self.convolution.allocate_descriptor_set(
				gpu,
				ref_in.buffer,
				in_bytes,
				weights.buffer,
				weight_offset,
				weights.buffer,
				bias_offset,
				ref_out.buffer,
				out_bytes,
			)?;
			Self::rebind_weight_bias(gpu, ref_conv_set, weights.buffer, weight_offset, weight_len, bias_offset, bias_len);

			input_is_a = !input_is_a;
			cur_w = out_w;
			cur_h = out_h;
			cur_channels = params.out_channels;

			let pooled = POOLED_BLOCKS.contains(&i);
			let (pool_w, pool_h, test_pool_set, ref_pool_set) = if pooled {
				let pool_w = MaxPool::output_size(cur_w);
				let pool_h = MaxPool::output_size(cur_h);
				let (test_pool_in, test_pool_out) =
					if input_is_a { (&test_buf_a, &test_buf_b) } else { (&test_buf_b, &test_buf_a) };
				let (ref_pool_in, ref_pool_out) =
					if input_is_a { (&ref_buf_a, &ref_buf_b) } else { (&ref_buf_b, &ref_buf_a) };
				let pool_in_bytes = (cur_w as u64) * (cur_h as u64) * (cur_channels as u64) * 4;
				let pool_out_bytes = (pool_w as u64) * (pool_h as u64) * (cur_channels as u64) * 4;

				let test_pool_set = self.maxpool.allocate_descriptor_set(
					gpu,
					test_pool_in.buffer,
					pool_in_bytes,
					test_pool_out.buffer,
					pool_out_bytes,
				)?;
				let ref_pool_set = self.maxpool.allocate_descriptor_set(
					gpu,
					ref_pool_in.buffer,
					pool_in_bytes,
					ref_pool_out.buffer,
					pool_out_bytes,
				)?;

				input_is_a = !input_is_a;
				cur_w = pool_w;
				cur_h = pool_h;
				(pool_w, pool_h, Some(test_pool_set), Some(ref_pool_set))
			} else {
				(0, 0, None, None)
			};

			let layer_map_bytes = (out_w as u64) * (out_h as u64) * 4;
			let layer_map = gpu.create_buffer(
				layer_map_bytes,
				vk::BufferUsageFlags::STORAGE_BUFFER,
				gpu_allocator::MemoryLocation::GpuOnly,
			)?;

			let (compare_offset, compare_len) = self.weights.compare_byte_range(i);
			let compare_set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.compare_set_layout])?[0];
			let compare_buf_infos = [
				buffer_info(test_out.buffer, 0, out_bytes),
				buffer_info(ref_out.buffer, 0, out_bytes),
				buffer_info(weights.buffer, compare_offset, compare_len),
				buffer_info(layer_map.buffer, 0, layer_map_bytes),
			];
			let compare_writes: Vec<_> = compare_buf_infos
				.iter()
				.enumerate()
				.map(|(slot, info)| buffer_write(compare_set, slot as u32, std::slice::from_ref(info)))
				.collect();
			unsafe { gpu.device.update_descriptor_sets(&compare_writes, &[]) };

			blocks.push(BlockPlan {
				params: *params,
				out_width: out_w,
				out_height: out_h,
				pool_width: pool_w,
				pool_height: pool_h,
				pooled,
				test_conv_set,
				ref_conv_set,
				test_pool_set,
				ref_pool_set,
				compare_set,
				layer_map,
			});
		}

		let accum_w = blocks[0].out_width;
		let accum_h = blocks[0].out_height;
		let accum_pixels = accum_w * accum_h;
		let accum_bytes = (accum_pixels as u64) * 4;
		let accum = gpu.create_buffer(
			accum_bytes,
			vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
			gpu_allocator::MemoryLocation::GpuOnly,
		)?;

		let mut reconstruct_sets = Vec::with_capacity(BLOCK_COUNT);
		for block in &blocks {
			let set = gpu.allocate_descriptor_sets(self.descriptor_pool, &[self.reconstruct_set_layout])?[0];
			let layer_map_bytes = (block.out_width as u64) * (block.out_height as u64) * 4;
			let infos =
				[buffer_info(block.layer_map.buffer, 0, layer_map_bytes), buffer_info(accum.buffer, 0, accum_bytes)];
			let writes =
				[buffer_write(set, 0, &infos[0..1]), buffer_write(set, 1, &infos[1..2])];
			unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
			reconstruct_sets.push(set);
		}

		let tree_sum_set =
			self.tree_sum.allocate_descriptor_set(gpu, accum.buffer, accum_bytes, accum.buffer, accum_bytes)?;

		Ok(Invocation {
			width,
			height,
			test_image,
			ref_image,
			test_buf_a,
			test_buf_b,
			ref_buf_a,
			ref_buf_b,
			weights,
			weights_bytes,
			preprocess_test_set,
			preprocess_ref_set,
			blocks,
			reconstruct_sets,
			accum,
			accum_pixels,
			tree_sum_set,
		})
	}

	/// `Convolution::allocate_descriptor_set` always binds its weights/bias
	/// ranges starting at offset 0 of whichever buffer is passed; LPIPS packs
	/// every block's weights and biases into one shared blob at nonzero
	/// offsets, so the two bindings are rewritten here with the real ranges.
	fn rebind_weight_bias(
		gpu: &GpuRuntime,
		set: vk::DescriptorSet,
		weights_buffer: vk::Buffer,
		weight_offset: u64,
		weight_len: u64,
		bias_offset: u64,
		bias_len: u64,
	) {
		let infos = [buffer_info(weights_buffer, weight_offset, weight_len), buffer_info(weights_buffer, bias_offset, bias_len)];
		let writes = [buffer_write(set, 1, &infos[0..1]), buffer_write(set, 2, &infos[1..2])];
		unsafe { gpu.device.update_descriptor_sets(&writes, &[]) };
	}
}

impl MetricPipeline for Lpips {
	fn prepare(&mut self, gpu: &GpuRuntime, width: u32, height: u32) -> Result<Resources> {
		self.invocation = Some(self.build_invocation(gpu, width, height)?);
		let image_bytes = (width as u64) * (height as u64) * 4;
		let weights_bytes = LpipsWeights::model_size();
		Resources::new(gpu, image_bytes * 2 + weights_bytes, 4)
	}

	fn record_upload(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let test_bytes = (invocation.width as u64) * (invocation.height as u64) * 4;
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, 0, &invocation.test_image);
		gpu.cmd_upload_image(cmd, resources.staging_in.buffer, test_bytes, &invocation.ref_image);
		gpu.cmd_copy_buffer(
			cmd,
			resources.staging_in.buffer,
			test_bytes * 2,
			invocation.weights.buffer,
			0,
			invocation.weights_bytes,
		);
		Ok(())
	}

	fn record_compute(&mut self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, _resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let (width, height) = (invocation.width, invocation.height);

		let pre_pc = PreprocessPushConstants { width, height };
		gpu.dispatch_2d(
			cmd,
			self.preprocess_pipeline,
			self.preprocess_pipeline_layout,
			invocation.preprocess_test_set,
			bytemuck::bytes_of(&pre_pc),
			width,
			height,
			16,
		);
		gpu.dispatch_2d(
			cmd,
			self.preprocess_pipeline,
			self.preprocess_pipeline_layout,
			invocation.preprocess_ref_set,
			bytemuck::bytes_of(&pre_pc),
			width,
			height,
			16,
		);
		gpu.barrier_compute_to_compute(cmd);

		// Blocks are processed in order; `in_w`/`in_h` track the spatial size
		// feeding each block, since `BlockPlan` only stores its own output
		// geometry.
		let mut in_w = width;
		let mut in_h = height;
		for block in invocation.blocks.iter() {
			let conv_pc = crate::primitives::convolution::PushConstants {
				in_width: in_w,
				in_height: in_h,
				in_channels: block.params.in_channels,
				out_channels: block.params.out_channels,
				out_width: block.out_width,
				out_height: block.out_height,
				stride: block.params.stride,
				padding: block.params.padding,
			};
			self.convolution.record(gpu, cmd, block.test_conv_set, kernel_size_for(block.params.kernel_size), conv_pc);
			self.convolution.record(gpu, cmd, block.ref_conv_set, kernel_size_for(block.params.kernel_size), conv_pc);
			gpu.barrier_compute_to_compute(cmd);

			let compare_pc = ComparePushConstants { width: block.out_width, height: block.out_height, channels: block.params.out_channels };
			gpu.dispatch_2d(
				cmd,
				self.compare_pipeline,
				self.compare_pipeline_layout,
				block.compare_set,
				bytemuck::bytes_of(&compare_pc),
				block.out_width,
				block.out_height,
				16,
			);
			gpu.barrier_compute_to_compute(cmd);

			if block.pooled {
				let pool_pc = maxpool::PushConstants {
					in_width: block.out_width,
					in_height: block.out_height,
					channels: block.params.out_channels,
					out_width: block.pool_width,
					out_height: block.pool_height,
				};
				self.maxpool.record(gpu, cmd, block.test_pool_set.unwrap(), pool_pc);
				self.maxpool.record(gpu, cmd, block.ref_pool_set.unwrap(), pool_pc);
				gpu.barrier_compute_to_compute(cmd);
				in_w = block.pool_width;
				in_h = block.pool_height;
			} else {
				in_w = block.out_width;
				in_h = block.out_height;
			}
		}

		let accum_bytes = (invocation.accum_pixels as u64) * 4;
		gpu.cmd_fill_buffer(cmd, invocation.accum.buffer, 0, accum_bytes);
		gpu.barrier_compute_to_compute(cmd);

		let dst_w = invocation.blocks[0].out_width;
		let dst_h = invocation.blocks[0].out_height;
		for (block, set) in invocation.blocks.iter().zip(invocation.reconstruct_sets.iter()) {
			let pc = ReconstructPushConstants {
				src_width: block.out_width,
				src_height: block.out_height,
				dst_width: dst_w,
				dst_height: dst_h,
			};
			gpu.dispatch_2d(
				cmd,
				self.reconstruct_pipeline,
				self.reconstruct_pipeline_layout,
				*set,
				bytemuck::bytes_of(&pc),
				dst_w,
				dst_h,
				16,
			);
			gpu.barrier_compute_to_compute(cmd);
		}

		for count in TreeSum::round_sizes(invocation.accum_pixels) {
			self.tree_sum.record(gpu, cmd, invocation.tree_sum_set, count);
			gpu.barrier_compute_to_compute(cmd);
		}
		gpu.barrier_compute_to_transfer(cmd);

		Ok(())
	}

	fn record_readback(&self, gpu: &GpuRuntime, cmd: vk::CommandBuffer, resources: &Resources) -> Result<()> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		gpu.cmd_copy_buffer(cmd, invocation.accum.buffer, 0, resources.staging_out.buffer, 0, 4);
		Ok(())
	}

	fn map_result(&self, _gpu: &GpuRuntime, resources: &mut Resources) -> Result<MetricResult> {
		let invocation = self.invocation.as_ref().expect("prepare must run first");
		let bytes = resources.read_staging_out(0, 4)?;
		let sum = f32::from_le_bytes(bytes.try_into().unwrap());
		Ok(MetricResult::Scalar(sum / (invocation.accum_pixels.max(1) as f32)))
	}
}

/// Uploads `test`/`reference` plus `weights`'s blob and returns the mean
/// LPIPS distance.
pub fn compute(gpu: &GpuRuntime, weights: LpipsWeights, test: &RgbaImage, reference: &RgbaImage) -> Result<f32> {
	let (width, height) = super::check_same_size(test, reference)?;
	// Cloned so the upload closure doesn't need to borrow `lpips` while the
	// orchestrator already holds it mutably.
	let weights_bytes = weights.bytes.clone();
	let mut lpips = Lpips::new(gpu, weights)?;

	let result = orchestrator::run_invocation(gpu, &mut lpips, width, height, |resources| {
		let test_bytes = (width as u64) * (height as u64) * 4;
		resources.write_staging_in(0, test.as_raw())?;
		resources.write_staging_in(test_bytes, reference.as_raw())?;
		resources.write_staging_in(test_bytes * 2, &weights_bytes)?;
		Ok(())
	})?;

	match result {
		MetricResult::Scalar(value) => Ok(value),
		MetricResult::Pair(value, _) => Err(Error::Unsupported(format!("LPIPS returned a pair: {value}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn model_size_matches_block_shapes() {
		let expected_floats: u64 = LPIPS_BLOCKS
			.iter()
			.map(|b| (b.out_channels as u64) * (b.in_channels as u64) * (b.kernel_size as u64) * (b.kernel_size as u64) + b.out_channels as u64)
			.sum::<u64>()
			+ LPIPS_BLOCKS.iter().map(|b| b.out_channels as u64).sum::<u64>();
		assert_eq!(LpipsWeights::model_size(), expected_floats * 4);
	}

	#[test]
	fn from_bytes_rejects_wrong_length() {
		let bytes = vec![0u8; 4];
		assert!(LpipsWeights::from_bytes(bytes).is_err());
	}

	#[test]
	fn buffer_sizes_grow_with_resolution() {
		assert!(buffer_sizes(256, 256) > buffer_sizes(64, 64));
	}

	#[test]
	fn load_round_trips_a_weights_file_on_disk() {
		let bytes = vec![0u8; LpipsWeights::model_size() as usize];
		let mut file = tempfile::NamedTempFile::new().unwrap();
		std::io::Write::write_all(&mut file, &bytes).unwrap();

		let weights = LpipsWeights::load(file.path()).unwrap();
		assert_eq!(weights.bytes.len(), bytes.len());
	}
}
