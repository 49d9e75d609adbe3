//! PrimitiveKit: GPU data-parallel building blocks reused by every metric
//! (§4.2). Each submodule owns its own pipeline(s), descriptor-set layout(s)
//! and (where the primitive is invoked on a whole buffer rather than inline
//! in a metric's own descriptor set) a small pool of descriptor sets.

pub mod colorize;
pub mod convolution;
pub mod gaussian_blur;
pub mod maxpool;
pub mod radix_sort;
pub mod tree_sum;

use std::ffi::CStr;

use ash::vk;

use crate::error::Result;
use crate::gpu::GpuRuntime;

pub(crate) use colorize::{image_info, image_write};

/// Shared shader loading: each primitive ships as a single SPIR-V module
/// compiled from `shaders/<name>.comp` by `build.rs`.
pub(crate) fn load_shader(gpu: &GpuRuntime, name: &str) -> Result<vk::ShaderModule> {
	let bytes = shader_bytes(name);
	let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
		.map_err(|e| crate::error::Error::GpuExecution(format!("invalid SPIR-V for {name}: {e}")))?;
	gpu.create_shader_module(&words)
}

pub(crate) fn entry_point() -> &'static CStr {
	CStr::from_bytes_with_nul(b"main\0").unwrap()
}

macro_rules! shader_bytes_for {
	($name:literal) => {
		include_bytes!(concat!(env!("OUT_DIR"), "/", $name, ".spv")).as_slice()
	};
}

fn shader_bytes(name: &str) -> &'static [u8] {
	match name {
		"colorize" => shader_bytes_for!("colorize"),
		"gaussian_blur" => shader_bytes_for!("gaussian_blur"),
		"tree_sum" => shader_bytes_for!("tree_sum"),
		"radix_sort_histogram" => shader_bytes_for!("radix_sort_histogram"),
		"radix_sort_scatter" => shader_bytes_for!("radix_sort_scatter"),
		"convolution" => shader_bytes_for!("convolution"),
		"maxpool" => shader_bytes_for!("maxpool"),
		"psnr_pack" => shader_bytes_for!("psnr_pack"),
		"psnr_postprocess" => shader_bytes_for!("psnr_postprocess"),
		"ssim_lumapack" => shader_bytes_for!("ssim_lumapack"),
		"ssim_combine" => shader_bytes_for!("ssim_combine"),
		"svd_block" => shader_bytes_for!("svd_block"),
		"svd_reduce" => shader_bytes_for!("svd_reduce"),
		"svd_msvd" => shader_bytes_for!("svd_msvd"),
		"fsim_downscale" => shader_bytes_for!("fsim_downscale"),
		"fsim_filters" => shader_bytes_for!("fsim_filters"),
		"fsim_phase_congruency" => shader_bytes_for!("fsim_phase_congruency"),
		"fsim_noise_pack" => shader_bytes_for!("fsim_noise_pack"),
		"fsim_pc_combine" => shader_bytes_for!("fsim_pc_combine"),
		"fsim_final" => shader_bytes_for!("fsim_final"),
		"flip_csf" => shader_bytes_for!("flip_csf"),
		"flip_color_error" => shader_bytes_for!("flip_color_error"),
		"flip_feature_error" => shader_bytes_for!("flip_feature_error"),
		"flip_combine" => shader_bytes_for!("flip_combine"),
		"lpips_preprocess" => shader_bytes_for!("lpips_preprocess"),
		"lpips_compare" => shader_bytes_for!("lpips_compare"),
		"lpips_reconstruct" => shader_bytes_for!("lpips_reconstruct"),
		other => panic!("unknown shader {other}"),
	}
}

/// Ceiling-divide convenience re-exported at the primitives level so metric
/// modules don't need to reach into `gpu::` for it.
pub fn div_ceil_u32(value: u32, divisor: u32) -> u32 {
	value.div_ceil(divisor)
}

pub(crate) fn buffer_info(buffer: vk::Buffer, offset: u64, range: u64) -> vk::DescriptorBufferInfo {
	vk::DescriptorBufferInfo { buffer, offset, range }
}

pub(crate) fn buffer_write<'a>(
	set: vk::DescriptorSet,
	binding: u32,
	infos: &'a [vk::DescriptorBufferInfo],
) -> vk::WriteDescriptorSet<'a> {
	vk::WriteDescriptorSet::default()
		.dst_set(set)
		.dst_binding(binding)
		.descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
		.buffer_info(infos)
}
