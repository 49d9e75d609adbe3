//! Thin facade over a compute-capable Vulkan device.
//!
//! `GpuRuntime` owns the instance, device, queues and command pools needed to
//! record and submit compute work. It does not know about any particular
//! metric; `PrimitiveKit` and the `metrics` module build on top of it.

pub mod cmd;

use std::ffi::{CStr, CString};
use std::sync::Mutex;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::{MemoryLocation, AllocationSizes};

use crate::error::{Error, Result};

/// A device buffer plus the allocation backing it. Dropped together.
pub struct Buffer {
	pub buffer: vk::Buffer,
	pub allocation: Option<gpu_allocator::vulkan::Allocation>,
	pub size: u64,
}

/// A device image plus its default 2D color view and backing allocation.
pub struct Image {
	pub image: vk::Image,
	pub view: vk::ImageView,
	pub allocation: Option<gpu_allocator::vulkan::Allocation>,
	pub width: u32,
	pub height: u32,
	pub format: vk::Format,
}

/// Binding shape for one descriptor set layout: (descriptor type, binding count).
/// Binding index equals position in the slice, matching the reference runtime.
pub type LayoutBindings<'a> = &'a [(vk::DescriptorType, u32)];

pub struct GpuRuntime {
	pub entry: ash::Entry,
	pub instance: ash::Instance,
	pub physical_device: vk::PhysicalDevice,
	pub device: ash::Device,
	/// `Option` so `Drop` can free the allocator's device memory before the
	/// device itself is destroyed.
	pub allocator: Mutex<Option<Allocator>>,

	pub compute_queue_family: u32,
	pub transfer_queue_family: u32,
	pub has_dedicated_transfer_queue: bool,

	pub compute_queue: vk::Queue,
	pub transfer_queue: vk::Queue,

	pub command_pool: vk::CommandPool,
	pub cmd_compute: vk::CommandBuffer,
	pub cmd_transfer: vk::CommandBuffer,
	/// Dedicated compute-queue buffer for the FFT host round-trip's blocking
	/// copies (§4.6a), kept separate from `cmd_transfer` so it never collides
	/// with an in-flight upload/readback submission on that queue.
	pub cmd_fft: vk::CommandBuffer,
	/// Only populated when a dedicated transfer queue family exists.
	pub command_pool_transfer: Option<vk::CommandPool>,

	pub selected_device_name: String,
}

impl GpuRuntime {
	/// Creates the Vulkan instance and device, selecting queues per the
	/// policy in §4.1: first physical device; primary queue is the family
	/// that supports compute+graphics+transfer; a family that supports
	/// transfer only (no compute, no graphics) becomes a dedicated transfer
	/// queue, otherwise the transfer queue aliases the primary.
	pub fn new() -> Result<Self> {
		let entry = unsafe { ash::Entry::load() }
			.map_err(|e| Error::GpuInit(format!("failed to load Vulkan: {e}")))?;

		let app_name = CString::new("Image Quality Metrics").unwrap();
		let engine_name = CString::new("iqm").unwrap();
		let app_info = vk::ApplicationInfo::default()
			.application_name(&app_name)
			.application_version(vk::make_api_version(0, 0, 1, 0))
			.engine_name(&engine_name)
			.engine_version(vk::make_api_version(0, 0, 1, 0))
			.api_version(vk::API_VERSION_1_2);

		let extensions: Vec<*const i8> = Vec::new();
		let layers: Vec<*const i8> = Vec::new();

		let instance_info = vk::InstanceCreateInfo::default()
			.application_info(&app_info)
			.enabled_extension_names(&extensions)
			.enabled_layer_names(&layers);

		let instance = unsafe { entry.create_instance(&instance_info, None) }
			.map_err(|e| Error::GpuInit(format!("vkCreateInstance failed: {e}")))?;

		let result = Self::init_device(&entry, &instance);
		if result.is_err() {
			unsafe { instance.destroy_instance(None) };
		}
		let (
			physical_device,
			device,
			compute_queue_family,
			transfer_queue_family,
			has_dedicated_transfer_queue,
			selected_device_name,
		) = result?;

		let compute_queue = unsafe { device.get_device_queue(compute_queue_family, 0) };
		let transfer_queue = if has_dedicated_transfer_queue {
			unsafe { device.get_device_queue(transfer_queue_family, 0) }
		} else {
			compute_queue
		};

		let command_pool = unsafe {
			device.create_command_pool(
				&vk::CommandPoolCreateInfo::default()
					.flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
					.queue_family_index(compute_queue_family),
				None,
			)
		}
		.map_err(|e| Error::GpuInit(format!("command pool creation failed: {e}")))?;

		let bufs = unsafe {
			device.allocate_command_buffers(
				&vk::CommandBufferAllocateInfo::default()
					.command_pool(command_pool)
					.level(vk::CommandBufferLevel::PRIMARY)
					.command_buffer_count(3),
			)
		}
		.map_err(|e| Error::GpuInit(format!("command buffer allocation failed: {e}")))?;
		let cmd_compute = bufs[0];
		let cmd_fft = bufs[2];

		let (cmd_transfer, command_pool_transfer) = if has_dedicated_transfer_queue {
			let pool = unsafe {
				device.create_command_pool(
					&vk::CommandPoolCreateInfo::default()
						.flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
						.queue_family_index(transfer_queue_family),
					None,
				)
			}
			.map_err(|e| Error::GpuInit(format!("transfer command pool creation failed: {e}")))?;

			let buf = unsafe {
				device.allocate_command_buffers(
					&vk::CommandBufferAllocateInfo::default()
						.command_pool(pool)
						.level(vk::CommandBufferLevel::PRIMARY)
						.command_buffer_count(1),
				)
			}
			.map_err(|e| Error::GpuInit(format!("transfer command buffer allocation failed: {e}")))?;

			(buf[0], Some(pool))
		} else {
			(bufs[1], None)
		};

		let allocator = Allocator::new(&AllocatorCreateDesc {
			instance: instance.clone(),
			device: device.clone(),
			physical_device,
			debug_settings: Default::default(),
			buffer_device_address: false,
			allocation_sizes: AllocationSizes::default(),
		})
		.map_err(|e| Error::GpuInit(format!("allocator creation failed: {e}")))?;

		Ok(Self {
			allocator: Mutex::new(Some(allocator)),
			entry,
			instance,
			physical_device,
			device,
			compute_queue_family,
			transfer_queue_family,
			has_dedicated_transfer_queue,
			compute_queue,
			transfer_queue,
			command_pool,
			cmd_compute,
			cmd_transfer,
			cmd_fft,
			command_pool_transfer,
			selected_device_name,
		})
	}

	#[allow(clippy::type_complexity)]
	fn init_device(
		entry: &ash::Entry,
		instance: &ash::Instance,
	) -> Result<(vk::PhysicalDevice, ash::Device, u32, u32, bool, String)> {
		let devices = unsafe { instance.enumerate_physical_devices() }
			.map_err(|e| Error::GpuInit(format!("failed to enumerate physical devices: {e}")))?;
		let physical_device = *devices
			.first()
			.ok_or_else(|| Error::GpuInit("no Vulkan physical devices found".into()))?;

		let properties = unsafe { instance.get_physical_device_properties(physical_device) };
		let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
			.to_string_lossy()
			.into_owned();

		let queue_families =
			unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

		let mut compute_queue_family: Option<u32> = None;
		let mut transfer_queue_family: Option<u32> = None;

		for (i, family) in queue_families.iter().enumerate() {
			let flags = family.queue_flags;
			let has_compute = flags.contains(vk::QueueFlags::COMPUTE);
			let has_graphics = flags.contains(vk::QueueFlags::GRAPHICS);
			let has_transfer = flags.contains(vk::QueueFlags::TRANSFER);

			if !has_compute && !has_graphics && has_transfer {
				transfer_queue_family = Some(i as u32);
			}

			if has_compute && has_graphics && has_transfer {
				compute_queue_family = Some(i as u32);
			}
		}

		let compute_queue_family = compute_queue_family
			.ok_or_else(|| Error::GpuInit("no compute+graphics+transfer queue family".into()))?;

		let has_dedicated_transfer_queue = transfer_queue_family.is_some();
		let transfer_queue_family = transfer_queue_family.unwrap_or(compute_queue_family);

		let priority = [1.0f32];
		let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
			.queue_family_index(compute_queue_family)
			.queue_priorities(&priority)];

		if has_dedicated_transfer_queue {
			queue_infos.push(
				vk::DeviceQueueCreateInfo::default()
					.queue_family_index(transfer_queue_family)
					.queue_priorities(&priority),
			);
		}

		let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
			.storage_buffer8_bit_access(true)
			.shader_float16(false);

		let device_info = vk::DeviceCreateInfo::default()
			.queue_create_infos(&queue_infos)
			.push_next(&mut features12);

		let device = unsafe { instance.create_device(physical_device, &device_info, None) }
			.map_err(|e| Error::GpuInit(format!("vkCreateDevice failed: {e}")))?;

		let _ = entry;

		Ok((
			physical_device,
			device,
			compute_queue_family,
			transfer_queue_family,
			has_dedicated_transfer_queue,
			device_name,
		))
	}

	/// Creates a buffer bound to a fresh allocation. `location` selects
	/// device-local vs host-visible memory, mirroring the reference
	/// runtime's `memoryFlags` parameter but routed through `gpu-allocator`.
	pub fn create_buffer(
		&self,
		size: u64,
		usage: vk::BufferUsageFlags,
		location: MemoryLocation,
	) -> Result<Buffer> {
		let family_indices = [self.compute_queue_family, self.transfer_queue_family];
		let mut buffer_info = vk::BufferCreateInfo::default().size(size).usage(usage);
		// Buffers crossing the upload (transfer queue) / dispatch (compute queue)
		// boundary are shared concurrently rather than transferred via explicit
		// ownership-transfer barriers, trading a little bandwidth for simplicity.
		if self.has_dedicated_transfer_queue {
			buffer_info = buffer_info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&family_indices);
		}
		let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
			.map_err(|e| Error::GpuResource(format!("buffer creation failed: {e}")))?;

		let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

		let allocation = self
			.allocator
			.lock()
			.unwrap()
			.as_mut()
			.expect("allocator used after drop")
			.allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
				name: "iqm-buffer",
				requirements,
				location,
				linear: true,
				allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
			})
			.map_err(|e| Error::GpuResource(format!("buffer allocation failed: {e}")))?;

		unsafe {
			self.device
				.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
		}
		.map_err(|e| Error::GpuResource(format!("bind_buffer_memory failed: {e}")))?;

		Ok(Buffer { buffer, allocation: Some(allocation), size })
	}

	/// Creates a 2D image, binds device-local memory, and builds a default
	/// full-extent color view — matching `VulkanRuntime::createImage`.
	pub fn create_image(
		&self,
		width: u32,
		height: u32,
		format: vk::Format,
		usage: vk::ImageUsageFlags,
	) -> Result<Image> {
		let family_indices = [self.compute_queue_family, self.transfer_queue_family];
		let mut image_info = vk::ImageCreateInfo::default()
			.image_type(vk::ImageType::TYPE_2D)
			.format(format)
			.extent(vk::Extent3D { width, height, depth: 1 })
			.mip_levels(1)
			.array_layers(1)
			.samples(vk::SampleCountFlags::TYPE_1)
			.tiling(vk::ImageTiling::OPTIMAL)
			.usage(usage)
			.initial_layout(vk::ImageLayout::UNDEFINED);
		if self.has_dedicated_transfer_queue {
			image_info = image_info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&family_indices);
		}

		let image = unsafe { self.device.create_image(&image_info, None) }
			.map_err(|e| Error::GpuResource(format!("image creation failed: {e}")))?;

		let requirements = unsafe { self.device.get_image_memory_requirements(image) };

		let allocation = self
			.allocator
			.lock()
			.unwrap()
			.as_mut()
			.expect("allocator used after drop")
			.allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
				name: "iqm-image",
				requirements,
				location: MemoryLocation::GpuOnly,
				linear: false,
				allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
			})
			.map_err(|e| Error::GpuResource(format!("image allocation failed: {e}")))?;

		unsafe {
			self.device
				.bind_image_memory(image, allocation.memory(), allocation.offset())
		}
		.map_err(|e| Error::GpuResource(format!("bind_image_memory failed: {e}")))?;

		let view = unsafe {
			self.device.create_image_view(
				&vk::ImageViewCreateInfo::default()
					.image(image)
					.view_type(vk::ImageViewType::TYPE_2D)
					.format(format)
					.subresource_range(vk::ImageSubresourceRange {
						aspect_mask: vk::ImageAspectFlags::COLOR,
						base_mip_level: 0,
						level_count: 1,
						base_array_layer: 0,
						layer_count: 1,
					}),
				None,
			)
		}
		.map_err(|e| Error::GpuResource(format!("image view creation failed: {e}")))?;

		Ok(Image { image, view, allocation: Some(allocation), width, height, format })
	}

	pub fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
		unsafe {
			self.device
				.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None)
		}
		.map_err(|e| Error::GpuExecution(format!("shader module creation failed: {e}")))
	}

	pub fn create_descriptor_set_layout(
		&self,
		bindings: LayoutBindings,
	) -> Result<vk::DescriptorSetLayout> {
		let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
			.iter()
			.enumerate()
			.map(|(i, (ty, count))| {
				vk::DescriptorSetLayoutBinding::default()
					.binding(i as u32)
					.descriptor_type(*ty)
					.descriptor_count(*count)
					.stage_flags(vk::ShaderStageFlags::COMPUTE)
			})
			.collect();

		unsafe {
			self.device.create_descriptor_set_layout(
				&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
				None,
			)
		}
		.map_err(|e| Error::GpuResource(format!("descriptor set layout creation failed: {e}")))
	}

	pub fn create_pipeline_layout(
		&self,
		set_layouts: &[vk::DescriptorSetLayout],
		push_constant_size: u32,
	) -> Result<vk::PipelineLayout> {
		let ranges = if push_constant_size > 0 {
			vec![vk::PushConstantRange::default()
				.stage_flags(vk::ShaderStageFlags::COMPUTE)
				.offset(0)
				.size(push_constant_size)]
		} else {
			Vec::new()
		};

		unsafe {
			self.device.create_pipeline_layout(
				&vk::PipelineLayoutCreateInfo::default()
					.set_layouts(set_layouts)
					.push_constant_ranges(&ranges),
				None,
			)
		}
		.map_err(|e| Error::GpuResource(format!("pipeline layout creation failed: {e}")))
	}

	pub fn create_compute_pipeline(
		&self,
		shader: vk::ShaderModule,
		layout: vk::PipelineLayout,
		entry_point: &CStr,
	) -> Result<vk::Pipeline> {
		let stage = vk::PipelineShaderStageCreateInfo::default()
			.stage(vk::ShaderStageFlags::COMPUTE)
			.module(shader)
			.name(entry_point);

		let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

		let pipelines = unsafe {
			self.device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
		}
		.map_err(|(_, e)| Error::GpuExecution(format!("compute pipeline creation failed: {e}")))?;

		Ok(pipelines[0])
	}

	/// Like `create_compute_pipeline`, but binds a single `uint` specialization
	/// constant at `constant_id = 0` -- used by `Convolution` to produce one
	/// pipeline per `KERNEL_SIZE` from the one shader module.
	pub fn create_compute_pipeline_specialized(
		&self,
		shader: vk::ShaderModule,
		layout: vk::PipelineLayout,
		entry_point: &CStr,
		constant_value: u32,
	) -> Result<vk::Pipeline> {
		let map_entry = vk::SpecializationMapEntry {
			constant_id: 0,
			offset: 0,
			size: std::mem::size_of::<u32>(),
		};
		let data = constant_value.to_ne_bytes();
		let specialization_info =
			vk::SpecializationInfo::default().map_entries(std::slice::from_ref(&map_entry)).data(&data);

		let stage = vk::PipelineShaderStageCreateInfo::default()
			.stage(vk::ShaderStageFlags::COMPUTE)
			.module(shader)
			.name(entry_point)
			.specialization_info(&specialization_info);

		let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

		let pipelines = unsafe {
			self.device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
		}
		.map_err(|(_, e)| Error::GpuExecution(format!("compute pipeline creation failed: {e}")))?;

		Ok(pipelines[0])
	}

	pub fn create_descriptor_pool(
		&self,
		max_sets: u32,
		pool_sizes: &[vk::DescriptorPoolSize],
	) -> Result<vk::DescriptorPool> {
		unsafe {
			self.device.create_descriptor_pool(
				&vk::DescriptorPoolCreateInfo::default()
					.flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
					.max_sets(max_sets)
					.pool_sizes(pool_sizes),
				None,
			)
		}
		.map_err(|e| Error::GpuResource(format!("descriptor pool creation failed: {e}")))
	}

	pub fn allocate_descriptor_sets(
		&self,
		pool: vk::DescriptorPool,
		layouts: &[vk::DescriptorSetLayout],
	) -> Result<Vec<vk::DescriptorSet>> {
		unsafe {
			self.device.allocate_descriptor_sets(
				&vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(layouts),
			)
		}
		.map_err(|e| Error::GpuResource(format!("descriptor set allocation failed: {e}")))
	}

	/// Ceiling-divide convenience used by every dispatch call site.
	pub fn compute_2d_groups(width: u32, height: u32, tile_size: u32) -> (u32, u32) {
		let groups_x = width.div_ceil(tile_size);
		let groups_y = height.div_ceil(tile_size);
		(groups_x, groups_y)
	}

	/// Records a one-shot barrier transitioning each image from UNDEFINED to
	/// GENERAL, matching `VulkanRuntime::initImages`.
	pub fn init_images(&self, cmd: vk::CommandBuffer, images: &[&Image]) {
		let barriers: Vec<vk::ImageMemoryBarrier> = images
			.iter()
			.map(|image| {
				vk::ImageMemoryBarrier::default()
					.old_layout(vk::ImageLayout::UNDEFINED)
					.new_layout(vk::ImageLayout::GENERAL)
					.src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
					.dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
					.image(image.image)
					.subresource_range(vk::ImageSubresourceRange {
						aspect_mask: vk::ImageAspectFlags::COLOR,
						base_mip_level: 0,
						level_count: 1,
						base_array_layer: 0,
						layer_count: 1,
					})
			})
			.collect();

		unsafe {
			self.device.cmd_pipeline_barrier(
				cmd,
				vk::PipelineStageFlags::BOTTOM_OF_PIPE,
				vk::PipelineStageFlags::TOP_OF_PIPE,
				vk::DependencyFlags::empty(),
				&[],
				&[],
				&barriers,
			);
		}
	}

	/// Blocks until `fence` is signaled or the wait fails. There is no
	/// cooperative cancellation (§5); a timeout or driver error is always
	/// fatal for the current invocation.
	pub fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
		unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
			.map_err(|e| Error::GpuExecution(format!("fence wait failed: {e}")))
	}
}

impl Drop for GpuRuntime {
	fn drop(&mut self) {
		unsafe {
			let _ = self.device.device_wait_idle();
			// Drop the allocator (and its outstanding allocations) before
			// the device and instance it borrows are destroyed.
			self.allocator.lock().unwrap().take();
			if let Some(pool) = self.command_pool_transfer {
				self.device.destroy_command_pool(pool, None);
			}
			self.device.destroy_command_pool(self.command_pool, None);
			self.device.destroy_device(None);
			self.instance.destroy_instance(None);
		}
	}
}
