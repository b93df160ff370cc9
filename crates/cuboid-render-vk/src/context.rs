// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical device and logical device, bundled into one
//! context that gets passed explicitly to every resource operation.

use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};

use crate::error::{RenderError, Result};

pub struct DeviceContext {
    pub entry: Entry,
    pub instance: Instance,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub graphics_queue: vk::Queue,
    // Same hardware queue as graphics on every device we pick, kept separate
    // so presentation code never assumes that.
    pub present_queue: vk::Queue,
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app_name = c"cuboid";

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: app_name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let ext_slice = ash_window::enumerate_required_extensions(display_raw)?;
    let ext_vec = ext_slice.to_vec();

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        ..Default::default()
    };

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

unsafe fn pick_device_and_queue(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for phys in unsafe { instance.enumerate_physical_devices()? } {
        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        for (i, q) in qprops.iter().enumerate() {
            let can_present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(phys, i as u32, surface)
                    .unwrap_or(false)
            };
            if q.queue_flags.contains(vk::QueueFlags::GRAPHICS) && can_present {
                return Ok((phys, i as u32));
            }
        }
    }
    Err(RenderError::NoAdequateDevice)
}

impl DeviceContext {
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
    ) -> Result<Self> {
        let entry = unsafe { Entry::load()? };

        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        let instance = unsafe { create_instance(&entry, dh)? };
        let surface = unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None)? };
        let surface_loader = surface::Instance::new(&entry, &instance);

        let (phys, queue_family) = unsafe { pick_device_and_queue(&instance, &surface_loader, surface)? };

        let priorities = [1.0_f32];
        let qinfo = vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };

        let device_exts = [ash::khr::swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: 1,
            p_queue_create_infos: &qinfo,
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };

        let device = unsafe { instance.create_device(phys, &dinfo, None)? };
        let graphics_queue = unsafe { device.get_device_queue(queue_family, 0) };
        let present_queue = graphics_queue;

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            phys,
            device,
            queue_family,
            graphics_queue,
            present_queue,
        })
    }

    /// The device's memory types, indexed as the allocator expects.
    pub unsafe fn memory_types(&self) -> Vec<vk::MemoryType> {
        let props = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.phys)
        };
        props.memory_types[..props.memory_type_count as usize].to_vec()
    }

    /// First depth format with optimal-tiling attachment support.
    pub unsafe fn find_depth_format(&self) -> Result<vk::Format> {
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        for format in candidates {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.phys, format)
            };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return Ok(format);
            }
        }
        Err(RenderError::NoDepthFormat)
    }

    /// Full GPU drain; the precondition for every teardown path.
    pub unsafe fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub unsafe fn destroy(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
