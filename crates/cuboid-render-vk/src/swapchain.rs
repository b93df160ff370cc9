// SPDX-License-Identifier: CEPL-1.0
//! Swapchain, views and framebuffers, recreated as a unit whenever the
//! surface goes stale.

use ash::khr::swapchain;
use ash::vk;
use cuboid_render::RenderSize;
use tracing::info;

use crate::context::DeviceContext;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

pub struct SwapchainManager {
    loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    // Bumped on every recreation; consumers of extent/format re-query when
    // they see it change.
    generation: u64,
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], want: VsyncMode) -> vk::PresentModeKHR {
    match want {
        VsyncMode::Mailbox if modes.iter().any(|&m| m == vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        // FIFO is the only mode the spec guarantees.
        _ => vk::PresentModeKHR::FIFO,
    }
}

fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

struct SwapchainParts {
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

unsafe fn create_parts(
    ctx: &DeviceContext,
    loader: &swapchain::Device,
    size: RenderSize,
    mode: VsyncMode,
) -> Result<SwapchainParts> {
    let caps = unsafe {
        ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)?
    };
    let formats = unsafe {
        ctx.surface_loader
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)?
    };
    let modes = unsafe {
        ctx.surface_loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)?
    };

    let surf_format = choose_surface_format(&formats);
    let present_mode = choose_present_mode(&modes, mode);
    let extent = extent_from_caps(&caps, size);

    let min_count = if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    };

    let swap_info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface: ctx.surface,
        min_image_count: min_count,
        image_format: surf_format.format,
        image_color_space: surf_format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        pre_transform: caps.current_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        ..Default::default()
    };

    let swapchain = unsafe { loader.create_swapchain(&swap_info, None)? };
    let images = unsafe { loader.get_swapchain_images(swapchain)? };

    let mut views = Vec::with_capacity(images.len());
    for &img in &images {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: img,
            view_type: vk::ImageViewType::TYPE_2D,
            format: surf_format.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        views.push(unsafe { ctx.device.create_image_view(&iv_info, None)? });
    }

    Ok(SwapchainParts {
        swapchain,
        format: surf_format.format,
        extent,
        images,
        views,
    })
}

impl SwapchainManager {
    pub unsafe fn create(ctx: &DeviceContext, size: RenderSize, mode: VsyncMode) -> Result<Self> {
        let loader = swapchain::Device::new(&ctx.instance, &ctx.device);
        let parts = unsafe { create_parts(ctx, &loader, size, mode)? };
        info!(
            "swapchain ready ({}x{}, fmt 0x{:x})",
            parts.extent.width,
            parts.extent.height,
            parts.format.as_raw()
        );
        Ok(Self {
            loader,
            swapchain: parts.swapchain,
            format: parts.format,
            extent: parts.extent,
            images: parts.images,
            views: parts.views,
            framebuffers: Vec::new(),
            generation: 0,
        })
    }

    /// Tear down and rebuild the chain. The caller must have drained the GPU
    /// and destroyed the framebuffers already.
    pub unsafe fn recreate(
        &mut self,
        ctx: &DeviceContext,
        size: RenderSize,
        mode: VsyncMode,
    ) -> Result<()> {
        debug_assert!(self.framebuffers.is_empty());

        unsafe {
            for &view in &self.views {
                ctx.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        self.views.clear();
        self.images.clear();

        let parts = unsafe { create_parts(ctx, &self.loader, size, mode)? };
        self.swapchain = parts.swapchain;
        self.format = parts.format;
        self.extent = parts.extent;
        self.images = parts.images;
        self.views = parts.views;
        self.generation += 1;

        info!(
            "swapchain recreated (gen {}, {}x{})",
            self.generation, self.extent.width, self.extent.height
        );
        Ok(())
    }

    /// One framebuffer per swapchain image, sharing a single depth view.
    pub unsafe fn build_framebuffers(
        &mut self,
        ctx: &DeviceContext,
        render_pass: vk::RenderPass,
        depth_view: vk::ImageView,
    ) -> Result<()> {
        debug_assert!(self.framebuffers.is_empty());
        for &view in &self.views {
            let attachments = [view, depth_view];
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            self.framebuffers
                .push(unsafe { ctx.device.create_framebuffer(&fb_info, None)? });
        }
        Ok(())
    }

    pub unsafe fn destroy_framebuffers(&mut self, ctx: &DeviceContext) {
        for &fb in &self.framebuffers {
            unsafe { ctx.device.destroy_framebuffer(fb, None) };
        }
        self.framebuffers.clear();
    }

    pub unsafe fn acquire_next(
        &self,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> ash::prelude::VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, signal, vk::Fence::null())
        }
    }

    /// Present `image_index`, waiting on `wait`. `Ok(true)` means suboptimal.
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> ash::prelude::VkResult<bool> {
        let present_info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe { self.loader.queue_present(queue, &present_info) }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            self.destroy_framebuffers(ctx);
            for &view in &self.views {
                ctx.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        self.views.clear();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_extent_surfaces_win() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let got = extent_from_caps(
            &caps,
            RenderSize {
                width: 1,
                height: 1,
            },
        );
        assert_eq!(got.width, 800);
        assert_eq!(got.height, 600);
    }

    #[test]
    fn free_extent_clamps_to_caps() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 200,
                height: 200,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 1000,
            },
            ..Default::default()
        };
        let got = extent_from_caps(
            &caps,
            RenderSize {
                width: 5000,
                height: 100,
            },
        );
        assert_eq!(got.width, 1000);
        assert_eq!(got.height, 200);
    }

    #[test]
    fn mailbox_falls_back_to_fifo() {
        let only_fifo = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&only_fifo, VsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );

        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&with_mailbox, VsyncMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&with_mailbox, VsyncMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn preferred_surface_format_is_bgra_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_UNORM
        );

        // Nothing matches: take whatever comes first.
        let odd = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        assert_eq!(
            choose_surface_format(&odd).format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }
}
