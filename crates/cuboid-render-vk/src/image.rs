// SPDX-License-Identifier: CEPL-1.0
//! GPU images with tracked layout state.
//!
//! An `ImageResource` owns only the image handle; its backing memory lives
//! in a [`crate::memory::MemoryBlock`] and the device is passed into every
//! operation instead of being stored as a back-reference.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{RenderError, Result};
use crate::layout::{self, LayoutState, TransitionMasks};
use crate::memory::MemoryRequirement;

/// Everything needed to record one layout-transition barrier.
#[derive(Clone, Copy, Debug)]
pub struct BarrierRequest {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub masks: TransitionMasks,
    pub aspect: vk::ImageAspectFlags,
}

/// Where transition barriers get recorded. The production sink writes into a
/// command buffer; tests substitute one that just captures the requests.
pub trait BarrierSink {
    fn record_barrier(&mut self, request: &BarrierRequest);
}

/// Records barriers into a live command buffer.
pub struct CommandRecorder<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
}

impl BarrierSink for CommandRecorder<'_> {
    fn record_barrier(&mut self, request: &BarrierRequest) {
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: request.masks.src_access,
            dst_access_mask: request.masks.dst_access,
            old_layout: request.old_layout,
            new_layout: request.new_layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: request.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: request.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                request.masks.src_stage,
                request.masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

pub struct ImageResource {
    image: vk::Image,
    format: vk::Format,
    layout: LayoutState,
    width: u32,
    height: u32,
}

impl ImageResource {
    pub(crate) fn from_raw(image: vk::Image, format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            image,
            format,
            layout: LayoutState::Undefined,
            width,
            height,
        }
    }

    unsafe fn create(
        ctx: &DeviceContext,
        format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { ctx.device.create_image(&info, None)? };
        Ok(Self::from_raw(image, format, width, height))
    }

    /// Sampled texture, filled later via a staging copy.
    pub unsafe fn create_sampled(ctx: &DeviceContext, width: u32, height: u32) -> Result<Self> {
        unsafe {
            Self::create(
                ctx,
                vk::Format::R8G8B8A8_SRGB,
                width,
                height,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            )
        }
    }

    pub unsafe fn create_depth_attachment(
        ctx: &DeviceContext,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        unsafe {
            Self::create(
                ctx,
                format,
                width,
                height,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )
        }
    }

    pub unsafe fn memory_requirement(&self, ctx: &DeviceContext) -> MemoryRequirement {
        unsafe { ctx.device.get_image_memory_requirements(self.image) }.into()
    }

    /// Record a layout transition and update the tracked state.
    ///
    /// An unsupported edge fails with the tracked layout unchanged and
    /// nothing recorded. On success the update is bookkeeping only: the GPU
    /// side is not visible until the command buffer executes, and ordering
    /// against that execution belongs to the frame loop.
    pub fn transition(&mut self, sink: &mut dyn BarrierSink, to: LayoutState) -> Result<()> {
        let masks = layout::transition_masks(self.layout, to).ok_or(
            RenderError::UnsupportedTransition {
                from: self.layout,
                to,
            },
        )?;
        sink.record_barrier(&BarrierRequest {
            image: self.image,
            old_layout: self.layout.as_vk(),
            new_layout: to.as_vk(),
            masks,
            aspect: layout::aspect_for(to, self.format),
        });
        self.layout = to;
        Ok(())
    }

    pub unsafe fn create_view(&self, ctx: &DeviceContext) -> Result<vk::ImageView> {
        let aspect = if layout::is_depth_format(self.format) {
            if layout::format_has_stencil(self.format) {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            } else {
                vk::ImageAspectFlags::DEPTH
            }
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: self.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: self.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        Ok(unsafe { ctx.device.create_image_view(&info, None)? })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn layout(&self) -> LayoutState {
        self.layout
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe { ctx.device.destroy_image(self.image, None) };
        self.image = vk::Image::null();
    }
}

pub unsafe fn create_sampler(ctx: &DeviceContext) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        max_anisotropy: 1.0,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        ..Default::default()
    };
    Ok(unsafe { ctx.device.create_sampler(&info, None)? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CapturingSink {
        barriers: Vec<BarrierRequest>,
    }

    impl BarrierSink for CapturingSink {
        fn record_barrier(&mut self, request: &BarrierRequest) {
            self.barriers.push(*request);
        }
    }

    fn test_image(format: vk::Format) -> ImageResource {
        ImageResource::from_raw(vk::Image::null(), format, 64, 64)
    }

    #[test]
    fn upload_chain_lands_in_shader_read_only() {
        let mut img = test_image(vk::Format::R8G8B8A8_SRGB);
        let mut sink = CapturingSink::default();

        img.transition(&mut sink, LayoutState::TransferDst).unwrap();
        img.transition(&mut sink, LayoutState::ShaderReadOnly)
            .unwrap();

        assert_eq!(img.layout(), LayoutState::ShaderReadOnly);
        assert_eq!(sink.barriers.len(), 2);
        assert_eq!(sink.barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            sink.barriers[0].new_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            sink.barriers[1].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(sink.barriers[1].aspect, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn illegal_edge_records_nothing_and_keeps_layout() {
        let mut img = test_image(vk::Format::R8G8B8A8_SRGB);
        let mut sink = CapturingSink::default();

        let err = img
            .transition(&mut sink, LayoutState::ShaderReadOnly)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnsupportedTransition {
                from: LayoutState::Undefined,
                to: LayoutState::ShaderReadOnly,
            }
        ));
        assert_eq!(img.layout(), LayoutState::Undefined);
        assert!(sink.barriers.is_empty());
    }

    #[test]
    fn failed_edge_after_success_keeps_earlier_state() {
        let mut img = test_image(vk::Format::B8G8R8A8_UNORM);
        let mut sink = CapturingSink::default();

        img.transition(&mut sink, LayoutState::ColorAttachment)
            .unwrap();
        img.transition(&mut sink, LayoutState::ShaderReadOnly)
            .unwrap();
        // No edge out of ShaderReadOnly back to TransferDst.
        assert!(img
            .transition(&mut sink, LayoutState::TransferDst)
            .is_err());

        assert_eq!(img.layout(), LayoutState::ShaderReadOnly);
        assert_eq!(sink.barriers.len(), 2);
    }

    #[test]
    fn depth_transition_uses_depth_aspect() {
        let mut img = test_image(vk::Format::D32_SFLOAT);
        let mut sink = CapturingSink::default();

        img.transition(&mut sink, LayoutState::DepthStencilAttachment)
            .unwrap();

        assert_eq!(sink.barriers[0].aspect, vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            sink.barriers[0].new_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn stencil_format_widens_the_aspect() {
        let mut img = test_image(vk::Format::D24_UNORM_S8_UINT);
        let mut sink = CapturingSink::default();

        img.transition(&mut sink, LayoutState::DepthStencilAttachment)
            .unwrap();

        assert_eq!(
            sink.barriers[0].aspect,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
