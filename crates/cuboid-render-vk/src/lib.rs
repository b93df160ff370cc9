// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend for the cuboid demo.
//!
//! The interesting parts live in the submodules: [`memory`] packs several
//! images into one allocation, [`layout`]/[`image`] track image layouts and
//! record transition barriers, [`swapchain`] owns the presentable chain and
//! [`frame`] drives the single-frame acquire/record/submit/present protocol.
//! This file assembles them into a [`VkRenderer`].

pub mod buffer;
pub mod context;
pub mod error;
pub mod frame;
pub mod image;
pub mod layout;
pub mod memory;
pub mod pipeline;
pub mod swapchain;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use cuboid_render::{Mesh, RenderSize, Renderer};

use buffer::{create_device_local, one_time_commands, Buffer};
use context::DeviceContext;
use error::RenderError;
use frame::{AcquireOutcome, Frame, FrameDriver, FrameOutcome, PresentOutcome};
use image::{CommandRecorder, ImageResource};
use layout::LayoutState;
use memory::MemoryBlock;
use pipeline::{PipelineParts, PushConstants};
use swapchain::SwapchainManager;

pub use error::RenderError as VkRenderError;
pub use swapchain::VsyncMode;

/// SPIR-V is compiled offline (glslc) into this directory.
const SHADER_DIR: &str = "shaders";

const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth image, its sub-allocated memory and its view. Rebuilt with the
/// swapchain since it is sized to the surface.
struct DepthTarget {
    image: ImageResource,
    memory: MemoryBlock,
    view: vk::ImageView,
    format: vk::Format,
}

impl DepthTarget {
    unsafe fn create(
        ctx: &DeviceContext,
        pool: vk::CommandPool,
        extent: vk::Extent2D,
    ) -> error::Result<Self> {
        unsafe {
            let format = ctx.find_depth_format()?;
            let mut image =
                ImageResource::create_depth_attachment(ctx, format, extent.width, extent.height)?;
            let req = image.memory_requirement(ctx);
            let mut memory = MemoryBlock::allocate(
                ctx,
                std::slice::from_ref(&req),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            memory.bind_image(ctx, image.handle(), req)?;
            let view = image.create_view(ctx)?;

            one_time_commands(ctx, pool, |cmd| {
                let mut recorder = CommandRecorder {
                    device: &ctx.device,
                    cmd,
                };
                image.transition(&mut recorder, LayoutState::DepthStencilAttachment)
            })?;

            Ok(Self {
                image,
                memory,
                view,
                format,
            })
        }
    }

    // Reverse of creation: view, then image, then its memory.
    unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device.destroy_image_view(self.view, None);
            self.image.destroy(ctx);
            self.memory.destroy(ctx);
        }
    }
}

/// Sampled texture fed through a staging buffer.
struct TextureTarget {
    image: ImageResource,
    memory: MemoryBlock,
    view: vk::ImageView,
}

impl TextureTarget {
    unsafe fn from_rgba(
        ctx: &DeviceContext,
        pool: vk::CommandPool,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> error::Result<Self> {
        debug_assert_eq!(rgba.len(), (width * height * 4) as usize);
        unsafe {
            let mut image = ImageResource::create_sampled(ctx, width, height)?;
            let req = image.memory_requirement(ctx);
            let mut memory = MemoryBlock::allocate(
                ctx,
                std::slice::from_ref(&req),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            memory.bind_image(ctx, image.handle(), req)?;

            let mut staging = Buffer::create(
                ctx,
                rgba.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            staging.write_bytes(ctx, rgba)?;

            let upload = one_time_commands(ctx, pool, |cmd| {
                let mut recorder = CommandRecorder {
                    device: &ctx.device,
                    cmd,
                };
                image.transition(&mut recorder, LayoutState::TransferDst)?;

                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    },
                };
                unsafe {
                    ctx.device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        image.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }

                image.transition(&mut recorder, LayoutState::ShaderReadOnly)
            });
            staging.destroy(ctx);
            upload?;

            let view = image.create_view(ctx)?;
            Ok(Self {
                image,
                memory,
                view,
            })
        }
    }

    unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device.destroy_image_view(self.view, None);
            self.image.destroy(ctx);
            self.memory.destroy(ctx);
        }
    }
}

struct MeshBuffers {
    vbuf: Buffer,
    ibuf: Buffer,
    index_count: u32,
}

impl MeshBuffers {
    unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            self.vbuf.destroy(ctx);
            self.ibuf.destroy(ctx);
        }
    }
}

pub struct VkRenderer {
    ctx: DeviceContext,
    swapchain: SwapchainManager,
    pipeline: PipelineParts,
    depth: DepthTarget,

    cmd_pool: vk::CommandPool,
    frame: Frame,

    sampler: vk::Sampler,
    texture: TextureTarget,
    mesh: Option<MeshBuffers>,
    ubo: Buffer,
    desc_pool: vk::DescriptorPool,
    desc_set: vk::DescriptorSet,

    clear: vk::ClearValue,
    view_proj: [[f32; 4]; 4],

    // Last size the window reported; recreation always targets this.
    surface_size: RenderSize,
    // Resize notice from the window, consumed once per frame.
    pending_resize: Option<RenderSize>,
    vsync_mode: VsyncMode,
    fence_timeout: Duration,
    started: Instant,
}

unsafe fn build(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
) -> error::Result<VkRenderer> {
    unsafe {
        let ctx = DeviceContext::new(window, display)?;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: ctx.queue_family,
            ..Default::default()
        };
        let cmd_pool = ctx.device.create_command_pool(&pool_info, None)?;

        let mut swapchain = SwapchainManager::create(&ctx, size, VsyncMode::default())?;
        let depth = DepthTarget::create(&ctx, cmd_pool, swapchain.extent())?;
        let pipeline = pipeline::create(
            &ctx,
            swapchain.format(),
            depth.format,
            Path::new(SHADER_DIR),
        )?;
        swapchain.build_framebuffers(&ctx, pipeline.render_pass, depth.view)?;

        let frame = Frame::create(&ctx, cmd_pool)?;

        let sampler = image::create_sampler(&ctx)?;
        // Placeholder until the app uploads a real texture.
        let texture = TextureTarget::from_rgba(&ctx, cmd_pool, 1, 1, &[255, 255, 255, 255])?;

        let ubo = Buffer::create(
            &ctx,
            std::mem::size_of::<[[f32; 4]; 4]>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
            },
        ];
        let dp_info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let desc_pool = ctx.device.create_descriptor_pool(&dp_info, None)?;

        let ds_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: desc_pool,
            descriptor_set_count: 1,
            p_set_layouts: &pipeline.set_layout,
            ..Default::default()
        };
        let desc_set = ctx.device.allocate_descriptor_sets(&ds_info)?[0];

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: ubo.buffer,
            offset: 0,
            range: std::mem::size_of::<[[f32; 4]; 4]>() as u64,
        };
        let ubo_write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: desc_set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        ctx.device.update_descriptor_sets(&[ubo_write], &[]);

        let mut renderer = VkRenderer {
            ctx,
            swapchain,
            pipeline,
            depth,
            cmd_pool,
            frame,
            sampler,
            texture,
            mesh: None,
            ubo,
            desc_pool,
            desc_set,
            clear: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.02, 0.02, 0.04, 1.0],
                },
            },
            view_proj: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            surface_size: size,
            pending_resize: None,
            vsync_mode: VsyncMode::default(),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            started: Instant::now(),
        };
        renderer.write_texture_descriptor();
        Ok(renderer)
    }
}

impl VkRenderer {
    fn write_texture_descriptor(&mut self) {
        let image_info = vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: self.desc_set,
            dst_binding: 1,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            p_image_info: &image_info,
            ..Default::default()
        };
        unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Present-mode changes take effect at the next frame via the same
    /// recreate path a resize uses.
    pub fn set_vsync_mode(&mut self, mode: VsyncMode) {
        if self.vsync_mode == mode {
            return;
        }
        self.vsync_mode = mode;
        self.pending_resize = Some(self.surface_size);
    }

    /// How long a frame may wait for the GPU before giving up. Expiry is a
    /// fatal error, never an indefinite block.
    pub fn set_fence_timeout(&mut self, timeout: Duration) {
        self.fence_timeout = timeout;
    }

    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain.generation()
    }
}

impl FrameDriver for VkRenderer {
    type Error = RenderError;

    fn take_pending_resize(&mut self) -> bool {
        match self.pending_resize.take() {
            Some(size) => {
                self.surface_size = size;
                true
            }
            None => false,
        }
    }

    fn wait_fence(&mut self) -> error::Result<()> {
        let timeout_ns = self.fence_timeout.as_nanos().min(u64::MAX as u128) as u64;
        match unsafe {
            self.ctx
                .device
                .wait_for_fences(&[self.frame.fence], true, timeout_ns)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::FenceTimeout),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&mut self) -> error::Result<()> {
        unsafe { self.ctx.device.reset_fences(&[self.frame.fence])? };
        Ok(())
    }

    fn acquire(&mut self) -> error::Result<AcquireOutcome> {
        match unsafe {
            self.swapchain
                .acquire_next(u64::MAX, self.frame.image_available)
        } {
            Ok((index, _suboptimal)) => Ok(AcquireOutcome::Ready(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&mut self, image_index: u32) -> error::Result<()> {
        let d = &self.ctx.device;
        let cmd = self.frame.cmd;
        let extent = self.swapchain.extent();

        unsafe {
            self.ubo
                .write_bytes(&self.ctx, bytemuck::bytes_of(&self.view_proj))?;

            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            d.begin_command_buffer(cmd, &begin)?;

            let clears = [
                self.clear,
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.pipeline.render_pass,
                framebuffer: self.swapchain.framebuffer(image_index),
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                },
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline,
            );

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            d.cmd_set_viewport(cmd, 0, &[viewport]);
            d.cmd_set_scissor(cmd, 0, &[scissor]);

            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.desc_set],
                &[],
            );

            if let Some(mesh) = &self.mesh {
                d.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vbuf.buffer], &[0]);
                d.cmd_bind_index_buffer(cmd, mesh.ibuf.buffer, 0, vk::IndexType::UINT32);

                let push = PushConstants {
                    time: self.started.elapsed().as_secs_f32(),
                };
                d.cmd_push_constants(
                    cmd,
                    self.pipeline.layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                d.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            }

            d.cmd_end_render_pass(cmd);
            d.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    fn submit(&mut self) -> error::Result<()> {
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.frame.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &self.frame.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &self.frame.render_done,
            ..Default::default()
        };
        unsafe {
            self.ctx.device.queue_submit(
                self.ctx.graphics_queue,
                std::slice::from_ref(&submit),
                self.frame.fence,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> error::Result<PresentOutcome> {
        match unsafe {
            self.swapchain
                .present(self.ctx.present_queue, image_index, self.frame.render_done)
        } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&mut self) -> error::Result<()> {
        unsafe { self.ctx.wait_idle() }
    }

    fn recreate(&mut self) -> error::Result<()> {
        // Teardown in dependency order: framebuffers, then the depth
        // view/image/memory, then the swapchain itself. The caller already
        // drained the GPU.
        unsafe {
            self.swapchain.destroy_framebuffers(&self.ctx);
            self.depth.destroy(&self.ctx);
            self.swapchain
                .recreate(&self.ctx, self.surface_size, self.vsync_mode)?;
            self.depth = DepthTarget::create(&self.ctx, self.cmd_pool, self.swapchain.extent())?;
            self.swapchain
                .build_framebuffers(&self.ctx, self.pipeline.render_pass, self.depth.view)?;
        }
        Ok(())
    }

    fn rearm_fence(&mut self) -> error::Result<()> {
        // Empty submission whose only effect is signaling the fence the
        // abandoned frame already reset.
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, &[], self.frame.fence)?;
        }
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self> {
        let renderer = unsafe { build(window, display, size)? };
        info!(
            "Vulkan renderer ready ({}x{})",
            renderer.surface_size.width, renderer.surface_size.height
        );
        Ok(renderer)
    }

    fn resize(&mut self, size: RenderSize) {
        debug!("resize noted: {}x{}", size.width, size.height);
        self.pending_resize = Some(size);
    }

    fn render(&mut self) -> Result<()> {
        match frame::run_frame(self)? {
            FrameOutcome::Rendered => {}
            FrameOutcome::Skipped => {
                debug!(
                    "frame skipped; swapchain recreated (gen {})",
                    self.swapchain.generation()
                );
            }
        }
        Ok(())
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<()> {
        unsafe {
            self.ctx.wait_idle()?;
            if let Some(mut old) = self.mesh.take() {
                old.destroy(&self.ctx);
            }
            let vbuf = create_device_local(
                &self.ctx,
                self.cmd_pool,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                bytemuck::cast_slice(&mesh.vertices),
            )?;
            let ibuf = create_device_local(
                &self.ctx,
                self.cmd_pool,
                vk::BufferUsageFlags::INDEX_BUFFER,
                bytemuck::cast_slice(&mesh.indices),
            )?;
            self.mesh = Some(MeshBuffers {
                vbuf,
                ibuf,
                index_count: mesh.indices.len() as u32,
            });
        }
        info!(
            "mesh uploaded ({} vertices, {} indices)",
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(())
    }

    fn upload_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
        unsafe {
            self.ctx.wait_idle()?;
            let new = TextureTarget::from_rgba(&self.ctx, self.cmd_pool, width, height, rgba)?;
            self.texture.destroy(&self.ctx);
            self.texture = new;
        }
        self.write_texture_descriptor();
        Ok(())
    }

    fn set_view_proj(&mut self, view_proj: [[f32; 4]; 4]) {
        self.view_proj = view_proj;
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        };
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.wait_idle();

            self.swapchain.destroy_framebuffers(&self.ctx);
            self.depth.destroy(&self.ctx);
            if let Some(mut mesh) = self.mesh.take() {
                mesh.destroy(&self.ctx);
            }
            self.texture.destroy(&self.ctx);
            self.ctx.device.destroy_sampler(self.sampler, None);
            self.ubo.destroy(&self.ctx);
            self.ctx.device.destroy_descriptor_pool(self.desc_pool, None);
            self.frame.destroy(&self.ctx);
            self.pipeline.destroy(&self.ctx);
            self.ctx.device.destroy_command_pool(self.cmd_pool, None);
            self.swapchain.destroy(&self.ctx);
            self.ctx.destroy();
        }
    }
}
