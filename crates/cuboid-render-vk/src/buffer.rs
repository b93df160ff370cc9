// SPDX-License-Identifier: CEPL-1.0
//! Vertex/index/uniform buffers. These use plain dedicated allocations; the
//! sub-allocator in [`crate::memory`] is for images.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{RenderError, Result};
use crate::memory::find_memory_type;

pub struct Buffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

impl Buffer {
    pub unsafe fn create(
        ctx: &DeviceContext,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { ctx.device.create_buffer(&info, None)? };

        let req = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
        let types = unsafe { ctx.memory_types() };
        let type_index = match find_memory_type(&types, req.memory_type_bits, properties) {
            Some(i) => i,
            None => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(RenderError::NoMemoryType);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: type_index,
            ..Default::default()
        };
        let memory = unsafe { ctx.device.allocate_memory(&alloc_info, None)? };
        unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0)? };

        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// Map, copy, unmap. Host-visible and coherent memory only.
    pub unsafe fn write_bytes(&self, ctx: &DeviceContext, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() as u64 <= self.size);
        unsafe {
            let ptr = ctx.device.map_memory(
                self.memory,
                0,
                bytes.len() as u64,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            ctx.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device.destroy_buffer(self.buffer, None);
            ctx.device.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Record into a throwaway command buffer, submit it and wait for the queue
/// to finish. Startup/upload paths only; the frame loop never blocks here.
pub unsafe fn one_time_commands<F>(ctx: &DeviceContext, pool: vk::CommandPool, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let alloc_info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = unsafe { ctx.device.allocate_command_buffers(&alloc_info)?[0] };

    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    let result = (|| {
        unsafe { ctx.device.begin_command_buffer(cmd, &begin)? };
        record(cmd)?;
        unsafe {
            ctx.device.end_command_buffer(cmd)?;
            let submit = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            ctx.device.queue_submit(
                ctx.graphics_queue,
                std::slice::from_ref(&submit),
                vk::Fence::null(),
            )?;
            ctx.device.queue_wait_idle(ctx.graphics_queue)?;
        }
        Ok(())
    })();

    unsafe { ctx.device.free_command_buffers(pool, &[cmd]) };
    result
}

/// Device-local buffer filled through a host-visible staging buffer.
pub unsafe fn create_device_local(
    ctx: &DeviceContext,
    pool: vk::CommandPool,
    usage: vk::BufferUsageFlags,
    bytes: &[u8],
) -> Result<Buffer> {
    let size = bytes.len() as u64;
    let dst = unsafe {
        Buffer::create(
            ctx,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?
    };

    let mut staging = unsafe {
        Buffer::create(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?
    };

    let result = (|| {
        unsafe { staging.write_bytes(ctx, bytes)? };
        unsafe {
            one_time_commands(ctx, pool, |cmd| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                unsafe {
                    ctx.device
                        .cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
                }
                Ok(())
            })
        }
    })();

    unsafe { staging.destroy(ctx) };
    match result {
        Ok(()) => Ok(dst),
        Err(e) => {
            let mut dst = dst;
            unsafe { dst.destroy(ctx) };
            Err(e)
        }
    }
}
