// SPDX-License-Identifier: CEPL-1.0
//! Device-memory sub-allocation: one `vkAllocateMemory` sized for several
//! images, bound one after another at aligned offsets.
//!
//! The sizing pass and the bind pass walk the same cursor arithmetic, so the
//! caller must bind images in the same relative order it sized them in. That
//! ordering contract is load-bearing and covered by tests.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{RenderError, Result};

/// Size/alignment/type-bits triple for one image, mirroring
/// `vk::MemoryRequirements`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirement {
    pub size: u64,
    pub alignment: u64,
    pub type_bits: u32,
}

impl From<vk::MemoryRequirements> for MemoryRequirement {
    fn from(req: vk::MemoryRequirements) -> Self {
        Self {
            size: req.size,
            alignment: req.alignment,
            type_bits: req.memory_type_bits,
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

/// The offsets a requirement list packs to, and the total block size.
/// Purely arithmetic; deterministic for a given ordered list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackingPlan {
    pub offsets: Vec<u64>,
    pub total_size: u64,
}

impl PackingPlan {
    pub fn compute(requirements: &[MemoryRequirement]) -> Self {
        let mut offsets = Vec::with_capacity(requirements.len());
        let mut cursor = 0u64;
        for req in requirements {
            let offset = align_up(cursor, req.alignment);
            offsets.push(offset);
            cursor = offset + req.size;
        }
        Self {
            offsets,
            total_size: cursor,
        }
    }
}

/// First memory type index that covers `type_bits` and carries every
/// requested property flag.
pub fn find_memory_type(
    types: &[vk::MemoryType],
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    types.iter().enumerate().find_map(|(i, ty)| {
        let allowed = type_bits & (1 << i) != 0;
        (allowed && ty.property_flags.contains(properties)).then_some(i as u32)
    })
}

/// Running bind state of a block: monotonic cursor plus the number of binds
/// the block was sized for. Rejects over-binding before anything mutates.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BindCursor {
    size: u64,
    cursor: u64,
    binds_left: usize,
}

impl BindCursor {
    pub(crate) fn new(size: u64, binds: usize) -> Self {
        Self {
            size,
            cursor: 0,
            binds_left: binds,
        }
    }

    /// Offset the next bind would land at. Does not mutate.
    pub(crate) fn next(&self, req: MemoryRequirement) -> Result<u64> {
        if self.binds_left == 0 {
            return Err(RenderError::BindOverflow);
        }
        let offset = align_up(self.cursor, req.alignment);
        if offset + req.size > self.size {
            return Err(RenderError::BindOverflow);
        }
        Ok(offset)
    }

    pub(crate) fn advance(&mut self, offset: u64, size: u64) {
        self.cursor = offset + size;
        self.binds_left -= 1;
    }

    #[cfg(test)]
    pub(crate) fn claim(&mut self, req: MemoryRequirement) -> Result<u64> {
        let offset = self.next(req)?;
        self.advance(offset, req.size);
        Ok(offset)
    }

    pub(crate) fn bytes_claimed(&self) -> u64 {
        self.cursor
    }
}

/// One device memory allocation shared by several images.
///
/// The block owns the memory exclusively; images bound into it must be
/// destroyed before the block is. Sub-ranges are never freed individually.
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    cursor: BindCursor,
}

impl MemoryBlock {
    /// Size one allocation for every requirement in order and allocate it.
    ///
    /// The memory type is chosen against the intersection of *all* the
    /// requirements' type bits, so a type acceptable to the first image but
    /// not a later one is never picked.
    pub unsafe fn allocate(
        ctx: &DeviceContext,
        requirements: &[MemoryRequirement],
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        debug_assert!(!requirements.is_empty());

        let plan = PackingPlan::compute(requirements);
        let type_bits = requirements.iter().fold(!0u32, |acc, r| acc & r.type_bits);
        let types = unsafe { ctx.memory_types() };
        let type_index =
            find_memory_type(&types, type_bits, properties).ok_or(RenderError::NoMemoryType)?;

        let allocate_info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: plan.total_size,
            memory_type_index: type_index,
            ..Default::default()
        };
        let memory = unsafe { ctx.device.allocate_memory(&allocate_info, None)? };

        Ok(Self {
            memory,
            cursor: BindCursor::new(plan.total_size, requirements.len()),
        })
    }

    /// Bind `image` at the next aligned offset and advance the cursor.
    ///
    /// Must be called once per image, in the order the requirements were
    /// passed to [`MemoryBlock::allocate`]. A bind beyond what the block was
    /// sized for fails with `BindOverflow` before touching the cursor or the
    /// device.
    pub unsafe fn bind_image(
        &mut self,
        ctx: &DeviceContext,
        image: vk::Image,
        req: MemoryRequirement,
    ) -> Result<u64> {
        let offset = self.cursor.next(req)?;
        unsafe { ctx.device.bind_image_memory(image, self.memory, offset)? };
        self.cursor.advance(offset, req.size);
        Ok(offset)
    }

    pub fn bytes_claimed(&self) -> u64 {
        self.cursor.bytes_claimed()
    }

    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe { ctx.device.free_memory(self.memory, None) };
        self.memory = vk::DeviceMemory::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(size: u64, alignment: u64) -> MemoryRequirement {
        MemoryRequirement {
            size,
            alignment,
            type_bits: !0,
        }
    }

    #[test]
    fn packing_matches_worked_example() {
        let plan = PackingPlan::compute(&[req(1024, 256), req(2048, 512)]);
        assert_eq!(plan.offsets, vec![0, 1024]);
        assert_eq!(plan.total_size, 3072);
    }

    #[test]
    fn offsets_are_aligned_and_non_overlapping() {
        let reqs = [req(100, 64), req(3, 1), req(700, 256), req(1, 4096)];
        let plan = PackingPlan::compute(&reqs);
        for (i, (offset, r)) in plan.offsets.iter().zip(&reqs).enumerate() {
            assert_eq!(offset % r.alignment, 0, "offset {i} misaligned");
            if i > 0 {
                assert!(
                    *offset >= plan.offsets[i - 1] + reqs[i - 1].size,
                    "offset {i} overlaps the previous image"
                );
            }
        }
        assert!(plan.total_size >= plan.offsets[3] + reqs[3].size);
    }

    #[test]
    fn packing_is_deterministic() {
        let reqs = [req(17, 16), req(33, 32), req(65, 64)];
        assert_eq!(PackingPlan::compute(&reqs), PackingPlan::compute(&reqs));
    }

    #[test]
    fn over_bind_fails_without_moving_the_cursor() {
        let reqs = [req(1024, 256), req(2048, 512)];
        let plan = PackingPlan::compute(&reqs);
        let mut cursor = BindCursor::new(plan.total_size, reqs.len());

        assert_eq!(cursor.claim(reqs[0]).unwrap(), 0);
        assert_eq!(cursor.claim(reqs[1]).unwrap(), 1024);
        let before = cursor.bytes_claimed();

        // Sized for two binds; a third must be rejected.
        assert!(matches!(
            cursor.claim(req(16, 16)),
            Err(RenderError::BindOverflow)
        ));
        assert_eq!(cursor.bytes_claimed(), before);
    }

    #[test]
    fn bind_larger_than_sized_fails() {
        let plan = PackingPlan::compute(&[req(64, 64)]);
        let mut cursor = BindCursor::new(plan.total_size, 1);
        // Same count, but a bigger image than was sized for.
        assert!(matches!(
            cursor.claim(req(128, 64)),
            Err(RenderError::BindOverflow)
        ));
        assert_eq!(cursor.bytes_claimed(), 0);
    }

    fn memory_type(flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags: flags,
            heap_index: 0,
        }
    }

    #[test]
    fn device_local_request_on_host_visible_device_fails() {
        let types = [
            memory_type(vk::MemoryPropertyFlags::HOST_VISIBLE),
            memory_type(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        ];
        assert_eq!(
            find_memory_type(&types, !0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn first_satisfying_type_wins() {
        let types = [
            memory_type(vk::MemoryPropertyFlags::HOST_VISIBLE),
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ];
        assert_eq!(
            find_memory_type(&types, !0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
    }

    #[test]
    fn type_bits_mask_is_honoured() {
        let types = [
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ];
        // Type 0 excluded by the mask, so type 1 must be chosen.
        assert_eq!(
            find_memory_type(&types, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        // Nothing allowed at all.
        assert_eq!(
            find_memory_type(&types, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
