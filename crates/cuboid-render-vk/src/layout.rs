// SPDX-License-Identifier: CEPL-1.0
//! Image layout states and the table of legal transitions.
//!
//! Every edge we support is spelled out in one match below; adding a new
//! transition means adding a row, not extending an if/else cascade.

use ash::vk;

/// The closed set of layouts an image can be tracked in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutState {
    Undefined,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    PresentSrc,
}

impl LayoutState {
    pub fn as_vk(self) -> vk::ImageLayout {
        match self {
            LayoutState::Undefined => vk::ImageLayout::UNDEFINED,
            LayoutState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            LayoutState::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            LayoutState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            LayoutState::DepthStencilAttachment => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            LayoutState::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            LayoutState::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            LayoutState::DepthStencilAttachment | LayoutState::DepthStencilReadOnly
        )
    }
}

/// Access/stage quadruple for one legal transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// The transition table. Returns `None` for any edge we do not support;
/// callers must treat that as an error and leave the image untouched.
pub fn transition_masks(from: LayoutState, to: LayoutState) -> Option<TransitionMasks> {
    use LayoutState::*;

    match (from, to) {
        (Undefined, TransferDst) => Some(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (TransferDst, ShaderReadOnly) => Some(TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_access: vk::AccessFlags::SHADER_READ,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        (Undefined, DepthStencilAttachment) => Some(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        }),
        (Undefined, ColorAttachment) => Some(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }),
        (ColorAttachment, ShaderReadOnly) => Some(TransitionMasks {
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags::SHADER_READ,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        _ => None,
    }
}

pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Barrier aspect mask, derived from the *target* state (not the current
/// one): a depth-stencil target selects depth, plus stencil when the format
/// carries one; everything else is color.
pub fn aspect_for(target: LayoutState, format: vk::Format) -> vk::ImageAspectFlags {
    if target.is_depth_stencil() {
        if format_has_stencil(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}
