// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::layout::LayoutState;

/// Everything that can go wrong inside the Vulkan backend.
///
/// `OutOfDate`/`Suboptimal` presentation results are deliberately absent:
/// they are recovered inside the frame loop and never escape it.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("no device memory type satisfies the requested property flags")]
    NoMemoryType,

    #[error("memory block has no room left for another image binding")]
    BindOverflow,

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedTransition { from: LayoutState, to: LayoutState },

    #[error("no physical device exposes a graphics queue that can present")]
    NoAdequateDevice,

    #[error("no supported depth attachment format")]
    NoDepthFormat,

    #[error("timed out waiting for the frame fence")]
    FenceTimeout,

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("vulkan loader: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("window handle: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;
