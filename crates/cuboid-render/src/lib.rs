// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// One mesh vertex. Plain bytes, uploaded verbatim to the GPU.
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Note the new drawable size. Consumed once, at the start of the next
    /// frame; resizing never tears anything down mid-frame.
    fn resize(&mut self, size: RenderSize);

    fn render(&mut self) -> Result<()>;

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<()>;
    fn upload_texture(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<()>;

    fn set_view_proj(&mut self, view_proj: [[f32; 4]; 4]);
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
