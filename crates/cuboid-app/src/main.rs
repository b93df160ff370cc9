// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use cuboid_core::init_tracing;
use cuboid_render::{RenderSize, Renderer};
use cuboid_render_vk::VkRenderer;
use tracing::{error, info};

use cuboid_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

mod camera;
mod mesh;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = "cuboid.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
    #[serde(default)]
    vsync_mode: VsyncMode,
    /// How long one frame may wait on the GPU before the app bails out.
    #[serde(default = "default_fence_timeout_ms")]
    fence_timeout_ms: u64,
    #[serde(default = "default_unfocused_fps")]
    unfocused_fps: u32,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync_mode: VsyncMode::Mailbox,
            fence_timeout_ms: default_fence_timeout_ms(),
            unfocused_fps: default_unfocused_fps(),
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_fence_timeout_ms() -> u64 {
    5000
}
fn default_unfocused_fps() -> u32 {
    30
}

fn load_cfg(path: &std::path::Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).unwrap_or_default(),
        Err(_) => AppCfg::default(),
    }
}

fn vk_vsync_mode(mode: VsyncMode) -> cuboid_render_vk::VsyncMode {
    match mode {
        VsyncMode::Fifo => cuboid_render_vk::VsyncMode::Fifo,
        VsyncMode::Mailbox => cuboid_render_vk::VsyncMode::Mailbox,
    }
}

/// Checkerboard test texture, `cells` squares per side.
fn checker_rgba(size: u32, cells: u32) -> Vec<u8> {
    let cell = (size / cells).max(1);
    let mut rgba = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            if on {
                rgba.extend_from_slice(&[235, 235, 235, 255]);
            } else {
                rgba.extend_from_slice(&[90, 60, 150, 255]);
            }
        }
    }
    rgba
}

struct App {
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,

    cfg: AppCfg,
    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,
    last_frame: Instant,

    cam_distance: f32,
    spinning: bool,
    spin_angle: f32,

    paused: bool,
    focused: bool,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn init_renderer(&mut self, window: &Window) -> Result<VkRenderer> {
        let wh = window.window_handle()?;
        let dh = window.display_handle()?;
        let mut renderer = VkRenderer::new(&wh, &dh, self.render_size)?;

        renderer.set_clear_color(self.cfg.render.clear_color);
        renderer.set_vsync_mode(vk_vsync_mode(self.cfg.render.vsync_mode));
        renderer.set_fence_timeout(Duration::from_millis(self.cfg.render.fence_timeout_ms));

        renderer.upload_mesh(&mesh::cube())?;
        let tex = checker_rgba(64, 8);
        renderer.upload_texture(64, 64, &tex)?;
        Ok(renderer)
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = event_loop
                .create_window(Window::default_attributes().with_title("cuboid"))
                .expect("create_window");

            let size = window.inner_size();
            self.render_size = RenderSize {
                width: size.width.max(1),
                height: size.height.max(1),
            };

            match self.init_renderer(&window) {
                Ok(r) => self.renderer = Some(r),
                Err(e) => {
                    error!("vk init failed: {e:#}");
                    event_loop.exit();
                    return;
                }
            }

            info!("vsync mode cfg = {:?}", self.cfg.render.vsync_mode);
            self.window = Some(window);
        }

        event_loop.set_control_flow(ControlFlow::Wait);

        self.paused = self.render_size.width == 0 || self.render_size.height == 0;
        info!("resumed, paused={}", self.paused);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match logical_key {
                Key::Named(NamedKey::Escape) => {
                    info!("Escape");
                    self.exiting = true;
                    self.renderer = None;
                    self.window = None;
                    event_loop.exit();
                }
                Key::Character(c) if c.eq_ignore_ascii_case("w") => {
                    self.cam_distance = (self.cam_distance - 0.25).max(camera::MIN_DISTANCE);
                }
                Key::Character(c) if c.eq_ignore_ascii_case("s") => {
                    self.cam_distance = (self.cam_distance + 0.25).min(camera::MAX_DISTANCE);
                }
                Key::Character(c) if c.eq_ignore_ascii_case("r") => {
                    self.spinning = !self.spinning;
                    info!("spinning={}", self.spinning);
                }
                _ => {}
            },

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                let now_paused = self.render_size.width == 0 || self.render_size.height == 0;
                self.paused = now_paused;
                info!(
                    "Resized to {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );

                if !self.paused {
                    if let Some(renderer) = &mut self.renderer {
                        renderer.resize(self.render_size);
                    }
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused =
                    occluded || self.render_size.width == 0 || self.render_size.height == 0;
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} so paused={}", occluded, self.paused);
                }
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);
                    if focused {
                        self.next_frame_deadline = None;
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }

                let now = Instant::now();
                let dt = now.duration_since(self.last_frame).as_secs_f32();
                self.last_frame = now;
                if self.spinning {
                    self.spin_angle += dt;
                }

                if let Some(renderer) = &mut self.renderer {
                    let aspect =
                        self.render_size.width.max(1) as f32 / self.render_size.height.max(1) as f32;
                    renderer.set_view_proj(camera::view_proj(
                        aspect,
                        self.cam_distance,
                        self.spin_angle,
                    ));

                    match renderer.render() {
                        Ok(()) => {
                            self.frames = self.frames.saturating_add(1);
                        }
                        Err(e) => {
                            // Transient surface states are handled inside the
                            // renderer; anything surfacing here is fatal.
                            error!("render error: {e:#}");
                            self.exiting = true;
                            self.renderer = None;
                            self.window = None;
                            event_loop.exit();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        if self.focused {
            // Presentation paces us; keep a redraw queued at all times.
            event_loop.set_control_flow(ControlFlow::Poll);
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        } else {
            // Throttle in the background.
            let target_fps = self.cfg.render.unfocused_fps.max(1);
            let frame_dt = Duration::from_nanos(1_000_000_000u64 / target_fps as u64);
            let now = Instant::now();

            let due = match self.next_frame_deadline {
                None => true,
                Some(t) => now >= t,
            };
            if due {
                let next = now + frame_dt;
                self.next_frame_deadline = Some(next);
                event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            } else if let Some(t) = self.next_frame_deadline {
                event_loop.set_control_flow(ControlFlow::WaitUntil(t));
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        window: None,
        renderer: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        cfg: load_cfg(&args.config),
        exiting: false,
        frames: 0,
        last_fps_instant: Instant::now(),
        last_frame: Instant::now(),
        cam_distance: 3.0,
        spinning: true,
        spin_angle: 0.0,
        paused: false,
        focused: true,
        next_frame_deadline: None,
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply_to_empty_toml() {
        let cfg: AppCfg = toml::from_str("").unwrap();
        assert_eq!(cfg.render.clear_color, default_clear());
        assert_eq!(cfg.render.fence_timeout_ms, 5000);
        assert_eq!(cfg.render.unfocused_fps, 30);
        assert!(matches!(cfg.render.vsync_mode, VsyncMode::Mailbox));
    }

    #[test]
    fn config_overrides_parse() {
        let cfg: AppCfg = toml::from_str(
            r#"
            [render]
            clear_color = [0.1, 0.2, 0.3, 1.0]
            vsync_mode = "fifo"
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(cfg.render.fence_timeout_ms, 250);
        assert!(matches!(cfg.render.vsync_mode, VsyncMode::Fifo));
        // Unset keys still default.
        assert_eq!(cfg.render.unfocused_fps, 30);
    }

    #[test]
    fn checker_texture_alternates() {
        let rgba = checker_rgba(64, 8);
        assert_eq!(rgba.len(), 64 * 64 * 4);
        let px = |x: usize, y: usize| {
            let i = (y * 64 + x) * 4;
            [rgba[i], rgba[i + 1], rgba[i + 2], rgba[i + 3]]
        };
        assert_eq!(px(0, 0), px(16, 0));
        assert_ne!(px(0, 0), px(8, 0));
        assert_ne!(px(0, 0), px(0, 8));
    }
}
