// SPDX-License-Identifier: CEPL-1.0
//! The acquire/record/submit/present protocol for a single in-flight frame.
//!
//! [`run_frame`] owns the ordering rules; the [`FrameDriver`] trait is the
//! seam between those rules and the actual Vulkan calls, which also lets the
//! protocol run against an instrumented fake in tests.

use ash::vk;

use crate::context::DeviceContext;
use crate::error::Result;

/// Per-frame sync objects and the one command buffer.
pub struct Frame {
    pub fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_done: vk::Semaphore,
    pub cmd: vk::CommandBuffer,
}

impl Frame {
    pub unsafe fn create(ctx: &DeviceContext, pool: vk::CommandPool) -> Result<Self> {
        // Signaled so the very first wait falls through.
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let sem_info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe {
            let fence = ctx.device.create_fence(&fence_info, None)?;
            let image_available = ctx.device.create_semaphore(&sem_info, None)?;
            let render_done = ctx.device.create_semaphore(&sem_info, None)?;
            let cmd = ctx.device.allocate_command_buffers(&alloc_info)?[0];
            Ok(Self {
                fence,
                image_available,
                render_done,
                cmd,
            })
        }
    }

    /// The command buffer goes down with its pool.
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device.destroy_fence(self.fence, None);
            ctx.device.destroy_semaphore(self.image_available, None);
            ctx.device.destroy_semaphore(self.render_done, None);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Surface incompatible; the frame must be abandoned before recording.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    OutOfDate,
    Suboptimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered,
    /// Abandoned at acquire; the swapchain was recreated instead.
    Skipped,
}

/// What one frame needs from the renderer. Transient presentation results
/// are returned as values; everything else is an error and fatal.
pub trait FrameDriver {
    type Error;

    /// Consume a pending resize notice, if any. At most one per frame.
    fn take_pending_resize(&mut self) -> bool;
    fn wait_fence(&mut self) -> std::result::Result<(), Self::Error>;
    fn reset_fence(&mut self) -> std::result::Result<(), Self::Error>;
    fn acquire(&mut self) -> std::result::Result<AcquireOutcome, Self::Error>;
    fn record(&mut self, image_index: u32) -> std::result::Result<(), Self::Error>;
    fn submit(&mut self) -> std::result::Result<(), Self::Error>;
    fn present(&mut self, image_index: u32) -> std::result::Result<PresentOutcome, Self::Error>;
    /// Full GPU drain. Required before any swapchain teardown.
    fn drain(&mut self) -> std::result::Result<(), Self::Error>;
    /// Destroy and rebuild everything swapchain-sized, bumping the
    /// generation counter.
    fn recreate(&mut self) -> std::result::Result<(), Self::Error>;
    /// Re-signal the frame fence after a frame was abandoned between the
    /// fence reset and the submit that would normally signal it.
    fn rearm_fence(&mut self) -> std::result::Result<(), Self::Error>;
}

/// Drive one frame through the protocol.
///
/// Ordering guarantees enforced here:
/// - the command buffer is only reset/recorded after the fence wait, i.e.
///   after the GPU finished the previous submission that used it;
/// - on an out-of-date acquire the swapchain is recreated only after a full
///   drain, nothing is recorded, and the frame is skipped;
/// - on an out-of-date/suboptimal present the recreate happens after the
///   present call returned, and the frame still counts as complete.
pub fn run_frame<D: FrameDriver>(driver: &mut D) -> std::result::Result<FrameOutcome, D::Error> {
    if driver.take_pending_resize() {
        driver.drain()?;
        driver.recreate()?;
    }

    driver.wait_fence()?;
    driver.reset_fence()?;

    let image_index = match driver.acquire()? {
        AcquireOutcome::Ready(index) => index,
        AcquireOutcome::OutOfDate => {
            driver.drain()?;
            driver.recreate()?;
            driver.rearm_fence()?;
            return Ok(FrameOutcome::Skipped);
        }
    };

    driver.record(image_index)?;
    driver.submit()?;

    match driver.present(image_index)? {
        PresentOutcome::Presented => {}
        PresentOutcome::OutOfDate | PresentOutcome::Suboptimal => {
            driver.drain()?;
            driver.recreate()?;
        }
    }

    Ok(FrameOutcome::Rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::result::Result;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Ev {
        WaitFence,
        ResetFence,
        Acquire,
        Record(u32),
        Submit,
        Present(u32),
        Drain,
        Recreate,
        Rearm,
    }

    #[derive(Debug, PartialEq)]
    struct Fatal;

    /// Scripted driver that logs every call and models the fence and the
    /// swapchain generation the way the real renderer does.
    struct FakeDriver {
        events: Vec<Ev>,
        acquire_script: Vec<Result<AcquireOutcome, Fatal>>,
        present_script: Vec<Result<PresentOutcome, Fatal>>,
        pending_resize: Option<(u32, u32)>,
        window_size: (u32, u32),
        extent: (u32, u32),
        generation: u64,
        fence_signaled: bool,
        gpu_busy: bool,
    }

    impl FakeDriver {
        fn new() -> Self {
            Self {
                events: Vec::new(),
                acquire_script: Vec::new(),
                present_script: Vec::new(),
                pending_resize: None,
                window_size: (640, 480),
                extent: (640, 480),
                generation: 0,
                fence_signaled: true,
                gpu_busy: false,
            }
        }
    }

    impl FrameDriver for FakeDriver {
        type Error = Fatal;

        fn take_pending_resize(&mut self) -> bool {
            match self.pending_resize.take() {
                Some(size) => {
                    self.window_size = size;
                    true
                }
                None => false,
            }
        }

        fn wait_fence(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::WaitFence);
            // An unsignaled fence with no work that will signal it is the
            // deadlock this protocol must never reach.
            assert!(
                self.fence_signaled || self.gpu_busy,
                "fence wait would block forever"
            );
            self.fence_signaled = true;
            self.gpu_busy = false;
            Ok(())
        }

        fn reset_fence(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::ResetFence);
            self.fence_signaled = false;
            Ok(())
        }

        fn acquire(&mut self) -> Result<AcquireOutcome, Fatal> {
            self.events.push(Ev::Acquire);
            self.acquire_script.remove(0)
        }

        fn record(&mut self, image_index: u32) -> Result<(), Fatal> {
            self.events.push(Ev::Record(image_index));
            Ok(())
        }

        fn submit(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::Submit);
            self.gpu_busy = true;
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<PresentOutcome, Fatal> {
            self.events.push(Ev::Present(image_index));
            self.present_script.remove(0)
        }

        fn drain(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::Drain);
            // Draining retires the in-flight submission, if any.
            if self.gpu_busy {
                self.gpu_busy = false;
                self.fence_signaled = true;
            }
            Ok(())
        }

        fn recreate(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::Recreate);
            self.extent = self.window_size;
            self.generation += 1;
            Ok(())
        }

        fn rearm_fence(&mut self) -> Result<(), Fatal> {
            self.events.push(Ev::Rearm);
            self.fence_signaled = true;
            Ok(())
        }
    }

    /// Every fence wait after the first must be separated from the previous
    /// one by exactly one reset.
    fn assert_fence_discipline(events: &[Ev]) {
        let mut resets_since_wait = None::<u32>;
        for ev in events {
            match ev {
                Ev::WaitFence => {
                    if let Some(resets) = resets_since_wait {
                        assert_eq!(resets, 1, "fence waited on twice without one reset between");
                    }
                    resets_since_wait = Some(0);
                }
                Ev::ResetFence => {
                    if let Some(resets) = resets_since_wait.as_mut() {
                        *resets += 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// The command buffer must not be touched between a submit and the next
    /// fence wait.
    fn assert_cmd_untouched_while_in_flight(events: &[Ev]) {
        let mut in_flight = false;
        for ev in events {
            match ev {
                Ev::Submit => in_flight = true,
                Ev::WaitFence => in_flight = false,
                Ev::Record(_) => {
                    assert!(!in_flight, "command buffer recorded while still in flight")
                }
                _ => {}
            }
        }
    }

    #[test]
    fn happy_path_orders_the_protocol() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![Ok(AcquireOutcome::Ready(2))];
        d.present_script = vec![Ok(PresentOutcome::Presented)];

        let outcome = run_frame(&mut d).unwrap();

        assert_eq!(outcome, FrameOutcome::Rendered);
        assert_eq!(
            d.events,
            vec![
                Ev::WaitFence,
                Ev::ResetFence,
                Ev::Acquire,
                Ev::Record(2),
                Ev::Submit,
                Ev::Present(2),
            ]
        );
        assert_eq!(d.generation, 0);
    }

    #[test]
    fn acquire_out_of_date_recreates_once_and_skips() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![Ok(AcquireOutcome::OutOfDate)];

        let outcome = run_frame(&mut d).unwrap();

        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(d.generation, 1);
        assert_eq!(d.events.iter().filter(|&&e| e == Ev::Recreate).count(), 1);
        assert!(!d.events.iter().any(|e| matches!(e, Ev::Record(_))));
        assert!(!d.events.iter().any(|&e| e == Ev::Submit));
        assert!(!d.events.iter().any(|e| matches!(e, Ev::Present(_))));
        // The drain must come before the recreate.
        let drain = d.events.iter().position(|&e| e == Ev::Drain).unwrap();
        let recreate = d.events.iter().position(|&e| e == Ev::Recreate).unwrap();
        assert!(drain < recreate);
    }

    #[test]
    fn skipped_frame_leaves_the_fence_usable() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![
            Ok(AcquireOutcome::OutOfDate),
            Ok(AcquireOutcome::Ready(0)),
        ];
        d.present_script = vec![Ok(PresentOutcome::Presented)];

        assert_eq!(run_frame(&mut d).unwrap(), FrameOutcome::Skipped);
        // The fake panics inside wait_fence if the skip path left the fence
        // permanently unsignaled.
        assert_eq!(run_frame(&mut d).unwrap(), FrameOutcome::Rendered);

        assert_fence_discipline(&d.events);
        assert_cmd_untouched_while_in_flight(&d.events);
    }

    #[test]
    fn present_suboptimal_recreates_after_presenting() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![Ok(AcquireOutcome::Ready(1))];
        d.present_script = vec![Ok(PresentOutcome::Suboptimal)];
        d.window_size = (1920, 1080);

        let outcome = run_frame(&mut d).unwrap();

        // The frame still counts even though its output may be stale.
        assert_eq!(outcome, FrameOutcome::Rendered);
        assert_eq!(d.generation, 1);
        // New extent matches the last-known window size.
        assert_eq!(d.extent, (1920, 1080));
        let present = d
            .events
            .iter()
            .position(|e| matches!(e, Ev::Present(_)))
            .unwrap();
        let recreate = d.events.iter().position(|&e| e == Ev::Recreate).unwrap();
        assert!(present < recreate);
    }

    #[test]
    fn present_out_of_date_recreates_too() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![Ok(AcquireOutcome::Ready(0))];
        d.present_script = vec![Ok(PresentOutcome::OutOfDate)];

        assert_eq!(run_frame(&mut d).unwrap(), FrameOutcome::Rendered);
        assert_eq!(d.generation, 1);
    }

    #[test]
    fn pending_resize_is_consumed_before_the_frame() {
        let mut d = FakeDriver::new();
        d.pending_resize = Some((800, 600));
        d.acquire_script = vec![Ok(AcquireOutcome::Ready(0))];
        d.present_script = vec![Ok(PresentOutcome::Presented)];

        assert_eq!(run_frame(&mut d).unwrap(), FrameOutcome::Rendered);
        assert_eq!(d.generation, 1);
        assert_eq!(d.extent, (800, 600));
        assert_eq!(d.events[0], Ev::Drain);
        assert_eq!(d.events[1], Ev::Recreate);
        assert_eq!(d.events[2], Ev::WaitFence);

        // Consumed exactly once.
        d.acquire_script = vec![Ok(AcquireOutcome::Ready(0))];
        d.present_script = vec![Ok(PresentOutcome::Presented)];
        run_frame(&mut d).unwrap();
        assert_eq!(d.generation, 1);
    }

    #[test]
    fn fatal_acquire_propagates() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![Err(Fatal)];

        assert_eq!(run_frame(&mut d), Err(Fatal));
        // No recovery was attempted.
        assert!(!d.events.iter().any(|&e| e == Ev::Recreate));
    }

    #[test]
    fn steady_state_obeys_fence_and_cmd_discipline() {
        let mut d = FakeDriver::new();
        d.acquire_script = vec![
            Ok(AcquireOutcome::Ready(0)),
            Ok(AcquireOutcome::Ready(1)),
            Ok(AcquireOutcome::OutOfDate),
            Ok(AcquireOutcome::Ready(0)),
        ];
        d.present_script = vec![
            Ok(PresentOutcome::Presented),
            Ok(PresentOutcome::Suboptimal),
            Ok(PresentOutcome::Presented),
        ];

        for _ in 0..4 {
            run_frame(&mut d).unwrap();
        }

        assert_fence_discipline(&d.events);
        assert_cmd_untouched_while_in_flight(&d.events);
        assert_eq!(d.generation, 2);
    }
}
