//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use voxa_gpu::{
    BinarySemaphore, GpuContext, GpuError, GpuQueue, RecordingState, SubmitInfo, SurfaceContext,
    Swapchain, TimelineSemaphore,
};
use winit::window::Window;

use crate::frame::FrameContext;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Per-frame-slot synchronization.
struct FrameSlot {
    /// Signaled when the swapchain image is available.
    image_available: BinarySemaphore,
    /// Frame timeline value signaled by the slot's last submission.
    finish_value: u64,
}

/// Application context shared across all app methods.
///
/// Provides access to the GPU context, window, swapchain and queue.
// Field order is drop order: everything holding the device goes before `gpu`.
pub struct AppContext {
    /// Graphics queue. Submit extra work through it between frames.
    pub queue: GpuQueue,
    frame_timeline: TimelineSemaphore,
    frames: Vec<FrameSlot>,
    /// Per-swapchain-image render finished semaphores.
    render_finished: Vec<BinarySemaphore>,
    swapchain: Option<Swapchain>,
    surface: SurfaceContext,
    /// GPU context with device and allocator.
    pub gpu: GpuContext,
    /// The window handle.
    pub window: Arc<Window>,
    current_frame_index: usize,
    /// Total frames submitted.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Whether vsync is enabled.
    pub vsync: bool,
    /// Set when present reported the swapchain as suboptimal or out of date.
    swapchain_dirty: bool,
}

impl AppContext {
    /// Create a new application context.
    ///
    /// # Safety
    /// The window must have valid handles.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
    ) -> anyhow::Result<Self> {
        // SAFETY: caller guarantees the window has valid handles; the surface
        // is destroyed in `Drop` before the context.
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        // SAFETY: no swapchain exists yet.
        let swapchain = unsafe {
            surface.create_swapchain(&gpu, size.width.max(1), size.height.max(1), vsync, None)?
        };

        let render_finished = (0..swapchain.images().len())
            .map(|_| gpu.create_binary_semaphore())
            .collect::<Result<Vec<_>, _>>()?;

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| {
                Ok(FrameSlot {
                    image_available: gpu.create_binary_semaphore()?,
                    finish_value: 0,
                })
            })
            .collect::<Result<Vec<_>, GpuError>>()?;

        let frame_timeline = gpu.create_timeline_semaphore(0)?;
        let queue = gpu.create_queue();

        Ok(Self {
            queue,
            frame_timeline,
            frames,
            render_finished,
            swapchain: Some(swapchain),
            surface,
            gpu,
            window,
            current_frame_index: 0,
            frame_count: 0,
            last_frame_time: Instant::now(),
            vsync,
            swapchain_dirty: false,
        })
    }

    /// Current swapchain.
    pub fn swapchain(&self) -> anyhow::Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Swapchain is being recreated"))
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or_else(vk::Extent2D::default, Swapchain::extent)
    }

    /// Format of the swapchain images.
    pub fn surface_format(&self) -> vk::Format {
        self.swapchain
            .as_ref()
            .map_or(vk::Format::UNDEFINED, Swapchain::format)
    }

    /// Get the aspect ratio (width / height).
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Start a frame.
    ///
    /// Waits until the GPU finished the frame that last used this slot,
    /// recycles completed command lists, acquires a swapchain image and
    /// begins a command list. Returns `None` when the swapchain was out of
    /// date and had to be recreated; skip the frame in that case.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self, dt: f32) -> anyhow::Result<Option<FrameContext>> {
        if self.swapchain_dirty {
            self.recreate_swapchain_for_window()?;
        }

        let slot = &self.frames[self.current_frame_index];
        self.frame_timeline
            .wait_for_value(slot.finish_value, u64::MAX)?;
        self.queue.recycle()?;

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Swapchain is being recreated"))?;
        // SAFETY: the slot's last submission, the only waiter on this
        // semaphore, has finished.
        let acquired =
            unsafe { swapchain.acquire_next_image(slot.image_available.raw(), u64::MAX) };
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                self.swapchain_dirty |= suboptimal;
                index
            }
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                tracing::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain_for_window()?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let image = swapchain
            .image(image_index)
            .ok_or_else(|| anyhow::anyhow!("Acquired image {image_index} does not exist"))?
            .clone();

        let mut command_list = self.queue.command_list()?;
        command_list.begin()?;

        Ok(Some(FrameContext {
            command_list,
            image,
            image_index,
            frame_number: self.frame_count,
            dt,
        }))
    }

    /// Finish a frame: end, submit and present it.
    ///
    /// # Panics
    /// If the application left a rendering scope open.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self, frame: FrameContext) -> anyhow::Result<()> {
        let FrameContext {
            mut command_list,
            image,
            image_index,
            ..
        } = frame;

        if image.layout() != vk::ImageLayout::PRESENT_SRC_KHR
            && command_list.state() == RecordingState::Recording
        {
            command_list.change_image_layout(&image, vk::ImageLayout::PRESENT_SRC_KHR);
        }

        let Some(render_finished) = self.render_finished.get(image_index as usize) else {
            // Close the scope so the unsubmitted list can go back to the pool
            if command_list.state() == RecordingState::Recording {
                let _ = command_list.end();
            }
            self.queue.discard(command_list);
            anyhow::bail!("No render semaphore for image {image_index}");
        };
        if let Err(e) = command_list.end() {
            self.queue.discard(command_list);
            return Err(e.into());
        }

        let finish_value = self.frame_count + 1;
        let slot = &mut self.frames[self.current_frame_index];

        self.queue.submit(
            SubmitInfo::new(vec![command_list])
                .wait_semaphore(&slot.image_available)
                .signal_semaphore(render_finished)
                .signal_timeline(&self.frame_timeline, finish_value),
        )?;
        slot.finish_value = finish_value;

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Swapchain is being recreated"))?;
        // SAFETY: `&mut self` serializes queue access, and the submission above
        // moved the image to PRESENT_SRC_KHR before signaling `render_finished`.
        let needs_recreate =
            unsafe { swapchain.present(self.queue.raw(), image_index, &[render_finished.raw()])? };
        self.swapchain_dirty |= needs_recreate;

        self.current_frame_index = (self.current_frame_index + 1) % self.frames.len();
        self.frame_count = finish_value;
        Ok(())
    }

    /// Block until every submitted frame finished on the GPU.
    pub fn wait_idle(&mut self) -> anyhow::Result<()> {
        self.queue.wait_idle()?;
        self.gpu.wait_idle()?;
        Ok(())
    }

    /// Recreate the swapchain (e.g., after resize).
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.wait_idle()?;

        // Old image views must be gone before the old swapchain is destroyed
        self.swapchain = None;
        // SAFETY: the device is idle and no swapchain exists for the surface.
        let swapchain = unsafe {
            self.surface
                .create_swapchain(&self.gpu, width, height, self.vsync, None)?
        };

        if swapchain.images().len() != self.render_finished.len() {
            self.render_finished = (0..swapchain.images().len())
                .map(|_| self.gpu.create_binary_semaphore())
                .collect::<Result<Vec<_>, _>>()?;
        }

        self.swapchain = Some(swapchain);
        self.swapchain_dirty = false;
        Ok(())
    }

    fn recreate_swapchain_for_window(&mut self) -> anyhow::Result<()> {
        let size = self.window.inner_size();
        self.recreate_swapchain(size.width.max(1), size.height.max(1))
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::error!("Failed to wait idle before shutdown: {e}");
        }
        self.swapchain = None;
        // SAFETY: the swapchain is gone and the device is idle.
        unsafe { self.surface.destroy() };
    }
}
