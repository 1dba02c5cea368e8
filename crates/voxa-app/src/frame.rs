//! Per-frame context for rendering.

use ash::vk;
use voxa_gpu::{CommandList, ImageHandle};

/// Context for the current frame being rendered.
pub struct FrameContext {
    /// Begun command list for this frame's work.
    pub command_list: CommandList,
    /// The acquired swapchain image.
    pub image: ImageHandle,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Current frame number.
    pub frame_number: u64,
    /// Delta time since last frame in seconds.
    pub dt: f32,
}

impl FrameContext {
    /// Size of the swapchain image.
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    /// Rectangle covering the whole swapchain image.
    pub fn full_rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent(),
        }
    }

    /// Viewport covering the whole swapchain image with a `0..1` depth range.
    #[allow(clippy::cast_precision_loss)]
    pub fn full_viewport(&self) -> vk::Viewport {
        let extent = self.extent();
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}
