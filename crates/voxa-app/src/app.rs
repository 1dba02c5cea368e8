//! `VoxaApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Voxa applications.
///
/// The framework handles window creation, GPU initialization, swapchain
/// management and the event loop.
///
/// GPU objects owned by the application (pipelines, buffers, images) are
/// dropped before the GPU context.
pub trait VoxaApp: Sized {
    /// Initialize the application.
    ///
    /// Called once when the application starts, after the GPU context and
    /// window have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record a frame.
    ///
    /// `frame.command_list` is already begun. The framework ends, submits and
    /// presents it afterwards, moving the swapchain image to
    /// `PRESENT_SRC_KHR` if the application left it in another layout.
    ///
    /// Leave no rendering scope open. On error an open scope is closed and
    /// the partial frame is still submitted.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the framework recreated the swapchain.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle device events (raw input).
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Cleanup before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
