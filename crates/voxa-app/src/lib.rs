//! Application framework for the Voxa renderer.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation and recreation
//! - Frame pacing on a timeline semaphore
//! - Event loop handling
//!
//! Each frame hands the application a begun [`CommandList`](voxa_gpu::CommandList)
//! and the acquired swapchain image as an [`ImageHandle`](voxa_gpu::ImageHandle).
//!
//! # Example
//!
//! ```no_run
//! use voxa_app::{VoxaApp, AppContext, FrameContext, AppConfig, run_app};
//!
//! struct MyApp;
//!
//! impl VoxaApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {}
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::VoxaApp;
pub use context::{AppContext, FRAMES_IN_FLIGHT};
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig, FpsStats};

// Re-export commonly used types for convenience
pub use voxa_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
