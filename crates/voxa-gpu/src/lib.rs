//! Vulkan command lists and resource lifetimes for the Voxa renderer.
//!
//! This crate provides:
//! - A [`CommandList`] that enforces a recording state machine and keeps every
//!   buffer, image and pipeline it references alive until it is reset
//! - Reference-counted resource handles; images carry their current layout
//! - Translation of attachment descriptions for dynamic rendering
//! - Queue submission with timeline-based recycling of command lists
//! - Vulkan instance, device, memory and swapchain management
//!
//! Native calls made by command lists and handles go through [`DeviceApi`],
//! which `ash::Device` implements.

pub mod attachment;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod testing;

pub use attachment::{render_area, RenderAttachment, RenderingInfo};
pub use command::{CommandList, RecordingState};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{DeviceApi, SemaphoreSubmit};
pub use error::{GpuError, Result};
pub use memory::{BufferDesc, GpuAllocator, Image2dDesc, MemoryBlock};
pub use pipeline::GraphicsPipelineConfig;
pub use queue::{GpuQueue, SubmitInfo};
pub use resource::{BufferHandle, ImageHandle, PipelineHandle, RawImage};
pub use staging::{StagingBuffer, StagingBufferPool, STAGING_BUFFER_SIZE};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainDesc};
pub use sync::{BinarySemaphore, TimelineSemaphore};
