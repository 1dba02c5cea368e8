//! Swapchain management.
//!
//! Swapchain images are exposed as non-owning [`ImageHandle`]s, so command
//! lists track their layouts and keep their views alive like any other image.

use std::sync::Arc;

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::resource::{ImageHandle, RawImage};
use ash::vk;

/// Parameters for [`Swapchain::new`] that come from the surface.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub queue_family: u32,
}

/// Swapchain wrapper. Destroys the swapchain on drop.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<ImageHandle>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid and `device_api` must wrap `device`.
    pub unsafe fn new(
        device: &ash::Device,
        device_api: &Arc<dyn DeviceApi>,
        loader: &ash::khr::swapchain::Device,
        desc: &SwapchainDesc,
        old_swapchain: Option<&Self>,
    ) -> Result<Self> {
        // One more than the minimum so acquire rarely blocks
        let mut image_count = desc.capabilities.min_image_count + 1;
        if desc.capabilities.max_image_count > 0
            && image_count > desc.capabilities.max_image_count
        {
            image_count = desc.capabilities.max_image_count;
        }

        let queue_families = [desc.queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(desc.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.map_or(vk::SwapchainKHR::null(), |s| s.swapchain));

        // SAFETY: forwarded from the caller.
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        // SAFETY: the swapchain was just created; it is destroyed again on failure.
        let images = match unsafe { wrap_images(device, device_api, loader, swapchain, desc) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: no image of the swapchain was handed out.
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        tracing::info!(
            width = desc.extent.width,
            height = desc.extent.height,
            images = images.len(),
            format = ?desc.surface_format.format,
            present_mode = ?desc.present_mode,
            "Created swapchain"
        );

        Ok(Self {
            loader: loader.clone(),
            swapchain,
            images,
            format: desc.surface_format.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
        })
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Handle to the image at `index`, as returned by acquire.
    pub fn image(&self, index: u32) -> Option<&ImageHandle> {
        self.images.get(index as usize)
    }

    pub fn images(&self) -> &[ImageHandle] {
        &self.images
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Acquire the next image.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    /// `ERROR_OUT_OF_DATE_KHR` means no image was acquired and the swapchain
    /// must be recreated.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(GpuError::from)
    }

    /// Present an image. Returns `true` when the swapchain should be recreated.
    ///
    /// # Safety
    /// `queue` must be externally synchronized and the image must have been
    /// acquired and transitioned to `PRESENT_SRC_KHR`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: forwarded from the caller.
        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views go first; a handle still held elsewhere would outlive its image
        for image in self.images.drain(..) {
            if ImageHandle::strong_count(&image) > 1 {
                tracing::warn!(name = image.name(), "Swapchain image outlives its swapchain");
            }
        }
        // SAFETY: owners wait for the queue to go idle before dropping the swapchain.
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        tracing::debug!("Destroyed swapchain");
    }
}

/// Wrap every image of `swapchain` with a fresh view.
unsafe fn wrap_images(
    device: &ash::Device,
    device_api: &Arc<dyn DeviceApi>,
    loader: &ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    desc: &SwapchainDesc,
) -> Result<Vec<ImageHandle>> {
    // SAFETY: forwarded from the caller.
    let images = unsafe { loader.get_swapchain_images(swapchain)? };

    let mut handles = Vec::with_capacity(images.len());
    for (i, image) in images.into_iter().enumerate() {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.surface_format.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        // SAFETY: `image` belongs to the live swapchain. On failure the views
        // created so far are destroyed by dropping `handles`.
        let view = unsafe { device.create_image_view(&view_info, None)? };

        let raw = RawImage {
            image,
            view,
            format: desc.surface_format.format,
            extent: desc.extent,
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::UNDEFINED,
        };
        // SAFETY: the swapchain outlives the handle; `Swapchain::drop` releases
        // its handles before destroying the swapchain.
        handles.push(unsafe {
            ImageHandle::from_swapchain(
                Arc::clone(device_api),
                raw,
                format!("swapchain image {i}"),
            )
        });
    }
    Ok(handles)
}

/// Select the best surface format, preferring sRGB BGRA8.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("Surface reports no formats".to_string()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    // Mailbox, then immediate, then FIFO (always supported)
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_srgb_surface_format() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn falls_back_to_first_surface_format() {
        let available = [format(vk::Format::R8G8B8A8_UNORM)];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_follows_vsync() {
        let available = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&available, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&available, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_only_when_surface_leaves_it_open() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, 4000, 10).width, 800);

        caps.current_extent.width = u32::MAX;
        let extent = calculate_extent(&caps, 4000, 10);
        assert_eq!((extent.width, extent.height), (1024, 10));
    }
}
