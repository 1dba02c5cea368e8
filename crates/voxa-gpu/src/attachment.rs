//! Render attachment descriptions for dynamic rendering.
//!
//! These are the caller-facing descriptions passed to
//! [`CommandList::begin_rendering`](crate::CommandList::begin_rendering).
//! They are translated into `vk::RenderingAttachmentInfo` at record time and
//! never stored past that call.

use ash::vk;

use crate::resource::ImageHandle;

/// One image bound as a color, depth or stencil target.
#[derive(Clone)]
pub struct RenderAttachment {
    pub image: ImageHandle,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    /// Used with `AttachmentLoadOp::CLEAR`. Zero when absent.
    pub clear_value: Option<vk::ClearValue>,
    /// Ignored for color attachments.
    pub resolve_mode: Option<vk::ResolveModeFlags>,
}

impl RenderAttachment {
    /// Load existing contents and store the result.
    pub fn new(image: ImageHandle) -> Self {
        Self {
            image,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: None,
            resolve_mode: None,
        }
    }

    /// Clear to `value` on load and store the result.
    pub fn cleared(image: ImageHandle, value: vk::ClearValue) -> Self {
        Self {
            load_op: vk::AttachmentLoadOp::CLEAR,
            clear_value: Some(value),
            ..Self::new(image)
        }
    }

    pub fn load_op(mut self, load_op: vk::AttachmentLoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn store_op(mut self, store_op: vk::AttachmentStoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn resolve_mode(mut self, mode: vk::ResolveModeFlags) -> Self {
        self.resolve_mode = Some(mode);
        self
    }
}

/// Everything [`CommandList::begin_rendering`](crate::CommandList::begin_rendering) needs.
#[derive(Clone, Default)]
pub struct RenderingInfo {
    pub color_attachments: Vec<RenderAttachment>,
    pub depth_attachment: Option<RenderAttachment>,
    pub stencil_attachment: Option<RenderAttachment>,
    /// Derived from the attachments when absent, see [`render_area`].
    pub render_area: Option<vk::Rect2D>,
}

impl RenderingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, attachment: RenderAttachment) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: RenderAttachment) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    pub fn stencil(mut self, attachment: RenderAttachment) -> Self {
        self.stencil_attachment = Some(attachment);
        self
    }

    pub fn area(mut self, area: vk::Rect2D) -> Self {
        self.render_area = Some(area);
        self
    }
}

/// The area rendering covers.
///
/// An explicit area wins. Otherwise the full extent of the first color
/// attachment, then the depth attachment, then the stencil attachment. With no
/// attachments at all the area is zero-sized, which is legal.
pub fn render_area(info: &RenderingInfo) -> vk::Rect2D {
    if let Some(area) = info.render_area {
        return area;
    }

    let extent = info
        .color_attachments
        .first()
        .or(info.depth_attachment.as_ref())
        .or(info.stencil_attachment.as_ref())
        .map(|attachment| attachment.image.extent())
        .unwrap_or_default();

    vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    }
}

/// Native attachment record for `attachment` in its current layout.
pub(crate) fn attachment_info(
    attachment: &RenderAttachment,
    resolve_mode: vk::ResolveModeFlags,
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(attachment.image.view())
        .image_layout(attachment.image.layout())
        .resolve_mode(resolve_mode)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear_value.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn explicit_area_wins() {
        let device = FakeDevice::new();
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 10, y: 20 },
            extent: extent(32, 32),
        };
        let info = RenderingInfo::new()
            .color(RenderAttachment::new(device.image(800, 600)))
            .area(area);

        assert_eq!(render_area(&info), area);
    }

    #[test]
    fn area_from_first_color_attachment() {
        let device = FakeDevice::new();
        let info = RenderingInfo::new()
            .color(RenderAttachment::new(device.image(800, 600)))
            .color(RenderAttachment::new(device.image(100, 100)))
            .depth(RenderAttachment::new(device.image(50, 50)));

        let area = render_area(&info);
        assert_eq!(area.offset, vk::Offset2D::default());
        assert_eq!(area.extent, extent(800, 600));
    }

    #[test]
    fn area_falls_back_to_depth_then_stencil() {
        let device = FakeDevice::new();
        let depth_only = RenderingInfo::new()
            .depth(RenderAttachment::new(device.image(640, 480)))
            .stencil(RenderAttachment::new(device.image(16, 16)));
        assert_eq!(render_area(&depth_only).extent, extent(640, 480));

        let stencil_only = RenderingInfo::new().stencil(RenderAttachment::new(device.image(16, 8)));
        assert_eq!(render_area(&stencil_only).extent, extent(16, 8));
    }

    #[test]
    fn no_attachments_gives_zero_area() {
        let area = render_area(&RenderingInfo::new());
        assert_eq!(area.extent, extent(0, 0));
        assert_eq!(area.offset, vk::Offset2D::default());
    }

    #[test]
    fn translation_uses_current_layout_and_clear_value() {
        let device = FakeDevice::new();
        let image = device.image(4, 4);
        image.set_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.25, 0.5, 0.75, 1.0],
            },
        };
        let attachment = RenderAttachment::cleared(image.clone(), clear)
            .store_op(vk::AttachmentStoreOp::DONT_CARE);

        let info = attachment_info(&attachment, vk::ResolveModeFlags::NONE);
        assert_eq!(info.image_view, image.view());
        assert_eq!(info.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(info.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(info.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(info.resolve_mode, vk::ResolveModeFlags::NONE);
        // SAFETY: written as a float color above.
        assert_eq!(unsafe { info.clear_value.color.float32 }, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn missing_clear_value_is_zero() {
        let device = FakeDevice::new();
        let attachment = RenderAttachment::new(device.image(4, 4));
        let info = attachment_info(&attachment, vk::ResolveModeFlags::NONE);
        // SAFETY: a zeroed union reads back as zero floats.
        assert_eq!(unsafe { info.clear_value.color.float32 }, [0.0; 4]);
    }
}
