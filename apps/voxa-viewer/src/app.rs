//! Viewer application: clears every swapchain image to a slowly cycling color.

use ash::vk;
use tracing::info;

use voxa_app::{AppContext, FrameContext, VoxaApp};
use voxa_gpu::{RenderAttachment, RenderingInfo};

/// Seconds for one full trip around the color wheel.
const CYCLE_SECONDS: f32 = 8.0;

pub struct Viewer {
    elapsed: f32,
}

impl VoxaApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        info!(
            "Viewer ready on {} ({}x{}, {:?})",
            ctx.gpu.device_name(),
            ctx.extent().width,
            ctx.extent().height,
            ctx.surface_format()
        );
        Ok(Self { elapsed: 0.0 })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.elapsed = (self.elapsed + dt) % CYCLE_SECONDS;
    }

    fn render(&mut self, _ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let viewport = frame.full_viewport();
        let scissor = frame.full_rect();
        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color(self.elapsed / CYCLE_SECONDS),
            },
        };

        let list = &mut frame.command_list;
        list.change_image_layout(&frame.image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        list.begin_rendering(
            &RenderingInfo::new().color(RenderAttachment::cleared(frame.image.clone(), clear)),
        );
        list.set_viewport(&viewport);
        list.set_scissor(&scissor);
        list.end_rendering();
        // The framework moves the image to PRESENT_SRC_KHR before submitting.
        Ok(())
    }
}

/// Dimmed hue-wheel color for `phase` in `0..1`.
fn clear_color(phase: f32) -> [f32; 4] {
    let hue = phase.rem_euclid(1.0) * 6.0;
    let x = 1.0 - ((hue % 2.0) - 1.0).abs();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (r, g, b) = match hue as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let dim = 0.25;
    [r * dim, g * dim, b * dim, 1.0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_color_walks_the_hue_wheel() {
        assert_eq!(clear_color(0.0), [0.25, 0.0, 0.0, 1.0]);
        assert_eq!(clear_color(0.5), [0.0, 0.25, 0.25, 1.0]);
        assert_eq!(clear_color(1.0), clear_color(0.0));
    }

    #[test]
    fn clear_color_is_opaque_and_dim() {
        for step in 0..60 {
            #[allow(clippy::cast_precision_loss)]
            let color = clear_color(step as f32 / 60.0);
            assert!((color[3] - 1.0).abs() < f32::EPSILON);
            assert!(color[..3].iter().all(|c| (0.0..=0.25).contains(c)));
        }
    }
}
