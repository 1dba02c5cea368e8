//! Graphics pipeline creation for dynamic rendering.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::resource::PipelineHandle;

/// Graphics pipeline configuration.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }
}

impl GraphicsPipelineConfig {
    /// Vertex-buffer-less pipeline drawing a single color target without depth.
    ///
    /// Suited to full-screen passes that generate their vertices in the shader.
    pub fn fullscreen(
        vertex_shader: Vec<u32>,
        fragment_shader: Vec<u32>,
        color_format: vk::Format,
    ) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            color_formats: vec![color_format],
            depth_format: None,
            ..Self::default()
        }
    }
}

unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
    stage: &str,
) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    // SAFETY: forwarded from the caller.
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))
}

/// Create a graphics pipeline using dynamic rendering (Vulkan 1.3).
///
/// Viewport and scissor are dynamic state, so set them on the command list
/// before drawing.
///
/// # Safety
/// The device must be valid and shader code must be valid SPIR-V.
pub unsafe fn create_graphics_pipeline(
    device: &Arc<ash::Device>,
    config: &GraphicsPipelineConfig,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<PipelineHandle> {
    // SAFETY: forwarded from the caller.
    let vert_module = unsafe { create_shader_module(device, &config.vertex_shader, "Vertex")? };
    // SAFETY: forwarded from the caller.
    let frag_module =
        match unsafe { create_shader_module(device, &config.fragment_shader, "Fragment") } {
            Ok(module) => module,
            Err(e) => {
                // SAFETY: the module is unused.
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

    // SAFETY: forwarded from the caller.
    let result = unsafe {
        build_graphics_pipeline(
            device,
            config,
            vert_module,
            frag_module,
            descriptor_set_layouts,
            push_constant_ranges,
        )
    };

    // SAFETY: modules are not needed once pipeline creation returns.
    unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    }

    let (pipeline, layout) = result?;
    tracing::debug!(?pipeline, "Created graphics pipeline");

    let api: Arc<dyn DeviceApi> = device.clone();
    // SAFETY: both objects were just created from `device` and are owned by the handle.
    Ok(unsafe {
        PipelineHandle::from_raw(api, pipeline, layout, vk::PipelineBindPoint::GRAPHICS)
    })
}

unsafe fn build_graphics_pipeline(
    device: &ash::Device,
    config: &GraphicsPipelineConfig,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&config.vertex_bindings)
        .vertex_attribute_descriptions(&config.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(config.polygon_mode)
        .cull_mode(config.cull_mode)
        .front_face(config.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(config.depth_test)
        .depth_write_enable(config.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = config
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(descriptor_set_layouts)
        .push_constant_ranges(push_constant_ranges);

    // SAFETY: forwarded from the caller.
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&config.color_formats);
    if let Some(depth_format) = config.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    // SAFETY: forwarded from the caller.
    let created = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    match created.map(|pipelines| pipelines.into_iter().next()) {
        Ok(Some(pipeline)) => Ok((pipeline, layout)),
        Ok(None) => {
            // SAFETY: the layout is unused.
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation("No pipeline returned".to_string()))
        }
        Err((_pipelines, e)) => {
            // SAFETY: the layout is unused.
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullscreen_config_has_no_depth_or_culling() {
        let config =
            GraphicsPipelineConfig::fullscreen(vec![1], vec![2], vk::Format::R8G8B8A8_UNORM);
        assert_eq!(config.color_formats, vec![vk::Format::R8G8B8A8_UNORM]);
        assert_eq!(config.depth_format, None);
        assert!(!config.depth_test);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert!(config.vertex_bindings.is_empty());
    }
}
