// Graphics pipeline creation and management
//
// Pipelines live in a generational table. Callers hold a `PipelineId`; a
// popped pipeline's id stops resolving instead of aliasing a newer one.
// Viewport and scissor are dynamic so pipelines survive swapchain resizes.

use ash::vk;
use slotmap::SlotMap;
use std::ffi::CString;
use std::sync::Arc;

use super::handle::{Owned, OwnedPipeline, OwnedPipelineLayout};
use super::shader;
use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

slotmap::new_key_type! {
    pub struct PipelineId;
}

/// Vulkan guarantees at least this much push constant space.
pub const MAX_PUSH_CONSTANT_BYTES: u32 = 128;

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub spirv: Vec<u8>,
    pub entry_point: CString,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, spirv: Vec<u8>) -> Self {
        Self {
            stage,
            spirv,
            entry_point: CString::from(c"main"),
        }
    }
}

/// Everything needed to build one graphics pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub stages: Vec<ShaderStage>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    /// Bytes visible to every stage in `stages`. 0 for none.
    pub push_constant_size: u32,
    pub alpha_blend: bool,
}

impl PipelineDesc {
    pub fn new(stages: Vec<ShaderStage>) -> Self {
        Self {
            stages,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            push_constant_size: 0,
            alpha_blend: true,
        }
    }

    pub fn with_vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    /// Union of the declared stages; push constants are visible to all.
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stages
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, stage| acc | stage.stage)
    }

    pub fn validate(&self) -> Result<()> {
        let has_vertex = self
            .stages
            .iter()
            .any(|stage| stage.stage == vk::ShaderStageFlags::VERTEX);
        if !has_vertex {
            return Err(GraphicsError::InvalidShaderCode(
                "pipeline has no vertex stage".into(),
            ));
        }
        if self.push_constant_size % 4 != 0 || self.push_constant_size > MAX_PUSH_CONSTANT_BYTES {
            return Err(GraphicsError::InvalidShaderCode(format!(
                "push constant size {} must be a multiple of 4 and at most {}",
                self.push_constant_size, MAX_PUSH_CONSTANT_BYTES
            )));
        }
        Ok(())
    }
}

fn color_blend_attachment(alpha_blend: bool) -> vk::PipelineColorBlendAttachmentState {
    if alpha_blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    }
}

/// A built pipeline with its layout.
pub struct GraphicsPipeline {
    // Pipeline goes before its layout.
    pipeline: OwnedPipeline,
    layout: OwnedPipelineLayout,
    push_constant_stages: vk::ShaderStageFlags,
    push_constant_size: u32,
}

impl GraphicsPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }

    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.push_constant_stages
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub fn check_push_constants(&self, data: &[u8]) -> Result<()> {
        check_push_constant_range(data.len(), self.push_constant_size)
    }
}

fn check_push_constant_range(data_bytes: usize, range_bytes: u32) -> Result<()> {
    if data_bytes > range_bytes as usize {
        return Err(GraphicsError::PushConstantsTooLarge {
            data_bytes,
            range_bytes,
        });
    }
    Ok(())
}

pub struct PipelineTable {
    pipelines: SlotMap<PipelineId, GraphicsPipeline>,
    device: Arc<LogicalDevice>,
}

impl PipelineTable {
    pub fn new(device: &Arc<LogicalDevice>) -> Self {
        Self {
            pipelines: SlotMap::with_key(),
            device: device.clone(),
        }
    }

    /// Builds a pipeline for `render_pass` whose set 0 is `set_layout`.
    pub fn push(
        &mut self,
        desc: &PipelineDesc,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<PipelineId> {
        desc.validate()?;

        // Modules are only needed until the pipeline exists.
        let modules = desc
            .stages
            .iter()
            .map(|stage| shader::create_shader_module(&self.device, &stage.spirv))
            .collect::<Result<Vec<_>>>()?;

        let shader_stages: Vec<_> = desc
            .stages
            .iter()
            .zip(&modules)
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(module.raw())
                    .name(&stage.entry_point)
                    .build()
            })
            .collect();

        // ─── Layout ────────────────────────────────────────────────────
        let push_constant_stages = desc.stage_flags();
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: push_constant_stages,
            offset: 0,
            size: desc.push_constant_size,
        }];
        let set_layouts = [set_layout];
        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        if desc.push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
        }
        let layout = unsafe { self.device.device.create_pipeline_layout(&layout_info, None) }
            .map_err(GraphicsError::CreatingPipelineLayout)?;
        let layout = Owned::new(&self.device, layout);

        // ─── Fixed function state ──────────────────────────────────────
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Counts only; the rectangles are set per batch.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [color_blend_attachment(desc.alpha_blend)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.raw())
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| GraphicsError::CreatingPipeline(e))?;
        let pipeline = Owned::new(&self.device, pipelines[0]);

        let id = self.pipelines.insert(GraphicsPipeline {
            pipeline,
            layout,
            push_constant_stages,
            push_constant_size: desc.push_constant_size,
        });
        log::debug!("Pushed pipeline {:?} ({} stages)", id, desc.stages.len());
        Ok(id)
    }

    /// Destroys the pipeline once the GPU is done with it.
    pub fn pop(&mut self, id: PipelineId) -> Result<()> {
        if !self.pipelines.contains_key(id) {
            return Err(GraphicsError::StalePipeline);
        }
        self.device.wait_idle()?;
        self.pipelines.remove(id);
        log::debug!("Popped pipeline {:?}", id);
        Ok(())
    }

    pub fn get(&self, id: PipelineId) -> Result<&GraphicsPipeline> {
        self.pipelines.get(id).ok_or(GraphicsError::StalePipeline)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(flags: vk::ShaderStageFlags) -> ShaderStage {
        ShaderStage::new(flags, Vec::new())
    }

    #[test]
    fn push_constants_reach_every_stage() {
        let desc = PipelineDesc::new(vec![
            stage(vk::ShaderStageFlags::VERTEX),
            stage(vk::ShaderStageFlags::FRAGMENT),
        ]);
        assert_eq!(
            desc.stage_flags(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn vertex_stage_is_required() {
        let desc = PipelineDesc::new(vec![stage(vk::ShaderStageFlags::FRAGMENT)]);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn push_constant_size_is_checked() {
        let stages = vec![stage(vk::ShaderStageFlags::VERTEX)];
        assert!(PipelineDesc::new(stages.clone())
            .with_push_constants(64)
            .validate()
            .is_ok());
        assert!(PipelineDesc::new(stages.clone())
            .with_push_constants(6)
            .validate()
            .is_err());
        assert!(PipelineDesc::new(stages)
            .with_push_constants(MAX_PUSH_CONSTANT_BYTES + 4)
            .validate()
            .is_err());
    }

    #[test]
    fn push_constants_must_fit_the_range() {
        assert!(check_push_constant_range(16, 16).is_ok());
        assert!(check_push_constant_range(0, 0).is_ok());
        assert!(matches!(
            check_push_constant_range(20, 16),
            Err(GraphicsError::PushConstantsTooLarge { data_bytes: 20, range_bytes: 16 })
        ));
    }

    #[test]
    fn alpha_blend_uses_source_alpha() {
        let blend = color_blend_attachment(true);
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(color_blend_attachment(false).blend_enable, vk::FALSE);
    }

    #[test]
    fn default_entry_point_is_main() {
        assert_eq!(stage(vk::ShaderStageFlags::VERTEX).entry_point.as_bytes(), b"main");
    }
}
