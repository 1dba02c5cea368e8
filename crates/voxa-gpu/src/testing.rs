//! In-memory [`DeviceApi`] used by the unit tests.
//!
//! Every call is appended to a log. Timeline semaphores are simulated: values
//! signalled by a submission stay pending until the fake GPU "finishes" them,
//! either through [`FakeDevice::complete_submissions`] or a blocking wait.

use std::collections::HashMap;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::device::{DeviceApi, SemaphoreSubmit};
use crate::resource::{BufferHandle, ImageHandle, PipelineHandle, RawImage};

#[derive(Clone, Debug)]
pub struct AttachmentRecord {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub resolve_mode: vk::ResolveModeFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_color: [f32; 4],
}

#[derive(Clone, Debug)]
pub struct BarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub range: vk::ImageSubresourceRange,
}

#[derive(Clone, Debug)]
pub enum Call {
    CreateCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer {
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    },
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandPool {
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    },
    FreeCommandBuffer(vk::CommandBuffer),
    DestroyCommandPool(vk::CommandPool),
    BeginRendering {
        render_area: vk::Rect2D,
        layer_count: u32,
        color: Vec<AttachmentRecord>,
        depth: Option<AttachmentRecord>,
        stencil: Option<AttachmentRecord>,
    },
    EndRendering,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        barriers: Vec<BarrierRecord>,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    DestroyImageView(vk::ImageView),
    DestroyPipeline(vk::Pipeline),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Vec<SemaphoreSubmit>,
        signal: Vec<SemaphoreSubmit>,
    },
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    calls: Vec<Call>,
    timelines: HashMap<vk::Semaphore, u64>,
    in_flight: Vec<SemaphoreSubmit>,
    fail_next_submit: bool,
    fail_next_end: bool,
    fail_next_semaphore: bool,
}

impl FakeState {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn complete_submissions(&mut self) {
        for signal in self.in_flight.drain(..) {
            if let Some(value) = self.timelines.get_mut(&signal.semaphore) {
                *value = (*value).max(signal.value);
            }
        }
    }
}

#[derive(Default)]
pub struct FakeDevice {
    state: Mutex<FakeState>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn api(self: &Arc<Self>) -> Arc<dyn DeviceApi> {
        self.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Let the fake GPU finish everything submitted so far.
    pub fn complete_submissions(&self) {
        self.state.lock().complete_submissions();
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    pub fn fail_next_end(&self) {
        self.state.lock().fail_next_end = true;
    }

    pub fn fail_next_semaphore(&self) {
        self.state.lock().fail_next_semaphore = true;
    }

    pub fn buffer(self: &Arc<Self>, size: u64) -> BufferHandle {
        let raw = self.state.lock().next();
        // SAFETY: the fake device accepts any handle.
        unsafe { BufferHandle::from_raw(self.api(), raw, size, None, "test buffer") }
    }

    pub fn image(self: &Arc<Self>, width: u32, height: u32) -> ImageHandle {
        self.image_with_aspect(width, height, vk::ImageAspectFlags::COLOR)
    }

    pub fn image_with_aspect(
        self: &Arc<Self>,
        width: u32,
        height: u32,
        aspect: vk::ImageAspectFlags,
    ) -> ImageHandle {
        let (image, view) = {
            let mut state = self.state.lock();
            (state.next(), state.next())
        };
        let raw = RawImage {
            image,
            view,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent2D { width, height },
            aspect,
            layout: vk::ImageLayout::UNDEFINED,
        };
        // SAFETY: the fake device accepts any handle.
        unsafe { ImageHandle::from_raw(self.api(), raw, None, "test image") }
    }

    pub fn pipeline(self: &Arc<Self>) -> PipelineHandle {
        let (pipeline, layout) = {
            let mut state = self.state.lock();
            (state.next(), state.next())
        };
        // SAFETY: the fake device accepts any handle.
        unsafe {
            PipelineHandle::from_raw(
                self.api(),
                pipeline,
                layout,
                vk::PipelineBindPoint::GRAPHICS,
            )
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

fn attachment_record(info: &vk::RenderingAttachmentInfo<'_>) -> AttachmentRecord {
    AttachmentRecord {
        view: info.image_view,
        layout: info.image_layout,
        resolve_mode: info.resolve_mode,
        load_op: info.load_op,
        store_op: info.store_op,
        // SAFETY: every clear value in these tests is a float color.
        clear_color: unsafe { info.clear_value.color.float32 },
    }
}

impl DeviceApi for FakeDevice {
    unsafe fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.next();
        state.calls.push(Call::CreateCommandPool(pool));
        Ok(pool)
    }

    unsafe fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let cmd = state.next();
        state.calls.push(Call::AllocateCommandBuffer(cmd));
        Ok(cmd)
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        self.record(Call::BeginCommandBuffer { cmd, flags });
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_end) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.calls.push(Call::EndCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()> {
        self.record(Call::ResetCommandPool { pool, flags });
        Ok(())
    }

    unsafe fn free_command_buffer(&self, _pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        self.record(Call::FreeCommandBuffer(cmd));
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.record(Call::DestroyCommandPool(pool));
    }

    unsafe fn cmd_begin_rendering(&self, _cmd: vk::CommandBuffer, info: &vk::RenderingInfo<'_>) {
        let color = if info.color_attachment_count == 0 {
            Vec::new()
        } else {
            // SAFETY: the pointer/count pair comes from a live slice.
            unsafe {
                std::slice::from_raw_parts(
                    info.p_color_attachments,
                    info.color_attachment_count as usize,
                )
            }
            .iter()
            .map(attachment_record)
            .collect()
        };
        // SAFETY: null or pointing at a live attachment for the duration of the call.
        let depth = unsafe { info.p_depth_attachment.as_ref() }.map(attachment_record);
        // SAFETY: as above.
        let stencil = unsafe { info.p_stencil_attachment.as_ref() }.map(attachment_record);

        self.record(Call::BeginRendering {
            render_area: info.render_area,
            layer_count: info.layer_count,
            color,
            depth,
            stencil,
        });
    }

    unsafe fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.record(Call::EndRendering);
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Call::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    unsafe fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record(Call::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    unsafe fn cmd_copy_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(Call::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let barriers = image_barriers
            .iter()
            .map(|b| BarrierRecord {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                src_access: b.src_access_mask,
                dst_access: b.dst_access_mask,
                src_queue_family: b.src_queue_family_index,
                dst_queue_family: b.dst_queue_family_index,
                range: b.subresource_range,
            })
            .collect();
        self.record(Call::PipelineBarrier {
            src_stage,
            dst_stage,
            dependency_flags,
            barriers,
        });
    }

    unsafe fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.record(Call::SetViewport(*viewport));
    }

    unsafe fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        self.record(Call::SetScissor(*scissor));
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.record(Call::DestroyBuffer(buffer));
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.record(Call::DestroyImage(image));
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.record(Call::DestroyImageView(view));
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(Call::DestroyPipeline(pipeline));
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record(Call::DestroyPipelineLayout(layout));
    }

    unsafe fn create_semaphore(&self, timeline_initial: Option<u64>) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_semaphore) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let semaphore = state.next();
        if let Some(initial) = timeline_initial {
            state.timelines.insert(semaphore, initial);
        }
        state.calls.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        self.state
            .lock()
            .timelines
            .get(&semaphore)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let current = state
            .timelines
            .get_mut(&semaphore)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *current = (*current).max(value);
        Ok(())
    }

    unsafe fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        if timeout_ns > 0 {
            state.complete_submissions();
        }
        let current = state
            .timelines
            .get(&semaphore)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        Ok(current >= value)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.timelines.remove(&semaphore);
        state.calls.push(Call::DestroySemaphore(semaphore));
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        wait: &[SemaphoreSubmit],
        signal: &[SemaphoreSubmit],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.in_flight.extend_from_slice(signal);
        state.calls.push(Call::Submit {
            command_buffers: command_buffers.to_vec(),
            wait: wait.to_vec(),
            signal: signal.to_vec(),
        });
        Ok(())
    }
}
