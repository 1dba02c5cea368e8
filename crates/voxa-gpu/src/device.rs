//! The device seam.
//!
//! Everything above this module talks to Vulkan through [`DeviceApi`], the
//! small set of native calls that command lists, resource handles, semaphores
//! and queues need. `ash::Device` implements it directly; tests substitute a
//! recording fake.

use ash::prelude::VkResult;
use ash::vk;

/// A semaphore operation attached to a queue submission.
///
/// `value` is ignored for binary semaphores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

impl SemaphoreSubmit {
    /// A timeline wait or signal at `value`.
    pub const fn timeline(semaphore: vk::Semaphore, value: u64) -> Self {
        Self { semaphore, value }
    }

    /// A binary semaphore wait or signal.
    pub const fn binary(semaphore: vk::Semaphore) -> Self {
        Self {
            semaphore,
            value: 0,
        }
    }
}

/// Native device operations used by the command and resource layers.
///
/// Every method mirrors one Vulkan entry point and carries its validity rules.
///
/// # Safety
/// Callers must pass handles created from this device that are still alive,
/// and must respect Vulkan's external synchronization requirements for
/// command pools, command buffers and queues.
pub trait DeviceApi: Send + Sync {
    /// Create a command pool for `queue_family`.
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;

    /// Allocate one primary command buffer from `pool`.
    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool)
        -> VkResult<vk::CommandBuffer>;

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()>;

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    unsafe fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, info: &vk::RenderingInfo<'_>);

    unsafe fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);

    unsafe fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    unsafe fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport);

    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D);

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn destroy_image(&self, image: vk::Image);

    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Create a semaphore. `Some(initial)` creates a timeline semaphore.
    unsafe fn create_semaphore(&self, timeline_initial: Option<u64>) -> VkResult<vk::Semaphore>;

    unsafe fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;

    /// Signal a timeline semaphore from the host.
    unsafe fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()>;

    /// Wait until a timeline semaphore reaches `value`.
    ///
    /// Returns `Ok(false)` when `timeout_ns` elapses first.
    unsafe fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> VkResult<bool>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submit command buffers as a single batch.
    ///
    /// Waits and signals apply at `ALL_COMMANDS`.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        wait: &[SemaphoreSubmit],
        signal: &[SemaphoreSubmit],
    ) -> VkResult<()>;
}

impl DeviceApi for ash::Device {
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::create_command_pool(self, &create_info, None) }
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: forwarded from the caller.
        let buffers = unsafe { self.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::begin_command_buffer(self, cmd, &begin_info) }
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::end_command_buffer(self, cmd) }
    }

    unsafe fn reset_command_pool(
        &self,
        pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> VkResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::reset_command_pool(self, pool, flags) }
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        // SAFETY: forwarded from the caller.
        unsafe { self.free_command_buffers(pool, &[cmd]) }
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_command_pool(self, pool, None) }
    }

    unsafe fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, info: &vk::RenderingInfo<'_>) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_begin_rendering(self, cmd, info) }
    }

    unsafe fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_end_rendering(self, cmd) }
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_bind_pipeline(self, cmd, bind_point, pipeline) }
    }

    unsafe fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: forwarded from the caller.
        unsafe {
            ash::Device::cmd_draw(
                self,
                cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_copy_buffer(self, cmd, src, dst, regions) }
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: forwarded from the caller.
        unsafe {
            ash::Device::cmd_pipeline_barrier(
                self,
                cmd,
                src_stage,
                dst_stage,
                dependency_flags,
                &[],
                &[],
                image_barriers,
            );
        }
    }

    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_set_viewport(self, cmd, 0, std::slice::from_ref(viewport)) }
    }

    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::cmd_set_scissor(self, cmd, 0, std::slice::from_ref(scissor)) }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_buffer(self, buffer, None) }
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_image(self, image, None) }
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_image_view(self, view, None) }
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_pipeline(self, pipeline, None) }
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_pipeline_layout(self, layout, None) }
    }

    unsafe fn create_semaphore(&self, timeline_initial: Option<u64>) -> VkResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(timeline_initial.unwrap_or(0));
        let mut create_info = vk::SemaphoreCreateInfo::default();
        if timeline_initial.is_some() {
            create_info = create_info.push_next(&mut type_info);
        }
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::create_semaphore(self, &create_info, None) }
    }

    unsafe fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        // SAFETY: forwarded from the caller.
        unsafe { self.get_semaphore_counter_value(semaphore) }
    }

    unsafe fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::signal_semaphore(self, &signal_info) }
    }

    unsafe fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        // SAFETY: forwarded from the caller.
        match unsafe { self.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: forwarded from the caller.
        unsafe { ash::Device::destroy_semaphore(self, semaphore, None) }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        wait: &[SemaphoreSubmit],
        signal: &[SemaphoreSubmit],
    ) -> VkResult<()> {
        let to_info = |s: &SemaphoreSubmit| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore)
                .value(s.value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        };
        let wait_infos: Vec<_> = wait.iter().map(to_info).collect();
        let signal_infos: Vec<_> = signal.iter().map(to_info).collect();
        let command_infos: Vec<_> = command_buffers
            .iter()
            .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
            .collect();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signal_infos);

        // SAFETY: forwarded from the caller.
        unsafe { self.queue_submit2(queue, &[submit_info], vk::Fence::null()) }
    }
}
