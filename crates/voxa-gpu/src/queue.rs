//! Queue submission and command list recycling.
//!
//! [`GpuQueue`] hands out command lists, submits them, and keeps each
//! submission's lists alive until an internal timeline semaphore shows the GPU
//! has finished with them. [`GpuQueue::recycle`] then resets those lists, which
//! releases the resources they retained, and puts them back in the pool.

use std::sync::Arc;

use ash::vk;

use crate::command::{CommandList, RecordingState};
use crate::device::{DeviceApi, SemaphoreSubmit};
use crate::error::Result;
use crate::sync::{BinarySemaphore, TimelineSemaphore};

/// One batch of command lists plus the semaphores it waits on and signals.
#[derive(Default)]
pub struct SubmitInfo<'a> {
    pub command_lists: Vec<CommandList>,
    pub wait_timelines: Vec<(&'a TimelineSemaphore, u64)>,
    pub signal_timelines: Vec<(&'a TimelineSemaphore, u64)>,
    pub wait_semaphores: Vec<&'a BinarySemaphore>,
    pub signal_semaphores: Vec<&'a BinarySemaphore>,
}

impl<'a> SubmitInfo<'a> {
    pub fn new(command_lists: Vec<CommandList>) -> Self {
        Self {
            command_lists,
            ..Self::default()
        }
    }

    pub fn wait_timeline(mut self, timeline: &'a TimelineSemaphore, value: u64) -> Self {
        self.wait_timelines.push((timeline, value));
        self
    }

    pub fn signal_timeline(mut self, timeline: &'a TimelineSemaphore, value: u64) -> Self {
        self.signal_timelines.push((timeline, value));
        self
    }

    pub fn wait_semaphore(mut self, semaphore: &'a BinarySemaphore) -> Self {
        self.wait_semaphores.push(semaphore);
        self
    }

    pub fn signal_semaphore(mut self, semaphore: &'a BinarySemaphore) -> Self {
        self.signal_semaphores.push(semaphore);
        self
    }
}

struct PendingSubmit {
    command_lists: Vec<CommandList>,
    timeline: TimelineSemaphore,
    finish_value: u64,
}

/// A device queue with a pool of reusable command lists.
pub struct GpuQueue {
    device: Arc<dyn DeviceApi>,
    queue: vk::Queue,
    queue_family: u32,
    pending: Vec<PendingSubmit>,
    unused_command_lists: Vec<CommandList>,
    unused_timelines: Vec<TimelineSemaphore>,
}

impl GpuQueue {
    pub fn new(device: Arc<dyn DeviceApi>, queue: vk::Queue, queue_family: u32) -> Self {
        Self {
            device,
            queue,
            queue_family,
            pending: Vec::new(),
            unused_command_lists: Vec::new(),
            unused_timelines: Vec::new(),
        }
    }

    pub fn raw(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Number of submissions the GPU may still be executing.
    pub fn pending_submits(&self) -> usize {
        self.pending.len()
    }

    /// Number of empty command lists ready for reuse.
    pub fn unused_command_lists(&self) -> usize {
        self.unused_command_lists.len()
    }

    /// An empty command list, reused from the pool when one is available.
    pub fn command_list(&mut self) -> Result<CommandList> {
        match self.unused_command_lists.pop() {
            Some(list) => Ok(list),
            None => CommandList::new(Arc::clone(&self.device), self.queue_family),
        }
    }

    /// Submit a batch.
    ///
    /// The lists stay alive, along with every resource they retained, until
    /// [`recycle`](Self::recycle) observes that the GPU finished the batch.
    ///
    /// # Panics
    /// If any list has not been ended.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&mut self, info: SubmitInfo<'_>) -> Result<()> {
        for (i, list) in info.command_lists.iter().enumerate() {
            assert_eq!(
                list.state(),
                RecordingState::Executable,
                "submitted command list {i} must be ended first"
            );
        }

        let (timeline, finish_value) = match self.next_timeline() {
            Ok(next) => next,
            Err(e) => {
                for list in info.command_lists {
                    self.return_command_list(list);
                }
                return Err(e);
            }
        };

        let command_buffers: Vec<_> = info
            .command_lists
            .iter()
            .map(CommandList::handle)
            .collect();
        let wait: Vec<_> = info
            .wait_timelines
            .iter()
            .map(|(t, value)| SemaphoreSubmit::timeline(t.raw(), *value))
            .chain(
                info.wait_semaphores
                    .iter()
                    .map(|s| SemaphoreSubmit::binary(s.raw())),
            )
            .collect();
        let signal: Vec<_> = info
            .signal_timelines
            .iter()
            .map(|(t, value)| SemaphoreSubmit::timeline(t.raw(), *value))
            .chain(
                info.signal_semaphores
                    .iter()
                    .map(|s| SemaphoreSubmit::binary(s.raw())),
            )
            .chain(std::iter::once(SemaphoreSubmit::timeline(
                timeline.raw(),
                finish_value,
            )))
            .collect();

        // SAFETY: every list is executable and `&mut self` serializes queue access.
        let submitted =
            unsafe { self.device.queue_submit(self.queue, &command_buffers, &wait, &signal) };

        if let Err(e) = submitted {
            // Nothing reached the GPU, so the lists can be reset right away.
            for list in info.command_lists {
                self.return_command_list(list);
            }
            self.unused_timelines.push(timeline);
            return Err(e.into());
        }

        tracing::trace!(
            command_lists = command_buffers.len(),
            finish_value,
            "Submitted command lists"
        );

        self.pending.push(PendingSubmit {
            command_lists: info.command_lists,
            timeline,
            finish_value,
        });
        Ok(())
    }

    /// Reset and pool every command list whose submission has completed.
    ///
    /// This is the point where retained resources are released. Returns the
    /// number of lists recycled.
    pub fn recycle(&mut self) -> Result<usize> {
        let mut recycled = 0;
        let mut i = 0;
        while i < self.pending.len() {
            let submit = &self.pending[i];
            if submit.timeline.value()? < submit.finish_value {
                i += 1;
                continue;
            }

            let submit = self.pending.swap_remove(i);
            recycled += submit.command_lists.len();
            for list in submit.command_lists {
                self.return_command_list(list);
            }
            self.unused_timelines.push(submit.timeline);
        }

        if recycled > 0 {
            tracing::trace!(
                recycled,
                pending = self.pending.len(),
                "Recycled command lists"
            );
        }
        Ok(recycled)
    }

    /// Block until every pending submission finished, then recycle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&mut self) -> Result<()> {
        for submit in &self.pending {
            submit
                .timeline
                .wait_for_value(submit.finish_value, u64::MAX)?;
        }
        self.recycle()?;
        Ok(())
    }

    /// An unused timeline and the value the next submission will signal on it.
    fn next_timeline(&mut self) -> Result<(TimelineSemaphore, u64)> {
        let timeline = match self.unused_timelines.pop() {
            Some(timeline) => timeline,
            None => TimelineSemaphore::new(Arc::clone(&self.device), 0)?,
        };
        match timeline.value() {
            Ok(value) => Ok((timeline, value + 1)),
            Err(e) => {
                self.unused_timelines.push(timeline);
                Err(e)
            }
        }
    }

    /// Reset a list that never reached the GPU and keep it for reuse.
    ///
    /// # Panics
    /// If a recording or rendering scope is still open.
    pub fn discard(&mut self, list: CommandList) {
        self.return_command_list(list);
    }

    fn return_command_list(&mut self, mut list: CommandList) {
        match list.reset() {
            Ok(()) => self.unused_command_lists.push(list),
            Err(e) => {
                tracing::warn!("Failed to reset command list: {e}");
                list.abandon();
            }
        }
    }
}

impl Drop for GpuQueue {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::error!("Failed to wait for queue before shutdown: {e}");
            for submit in self.pending.drain(..) {
                for list in submit.command_lists {
                    list.abandon();
                }
            }
        }
        tracing::debug!(
            command_lists = self.unused_command_lists.len(),
            "Destroying queue"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice};
    use crate::BufferHandle;

    fn queue(device: &Arc<FakeDevice>) -> GpuQueue {
        GpuQueue::new(device.api(), vk::Queue::null(), 0)
    }

    fn recorded_copy(queue: &mut GpuQueue, src: &BufferHandle, dst: &BufferHandle) -> CommandList {
        let mut list = queue.command_list().unwrap();
        list.begin().unwrap();
        list.copy_buffer_to_buffer(
            src,
            dst,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: src.size(),
            }],
        );
        list.end().unwrap();
        list
    }

    #[test]
    fn resources_released_only_after_gpu_completion() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let src = device.buffer(64);
        let dst = device.buffer(64);

        let list = recorded_copy(&mut queue, &src, &dst);
        queue.submit(SubmitInfo::new(vec![list])).unwrap();
        assert_eq!(queue.pending_submits(), 1);
        assert_eq!(BufferHandle::strong_count(&src), 2);

        assert_eq!(queue.recycle().unwrap(), 0);
        assert_eq!(BufferHandle::strong_count(&src), 2);

        device.complete_submissions();
        assert_eq!(queue.recycle().unwrap(), 1);
        assert_eq!(queue.pending_submits(), 0);
        assert_eq!(queue.unused_command_lists(), 1);
        assert_eq!(BufferHandle::strong_count(&src), 1);
        assert_eq!(BufferHandle::strong_count(&dst), 1);
    }

    #[test]
    fn recycled_lists_are_reused() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);

        let mut list = queue.command_list().unwrap();
        let first = list.handle();
        list.begin().unwrap();
        list.end().unwrap();
        queue.submit(SubmitInfo::new(vec![list])).unwrap();
        queue.wait_idle().unwrap();

        let list = queue.command_list().unwrap();
        assert_eq!(list.handle(), first);
        assert!(list.is_empty());
        assert_eq!(
            device.count(|c| matches!(c, Call::CreateCommandPool(_))),
            1
        );
        drop(list);
    }

    #[test]
    fn submit_carries_waits_and_signals() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let frame = TimelineSemaphore::new(device.api(), 0).unwrap();
        let acquired = BinarySemaphore::new(device.api()).unwrap();
        let rendered = BinarySemaphore::new(device.api()).unwrap();

        let mut list = queue.command_list().unwrap();
        list.begin().unwrap();
        list.end().unwrap();
        queue
            .submit(
                SubmitInfo::new(vec![list])
                    .wait_semaphore(&acquired)
                    .signal_semaphore(&rendered)
                    .signal_timeline(&frame, 1),
            )
            .unwrap();

        let (wait, signal) = device
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Submit { wait, signal, .. } => Some((wait, signal)),
                _ => None,
            })
            .unwrap();
        assert_eq!(wait, vec![SemaphoreSubmit::binary(acquired.raw())]);
        assert_eq!(signal.len(), 3);
        assert_eq!(signal[0], SemaphoreSubmit::timeline(frame.raw(), 1));
        assert_eq!(signal[1], SemaphoreSubmit::binary(rendered.raw()));
        assert_eq!(signal[2].value, 1);

        assert!(frame.wait_for_value(1, u64::MAX).unwrap());
        queue.wait_idle().unwrap();
    }

    #[test]
    fn timelines_are_reused_with_increasing_values() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);

        for _ in 0..2 {
            let mut list = queue.command_list().unwrap();
            list.begin().unwrap();
            list.end().unwrap();
            queue.submit(SubmitInfo::new(vec![list])).unwrap();
            queue.wait_idle().unwrap();
        }

        let finish_values: Vec<_> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit { signal, .. } => signal.last().map(|s| s.value),
                _ => None,
            })
            .collect();
        assert_eq!(finish_values, vec![1, 2]);
        assert_eq!(device.count(|c| matches!(c, Call::CreateSemaphore(_))), 1);
    }

    #[test]
    #[should_panic(expected = "submitted command list 0 must be ended first")]
    fn submitting_unended_list_panics() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let mut list = queue.command_list().unwrap();
        list.begin().unwrap();
        let _ = queue.submit(SubmitInfo::new(vec![list]));
    }

    #[test]
    fn failed_submit_returns_lists_to_pool() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let src = device.buffer(16);
        let dst = device.buffer(16);
        let list = recorded_copy(&mut queue, &src, &dst);

        device.fail_next_submit();
        let err = queue.submit(SubmitInfo::new(vec![list])).unwrap_err();
        assert!(matches!(
            err,
            crate::GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
        assert_eq!(queue.pending_submits(), 0);
        assert_eq!(queue.unused_command_lists(), 1);
        assert_eq!(BufferHandle::strong_count(&src), 1);
    }

    #[test]
    fn failed_timeline_creation_returns_lists_to_pool() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let src = device.buffer(16);
        let dst = device.buffer(16);
        let list = recorded_copy(&mut queue, &src, &dst);

        device.fail_next_semaphore();
        assert!(queue.submit(SubmitInfo::new(vec![list])).is_err());
        assert_eq!(queue.pending_submits(), 0);
        assert_eq!(queue.unused_command_lists(), 1);
        assert_eq!(BufferHandle::strong_count(&src), 1);
        assert_eq!(device.count(|c| matches!(c, Call::Submit { .. })), 0);
    }

    #[test]
    fn discarded_list_is_reset_for_reuse() {
        let device = FakeDevice::new();
        let mut queue = queue(&device);
        let src = device.buffer(16);
        let dst = device.buffer(16);
        let list = recorded_copy(&mut queue, &src, &dst);

        queue.discard(list);
        assert_eq!(queue.unused_command_lists(), 1);
        assert_eq!(BufferHandle::strong_count(&dst), 1);
        assert!(queue.command_list().unwrap().is_empty());
    }

    #[test]
    fn drop_waits_for_pending_work() {
        let device = FakeDevice::new();
        let src = device.buffer(16);
        let dst = device.buffer(16);
        {
            let mut queue = queue(&device);
            let list = recorded_copy(&mut queue, &src, &dst);
            queue.submit(SubmitInfo::new(vec![list])).unwrap();
        }
        assert_eq!(BufferHandle::strong_count(&src), 1);
        assert_eq!(device.count(|c| matches!(c, Call::DestroyCommandPool(_))), 1);
    }
}
