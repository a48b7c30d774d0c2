//! Command bundle: a command list plus, in deferred mode, its command queue
//!
//! Callers record and execute work the same way in both execution models:
//!
//! * deferred: appends are recorded, `close` finishes recording, and
//!   `execute_and_synchronize` submits the list to the queue and waits on the queue;
//! * immediate: there is no queue, every append is scheduled as it is made, `close` does
//!   nothing and `execute_and_synchronize` only waits on the list.
//!
//! The list is always destroyed before the queue.

use crate::driver::{
    fail, CommandListDesc, CommandListFlags, CommandQueueDesc, CommandQueueFlags, CommandQueueMode,
    CommandQueuePriority, Driver, Kernel, ZeResult,
};
use crate::handle::{
    CommandListHandle, CommandQueueHandle, ContextHandle, DeviceHandle, EventHandle, FenceHandle,
    MemoryHandle,
};
use crate::Result;

/// Parameters of [`CommandBundle::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleDesc {
    pub queue_flags: CommandQueueFlags,
    pub mode: CommandQueueMode,
    pub priority: CommandQueuePriority,
    pub list_flags: CommandListFlags,
    /// Queue group ordinal.
    pub ordinal: u32,
    /// Queue index within the group; must be 0 unless `queue_flags` has `EXPLICIT_ONLY`.
    pub index: u32,
    pub immediate: bool,
}

impl BundleDesc {
    pub fn new(immediate: bool) -> Self {
        Self {
            immediate,
            ..Self::default()
        }
    }
}

pub struct CommandBundle {
    driver: Driver,
    list: CommandListHandle,
    queue: Option<CommandQueueHandle>,
    list_destroyed: bool,
    queue_destroyed: bool,
}

impl CommandBundle {
    /// Create the list (and queue, in deferred mode). Failures are final.
    pub fn create(
        driver: &Driver,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &BundleDesc,
    ) -> Result<Self> {
        if desc.index != 0 && !desc.queue_flags.contains(CommandQueueFlags::EXPLICIT_ONLY) {
            return fail("create_command_bundle", ZeResult::InvalidArgument);
        }
        let queue_desc = CommandQueueDesc {
            ordinal: desc.ordinal,
            index: desc.index,
            flags: desc.queue_flags,
            mode: desc.mode,
            priority: desc.priority,
        };

        let (list, queue) = if desc.immediate {
            let list = driver.create_immediate_command_list(context, device, &queue_desc)?;
            (list, None)
        } else {
            let queue = driver.create_command_queue(context, device, &queue_desc)?;
            let list_desc = CommandListDesc {
                ordinal: desc.ordinal,
                flags: desc.list_flags,
            };
            match driver.create_command_list(context, device, &list_desc) {
                Ok(list) => (list, Some(queue)),
                Err(e) => {
                    driver.destroy_command_queue(queue)?;
                    return Err(e);
                }
            }
        };
        tracing::debug!(
            %list,
            immediate = desc.immediate,
            ordinal = desc.ordinal,
            "bundle created"
        );

        Ok(Self {
            driver: driver.clone(),
            list,
            queue,
            list_destroyed: false,
            queue_destroyed: false,
        })
    }

    pub fn is_immediate(&self) -> bool {
        self.queue.is_none()
    }

    pub fn list(&self) -> CommandListHandle {
        self.list
    }

    /// Companion queue; `None` for immediate bundles.
    pub fn queue(&self) -> Option<CommandQueueHandle> {
        self.queue
    }

    pub fn append_memory_copy(
        &mut self,
        dst: MemoryHandle,
        src: MemoryHandle,
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        self.driver.append_memory_copy(self.list, dst, src, size, signal, waits)
    }

    pub fn append_memory_fill(
        &mut self,
        dst: MemoryHandle,
        pattern: &[u8],
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        self.driver.append_memory_fill(self.list, dst, pattern, size, signal, waits)
    }

    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        self.driver.append_launch_kernel(self.list, kernel, signal, waits)
    }

    pub fn append_barrier(
        &mut self,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        self.driver.append_barrier(self.list, signal, waits)
    }

    pub fn append_signal_event(&mut self, event: EventHandle) -> Result<()> {
        self.driver.append_signal_event(self.list, event)
    }

    pub fn append_wait_on_events(&mut self, events: &[EventHandle]) -> Result<()> {
        self.driver.append_wait_on_events(self.list, events)
    }

    pub fn append_event_reset(&mut self, event: EventHandle) -> Result<()> {
        self.driver.append_event_reset(self.list, event)
    }

    /// Finish recording. No-op for immediate bundles.
    pub fn close(&mut self) -> Result<()> {
        if self.is_immediate() {
            return Ok(());
        }
        self.driver.close_command_list(self.list)
    }

    /// Discard recorded work so the list can be recorded again.
    pub fn reset(&mut self) -> Result<()> {
        self.driver.reset_command_list(self.list)
    }

    /// Submit the closed list to the queue, optionally signaling `fence`. No-op when immediate.
    pub fn execute(&mut self, fence: Option<FenceHandle>) -> Result<()> {
        match self.queue {
            Some(queue) => self.driver.execute_command_lists(queue, &[self.list], fence),
            None => Ok(()),
        }
    }

    /// Wait for submitted work: the queue in deferred mode, the list in immediate mode.
    pub fn synchronize(&self, timeout_ns: u64) -> Result<()> {
        match self.queue {
            Some(queue) => self.driver.command_queue_synchronize(queue, timeout_ns),
            None => self.driver.command_list_host_synchronize(self.list, timeout_ns),
        }
    }

    /// Execute and wait. `u64::MAX` waits without bound; an elapsed timeout is not-ready.
    pub fn execute_and_synchronize(&mut self, timeout_ns: u64) -> Result<()> {
        self.execute(None)?;
        self.synchronize(timeout_ns)
    }

    /// Destroy the list, then the queue.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    /// Each object is marked destroyed only once the driver accepted it, so a failed release
    /// is retried on drop.
    fn release(&mut self) -> Result<()> {
        if !self.list_destroyed {
            self.driver.destroy_command_list(self.list)?;
            self.list_destroyed = true;
        }
        if let (Some(queue), false) = (self.queue, self.queue_destroyed) {
            self.driver.destroy_command_queue(queue)?;
            self.queue_destroyed = true;
        }
        Ok(())
    }
}

impl Drop for CommandBundle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(list = %self.list, error = %e, "failed to destroy command bundle");
        }
    }
}
