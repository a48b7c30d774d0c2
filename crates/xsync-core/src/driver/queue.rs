//! Command queues, execution engines and fences

use super::command::{Command, ExecContext, ListKind};
use super::{fail, Driver, ZeResult};
use crate::handle::{
    CommandListHandle, CommandQueueHandle, ContextHandle, DeviceHandle, FenceHandle,
};
use crate::{Error, Result};
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandQueueFlags: u32 {
        /// Only the queue at `index` may be used; otherwise `index` must be 0.
        const EXPLICIT_ONLY = 1 << 0;
        const COPY_OFFLOAD_HINT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandQueueMode {
    #[default]
    Default,
    /// Submission returns after the work completed.
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandQueuePriority {
    #[default]
    Normal,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    pub ordinal: u32,
    pub index: u32,
    pub flags: CommandQueueFlags,
    pub mode: CommandQueueMode,
    pub priority: CommandQueuePriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    NotReady,
    Signaled,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cond` until `done` holds. `u64::MAX` waits forever; returns whether `done` held.
fn wait_for<T>(m: &Mutex<T>, cond: &Condvar, timeout_ns: u64, done: impl Fn(&T) -> bool) -> bool {
    let mut guard = lock(m);
    if timeout_ns == u64::MAX {
        while !done(&guard) {
            guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        return true;
    }
    let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
    while !done(&guard) {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        guard = cond
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    true
}

/// One-shot completion flag signaled by an engine.
pub(crate) struct FenceSignal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl FenceSignal {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *lock(&self.signaled) = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *lock(&self.signaled) = false;
    }

    fn is_signaled(&self) -> bool {
        *lock(&self.signaled)
    }

    fn wait(&self, timeout_ns: u64) -> bool {
        wait_for(&self.signaled, &self.cond, timeout_ns, |s| *s)
    }
}

struct Batch {
    commands: Vec<Command>,
    fence: Option<Arc<FenceSignal>>,
}

#[derive(Default)]
struct Counts {
    submitted: u64,
    completed: u64,
}

#[derive(Default)]
struct Progress {
    counts: Mutex<Counts>,
    cond: Condvar,
}

/// In-order execution engine backed by one worker thread.
pub(crate) struct Engine {
    sender: Mutex<Option<Sender<Batch>>>,
    progress: Arc<Progress>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    pub(crate) fn spawn(name: String, exec: ExecContext) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let progress = Arc::new(Progress::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let progress = Arc::clone(&progress);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(name)
                .spawn(move || run(receiver, exec, &progress, &shutdown))?
        };
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            progress,
            shutdown,
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(
        &self,
        commands: Vec<Command>,
        fence: Option<Arc<FenceSignal>>,
    ) -> Result<()> {
        let sender = lock(&self.sender);
        let sender = match sender.as_ref() {
            Some(sender) => sender,
            None => return fail("submit", ZeResult::Uninitialized),
        };
        lock(&self.progress.counts).submitted += 1;
        sender
            .send(Batch { commands, fence })
            .map_err(|_| Error::driver("submit", ZeResult::Uninitialized))
    }

    /// Wait until every batch submitted before the call has completed.
    pub(crate) fn synchronize(&self, timeout_ns: u64) -> bool {
        let target = lock(&self.progress.counts).submitted;
        wait_for(&self.progress.counts, &self.progress.cond, timeout_ns, |c| {
            c.completed >= target
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        lock(&self.sender).take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Batch>, exec: ExecContext, progress: &Progress, shutdown: &AtomicBool) {
    while let Ok(batch) = receiver.recv() {
        if !shutdown.load(Ordering::Relaxed) {
            for command in &batch.commands {
                command.execute(&exec, shutdown);
            }
            if let Some(fence) = &batch.fence {
                fence.signal();
            }
        }
        lock(&progress.counts).completed += 1;
        progress.cond.notify_all();
    }
}

pub(crate) struct QueueEntry {
    context: u64,
    ordinal: u32,
    mode: CommandQueueMode,
    engine: Arc<Engine>,
}

pub(crate) struct FenceEntry {
    queue: u64,
    signal: Arc<FenceSignal>,
}

impl Driver {
    pub fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandQueueHandle> {
        const CALL: &str = "zeCommandQueueCreate";
        self.check_ordinal(device, desc.ordinal, Some(desc.index), CALL)?;
        let raw = self.next_raw();
        let context = Self::check_context(&self.state(), context, CALL)?;
        let engine = Engine::spawn(
            format!("xsync-queue-{}", raw),
            ExecContext {
                clock: self.shared.clock,
                tiles: self.tiles(device),
            },
        )?;
        self.state().queues.insert(
            raw.get(),
            QueueEntry {
                context,
                ordinal: desc.ordinal,
                mode: desc.mode,
                engine: Arc::new(engine),
            },
        );
        tracing::debug!(
            queue = raw.get(),
            ordinal = desc.ordinal,
            index = desc.index,
            "command queue created"
        );
        Ok(CommandQueueHandle::from_raw(raw))
    }

    /// Destroy a queue. Fails with `HANDLE_OBJECT_IN_USE` while a fence of the queue, or a
    /// command list last executed on it, is still alive.
    pub fn destroy_command_queue(&self, queue: CommandQueueHandle) -> Result<()> {
        const CALL: &str = "zeCommandQueueDestroy";
        let raw = queue.raw()?;
        let mut state = self.state();
        if !state.queues.contains_key(&raw) {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        let in_use = state.lists.values().any(|l| l.last_queue() == Some(raw))
            || state.fences.values().any(|f| f.queue == raw);
        if in_use {
            return fail(CALL, ZeResult::HandleObjectInUse);
        }
        let entry = state.queues.remove(&raw);
        drop(state);
        drop(entry);
        Ok(())
    }

    /// Submit closed command lists, signaling `fence` once they have all executed.
    pub fn execute_command_lists(
        &self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        const CALL: &str = "zeCommandQueueExecuteCommandLists";
        let raw = queue.raw()?;
        let mut state = self.state();
        let (context, ordinal, mode, engine) = match state.queues.get(&raw) {
            Some(q) => (q.context, q.ordinal, q.mode, Arc::clone(&q.engine)),
            None => return fail(CALL, ZeResult::InvalidArgument),
        };
        let fence = match fence {
            Some(fence) => match state.fences.get(&fence.raw()?) {
                Some(f) if f.queue == raw => Some(Arc::clone(&f.signal)),
                _ => return fail(CALL, ZeResult::InvalidArgument),
            },
            None => None,
        };

        let mut commands = Vec::new();
        for list in lists {
            let entry = match state.lists.get(&list.raw()?) {
                Some(entry) => entry,
                None => return fail(CALL, ZeResult::InvalidArgument),
            };
            if entry.context != context || entry.ordinal != ordinal {
                return fail(CALL, ZeResult::InvalidArgument);
            }
            match entry.closed_commands() {
                Some(recorded) => commands.extend_from_slice(recorded),
                None => {
                    tracing::warn!(list = %list, "command list is not closed or is immediate");
                    return fail(CALL, ZeResult::InvalidArgument);
                }
            }
        }
        for list in lists {
            if let Some(ListKind::Regular { last_queue, .. }) =
                state.lists.get_mut(&list.raw()?).map(|e| &mut e.kind)
            {
                *last_queue = Some(raw);
            }
        }
        drop(state);

        engine.submit(commands, fence)?;
        if mode == CommandQueueMode::Synchronous {
            engine.synchronize(u64::MAX);
        }
        Ok(())
    }

    /// Wait for all work submitted to `queue` (`NOT_READY` on timeout).
    pub fn command_queue_synchronize(
        &self,
        queue: CommandQueueHandle,
        timeout_ns: u64,
    ) -> Result<()> {
        const CALL: &str = "zeCommandQueueSynchronize";
        let engine = self.queue_engine(queue, CALL)?;
        if engine.synchronize(timeout_ns) {
            Ok(())
        } else {
            fail(CALL, ZeResult::NotReady)
        }
    }

    fn queue_engine(&self, queue: CommandQueueHandle, call: &'static str) -> Result<Arc<Engine>> {
        let raw = queue.raw()?;
        match self.state().queues.get(&raw) {
            Some(q) => Ok(Arc::clone(&q.engine)),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }

    // ---- fences --------------------------------------------------------------------------

    pub fn create_fence(&self, queue: CommandQueueHandle) -> Result<FenceHandle> {
        const CALL: &str = "zeFenceCreate";
        let queue = queue.raw()?;
        let raw = self.next_raw();
        let mut state = self.state();
        if !state.queues.contains_key(&queue) {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        state.fences.insert(
            raw.get(),
            FenceEntry {
                queue,
                signal: Arc::new(FenceSignal::new()),
            },
        );
        Ok(FenceHandle::from_raw(raw))
    }

    pub fn destroy_fence(&self, fence: FenceHandle) -> Result<()> {
        let raw = fence.raw()?;
        match self.state().fences.remove(&raw) {
            Some(_) => Ok(()),
            None => fail("zeFenceDestroy", ZeResult::InvalidArgument),
        }
    }

    pub fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        self.fence_signal(fence, "zeFenceReset")?.reset();
        Ok(())
    }

    pub fn query_fence_status(&self, fence: FenceHandle) -> Result<FenceStatus> {
        Ok(if self.fence_signal(fence, "zeFenceQueryStatus")?.is_signaled() {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotReady
        })
    }

    /// Wait for the fence (`NOT_READY` on timeout).
    pub fn fence_host_synchronize(&self, fence: FenceHandle, timeout_ns: u64) -> Result<()> {
        const CALL: &str = "zeFenceHostSynchronize";
        if self.fence_signal(fence, CALL)?.wait(timeout_ns) {
            Ok(())
        } else {
            fail(CALL, ZeResult::NotReady)
        }
    }

    fn fence_signal(&self, fence: FenceHandle, call: &'static str) -> Result<Arc<FenceSignal>> {
        let raw = fence.raw()?;
        match self.state().fences.get(&raw) {
            Some(f) => Ok(Arc::clone(&f.signal)),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::driver;
    use super::super::CommandListDesc;
    use super::*;

    fn queue_and_list(
        driver: &Driver,
        ctx: ContextHandle,
    ) -> (CommandQueueHandle, CommandListHandle) {
        let dev = driver.devices()[0];
        let queue = driver
            .create_command_queue(ctx, dev, &CommandQueueDesc::default())
            .unwrap();
        let list = driver
            .create_command_list(ctx, dev, &CommandListDesc::default())
            .unwrap();
        (queue, list)
    }

    #[test]
    fn test_unclosed_list_is_rejected() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let (queue, list) = queue_and_list(&driver, ctx);
        let mem = driver.allocate_host(ctx, 8, 0).unwrap();
        driver.append_memory_fill(list, mem, &[0x5A], 8, None, &[]).unwrap();

        assert!(driver.execute_command_lists(queue, &[list], None).is_err());
        driver.command_queue_synchronize(queue, u64::MAX).unwrap();
        let mut out = [0u8; 8];
        driver.host_read(mem, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn test_fence_signals_after_execution() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let (queue, list) = queue_and_list(&driver, ctx);
        let fence = driver.create_fence(queue).unwrap();
        assert_eq!(driver.query_fence_status(fence).unwrap(), FenceStatus::NotReady);
        assert!(driver.fence_host_synchronize(fence, 0).unwrap_err().is_not_ready());

        driver.close_command_list(list).unwrap();
        driver.execute_command_lists(queue, &[list], Some(fence)).unwrap();
        driver.fence_host_synchronize(fence, u64::MAX).unwrap();
        assert_eq!(driver.query_fence_status(fence).unwrap(), FenceStatus::Signaled);
        driver.reset_fence(fence).unwrap();
        assert_eq!(driver.query_fence_status(fence).unwrap(), FenceStatus::NotReady);

        let err = driver.destroy_command_queue(queue).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                result: ZeResult::HandleObjectInUse,
                ..
            }
        ));
        driver.destroy_fence(fence).unwrap();
        driver.destroy_command_list(list).unwrap();
        driver.destroy_command_queue(queue).unwrap();
    }

    #[test]
    fn test_fence_of_other_queue_is_rejected() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let (queue, list) = queue_and_list(&driver, ctx);
        let (other, _) = queue_and_list(&driver, ctx);
        let fence = driver.create_fence(other).unwrap();
        driver.close_command_list(list).unwrap();
        assert!(driver.execute_command_lists(queue, &[list], Some(fence)).is_err());
    }

    #[test]
    fn test_queue_index_is_validated() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let dev = driver.devices()[0];
        let desc = CommandQueueDesc {
            index: driver.config().compute_queues,
            ..Default::default()
        };
        assert!(driver.create_command_queue(ctx, dev, &desc).is_err());
    }

    #[test]
    fn test_synchronous_queue_completes_on_submit() {
        let driver = driver();
        let ctx = driver.create_context().unwrap();
        let dev = driver.devices()[0];
        let desc = CommandQueueDesc {
            mode: CommandQueueMode::Synchronous,
            ..Default::default()
        };
        let queue = driver.create_command_queue(ctx, dev, &desc).unwrap();
        let list = driver
            .create_command_list(ctx, dev, &CommandListDesc::default())
            .unwrap();
        let mem = driver.allocate_host(ctx, 4, 0).unwrap();
        driver.append_memory_fill(list, mem, &[1, 2], 4, None, &[]).unwrap();
        driver.close_command_list(list).unwrap();
        driver.execute_command_lists(queue, &[list], None).unwrap();

        let mut out = [0u8; 4];
        driver.host_read(mem, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2]);
    }
}
