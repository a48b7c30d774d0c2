//! Command lists and command execution

use super::device::QueueGroupFlags;
use super::event::{poll_until, EventPoolFlags, EventRef};
use super::memory::Allocation;
use super::queue::{CommandQueueDesc, CommandQueueMode, Engine};
use super::{fail, Driver, State, ZeResult};
use crate::handle::{CommandListHandle, ContextHandle, DeviceHandle, EventHandle, MemoryHandle};
use crate::timestamp::{KernelTimestamp, SynchronizedTimestamp, TimestampData};
use crate::Result;
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandListFlags: u32 {
        const RELAXED_ORDERING = 1 << 0;
        const MAXIMIZE_THROUGHPUT = 1 << 1;
        const EXPLICIT_ONLY = 1 << 2;
        const IN_ORDER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandListDesc {
    /// Queue group the list will be submitted to.
    pub ordinal: u32,
    pub flags: CommandListFlags,
}

/// Built-in kernels of the reference device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Add `value` (wrapping) to the first `size` bytes of `buffer`.
    AddConstant {
        buffer: MemoryHandle,
        size: usize,
        value: u8,
    },
    /// Busy the engine for `duration`.
    Spin { duration: Duration },
}

#[derive(Clone)]
pub(crate) struct MemRef {
    alloc: Arc<Allocation>,
    size: usize,
}

#[derive(Clone)]
enum Op {
    Copy { dst: MemRef, src: MemRef },
    Fill { dst: MemRef, pattern: Vec<u8> },
    AddConstant { buffer: MemRef, value: u8 },
    Spin(Duration),
    Barrier,
    Signal,
    Wait,
    Reset(EventRef),
}

/// One recorded command: optional waits, the operation, optional completion event.
#[derive(Clone)]
pub(crate) struct Command {
    op: Op,
    signal: Option<EventRef>,
    waits: Vec<EventRef>,
}

/// What an engine needs to know to execute commands.
#[derive(Clone, Copy)]
pub(crate) struct ExecContext {
    pub(crate) clock: super::DeviceClock,
    pub(crate) tiles: u32,
}

impl Command {
    /// Run the command on the calling (engine) thread.
    pub(crate) fn execute(&self, exec: &ExecContext, shutdown: &AtomicBool) {
        for wait in &self.waits {
            poll_until(u64::MAX, || {
                wait.slot().is_signaled() || shutdown.load(Ordering::Relaxed)
            });
        }
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let start_ns = exec.clock.host_ns();
        match &self.op {
            Op::Copy { dst, src } => {
                let mut tmp = vec![0u8; src.size];
                src.alloc.read(0, &mut tmp);
                dst.alloc.write(0, &tmp);
            }
            Op::Fill { dst, pattern } => {
                dst.alloc.fill(0, dst.size, pattern);
            }
            Op::AddConstant { buffer, value } => {
                let value = *value;
                buffer.alloc.update(0, buffer.size, |b| b.wrapping_add(value));
            }
            Op::Spin(duration) => {
                let until = Instant::now() + *duration;
                while Instant::now() < until && !shutdown.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            }
            Op::Reset(event) => event.slot().reset(),
            Op::Barrier | Op::Signal | Op::Wait => {}
        }
        let end_ns = exec.clock.host_ns();

        if let Some(event) = &self.signal {
            signal(event, exec, start_ns, end_ns);
        }
    }
}

fn signal(event: &EventRef, exec: &ExecContext, start_ns: u64, end_ns: u64) {
    let flags = event.storage.flags();
    let timestamped = EventPoolFlags::KERNEL_TIMESTAMP | EventPoolFlags::KERNEL_MAPPED_TIMESTAMP;
    if !flags.intersects(timestamped) {
        event.slot().signal();
        return;
    }
    let tiles = if flags.contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP) {
        exec.tiles.max(1)
    } else {
        1
    };
    let ticks = TimestampData {
        start: exec.clock.kernel_ticks(start_ns),
        end: exec.clock.kernel_ticks(end_ns),
    };
    let ns = TimestampData {
        start: start_ns,
        end: end_ns,
    };
    let kernel = vec![
        KernelTimestamp {
            global: ticks,
            context: ticks,
        };
        tiles as usize
    ];
    let synced = vec![
        SynchronizedTimestamp {
            global: ns,
            context: ns,
        };
        tiles as usize
    ];
    event.slot().record(&kernel, &synced);
    tracing::trace!(event = event.event, ?ticks, "recorded kernel timestamp");
}

pub(crate) enum ListKind {
    Regular {
        commands: Vec<Command>,
        closed: bool,
        /// Queue the list was last executed on.
        last_queue: Option<u64>,
    },
    Immediate {
        engine: Arc<Engine>,
        mode: CommandQueueMode,
    },
}

pub(crate) struct ListEntry {
    pub(crate) context: u64,
    pub(crate) device: DeviceHandle,
    pub(crate) ordinal: u32,
    pub(crate) kind: ListKind,
}

impl ListEntry {
    /// Commands of a closed regular list, ready for submission.
    pub(crate) fn closed_commands(&self) -> Option<&[Command]> {
        match &self.kind {
            ListKind::Regular {
                commands,
                closed: true,
                ..
            } => Some(commands),
            _ => None,
        }
    }

    pub(crate) fn last_queue(&self) -> Option<u64> {
        match &self.kind {
            ListKind::Regular { last_queue, .. } => *last_queue,
            ListKind::Immediate { .. } => None,
        }
    }
}

impl Driver {
    /// Validate a queue group ordinal (and queue index) against `device`.
    pub(crate) fn check_ordinal(
        &self,
        device: DeviceHandle,
        ordinal: u32,
        index: Option<u32>,
        call: &'static str,
    ) -> Result<QueueGroupFlags> {
        let record = self.device_record(device, call)?;
        match record.properties.queue_groups.get(ordinal as usize) {
            Some(group) if index.map_or(true, |i| i < group.num_queues) => Ok(group.flags),
            _ => fail(call, ZeResult::InvalidArgument),
        }
    }

    pub fn create_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandListDesc,
    ) -> Result<CommandListHandle> {
        const CALL: &str = "zeCommandListCreate";
        self.check_ordinal(device, desc.ordinal, None, CALL)?;
        let raw = self.next_raw();
        let mut state = self.state();
        let context = Self::check_context(&state, context, CALL)?;
        state.lists.insert(
            raw.get(),
            ListEntry {
                context,
                device,
                ordinal: desc.ordinal,
                kind: ListKind::Regular {
                    commands: Vec::new(),
                    closed: false,
                    last_queue: None,
                },
            },
        );
        Ok(CommandListHandle::from_raw(raw))
    }

    /// Create a list whose appends are submitted to its own engine as they are recorded.
    pub fn create_immediate_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandListHandle> {
        const CALL: &str = "zeCommandListCreateImmediate";
        self.check_ordinal(device, desc.ordinal, Some(desc.index), CALL)?;
        let raw = self.next_raw();
        let context = Self::check_context(&self.state(), context, CALL)?;
        let engine = Engine::spawn(
            format!("xsync-imm-{}", raw),
            ExecContext {
                clock: self.shared.clock,
                tiles: self.tiles(device),
            },
        )?;
        self.state().lists.insert(
            raw.get(),
            ListEntry {
                context,
                device,
                ordinal: desc.ordinal,
                kind: ListKind::Immediate {
                    engine: Arc::new(engine),
                    mode: desc.mode,
                },
            },
        );
        tracing::debug!(list = raw.get(), mode = ?desc.mode, "immediate command list created");
        Ok(CommandListHandle::from_raw(raw))
    }

    pub fn destroy_command_list(&self, list: CommandListHandle) -> Result<()> {
        let raw = list.raw()?;
        let mut state = self.state();
        let entry = state.lists.remove(&raw);
        drop(state);
        match entry {
            // An immediate list's engine is joined here, outside the state lock.
            Some(entry) => {
                drop(entry);
                Ok(())
            }
            None => fail("zeCommandListDestroy", ZeResult::InvalidArgument),
        }
    }

    /// Finish recording. No-op for immediate lists.
    pub fn close_command_list(&self, list: CommandListHandle) -> Result<()> {
        let raw = list.raw()?;
        let mut state = self.state();
        match state.lists.get_mut(&raw).map(|e| &mut e.kind) {
            Some(ListKind::Regular { closed, .. }) => {
                *closed = true;
                Ok(())
            }
            Some(ListKind::Immediate { .. }) => Ok(()),
            None => fail("zeCommandListClose", ZeResult::InvalidArgument),
        }
    }

    /// Drop recorded commands and reopen the list for recording.
    pub fn reset_command_list(&self, list: CommandListHandle) -> Result<()> {
        let raw = list.raw()?;
        let mut state = self.state();
        match state.lists.get_mut(&raw).map(|e| &mut e.kind) {
            Some(ListKind::Regular {
                commands, closed, ..
            }) => {
                commands.clear();
                *closed = false;
                Ok(())
            }
            Some(ListKind::Immediate { .. }) => Ok(()),
            None => fail("zeCommandListReset", ZeResult::InvalidArgument),
        }
    }

    /// Wait for everything appended to an immediate list.
    pub fn command_list_host_synchronize(
        &self,
        list: CommandListHandle,
        timeout_ns: u64,
    ) -> Result<()> {
        const CALL: &str = "zeCommandListHostSynchronize";
        let raw = list.raw()?;
        let engine = match self.state().lists.get(&raw).map(|e| &e.kind) {
            Some(ListKind::Immediate { engine, .. }) => Arc::clone(engine),
            Some(ListKind::Regular { .. }) => return fail(CALL, ZeResult::InvalidArgument),
            None => return fail(CALL, ZeResult::InvalidArgument),
        };
        if engine.synchronize(timeout_ns) {
            Ok(())
        } else {
            fail(CALL, ZeResult::NotReady)
        }
    }

    pub fn append_memory_copy(
        &self,
        list: CommandListHandle,
        dst: MemoryHandle,
        src: MemoryHandle,
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        const CALL: &str = "zeCommandListAppendMemoryCopy";
        self.append(list, CALL, signal, waits, |state| {
            Ok(Op::Copy {
                dst: mem_ref(state, dst, size, CALL)?,
                src: mem_ref(state, src, size, CALL)?,
            })
        })
    }

    /// Repeat `pattern` over the first `size` bytes of `dst`.
    pub fn append_memory_fill(
        &self,
        list: CommandListHandle,
        dst: MemoryHandle,
        pattern: &[u8],
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        const CALL: &str = "zeCommandListAppendMemoryFill";
        if pattern.is_empty() {
            return fail(CALL, ZeResult::InvalidSize);
        }
        self.append(list, CALL, signal, waits, |state| {
            Ok(Op::Fill {
                dst: mem_ref(state, dst, size, CALL)?,
                pattern: pattern.to_vec(),
            })
        })
    }

    pub fn append_launch_kernel(
        &self,
        list: CommandListHandle,
        kernel: &Kernel,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        const CALL: &str = "zeCommandListAppendLaunchKernel";
        let (device, ordinal) = self.list_target(list, CALL)?;
        if !self
            .check_ordinal(device, ordinal, None, CALL)?
            .contains(QueueGroupFlags::COMPUTE)
        {
            return fail(CALL, ZeResult::InvalidArgument);
        }
        self.append(list, CALL, signal, waits, |state| match *kernel {
            Kernel::AddConstant {
                buffer,
                size,
                value,
            } => Ok(Op::AddConstant {
                buffer: mem_ref(state, buffer, size, CALL)?,
                value,
            }),
            Kernel::Spin { duration } => Ok(Op::Spin(duration)),
        })
    }

    pub fn append_barrier(
        &self,
        list: CommandListHandle,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> Result<()> {
        self.append(list, "zeCommandListAppendBarrier", signal, waits, |_| Ok(Op::Barrier))
    }

    pub fn append_signal_event(&self, list: CommandListHandle, event: EventHandle) -> Result<()> {
        self.append(list, "zeCommandListAppendSignalEvent", Some(event), &[], |_| Ok(Op::Signal))
    }

    pub fn append_wait_on_events(
        &self,
        list: CommandListHandle,
        events: &[EventHandle],
    ) -> Result<()> {
        self.append(list, "zeCommandListAppendWaitOnEvents", None, events, |_| Ok(Op::Wait))
    }

    pub fn append_event_reset(&self, list: CommandListHandle, event: EventHandle) -> Result<()> {
        const CALL: &str = "zeCommandListAppendEventReset";
        self.append(list, CALL, None, &[], |state| {
            Ok(Op::Reset(Self::event_ref(state, event, CALL)?))
        })
    }

    fn list_target(
        &self,
        list: CommandListHandle,
        call: &'static str,
    ) -> Result<(DeviceHandle, u32)> {
        let raw = list.raw()?;
        match self.state().lists.get(&raw) {
            Some(entry) => Ok((entry.device, entry.ordinal)),
            None => fail(call, ZeResult::InvalidArgument),
        }
    }

    /// Record a command on a regular list, or submit it right away on an immediate one.
    fn append(
        &self,
        list: CommandListHandle,
        call: &'static str,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
        op: impl FnOnce(&State) -> Result<Op>,
    ) -> Result<()> {
        let raw = list.raw()?;
        let mut state = self.state();
        let command = Command {
            op: op(&*state)?,
            signal: signal
                .map(|e| Self::event_ref(&*state, e, call))
                .transpose()?,
            waits: waits
                .iter()
                .map(|&e| Self::event_ref(&*state, e, call))
                .collect::<Result<_>>()?,
        };

        let mut pending = Some(command);
        let immediate = match state.lists.get_mut(&raw).map(|e| &mut e.kind) {
            Some(ListKind::Regular {
                commands, closed, ..
            }) => {
                if *closed {
                    return fail(call, ZeResult::InvalidArgument);
                }
                commands.extend(pending.take());
                None
            }
            Some(ListKind::Immediate { engine, mode }) => Some((Arc::clone(engine), *mode)),
            None => return fail(call, ZeResult::InvalidArgument),
        };
        drop(state);

        if let Some((engine, mode)) = immediate {
            engine.submit(pending.into_iter().collect(), None)?;
            if mode == CommandQueueMode::Synchronous {
                engine.synchronize(u64::MAX);
            }
        }
        Ok(())
    }
}

fn mem_ref(state: &State, mem: MemoryHandle, size: usize, call: &'static str) -> Result<MemRef> {
    let alloc = Driver::allocation(state, mem, call)?;
    if size == 0 || size > alloc.size {
        return fail(call, ZeResult::InvalidSize);
    }
    Ok(MemRef { alloc, size })
}
