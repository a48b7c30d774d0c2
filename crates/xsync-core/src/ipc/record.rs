//! Exchange record shared between producer and consumer
//!
//! The record is a single fixed-layout segment. The producer fills the request fields (and,
//! for the record transport, the handle bytes) before spawning the consumer; the consumer only
//! ever writes the reply fields.

use crate::driver::{IpcHandleData, IPC_HANDLE_SIZE};
use crate::shm::SharedMemory;
use crate::timestamp::{KernelTimestamp, TimestampData};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const MAGIC: u32 = 0x5853_5852; // "XSXR"
const VERSION: u32 = 1;

const HANDLE_WORDS: usize = IPC_HANDLE_SIZE / 8;

#[repr(C)]
struct RecordLayout {
    magic: AtomicU32,
    version: AtomicU32,
    test_case: AtomicU32,
    transport: AtomicU32,
    size: AtomicU64,
    flags: AtomicU32,
    is_immediate: AtomicU32,
    pattern: AtomicU32,
    event_index: AtomicU32,
    handle_written: AtomicU32,
    reply_written: AtomicU32,
    handle: [AtomicU64; HANDLE_WORDS],
    reply: [AtomicU64; 4],
}

/// Which consumer routine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TestCase {
    /// Open exported memory on the root device and validate a copy of it.
    MemoryDeviceAccess = 1,
    /// Open exported memory on the root device and copy it from every sub-device.
    MemorySubDeviceAccess = 2,
    /// As device access; the producer holds extra gets and puts them all afterwards.
    MemoryPutHandle = 3,
    /// Host-synchronize on an event of an exported pool.
    EventHostReads = 4,
    /// Make the device wait on an event of an exported pool.
    EventDeviceReads = 5,
    /// Read a kernel timestamp the producer recorded and report it back.
    EventTimestamp = 6,
    /// Make the second root device wait on an event of an exported pool.
    EventSecondDeviceReads = 7,
    /// Make every root device wait on an event of an exported pool, one after another.
    EventMultiDeviceReads = 8,
}

impl TestCase {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => TestCase::MemoryDeviceAccess,
            2 => TestCase::MemorySubDeviceAccess,
            3 => TestCase::MemoryPutHandle,
            4 => TestCase::EventHostReads,
            5 => TestCase::EventDeviceReads,
            6 => TestCase::EventTimestamp,
            7 => TestCase::EventSecondDeviceReads,
            8 => TestCase::EventMultiDeviceReads,
            _ => return None,
        })
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            TestCase::MemoryDeviceAccess
                | TestCase::MemorySubDeviceAccess
                | TestCase::MemoryPutHandle
        )
    }

    /// Cases where the consumer only waits for the producer's signal.
    pub fn is_event_read(self) -> bool {
        matches!(
            self,
            TestCase::EventHostReads
                | TestCase::EventDeviceReads
                | TestCase::EventSecondDeviceReads
                | TestCase::EventMultiDeviceReads
        )
    }

    /// Cases that need more than one root device.
    pub fn needs_multiple_devices(self) -> bool {
        matches!(self, TestCase::EventSecondDeviceReads | TestCase::EventMultiDeviceReads)
    }
}

/// How the handle reaches the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Transport {
    /// Handle bytes plus the descriptor as `SCM_RIGHTS` over a unix socket.
    #[default]
    Socket = 1,
    /// Handle bytes embedded in the record.
    Record = 2,
}

impl Transport {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Transport::Socket),
            2 => Some(Transport::Record),
            _ => None,
        }
    }
}

/// Request fields written by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub test_case: TestCase,
    pub transport: Transport,
    pub size: u64,
    pub flags: u32,
    pub is_immediate: bool,
    pub pattern: u8,
    pub event_index: u32,
}

impl ExchangeRequest {
    pub fn new(test_case: TestCase, transport: Transport) -> Self {
        Self {
            test_case,
            transport,
            size: 0,
            flags: 0,
            is_immediate: false,
            pattern: 1,
            event_index: 0,
        }
    }
}

/// Mapped exchange record.
pub struct RecordRegion {
    shm: SharedMemory,
}

impl RecordRegion {
    pub const SIZE: usize = std::mem::size_of::<RecordLayout>();

    /// Create a fresh record, replacing any stale one of the same name.
    pub fn create(name: &str) -> Result<Self> {
        let shm = SharedMemory::recreate(name, Self::SIZE)?;
        let layout = unsafe { &*(shm.as_ptr() as *const RecordLayout) };
        layout.version.store(VERSION, Ordering::Relaxed);
        layout.magic.store(MAGIC, Ordering::Release);
        Ok(Self { shm })
    }

    /// Open the record created by the producer.
    pub fn open(name: &str) -> Result<Self> {
        let shm = SharedMemory::open(name)?;
        if shm.size() < Self::SIZE {
            return Err(Error::Protocol(format!("{} is too small for an exchange record", name)));
        }
        let region = Self { shm };
        let layout = region.layout();
        if layout.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::Protocol("invalid magic number".to_string()));
        }
        let version = layout.version.load(Ordering::Relaxed);
        if version != VERSION {
            return Err(Error::Protocol(format!(
                "version mismatch: expected {}, got {}",
                VERSION, version
            )));
        }
        Ok(region)
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// True on the producer side.
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    fn layout(&self) -> &RecordLayout {
        // Safety: the mapping is at least `SIZE` bytes, page aligned, and every field is an
        // atomic, so shared references across processes are sound.
        unsafe { &*(self.shm.as_ptr() as *const RecordLayout) }
    }

    fn producer_only(&self, what: &str) -> Result<&RecordLayout> {
        if !self.is_owner() {
            return Err(Error::Protocol(format!("the consumer may not write the {}", what)));
        }
        Ok(self.layout())
    }

    pub fn write_request(&self, request: &ExchangeRequest) -> Result<()> {
        let layout = self.producer_only("request")?;
        layout.test_case.store(request.test_case as u32, Ordering::Relaxed);
        layout.transport.store(request.transport as u32, Ordering::Relaxed);
        layout.size.store(request.size, Ordering::Relaxed);
        layout.flags.store(request.flags, Ordering::Relaxed);
        layout.is_immediate.store(request.is_immediate as u32, Ordering::Relaxed);
        layout.pattern.store(request.pattern as u32, Ordering::Relaxed);
        layout.event_index.store(request.event_index, Ordering::Release);
        Ok(())
    }

    pub fn request(&self) -> Result<ExchangeRequest> {
        let layout = self.layout();
        let event_index = layout.event_index.load(Ordering::Acquire);
        let test_case = layout.test_case.load(Ordering::Relaxed);
        let transport = layout.transport.load(Ordering::Relaxed);
        Ok(ExchangeRequest {
            test_case: TestCase::from_u32(test_case)
                .ok_or_else(|| Error::Protocol(format!("unrecognized test case {}", test_case)))?,
            transport: Transport::from_u32(transport)
                .ok_or_else(|| Error::Protocol(format!("unrecognized transport {}", transport)))?,
            size: layout.size.load(Ordering::Relaxed),
            flags: layout.flags.load(Ordering::Relaxed),
            is_immediate: layout.is_immediate.load(Ordering::Relaxed) != 0,
            pattern: layout.pattern.load(Ordering::Relaxed) as u8,
            event_index,
        })
    }

    /// Embed handle bytes for the record transport.
    pub fn write_handle(&self, handle: &IpcHandleData) -> Result<()> {
        let layout = self.producer_only("handle")?;
        for (word, chunk) in layout.handle.iter().zip(handle.as_bytes().chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            word.store(u64::from_ne_bytes(raw), Ordering::Relaxed);
        }
        layout.handle_written.store(1, Ordering::Release);
        Ok(())
    }

    /// Embedded handle bytes, if the producer wrote any.
    pub fn handle(&self) -> Result<Option<IpcHandleData>> {
        let layout = self.layout();
        if layout.handle_written.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(&layout.handle) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }
        IpcHandleData::from_bytes(bytes).map(Some)
    }

    /// Report a timestamp back to the producer. Consumer only.
    pub fn write_reply(&self, timestamp: &KernelTimestamp) -> Result<()> {
        if self.is_owner() {
            return Err(Error::Protocol("the producer may not write the reply".into()));
        }
        let layout = self.layout();
        layout.reply[0].store(timestamp.global.start, Ordering::Relaxed);
        layout.reply[1].store(timestamp.global.end, Ordering::Relaxed);
        layout.reply[2].store(timestamp.context.start, Ordering::Relaxed);
        layout.reply[3].store(timestamp.context.end, Ordering::Relaxed);
        layout.reply_written.store(1, Ordering::Release);
        Ok(())
    }

    pub fn reply(&self) -> Option<KernelTimestamp> {
        let layout = self.layout();
        if layout.reply_written.load(Ordering::Acquire) == 0 {
            return None;
        }
        let word = |i: usize| layout.reply[i].load(Ordering::Relaxed);
        Some(KernelTimestamp {
            global: TimestampData {
                start: word(0),
                end: word(1),
            },
            context: TimestampData {
                start: word(2),
                end: word(3),
            },
        })
    }
}
