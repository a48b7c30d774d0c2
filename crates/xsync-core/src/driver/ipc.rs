//! Exportable IPC handles
//!
//! An IPC handle is a fixed 64-byte token. Layout:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic `XSIH`                            |
//! | 4      | 1    | kind (1 = memory, 2 = event pool)       |
//! | 8      | 4    | descriptor in the holder's process      |
//! | 12     | 4    | exporting process id                    |
//! | 16     | 8    | object id in the exporting driver       |
//! | 24     | 8    | object size in bytes                    |
//! | 32     | 32   | NUL-terminated shared memory name       |

use crate::{Error, Result};
use std::os::fd::{OwnedFd, RawFd};

pub const IPC_HANDLE_SIZE: usize = 64;

const MAGIC: [u8; 4] = *b"XSIH";
const NAME_OFFSET: usize = 32;
const NAME_CAPACITY: usize = IPC_HANDLE_SIZE - NAME_OFFSET - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcHandleKind {
    Memory = 1,
    EventPool = 2,
}

impl IpcHandleKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(IpcHandleKind::Memory),
            2 => Some(IpcHandleKind::EventPool),
            _ => None,
        }
    }
}

/// Raw bytes of an IPC handle.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IpcHandleData {
    bytes: [u8; IPC_HANDLE_SIZE],
}

impl std::fmt::Debug for IpcHandleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandleData")
            .field("kind", &self.kind())
            .field("fd", &self.fd())
            .field("pid", &self.pid())
            .field("object", &self.object_id())
            .field("size", &self.size())
            .field("name", &self.name())
            .finish()
    }
}

impl IpcHandleData {
    pub(crate) fn new(
        kind: IpcHandleKind,
        fd: RawFd,
        object_id: u64,
        size: u64,
        name: &str,
    ) -> Result<Self> {
        if name.len() > NAME_CAPACITY {
            return Err(Error::Protocol(format!("segment name {:?} too long for IPC handle", name)));
        }
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4] = kind as u8;
        bytes[8..12].copy_from_slice(&fd.to_ne_bytes());
        bytes[12..16].copy_from_slice(&std::process::id().to_ne_bytes());
        bytes[16..24].copy_from_slice(&object_id.to_ne_bytes());
        bytes[24..32].copy_from_slice(&size.to_ne_bytes());
        bytes[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        Ok(Self { bytes })
    }

    /// Parse bytes received from another process.
    pub fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Result<Self> {
        let data = Self { bytes };
        if bytes[0..4] != MAGIC {
            return Err(Error::Protocol("IPC handle has a bad magic".into()));
        }
        if data.kind().is_none() {
            return Err(Error::Protocol(format!("unknown IPC handle kind {}", bytes[4])));
        }
        data.name()?;
        Ok(data)
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.bytes
    }

    pub fn kind(&self) -> Option<IpcHandleKind> {
        IpcHandleKind::from_u8(self.bytes[4])
    }

    pub fn fd(&self) -> RawFd {
        RawFd::from_ne_bytes([self.bytes[8], self.bytes[9], self.bytes[10], self.bytes[11]])
    }

    /// Same handle with the descriptor replaced by one valid in the receiving process.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.bytes[8..12].copy_from_slice(&fd.to_ne_bytes());
        self
    }

    pub fn pid(&self) -> u32 {
        u32::from_ne_bytes([self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15]])
    }

    pub fn object_id(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[16..24]);
        u64::from_ne_bytes(raw)
    }

    pub fn size(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[24..32]);
        u64::from_ne_bytes(raw)
    }

    /// Name of the shared memory object behind the handle.
    pub fn name(&self) -> Result<&str> {
        let field = &self.bytes[NAME_OFFSET..];
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        std::str::from_utf8(&field[..len])
            .map_err(|_| Error::Protocol("IPC handle name is not UTF-8".into()))
    }
}

/// A typed IPC handle.
pub trait IpcHandle: Sized + Copy {
    const KIND: IpcHandleKind;

    fn data(&self) -> &IpcHandleData;

    fn from_data_unchecked(data: IpcHandleData) -> Self;

    /// Wrap raw handle data, checking that it was exported for this kind of object.
    fn from_data(data: IpcHandleData) -> Result<Self> {
        match data.kind() {
            Some(kind) if kind == Self::KIND => Ok(Self::from_data_unchecked(data)),
            other => Err(Error::Protocol(format!(
                "expected a {:?} IPC handle, got {:?}",
                Self::KIND,
                other
            ))),
        }
    }
}

/// Exported memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMemHandle(IpcHandleData);

/// Exported event pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcEventPoolHandle(IpcHandleData);

impl IpcHandle for IpcMemHandle {
    const KIND: IpcHandleKind = IpcHandleKind::Memory;

    fn data(&self) -> &IpcHandleData {
        &self.0
    }

    fn from_data_unchecked(data: IpcHandleData) -> Self {
        Self(data)
    }
}

impl IpcHandle for IpcEventPoolHandle {
    const KIND: IpcHandleKind = IpcHandleKind::EventPool;

    fn data(&self) -> &IpcHandleData {
        &self.0
    }

    fn from_data_unchecked(data: IpcHandleData) -> Self {
        Self(data)
    }
}

/// Export bookkeeping for one object: the descriptor handed out and outstanding gets.
pub(crate) struct Export {
    pub(crate) fd: OwnedFd,
    pub(crate) gets: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_fields() {
        let data = IpcHandleData::new(IpcHandleKind::Memory, 9, 42, 4096, "/xs_m_1_42").unwrap();
        let parsed = IpcHandleData::from_bytes(*data.as_bytes()).unwrap();
        assert_eq!(parsed.kind(), Some(IpcHandleKind::Memory));
        assert_eq!(parsed.fd(), 9);
        assert_eq!(parsed.pid(), std::process::id());
        assert_eq!(parsed.object_id(), 42);
        assert_eq!(parsed.size(), 4096);
        assert_eq!(parsed.name().unwrap(), "/xs_m_1_42");
        assert_eq!(parsed.with_fd(3).fd(), 3);
    }

    #[test]
    fn test_kind_is_checked() {
        let data = IpcHandleData::new(IpcHandleKind::EventPool, 3, 1, 64, "/p").unwrap();
        assert!(IpcMemHandle::from_data(data).is_err());
        assert!(IpcEventPoolHandle::from_data(data).is_ok());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(IpcHandleData::from_bytes([0u8; IPC_HANDLE_SIZE]).is_err());
        let long = "x".repeat(NAME_CAPACITY + 1);
        assert!(IpcHandleData::new(IpcHandleKind::Memory, 0, 0, 0, &long).is_err());
    }
}
