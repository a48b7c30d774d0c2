//! Descriptor transfer over a unix socket
//!
//! The receiver binds first. The sender connects, retrying until the receiver is listening,
//! and sends the 64 handle bytes with the exported descriptor attached as `SCM_RIGHTS`. The
//! receiver rebuilds the handle around the descriptor it was given.

use crate::driver::{IpcHandleData, IPC_HANDLE_SIZE};
use crate::{Error, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::stat::fstat;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Delay between connection attempts.
pub const CONNECTION_WAIT: Duration = Duration::from_millis(100);
/// Give up connecting after this long.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket path of exchange `name`.
pub fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name.trim_start_matches('/')))
}

/// Best-effort removal of a stale socket file.
pub fn remove_socket(path: &Path) {
    if std::fs::remove_file(path).is_ok() {
        tracing::debug!(path = %path.display(), "removed stale socket");
    }
}

/// A handle together with the descriptor received alongside it.
#[derive(Debug)]
pub struct ReceivedHandle {
    data: IpcHandleData,
    fd: Option<OwnedFd>,
}

impl ReceivedHandle {
    /// Handle taken from the record; no descriptor travelled with it.
    pub fn without_descriptor(data: IpcHandleData) -> Self {
        Self { data, fd: None }
    }

    /// Handle bytes, with the descriptor field pointing at the local descriptor.
    pub fn data(&self) -> IpcHandleData {
        self.data
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Listening end of a descriptor transfer.
pub struct HandleReceiver {
    listener: UnixListener,
    path: PathBuf,
}

impl HandleReceiver {
    pub fn bind(path: &Path) -> Result<Self> {
        remove_socket(path);
        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "listening for IPC handle");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept one sender and receive one handle.
    pub fn receive(&self) -> Result<ReceivedHandle> {
        let (stream, _) = self.listener.accept()?;
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        let mut cmsg_buffer = nix::cmsg_space!(RawFd);

        let (received, fd) = {
            let mut iov = [IoSliceMut::new(&mut bytes)];
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )?;
            let mut fd = None;
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // Safety: SCM_RIGHTS installed `raw` in this process and nothing else
                        // owns it.
                        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                        if fd.is_none() {
                            fd = Some(owned);
                        }
                    }
                }
            }
            (msg.bytes, fd)
        };

        if received != IPC_HANDLE_SIZE {
            return Err(Error::Protocol(format!(
                "short IPC handle: {} of {} bytes",
                received, IPC_HANDLE_SIZE
            )));
        }
        let fd = fd.ok_or_else(|| {
            Error::Protocol("no descriptor received with the IPC handle".into())
        })?;
        let data = IpcHandleData::from_bytes(bytes)?;

        let stat = fstat(fd.as_raw_fd())?;
        if (stat.st_size as u64) < data.size() {
            return Err(Error::Protocol(format!(
                "descriptor covers {} bytes, handle needs {}",
                stat.st_size,
                data.size()
            )));
        }
        let data = data.with_fd(fd.as_raw_fd());
        tracing::debug!(fd = fd.as_raw_fd(), "received IPC handle");
        Ok(ReceivedHandle { data, fd: Some(fd) })
    }
}

impl Drop for HandleReceiver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn connect(path: &Path) -> Result<UnixStream> {
    let start = Instant::now();
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if start.elapsed() < CONNECTION_TIMEOUT => {
                tracing::debug!(error = %e, "connection error, sleeping and retrying");
                std::thread::sleep(CONNECTION_WAIT);
            }
            Err(e) => {
                return Err(Error::Protocol(format!(
                    "timed out connecting to {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

/// Send `handle` with its descriptor to the receiver listening on `path`.
pub fn send_handle(path: &Path, handle: &IpcHandleData) -> Result<()> {
    let fd = handle.fd();
    if fd < 0 {
        return Err(Error::Protocol("IPC handle carries no descriptor".into()));
    }
    let stream = connect(path)?;
    let iov = [IoSlice::new(handle.as_bytes())];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    if sent != IPC_HANDLE_SIZE {
        return Err(Error::Protocol(format!("short send: {} of {} bytes", sent, IPC_HANDLE_SIZE)));
    }
    tracing::debug!(fd, "sent IPC handle");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IpcHandleKind;
    use crate::shm::SharedMemory;

    #[test]
    fn test_descriptor_travels_with_handle() {
        let name = format!("/xsync_sock_{}", std::process::id());
        let shm = SharedMemory::recreate(&name, 4096).unwrap();
        let fd = shm.descriptor().unwrap();
        let handle =
            IpcHandleData::new(IpcHandleKind::Memory, fd.as_raw_fd(), 1, 4096, &name).unwrap();

        let path = socket_path(&name);
        let receiver = HandleReceiver::bind(&path).unwrap();
        let sender = std::thread::spawn(move || send_handle(&path, &handle));

        let received = receiver.receive().unwrap();
        sender.join().unwrap().unwrap();

        let data = received.data();
        assert_eq!(data.name().unwrap(), name);
        assert_eq!(data.size(), 4096);
        assert_eq!(Some(data.fd()), received.descriptor());
        assert_ne!(data.fd(), fd.as_raw_fd());
    }

    #[test]
    fn test_handle_without_descriptor_is_refused() {
        let handle = IpcHandleData::new(IpcHandleKind::Memory, -1, 1, 16, "/none").unwrap();
        let err = send_handle(Path::new("/nonexistent/xsync.sock"), &handle).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
