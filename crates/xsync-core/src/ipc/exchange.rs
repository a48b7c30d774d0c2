//! Producer and consumer ends of one exchange
//!
//! The producer owns every named object of the exchange: the record segment, the semaphore
//! and the socket path. It removes stale copies before creating them and unlinks them when
//! the [`Exchange`] is dropped, which callers do only after the consumer has been waited on.

use super::record::{ExchangeRequest, RecordRegion, Transport};
use super::semaphore::NamedSemaphore;
use super::socket::{
    remove_socket, send_handle, socket_path, HandleReceiver, ReceivedHandle, CONNECTION_TIMEOUT,
};
use crate::driver::IpcHandleData;
use crate::logging::scan_for_errors;
use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Environment variable carrying the exchange name to the consumer.
pub const EXCHANGE_ENV: &str = "XSYNC_IPC_EXCHANGE";

/// Attempts the consumer makes to open the record before giving up.
const OPEN_RETRIES: u32 = 100;
const OPEN_RETRY_WAIT: Duration = Duration::from_millis(100);

static NEXT_EXCHANGE: AtomicU32 = AtomicU32::new(0);

/// Producer end.
pub struct Exchange {
    name: String,
    record: RecordRegion,
    semaphore: NamedSemaphore,
    socket: PathBuf,
    transport: Transport,
}

impl Exchange {
    /// Name unique to this process and call, e.g. `/xsync_mem_4242_0`.
    pub fn unique_name(prefix: &str) -> String {
        format!(
            "/{}_{}_{}",
            prefix,
            std::process::id(),
            NEXT_EXCHANGE.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Remove stale objects named `name`, then create the record and the semaphore and
    /// write `request` into the record.
    pub fn create(name: &str, request: &ExchangeRequest) -> Result<Self> {
        Self::remove_stale(name);
        let record = RecordRegion::create(name)?;
        let semaphore = NamedSemaphore::create(name)?;
        record.write_request(request)?;
        tracing::debug!(
            name,
            test_case = ?request.test_case,
            transport = ?request.transport,
            "exchange created"
        );
        Ok(Self {
            name: name.to_string(),
            record,
            semaphore,
            socket: socket_path(name),
            transport: request.transport,
        })
    }

    /// Best-effort cleanup of everything a crashed run may have left under `name`.
    pub fn remove_stale(name: &str) {
        SharedMemory::remove(name);
        NamedSemaphore::remove(name);
        remove_socket(&socket_path(name));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &RecordRegion {
        &self.record
    }

    pub fn semaphore(&self) -> &NamedSemaphore {
        &self.semaphore
    }

    /// Hand `handle` to the consumer. With the record transport this must happen before
    /// [`spawn`](Self::spawn); with the socket transport, after it.
    pub fn send_handle(&self, handle: &IpcHandleData) -> Result<()> {
        match self.transport {
            Transport::Record => self.record.write_handle(handle),
            Transport::Socket => {
                if !self.semaphore.wait_timeout(CONNECTION_TIMEOUT) {
                    return Err(Error::Protocol("consumer never became ready".into()));
                }
                send_handle(&self.socket, handle)
            }
        }
    }

    /// Start the consumer executable with no arguments and capture its stdout.
    pub fn spawn(&self, helper: &Path) -> Result<Consumer> {
        let mut child = Command::new(helper)
            .env(EXCHANGE_ENV, &self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("consumer stdout was not captured".into()))?;
        let reader = std::thread::Builder::new()
            .name("xsync-consumer-log".into())
            .spawn(move || {
                let mut out = String::new();
                let _ = stdout.read_to_string(&mut out);
                out
            })?;
        tracing::debug!(pid = child.id(), helper = %helper.display(), "consumer spawned");
        Ok(Consumer {
            child,
            reader: Some(reader),
            waited: false,
        })
    }

    /// Spawn the consumer and hand it `handle`, in the order the transport needs.
    pub fn launch(&self, helper: &Path, handle: &IpcHandleData) -> Result<Consumer> {
        if self.transport == Transport::Record {
            self.send_handle(handle)?;
        }
        let consumer = self.spawn(helper)?;
        if self.transport == Transport::Socket {
            self.send_handle(handle)?;
        }
        Ok(consumer)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        remove_socket(&self.socket);
    }
}

/// Outcome of a consumer that passed.
#[derive(Debug)]
pub struct ConsumerReport {
    pub status: ExitStatus,
    pub output: String,
}

/// A running consumer. Killed and reaped on drop unless waited on.
pub struct Consumer {
    child: Child,
    reader: Option<JoinHandle<String>>,
    waited: bool,
}

impl Consumer {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for exit. Success means a normal exit with code 0 and no error lines on stdout.
    pub fn wait(mut self) -> Result<ConsumerReport> {
        let status = self.child.wait()?;
        self.waited = true;
        let output = self
            .reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let errors = scan_for_errors(&output);
        if status.code() != Some(0) || !errors.is_empty() {
            return Err(Error::ConsumerFailed {
                status: status.to_string(),
                errors,
            });
        }
        tracing::debug!(%status, "consumer passed");
        Ok(ConsumerReport { status, output })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.waited {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        tracing::warn!(pid = self.child.id(), "consumer killed before it was waited on");
    }
}

/// Consumer end.
pub struct ExchangePeer {
    name: String,
    record: RecordRegion,
    semaphore: NamedSemaphore,
    socket: PathBuf,
}

impl ExchangePeer {
    /// Join the exchange named by [`EXCHANGE_ENV`].
    pub fn from_env() -> Result<Self> {
        let name = std::env::var(EXCHANGE_ENV)
            .map_err(|_| Error::Config(format!("{} is not set", EXCHANGE_ENV)))?;
        Self::open(&name)
    }

    /// Join exchange `name`, retrying while the producer is still setting it up.
    pub fn open(name: &str) -> Result<Self> {
        let mut attempt = 1;
        let record = loop {
            match RecordRegion::open(name) {
                Ok(record) => break record,
                Err(e) if attempt < OPEN_RETRIES => {
                    tracing::debug!(attempt, error = %e, "exchange record not ready");
                    attempt += 1;
                    std::thread::sleep(OPEN_RETRY_WAIT);
                }
                Err(e) => return Err(e),
            }
        };
        let semaphore = NamedSemaphore::open(name)?;
        Ok(Self {
            name: name.to_string(),
            record,
            semaphore,
            socket: socket_path(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> Result<ExchangeRequest> {
        self.record.request()
    }

    pub fn record(&self) -> &RecordRegion {
        &self.record
    }

    pub fn semaphore(&self) -> &NamedSemaphore {
        &self.semaphore
    }

    /// Obtain the producer's handle over the requested transport. For the socket transport
    /// this binds, signals readiness on the semaphore and blocks until the handle arrives.
    pub fn receive_handle(&self) -> Result<ReceivedHandle> {
        match self.request()?.transport {
            Transport::Record => self
                .record
                .handle()?
                .map(ReceivedHandle::without_descriptor)
                .ok_or_else(|| Error::Protocol("no IPC handle in the exchange record".into())),
            Transport::Socket => {
                let receiver = HandleReceiver::bind(&self.socket)?;
                self.semaphore.post();
                receiver.receive()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IpcHandleKind;
    use crate::ipc::record::TestCase;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_unique_names_differ() {
        let a = Exchange::unique_name("t");
        let b = Exchange::unique_name("t");
        assert_ne!(a, b);
        assert!(a.starts_with('/'));
    }

    #[test]
    fn test_record_transport_in_process() {
        let name = Exchange::unique_name("xsync_ex");
        let request = ExchangeRequest::new(TestCase::MemoryDeviceAccess, Transport::Record);
        let exchange = Exchange::create(&name, &request).unwrap();
        let handle = IpcHandleData::new(IpcHandleKind::Memory, 3, 9, 128, "/xs_m_1_9").unwrap();
        exchange.send_handle(&handle).unwrap();

        let peer = ExchangePeer::open(&name).unwrap();
        assert_eq!(peer.request().unwrap(), request);
        assert_eq!(peer.receive_handle().unwrap().data(), handle);
    }

    #[test]
    fn test_socket_transport_in_process() {
        let name = Exchange::unique_name("xsync_ex");
        let request = ExchangeRequest::new(TestCase::MemoryDeviceAccess, Transport::Socket);
        let exchange = Exchange::create(&name, &request).unwrap();
        let shm = SharedMemory::recreate(&format!("{}_obj", name), 256).unwrap();
        let fd = shm.descriptor().unwrap();
        let handle =
            IpcHandleData::new(IpcHandleKind::Memory, fd.as_raw_fd(), 9, 256, shm.name()).unwrap();

        let peer_name = name.clone();
        let consumer = std::thread::spawn(move || {
            let peer = ExchangePeer::open(&peer_name)?;
            peer.receive_handle().map(|h| h.data())
        });
        exchange.send_handle(&handle).unwrap();
        let received = consumer.join().unwrap().unwrap();
        assert_eq!(received.name().unwrap(), shm.name());
        assert_eq!(received.object_id(), 9);
    }

    #[test]
    fn test_record_transport_without_handle_is_a_protocol_error() {
        let name = Exchange::unique_name("xsync_ex");
        let request = ExchangeRequest::new(TestCase::EventHostReads, Transport::Record);
        let _exchange = Exchange::create(&name, &request).unwrap();
        let peer = ExchangePeer::open(&name).unwrap();
        assert!(matches!(peer.receive_handle().unwrap_err(), Error::Protocol(_)));
    }

    #[test]
    fn test_failing_consumer_is_reported() {
        let name = Exchange::unique_name("xsync_ex");
        let request = ExchangeRequest::new(TestCase::EventHostReads, Transport::Record);
        let exchange = Exchange::create(&name, &request).unwrap();
        let consumer = exchange.spawn(Path::new("/bin/false")).unwrap();
        assert!(matches!(consumer.wait().unwrap_err(), Error::ConsumerFailed { .. }));
    }
}
