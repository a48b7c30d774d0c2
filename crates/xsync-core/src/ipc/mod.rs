//! Cross-process resource exchange
//!
//! A producer process shares a memory allocation or an event pool with a consumer process:
//!
//! 1. the producer removes stale objects and creates the [`RecordRegion`] and the
//!    [`NamedSemaphore`] (count zero) of the exchange;
//! 2. it spawns the consumer, which learns the exchange name from `XSYNC_IPC_EXCHANGE`;
//! 3. it exports the resource and hands the handle over, either embedded in the record or as
//!    a descriptor over a unix socket once the consumer posts "ready";
//! 4. the consumer opens the resource, validates it, writes any reply fields and exits with
//!    code 0, or 1 on any failure;
//! 5. the producer waits for the exit, checks the code and the consumer's log, reads the
//!    reply, and only then puts the handle.

pub mod exchange;
pub mod record;
pub mod scenario;
pub mod semaphore;
pub mod socket;

pub use exchange::{Consumer, ConsumerReport, Exchange, ExchangePeer, EXCHANGE_ENV};
pub use record::{ExchangeRequest, RecordRegion, TestCase, Transport};
pub use scenario::{
    run_consumer, run_event_producer, run_memory_producer, run_timestamp_producer, EventScenario,
    MemoryScenario, SignalSource, TimestampOutcome,
};
pub use semaphore::NamedSemaphore;
pub use socket::{HandleReceiver, ReceivedHandle};
