//! Cross-process integration tests
//!
//! Exchanges run against the real `xsync-ipc-helper` executable; the record and semaphore are
//! also exercised across a `fork()`.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::path::Path;
use std::thread;
use std::time::Duration;

use xsync_core::driver::{CommandListDesc, CommandQueueDesc, DriverConfig, IpcHandle};
use xsync_core::fence::sync_fence;
use xsync_core::ipc::{
    run_event_producer, run_memory_producer, run_timestamp_producer, EventScenario, Exchange,
    ExchangeRequest, MemoryScenario, NamedSemaphore, RecordRegion, SignalSource, TestCase,
    Transport,
};
use xsync_core::timestamp::{KernelTimestamp, TimestampData};
use xsync_core::{Buffer, Error, Harness, HarnessConfig};

fn helper() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_xsync-ipc-helper"))
}

/// Check that a WaitStatus is a normal exit with code 0
fn is_exit_success(status: WaitStatus) -> bool {
    matches!(status, WaitStatus::Exited(_, 0))
}

#[test]
fn test_memory_device_access_over_socket() {
    let h = Harness::reference().unwrap();
    let scenario = MemoryScenario::new(TestCase::MemoryDeviceAccess);
    let report = run_memory_producer(&h, helper(), &scenario).unwrap();
    assert!(report.status.success());
}

#[test]
fn test_memory_device_access_immediate_over_record() {
    let h = Harness::reference().unwrap();
    let scenario = MemoryScenario {
        transport: Transport::Record,
        immediate: true,
        pattern: 7,
        ..MemoryScenario::new(TestCase::MemoryDeviceAccess)
    };
    run_memory_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_memory_sub_device_access() {
    let h = Harness::reference().unwrap();
    let scenario = MemoryScenario::new(TestCase::MemorySubDeviceAccess);
    run_memory_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_memory_put_handle_after_consumer_exit() {
    let h = Harness::reference().unwrap();
    run_memory_producer(&h, helper(), &MemoryScenario::new(TestCase::MemoryPutHandle)).unwrap();
    assert_eq!(h.driver().live_objects().allocations, 0);
}

#[test]
fn test_event_signaled_by_host_read_by_host() {
    let h = Harness::reference().unwrap();
    let scenario = EventScenario::new(TestCase::EventHostReads, SignalSource::Host);
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_event_signaled_by_device_read_by_device() {
    let h = Harness::reference().unwrap();
    let scenario = EventScenario {
        transport: Transport::Record,
        ..EventScenario::new(TestCase::EventDeviceReads, SignalSource::Device)
    };
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_event_signaled_by_host_read_by_device() {
    let h = Harness::reference().unwrap();
    let scenario = EventScenario::new(TestCase::EventDeviceReads, SignalSource::Host);
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_event_signaled_by_device_read_by_host() {
    let h = Harness::reference().unwrap();
    let scenario = EventScenario {
        immediate: true,
        ..EventScenario::new(TestCase::EventHostReads, SignalSource::Device)
    };
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_event_signaled_by_device_read_by_second_device() {
    let h = Harness::reference().unwrap();
    assert!(h.driver().devices().len() >= 2);
    let scenario = EventScenario::new(TestCase::EventSecondDeviceReads, SignalSource::Device);
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_event_signaled_by_host_read_by_every_device() {
    let h = Harness::reference().unwrap();
    let scenario = EventScenario {
        transport: Transport::Record,
        ..EventScenario::new(TestCase::EventMultiDeviceReads, SignalSource::Host)
    };
    run_event_producer(&h, helper(), &scenario).unwrap();
}

#[test]
fn test_multi_device_event_case_skips_on_single_device() {
    let config = HarnessConfig {
        driver: DriverConfig {
            devices: 1,
            ..DriverConfig::default()
        },
        ..HarnessConfig::default()
    };
    let h = Harness::init(config).unwrap();
    let scenario = EventScenario::new(TestCase::EventSecondDeviceReads, SignalSource::Host);
    let err = run_event_producer(&h, helper(), &scenario).unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn test_event_timestamp_read_by_consumer() {
    let h = Harness::reference().unwrap();
    let outcome = run_timestamp_producer(&h, helper(), Transport::Socket, false).unwrap();
    let bits = h.driver().device_properties(h.device()).unwrap().kernel_timestamp_valid_bits;
    assert!(outcome.timestamp.global.elapsed_ticks(bits) > 0);
    let ts = outcome.timestamp;
    assert!(ts.context.elapsed_ticks(bits) <= ts.global.elapsed_ticks(bits));
}

#[test]
fn test_consumer_failure_is_reported() {
    let h = Harness::reference().unwrap();
    let handle = {
        let gone = Buffer::device(h.driver(), h.context(), h.device(), 64).unwrap();
        gone.ipc_handle().unwrap()
    };
    let request = ExchangeRequest {
        size: 64,
        ..ExchangeRequest::new(TestCase::MemoryDeviceAccess, Transport::Record)
    };
    let exchange = Exchange::create(&Exchange::unique_name("xsync_fail"), &request).unwrap();
    let consumer = exchange.launch(helper(), handle.data()).unwrap();
    match consumer.wait() {
        Err(Error::ConsumerFailed { errors, .. }) => assert!(!errors.is_empty()),
        other => panic!("expected a consumer failure, got {:?}", other.map(|r| r.status)),
    }
}

#[test]
fn test_record_and_semaphore_across_fork() {
    let name = Exchange::unique_name("xsync_fork");
    let request = ExchangeRequest::new(TestCase::EventTimestamp, Transport::Record);
    let exchange = Exchange::create(&name, &request).unwrap();
    let reply = KernelTimestamp {
        global: TimestampData { start: 100, end: 250 },
        context: TimestampData { start: 120, end: 240 },
    };

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let ok = (|| -> xsync_core::Result<()> {
                let record = RecordRegion::open(&name)?;
                let semaphore = NamedSemaphore::open(&name)?;
                if record.request()? != request {
                    return Err(Error::Protocol("request mismatch".into()));
                }
                if !semaphore.wait_timeout(Duration::from_secs(10)) {
                    return Err(Error::Protocol("no go signal".into()));
                }
                record.write_reply(&reply)?;
                semaphore.post();
                Ok(())
            })()
            .is_ok();
            std::process::exit(if ok { 0 } else { 1 });
        }
        ForkResult::Parent { child } => {
            assert!(exchange.record().reply().is_none());
            exchange.semaphore().post();
            let status = waitpid(child, None).unwrap();
            assert!(is_exit_success(status), "child failed: {:?}", status);
            // The child took the go signal and posted its own.
            assert_eq!(exchange.semaphore().value(), 1);
            assert_eq!(exchange.record().reply(), Some(reply));
        }
    }
}

#[test]
fn test_sixteen_threads_share_one_queue() {
    const THREADS: usize = 16;
    let h = Harness::reference().unwrap();
    let driver = h.driver();
    let (context, device) = (h.context(), h.device());
    let queue = driver
        .create_command_queue(context, device, &CommandQueueDesc::default())
        .unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let driver = driver.clone();
            thread::spawn(move || -> xsync_core::Result<()> {
                let value = i as u8 + 1;
                let mem = driver.allocate_host(context, 256, 0)?;
                let desc = CommandListDesc::default();
                let list = driver.create_command_list(context, device, &desc)?;
                driver.append_memory_fill(list, mem, &[value], 256, None, &[])?;
                driver.close_command_list(list)?;
                let fence = driver.create_fence(queue)?;
                driver.execute_command_lists(queue, &[list], Some(fence))?;
                sync_fence(&driver, fence, u64::MAX)?;

                let mut out = [0u8; 256];
                driver.host_read(mem, 0, &mut out)?;
                assert!(out.iter().all(|&b| b == value));

                driver.destroy_fence(fence)?;
                driver.destroy_command_list(list)?;
                driver.free_memory(context, mem)
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    driver.destroy_command_queue(queue).unwrap();
}
