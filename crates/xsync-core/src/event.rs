//! Event pools and events
//!
//! Free functions sequence single driver calls and report failures with their call name.
//! [`EventPool`] bundles a pool with an [`EventIndexAllocator`] so tests can create and destroy
//! events without tracking slot indices themselves.

use crate::driver::{
    Driver, EventDesc, EventPoolDesc, EventPoolFlags, EventScope, EventStatus, IpcEventPoolHandle,
};
use crate::handle::{ContextHandle, DeviceHandle, EventHandle, EventPoolHandle};
use crate::index::EventIndexAllocator;
use crate::{Error, Result};

/// Slots in a lazily created default pool.
pub const DEFAULT_POOL_SIZE: u32 = 32;

/// Create an event pool on `devices` (all devices when empty).
///
/// Mapped-timestamp pools on a driver without the capability fail with
/// [`Error::Unsupported`], which callers treat as a skip.
pub fn create_event_pool(
    driver: &Driver,
    context: ContextHandle,
    count: u32,
    flags: EventPoolFlags,
    devices: &[DeviceHandle],
) -> Result<EventPoolHandle> {
    if flags.contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP) {
        let targets = if devices.is_empty() {
            driver.devices()
        } else {
            devices.to_vec()
        };
        for device in targets {
            if !driver.device_properties(device)?.mapped_timestamps {
                return Err(Error::Unsupported(format!(
                    "{} has no mapped kernel timestamps",
                    device
                )));
            }
        }
    }
    driver.create_event_pool(context, &EventPoolDesc { flags, count }, devices)
}

pub fn destroy_event_pool(driver: &Driver, pool: EventPoolHandle) -> Result<()> {
    driver.destroy_event_pool(pool)
}

/// Create an event at a caller-chosen `index`.
pub fn create_event(
    driver: &Driver,
    pool: EventPoolHandle,
    index: u32,
    signal: EventScope,
    wait: EventScope,
) -> Result<EventHandle> {
    driver.create_event(pool, &EventDesc { index, signal, wait })
}

pub fn destroy_event(driver: &Driver, event: EventHandle) -> Result<()> {
    driver.destroy_event(event)
}

pub fn host_signal(driver: &Driver, event: EventHandle) -> Result<()> {
    driver.event_host_signal(event)
}

/// Block until signaled. A zero or exceeded timeout reports not-ready.
pub fn host_synchronize(driver: &Driver, event: EventHandle, timeout_ns: u64) -> Result<()> {
    driver.event_host_synchronize(event, timeout_ns)
}

pub fn host_reset(driver: &Driver, event: EventHandle) -> Result<()> {
    driver.event_host_reset(event)
}

pub fn query_status(driver: &Driver, event: EventHandle) -> Result<EventStatus> {
    driver.event_query_status(event)
}

pub fn get_event_pool_ipc_handle(
    driver: &Driver,
    pool: EventPoolHandle,
) -> Result<IpcEventPoolHandle> {
    driver.event_pool_get_ipc_handle(pool)
}

pub fn put_event_pool_ipc_handle(
    driver: &Driver,
    context: ContextHandle,
    handle: IpcEventPoolHandle,
) -> Result<()> {
    driver.event_pool_put_ipc_handle(context, handle)
}

pub fn open_event_pool_ipc_handle(
    driver: &Driver,
    context: ContextHandle,
    handle: IpcEventPoolHandle,
) -> Result<EventPoolHandle> {
    driver.event_pool_open_ipc_handle(context, handle)
}

pub fn close_event_pool_ipc_handle(driver: &Driver, pool: EventPoolHandle) -> Result<()> {
    driver.event_pool_close_ipc_handle(pool)
}

/// Event pool with slot bookkeeping.
///
/// The pool is created on first use. Dropping it destroys every live event, then the pool.
pub struct EventPool {
    driver: Driver,
    context: ContextHandle,
    pool: Option<EventPoolHandle>,
    capacity: u32,
    flags: EventPoolFlags,
    devices: Vec<DeviceHandle>,
    indices: EventIndexAllocator,
}

impl EventPool {
    /// Default pool: [`DEFAULT_POOL_SIZE`] host-visible slots, created lazily.
    pub fn new(driver: &Driver, context: ContextHandle) -> Self {
        Self::lazy(driver, context, DEFAULT_POOL_SIZE, EventPoolFlags::HOST_VISIBLE, &[])
    }

    /// Create the pool right away.
    pub fn create(
        driver: &Driver,
        context: ContextHandle,
        capacity: u32,
        flags: EventPoolFlags,
        devices: &[DeviceHandle],
    ) -> Result<Self> {
        let mut pool = Self::lazy(driver, context, capacity, flags, devices);
        pool.handle()?;
        Ok(pool)
    }

    fn lazy(
        driver: &Driver,
        context: ContextHandle,
        capacity: u32,
        flags: EventPoolFlags,
        devices: &[DeviceHandle],
    ) -> Self {
        Self {
            driver: driver.clone(),
            context,
            pool: None,
            capacity,
            flags,
            devices: devices.to_vec(),
            indices: EventIndexAllocator::new(capacity),
        }
    }

    /// Pool handle, creating the pool if needed.
    pub fn handle(&mut self) -> Result<EventPoolHandle> {
        if let Some(pool) = self.pool {
            return Ok(pool);
        }
        let pool = create_event_pool(
            &self.driver,
            self.context,
            self.capacity,
            self.flags,
            &self.devices,
        )?;
        tracing::debug!(%pool, capacity = self.capacity, "event pool created");
        self.pool = Some(pool);
        Ok(pool)
    }

    pub fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Events currently alive in this pool.
    pub fn live(&self) -> usize {
        self.indices.live()
    }

    /// Slot held by a live event.
    pub fn index_of(&self, event: EventHandle) -> Option<u32> {
        self.indices.index_of(event)
    }

    /// Create an event on the first free slot.
    pub fn create_event(&mut self, signal: EventScope, wait: EventScope) -> Result<EventHandle> {
        let pool = self.handle()?;
        let index = self.indices.acquire_index().ok_or(Error::PoolExhausted {
            capacity: self.capacity,
        })?;
        let event = self.driver.create_event(pool, &EventDesc { index, signal, wait })?;
        self.indices.bind(event, index)?;
        Ok(event)
    }

    pub fn create_events(
        &mut self,
        count: usize,
        signal: EventScope,
        wait: EventScope,
    ) -> Result<Vec<EventHandle>> {
        (0..count).map(|_| self.create_event(signal, wait)).collect()
    }

    /// Create an event at the slot named in `desc`.
    pub fn create_event_with_desc(&mut self, desc: &EventDesc) -> Result<EventHandle> {
        let pool = self.handle()?;
        let event = self.driver.create_event(pool, desc)?;
        if let Err(e) = self.indices.bind(event, desc.index) {
            self.driver.destroy_event(event)?;
            return Err(e);
        }
        Ok(event)
    }

    /// Destroy an event and return its slot to the pool.
    pub fn destroy_event(&mut self, event: EventHandle) -> Result<()> {
        if self.indices.index_of(event).is_none() {
            return Err(Error::UnknownEvent(event.raw()?));
        }
        self.driver.destroy_event(event)?;
        self.indices.release_index(event)?;
        Ok(())
    }

    pub fn destroy_events(&mut self, events: &[EventHandle]) -> Result<()> {
        events.iter().try_for_each(|&event| self.destroy_event(event))
    }

    /// Export the pool. The pool must have been created with [`EventPoolFlags::IPC`].
    pub fn ipc_handle(&mut self) -> Result<IpcEventPoolHandle> {
        if !self.flags.contains(EventPoolFlags::IPC) {
            return Err(Error::Protocol("event pool was not created with the IPC flag".into()));
        }
        let pool = self.handle()?;
        get_event_pool_ipc_handle(&self.driver, pool)
    }

    pub fn put_ipc_handle(&self, handle: IpcEventPoolHandle) -> Result<()> {
        put_event_pool_ipc_handle(&self.driver, self.context, handle)
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        let events: Vec<EventHandle> = self.indices.events().collect();
        for event in events {
            if let Err(e) = self.destroy_event(event) {
                tracing::warn!(%event, error = %e, "failed to destroy event");
            }
        }
        if let Some(pool) = self.pool.take() {
            if let Err(e) = self.driver.destroy_event_pool(pool) {
                tracing::warn!(%pool, error = %e, "failed to destroy event pool");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::harness::Harness;

    #[test]
    fn test_status_round_trip() {
        let h = Harness::reference().unwrap();
        let d = h.driver();
        let pool = create_event_pool(d, h.context(), 1, EventPoolFlags::HOST_VISIBLE, &[]).unwrap();
        let ev = create_event(d, pool, 0, EventScope::HOST, EventScope::HOST).unwrap();

        assert_eq!(query_status(d, ev).unwrap(), EventStatus::NotReady);
        host_signal(d, ev).unwrap();
        assert_eq!(query_status(d, ev).unwrap(), EventStatus::Signaled);
        host_synchronize(d, ev, 0).unwrap();
        host_reset(d, ev).unwrap();
        assert_eq!(query_status(d, ev).unwrap(), EventStatus::NotReady);

        destroy_event(d, ev).unwrap();
        destroy_event_pool(d, pool).unwrap();
    }

    #[test]
    fn test_ipc_pool_open_and_close() {
        let producer = Harness::reference().unwrap();
        let consumer = Harness::reference().unwrap();
        let (pd, cd) = (producer.driver(), consumer.driver());
        let flags = EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC;
        let pool = create_event_pool(pd, producer.context(), 4, flags, &[]).unwrap();
        let ev = create_event(pd, pool, 3, EventScope::HOST, EventScope::HOST).unwrap();
        let handle = get_event_pool_ipc_handle(pd, pool).unwrap();

        let opened = open_event_pool_ipc_handle(cd, consumer.context(), handle).unwrap();
        let remote = create_event(cd, opened, 3, EventScope::HOST, EventScope::HOST).unwrap();
        assert_eq!(query_status(cd, remote).unwrap(), EventStatus::NotReady);
        host_signal(pd, ev).unwrap();
        host_synchronize(cd, remote, 1_000_000_000).unwrap();
        destroy_event(cd, remote).unwrap();
        close_event_pool_ipc_handle(cd, opened).unwrap();
        assert!(close_event_pool_ipc_handle(cd, opened).is_err());

        put_event_pool_ipc_handle(pd, producer.context(), handle).unwrap();
        destroy_event(pd, ev).unwrap();
        destroy_event_pool(pd, pool).unwrap();
    }

    #[test]
    fn test_pool_lazy_init_and_reuse() {
        let h = Harness::reference().unwrap();
        let mut pool = EventPool::new(h.driver(), h.context());
        assert_eq!(h.driver().live_objects().event_pools, 0);

        for _ in 0..50 {
            let events = pool
                .create_events(DEFAULT_POOL_SIZE as usize, EventScope::HOST, EventScope::HOST)
                .unwrap();
            assert!(matches!(
                pool.create_event(EventScope::HOST, EventScope::HOST),
                Err(Error::PoolExhausted { capacity: 32 })
            ));
            pool.destroy_events(&events).unwrap();
            assert_eq!(pool.live(), 0);
        }
        assert_eq!(h.driver().live_objects().event_pools, 1);
        drop(pool);
        assert_eq!(h.driver().live_objects().event_pools, 0);
    }

    #[test]
    fn test_drop_cleans_up_live_events() {
        let h = Harness::reference().unwrap();
        {
            let mut pool = EventPool::new(h.driver(), h.context());
            pool.create_events(3, EventScope::HOST, EventScope::HOST).unwrap();
            pool.create_event_with_desc(&EventDesc::new(10)).unwrap();
            assert!(pool.create_event_with_desc(&EventDesc::new(10)).is_err());
            assert_eq!(h.driver().live_objects().events, 4);
        }
        let live = h.driver().live_objects();
        assert_eq!(live.events, 0);
        assert_eq!(live.event_pools, 0);
    }

    #[test]
    fn test_desc_slot_is_not_handed_out_again() {
        let h = Harness::reference().unwrap();
        let mut pool = EventPool::create(
            h.driver(),
            h.context(),
            2,
            EventPoolFlags::HOST_VISIBLE,
            &[],
        )
        .unwrap();
        let pinned = pool.create_event_with_desc(&EventDesc::new(0)).unwrap();
        let next = pool.create_event(EventScope::HOST, EventScope::HOST).unwrap();
        assert_eq!(pool.index_of(pinned), Some(0));
        assert_eq!(pool.index_of(next), Some(1));
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        let h = Harness::reference().unwrap();
        let mut a = EventPool::new(h.driver(), h.context());
        let mut b = EventPool::new(h.driver(), h.context());
        let ev = a.create_event(EventScope::HOST, EventScope::HOST).unwrap();
        assert!(matches!(b.destroy_event(ev), Err(Error::UnknownEvent(_))));
        a.destroy_event(ev).unwrap();
        assert!(a.destroy_event(ev).is_err());
    }

    #[test]
    fn test_mapped_pool_without_capability_is_a_skip() {
        let driver = Driver::init(DriverConfig {
            mapped_timestamps: false,
            ..Default::default()
        })
        .unwrap();
        let ctx = driver.create_context().unwrap();
        let err = create_event_pool(&driver, ctx, 1, EventPoolFlags::KERNEL_MAPPED_TIMESTAMP, &[])
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_ipc_handle_needs_ipc_flag() {
        let h = Harness::reference().unwrap();
        let mut plain = EventPool::new(h.driver(), h.context());
        assert!(plain.ipc_handle().is_err());

        let mut shared = EventPool::create(
            h.driver(),
            h.context(),
            4,
            EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC,
            &[],
        )
        .unwrap();
        let handle = shared.ipc_handle().unwrap();
        shared.put_ipc_handle(handle).unwrap();
    }
}
