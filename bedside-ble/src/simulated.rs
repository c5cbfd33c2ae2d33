//! In-process bed simulator
//!
//! A [`GattLink`] that keeps the bed's characteristics in memory. It backs
//! `bedside-hub run --simulate` and the session tests, which use its failure
//! injection and call counters in place of real hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bedside_proto::Characteristic;
use tokio::time::Instant;

use crate::link::{ConnError, GattLink, IoError, PeripheralIdentity};

/// Counters of what the simulator has been asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub connect_attempts: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub writes: usize,
    pub reads: usize,
    /// Highest number of `connect` calls that were in flight at once
    pub max_concurrent_connects: usize,
}

/// Handle of one simulated connection
#[derive(Debug)]
pub struct SimHandle {
    id: u64,
}

struct SimState {
    values: HashMap<Characteristic, Vec<u8>>,
    light_readable: bool,
    light_exposed: bool,
    busy_remaining: usize,
    connect_failure: Option<ConnError>,
    write_failures: HashMap<Characteristic, usize>,
    read_failures: usize,
    next_id: u64,
    live: Option<u64>,
    stats: SimStats,
    written: Vec<(Characteristic, Vec<u8>, Instant)>,
}

/// A bed that lives in memory
pub struct SimulatedBed {
    state: Mutex<SimState>,
    connect_delay: Duration,
    connecting: AtomicUsize,
}

impl Default for SimulatedBed {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBed {
    /// Flat bed, motors off, light off and readable
    pub fn new() -> Self {
        let values = Characteristic::ALL
            .into_iter()
            .map(|c| (c, vec![0u8]))
            .collect();
        Self {
            state: Mutex::new(SimState {
                values,
                light_readable: true,
                light_exposed: true,
                busy_remaining: 0,
                connect_failure: None,
                write_failures: HashMap::new(),
                read_failures: 0,
                next_id: 1,
                live: None,
                stats: SimStats::default(),
                written: Vec::new(),
            }),
            connect_delay: Duration::ZERO,
            connecting: AtomicUsize::new(0),
        }
    }

    /// Every `connect` takes this long, like a real radio
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` connects fail with [`ConnError::Busy`]
    pub fn busy_for(&self, n: usize) {
        self.lock().busy_remaining = n;
    }

    /// Every connect fails with `error` until cleared with `None`
    pub fn fail_connect(&self, error: Option<ConnError>) {
        self.lock().connect_failure = error;
    }

    /// The next `n` writes to `target` fail
    pub fn fail_writes(&self, target: Characteristic, n: usize) {
        self.lock().write_failures.insert(target, n);
    }

    /// The next `n` reads fail
    pub fn fail_reads(&self, n: usize) {
        self.lock().read_failures = n;
    }

    /// Older firmware can't read the light back
    pub fn set_light_readable(&self, readable: bool) {
        self.lock().light_readable = readable;
    }

    /// Some firmware has no light characteristic at all
    pub fn set_light_exposed(&self, exposed: bool) {
        self.lock().light_exposed = exposed;
    }

    pub fn set_value(&self, target: Characteristic, raw: Vec<u8>) {
        self.lock().values.insert(target, raw);
    }

    pub fn value(&self, target: Characteristic) -> Vec<u8> {
        self.lock().values.get(&target).cloned().unwrap_or_default()
    }

    /// The live connection dies without telling anyone
    pub fn drop_link(&self) {
        self.lock().live = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().live.is_some()
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    /// Successful writes, in order
    pub fn written(&self) -> Vec<(Characteristic, Vec<u8>)> {
        let state = self.lock();
        state.written.iter().map(|(c, v, _)| (*c, v.clone())).collect()
    }

    /// When each successful write landed
    pub fn write_times(&self) -> Vec<(Characteristic, Instant)> {
        let state = self.lock();
        state.written.iter().map(|(c, _, at)| (*c, *at)).collect()
    }
}

#[async_trait]
impl GattLink for SimulatedBed {
    type Handle = SimHandle;

    async fn connect(
        &self,
        identity: &PeripheralIdentity,
        timeout: Duration,
    ) -> Result<SimHandle, ConnError> {
        let in_flight = self.connecting.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.lock();
            state.stats.connect_attempts += 1;
            state.stats.max_concurrent_connects = state.stats.max_concurrent_connects.max(in_flight);
        }

        if self.connect_delay > timeout {
            tokio::time::sleep(timeout).await;
            self.connecting.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnError::Timeout(timeout));
        }
        tokio::time::sleep(self.connect_delay).await;
        self.connecting.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        if let Some(e) = state.connect_failure.clone() {
            return Err(e);
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Err(ConnError::Busy);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live = Some(id);
        state.stats.connects += 1;
        tracing::debug!("simulated bed {} connected ({id})", identity.address);
        Ok(SimHandle { id })
    }

    async fn write(
        &self,
        handle: &SimHandle,
        target: Characteristic,
        payload: &[u8],
    ) -> Result<(), IoError> {
        let mut state = self.lock();
        state.stats.writes += 1;
        if state.live != Some(handle.id) {
            return Err(IoError::Disconnected("simulated link is down".to_string()));
        }
        if target == Characteristic::Light && !state.light_exposed {
            return Err(IoError::NotExposed(target));
        }
        if let Some(n) = state.write_failures.get_mut(&target) {
            if *n > 0 {
                *n -= 1;
                return Err(IoError::Gatt(target, "injected write failure".to_string()));
            }
        }
        state.values.insert(target, payload.to_vec());
        state.written.push((target, payload.to_vec(), Instant::now()));
        Ok(())
    }

    async fn read(&self, handle: &SimHandle, target: Characteristic) -> Result<Vec<u8>, IoError> {
        let mut state = self.lock();
        state.stats.reads += 1;
        if state.live != Some(handle.id) {
            return Err(IoError::Disconnected("simulated link is down".to_string()));
        }
        if target == Characteristic::Light && !state.light_exposed {
            return Err(IoError::NotExposed(target));
        }
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(IoError::Gatt(target, "injected read failure".to_string()));
        }
        if target == Characteristic::Light && !state.light_readable {
            return Err(IoError::NotReadable(target));
        }
        Ok(state.values.get(&target).cloned().unwrap_or_default())
    }

    async fn disconnect(&self, handle: &SimHandle) {
        let mut state = self.lock();
        state.stats.disconnects += 1;
        if state.live == Some(handle.id) {
            state.live = None;
        }
    }
}
