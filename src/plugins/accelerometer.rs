//! Accelerometer plugin with a synthetic sample producer.
//!
//! `accelerometersensor` composes `accelerometerchain`, which acquires
//! `accelerometeradaptor`. While at least one session is started, a worker
//! thread produces one [`AccelFrame`] per effective interval and pushes it
//! through the cross-thread pipe for every started session. Production is
//! gated by the adaptor's standby state unless a session holds a standby
//! override.
//!
//! Construction parameters understood by the sensor:
//! - `interval=<ms>`: initial sampling interval (default 100 ms).

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::channel::{lock, DataRange, DeviceAdaptor, ProcessingChain, SensorChannel};
use crate::error::ManagerError;
use crate::ident;
use crate::manager::SensorManager;
use crate::pipe::SampleSink;
use crate::registry::{ChainServices, SensorServices};
use crate::session::SessionId;

const SENSOR_TYPE: &str = "accelerometersensor";
const CHAIN_ID: &str = "accelerometerchain";
const ADAPTOR_ID: &str = "accelerometeradaptor";

const DEFAULT_INTERVAL_MS: u32 = 100;

/// Worker sleep granularity; bounds teardown latency under long intervals.
const TICK: Duration = Duration::from_millis(10);

/// Installs the accelerometer factories and registry slots.
pub fn register(manager: &mut SensorManager) {
    manager.register_adaptor_factory(ADAPTOR_ID, make_accel_adaptor);
    manager.register_adaptor_slot(ADAPTOR_ID, ADAPTOR_ID, HashMap::new());
    manager.register_chain_factory(CHAIN_ID, make_accel_chain);
    manager.register_chain_slot(CHAIN_ID, CHAIN_ID);
    manager.register_sensor_factory(SENSOR_TYPE, make_accel_sensor);
    manager.register_sensor_slot(SENSOR_TYPE, SENSOR_TYPE);
}

/// One accelerometer sample as written to the session socket: timestamp in
/// microseconds plus the three axes in m/s², all little-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelFrame {
    pub timestamp_us: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelFrame {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.x.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.y.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.z.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            buf
        };
        Self {
            timestamp_us: i64::from_le_bytes(field(0..8)),
            x: f64::from_le_bytes(field(8..16)),
            y: f64::from_le_bytes(field(16..24)),
            z: f64::from_le_bytes(field(24..32)),
        }
    }
}

/// State shared between the adaptor and the sensor's producer thread.
#[derive(Debug, Default)]
pub struct AccelAdaptorState {
    standby: AtomicBool,
}

impl AccelAdaptorState {
    pub fn in_standby(&self) -> bool {
        self.standby.load(Ordering::Relaxed)
    }
}

pub struct AccelAdaptor {
    id: String,
    started: bool,
    screen_blanked: bool,
    properties: HashMap<String, i32>,
    state: Arc<AccelAdaptorState>,
}

impl AccelAdaptor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            started: false,
            screen_blanked: false,
            properties: HashMap::new(),
            state: Arc::new(AccelAdaptorState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn screen_blanked(&self) -> bool {
        self.screen_blanked
    }

    pub fn state(&self) -> Arc<AccelAdaptorState> {
        Arc::clone(&self.state)
    }
}

impl DeviceAdaptor for AccelAdaptor {
    fn start_adaptor(&mut self) -> bool {
        self.started = true;
        true
    }

    fn stop_adaptor(&mut self) {
        self.started = false;
    }

    fn standby(&mut self) -> bool {
        self.state.standby.store(true, Ordering::Relaxed);
        true
    }

    fn resume(&mut self) -> bool {
        self.state.standby.store(false, Ordering::Relaxed);
        true
    }

    fn set_screen_blanked(&mut self, blanked: bool) {
        self.screen_blanked = blanked;
    }

    fn set_property(&mut self, name: &str, value: i32) {
        self.properties.insert(name.to_string(), value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn make_accel_adaptor(id: &str) -> Arc<Mutex<dyn DeviceAdaptor>> {
    Arc::new(Mutex::new(AccelAdaptor::new(id)))
}

pub struct AccelChain {
    id: String,
    adaptor: Arc<Mutex<dyn DeviceAdaptor>>,
}

impl ProcessingChain for AccelChain {
    fn id(&self) -> &str {
        &self.id
    }

    fn running(&self) -> bool {
        lock(&self.adaptor)
            .as_any()
            .downcast_ref::<AccelAdaptor>()
            .is_some_and(AccelAdaptor::started)
    }
}

pub fn make_accel_chain(
    id: &str,
    services: &mut ChainServices<'_>,
) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError> {
    let adaptor = services.request_adaptor(ADAPTOR_ID)?;
    Ok(Arc::new(Mutex::new(AccelChain {
        id: id.to_string(),
        adaptor,
    })))
}

/// State shared between the sensor (control context) and its worker thread.
struct ProducerShared {
    stop: AtomicBool,
    interval_ms: AtomicU32,
    standby_override: AtomicBool,
    sessions: Mutex<HashSet<SessionId>>,
}

pub struct AccelSensor {
    id: String,
    base_interval_ms: u32,
    intervals: HashMap<SessionId, u32>,
    standby_overrides: HashSet<SessionId>,
    data_ranges: HashMap<SessionId, DataRange>,
    chain: Arc<Mutex<dyn ProcessingChain>>,
    adaptor_state: Arc<AccelAdaptorState>,
    sink: SampleSink,
    shared: Arc<ProducerShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AccelSensor {
    fn effective_interval_ms(&self) -> u32 {
        self.intervals
            .values()
            .min()
            .copied()
            .unwrap_or(self.base_interval_ms)
            .max(1)
    }

    fn refresh_interval(&self) {
        self.shared
            .interval_ms
            .store(self.effective_interval_ms(), Ordering::Relaxed);
    }

    fn ensure_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let adaptor_state = Arc::clone(&self.adaptor_state);
        let sink = self.sink.clone();
        debug!(sensor = %self.id, "starting accelerometer producer");
        self.worker = Some(thread::spawn(move || {
            produce_frames(shared, adaptor_state, sink)
        }));
    }
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}

fn produce_frames(
    shared: Arc<ProducerShared>,
    adaptor_state: Arc<AccelAdaptorState>,
    sink: SampleSink,
) {
    let mut elapsed = Duration::ZERO;
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(TICK);
        elapsed += TICK;
        if elapsed < Duration::from_millis(u64::from(shared.interval_ms.load(Ordering::Relaxed))) {
            continue;
        }
        elapsed = Duration::ZERO;

        if adaptor_state.in_standby() && !shared.standby_override.load(Ordering::Relaxed) {
            continue;
        }

        let sessions: Vec<SessionId> = lock(&shared.sessions).iter().copied().collect();
        if sessions.is_empty() {
            continue;
        }

        // Device at rest: gravity on the z axis.
        let frame = AccelFrame {
            timestamp_us: now_us(),
            x: 0.0,
            y: 0.0,
            z: 9.81,
        };
        let bytes = frame.to_bytes();
        for session in sessions {
            if shared.stop.load(Ordering::Relaxed) {
                return;
            }
            let _ = sink.write(session, &bytes);
        }
    }
}

impl SensorChannel for AccelSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn start(&mut self, session: SessionId) -> bool {
        if !lock(&self.shared.sessions).insert(session) {
            return false;
        }
        self.ensure_worker();
        true
    }

    fn stop(&mut self, session: SessionId) -> bool {
        lock(&self.shared.sessions).remove(&session)
    }

    fn running(&self) -> bool {
        !lock(&self.shared.sessions).is_empty() && lock(&self.chain).running()
    }

    fn set_interval(&mut self, session: SessionId, interval_ms: u32) -> bool {
        if interval_ms == 0 {
            warn!(sensor = %self.id, session, "ignoring zero interval request");
            return false;
        }
        self.intervals.insert(session, interval_ms);
        self.refresh_interval();
        true
    }

    fn remove_interval_request(&mut self, session: SessionId) {
        self.intervals.remove(&session);
        self.refresh_interval();
    }

    fn set_data_rate(&mut self, session: SessionId, rate_hz: f64) -> bool {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            warn!(sensor = %self.id, session, rate_hz, "ignoring invalid data rate");
            return false;
        }
        self.set_interval(session, (1000.0 / rate_hz).round().max(1.0) as u32)
    }

    fn set_standby_override(&mut self, session: SessionId, value: bool) -> bool {
        if value {
            self.standby_overrides.insert(session);
        } else {
            self.standby_overrides.remove(&session);
        }
        self.shared
            .standby_override
            .store(!self.standby_overrides.is_empty(), Ordering::Relaxed);
        true
    }

    fn request_data_range(&mut self, session: SessionId, range: DataRange) {
        self.data_ranges.insert(session, range);
    }

    fn remove_data_range_request(&mut self, session: SessionId) {
        self.data_ranges.remove(&session);
    }

    fn reset(&mut self) {
        lock(&self.shared.sessions).clear();
        self.intervals.clear();
        self.standby_overrides.clear();
        self.data_ranges.clear();
        self.shared.standby_override.store(false, Ordering::Relaxed);
        self.refresh_interval();
    }
}

impl Drop for AccelSensor {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        lock(&self.shared.sessions).clear();
        // The worker observes the stop flag and exits on its own; joining
        // here could deadlock against a full sample pipe.
        let _ = self.worker.take();
    }
}

pub fn make_accel_sensor(
    id: &str,
    services: &mut SensorServices<'_>,
) -> Result<Box<dyn SensorChannel>, ManagerError> {
    let chain = services.request_chain(CHAIN_ID)?;
    let adaptor = services.request_adaptor(ADAPTOR_ID)?;
    let adaptor_state = {
        let guard = lock(&adaptor);
        match guard.as_any().downcast_ref::<AccelAdaptor>() {
            Some(accel) => accel.state(),
            None => {
                return Err(ManagerError::NotInstantiated(format!(
                    "adaptor '{ADAPTOR_ID}' is not an accelerometer adaptor"
                )))
            }
        }
    };

    let parameters = ident::parse_parameters(id);
    let base_interval_ms = parameters
        .get("interval")
        .and_then(|value| value.parse().ok())
        .filter(|interval| *interval > 0)
        .unwrap_or(DEFAULT_INTERVAL_MS);

    let shared = Arc::new(ProducerShared {
        stop: AtomicBool::new(false),
        interval_ms: AtomicU32::new(base_interval_ms),
        standby_override: AtomicBool::new(false),
        sessions: Mutex::new(HashSet::new()),
    });

    Ok(Box::new(AccelSensor {
        id: id.to_string(),
        base_interval_ms,
        intervals: HashMap::new(),
        standby_overrides: HashSet::new(),
        data_ranges: HashMap::new(),
        chain,
        adaptor_state,
        sink: services.sample_sink(),
        shared,
        worker: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_round_trips() {
        let frame = AccelFrame {
            timestamp_us: 1_700_000_000_000_000,
            x: 0.25,
            y: -0.5,
            z: 9.81,
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), AccelFrame::SIZE);
        assert_eq!(AccelFrame::from_bytes(&bytes), frame);
    }

    #[test]
    fn producer_writes_frames_for_started_sessions() {
        let (sink, mut rx) = crate::pipe::channel(16);
        let shared = Arc::new(ProducerShared {
            stop: AtomicBool::new(false),
            interval_ms: AtomicU32::new(10),
            standby_override: AtomicBool::new(false),
            sessions: Mutex::new(HashSet::from([3])),
        });
        let adaptor_state = Arc::new(AccelAdaptorState::default());

        let worker = {
            let shared = Arc::clone(&shared);
            let adaptor_state = Arc::clone(&adaptor_state);
            thread::spawn(move || produce_frames(shared, adaptor_state, sink))
        };

        let record = rx.blocking_recv().expect("frame");
        assert_eq!(record.session_id, 3);
        assert_eq!(record.payload.len(), AccelFrame::SIZE);
        let mut bytes = [0u8; AccelFrame::SIZE];
        bytes.copy_from_slice(&record.payload);
        let frame = AccelFrame::from_bytes(&bytes);
        assert_eq!(frame.z, 9.81);

        shared.stop.store(true, Ordering::Relaxed);
        worker.join().expect("worker");
    }

    #[test]
    fn standby_gates_production_unless_overridden() {
        let (sink, mut rx) = crate::pipe::channel(16);
        let shared = Arc::new(ProducerShared {
            stop: AtomicBool::new(false),
            interval_ms: AtomicU32::new(10),
            standby_override: AtomicBool::new(false),
            sessions: Mutex::new(HashSet::from([1])),
        });
        let adaptor_state = Arc::new(AccelAdaptorState::default());
        adaptor_state.standby.store(true, Ordering::Relaxed);

        let worker = {
            let shared = Arc::clone(&shared);
            let adaptor_state = Arc::clone(&adaptor_state);
            thread::spawn(move || produce_frames(shared, adaptor_state, sink))
        };

        // In standby nothing arrives; with an override frames flow again.
        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_none());

        shared.standby_override.store(true, Ordering::Relaxed);
        assert!(rx.blocking_recv().is_some());

        shared.stop.store(true, Ordering::Relaxed);
        worker.join().expect("worker");
    }
}
