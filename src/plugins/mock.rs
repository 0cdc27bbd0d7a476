//! Mock sensor family for development and tests.
//!
//! Registers the full dependency graph so registry, arbitration, and
//! refcount behaviour can be exercised without hardware: `mocksensor`
//! composes `mockchain` plus a direct hold on `mockadaptor`, and the chain
//! acquires the same adaptor itself.
//!
//! Construction parameters understood by the sensor:
//! - `valid=false`: the built instance reports itself invalid, which makes
//!   the manager discard it.
//!
//! Adaptor property bag:
//! - `fail_start=1`: `start_adaptor` reports failure.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::channel::{lock, DataRange, DeviceAdaptor, ProcessingChain, SampleFilter, SensorChannel};
use crate::error::ManagerError;
use crate::ident;
use crate::manager::SensorManager;
use crate::registry::{ChainServices, SensorServices};
use crate::session::SessionId;

/// Installs the mock factories and registry slots.
pub fn register(manager: &mut SensorManager) {
    manager.register_adaptor_factory("mockadaptor", make_mock_adaptor);
    manager.register_adaptor_slot("mockadaptor", "mockadaptor", HashMap::new());
    manager.register_chain_factory("mockchain", make_mock_chain);
    manager.register_chain_slot("mockchain", "mockchain");
    manager.register_sensor_factory("mocksensor", make_mock_sensor);
    manager.register_sensor_slot("mocksensor", "mocksensor");
    manager.register_filter_factory("mockfilter", make_mock_filter);
}

pub struct MockAdaptor {
    id: String,
    started: bool,
    standby: bool,
    screen_blanked: bool,
    fail_start: bool,
    properties: HashMap<String, i32>,
}

impl MockAdaptor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            started: false,
            standby: false,
            screen_blanked: false,
            fail_start: false,
            properties: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn in_standby(&self) -> bool {
        self.standby
    }

    pub fn screen_blanked(&self) -> bool {
        self.screen_blanked
    }

    pub fn property(&self, name: &str) -> Option<i32> {
        self.properties.get(name).copied()
    }
}

impl DeviceAdaptor for MockAdaptor {
    fn configure(&mut self, properties: &HashMap<String, String>) {
        self.fail_start = properties.get("fail_start").map(String::as_str) == Some("1");
    }

    fn start_adaptor(&mut self) -> bool {
        if self.fail_start {
            return false;
        }
        self.started = true;
        true
    }

    fn stop_adaptor(&mut self) {
        self.started = false;
    }

    fn standby(&mut self) -> bool {
        self.standby = true;
        true
    }

    fn resume(&mut self) -> bool {
        self.standby = false;
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

pub fn make_mock_adaptor(id: &str) -> Arc<Mutex<dyn DeviceAdaptor>> {
    Arc::new(Mutex::new(MockAdaptor::new(id)))
}

pub struct MockChain {
    id: String,
    adaptor: Arc<Mutex<dyn DeviceAdaptor>>,
}

impl ProcessingChain for MockChain {
    fn id(&self) -> &str {
        &self.id
    }

    fn running(&self) -> bool {
        lock(&self.adaptor)
            .as_any()
            .downcast_ref::<MockAdaptor>()
            .is_some_and(MockAdaptor::started)
    }
}

pub fn make_mock_chain(
    id: &str,
    services: &mut ChainServices<'_>,
) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError> {
    let adaptor = services.request_adaptor("mockadaptor")?;
    Ok(Arc::new(Mutex::new(MockChain {
        id: id.to_string(),
        adaptor,
    })))
}

pub struct MockSensor {
    id: String,
    valid: bool,
    parameters: HashMap<String, String>,
    started: HashSet<SessionId>,
    intervals: HashMap<SessionId, u32>,
    data_rates: HashMap<SessionId, f64>,
    standby_overrides: HashSet<SessionId>,
    data_ranges: HashMap<SessionId, DataRange>,
    chain: Arc<Mutex<dyn ProcessingChain>>,
    adaptor: Arc<Mutex<dyn DeviceAdaptor>>,
}

impl MockSensor {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn chain_running(&self) -> bool {
        lock(&self.chain).running()
    }

    pub fn adaptor_started(&self) -> bool {
        lock(&self.adaptor)
            .as_any()
            .downcast_ref::<MockAdaptor>()
            .is_some_and(MockAdaptor::started)
    }
}

impl SensorChannel for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn start(&mut self, session: SessionId) -> bool {
        self.started.insert(session)
    }

    fn stop(&mut self, session: SessionId) -> bool {
        self.started.remove(&session)
    }

    fn running(&self) -> bool {
        !self.started.is_empty()
    }

    fn set_interval(&mut self, session: SessionId, interval_ms: u32) -> bool {
        self.intervals.insert(session, interval_ms);
        true
    }

    fn remove_interval_request(&mut self, session: SessionId) {
        self.intervals.remove(&session);
    }

    fn set_data_rate(&mut self, session: SessionId, rate_hz: f64) -> bool {
        self.data_rates.insert(session, rate_hz);
        true
    }

    fn set_standby_override(&mut self, session: SessionId, value: bool) -> bool {
        if value {
            self.standby_overrides.insert(session);
        } else {
            self.standby_overrides.remove(&session);
        }
        true
    }

    fn request_data_range(&mut self, session: SessionId, range: DataRange) {
        self.data_ranges.insert(session, range);
    }

    fn remove_data_range_request(&mut self, session: SessionId) {
        self.data_ranges.remove(&session);
    }

    fn reset(&mut self) {
        self.started.clear();
        self.intervals.clear();
        self.data_rates.clear();
        self.standby_overrides.clear();
        self.data_ranges.clear();
    }
}

pub fn make_mock_sensor(
    id: &str,
    services: &mut SensorServices<'_>,
) -> Result<Box<dyn SensorChannel>, ManagerError> {
    let chain = services.request_chain("mockchain")?;
    let adaptor = services.request_adaptor("mockadaptor")?;
    let parameters = ident::parse_parameters(id);
    let valid = parameters.get("valid").map(String::as_str) != Some("false");
    Ok(Box::new(MockSensor {
        id: id.to_string(),
        valid,
        parameters,
        started: HashSet::new(),
        intervals: HashMap::new(),
        data_rates: HashMap::new(),
        standby_overrides: HashSet::new(),
        data_ranges: HashMap::new(),
        chain,
        adaptor,
    }))
}

pub struct MockFilter;

impl SampleFilter for MockFilter {
    fn name(&self) -> &str {
        "mockfilter"
    }

    fn process(&mut self, _payload: &mut Vec<u8>) {}
}

pub fn make_mock_filter() -> Box<dyn SampleFilter> {
    Box::new(MockFilter)
}
