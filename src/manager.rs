//! The sensor manager: object registry, session arbitration, and the glue
//! between sample producers and the per-session sockets.
//!
//! One manager value is owned by the control-context task (see
//! [`crate::daemon`]); every registry mutation happens there. Sample
//! producers on worker threads only ever touch the cross-thread pipe.
//!
//! Arbitration rule: per sensor, at most one controlling session plus any
//! number of listeners. The sensor instance exists exactly while at least
//! one session of either kind is bound; chains and adaptors ride the
//! sensors' lifetimes through their refcounts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::channel::{lock, DeviceAdaptor, ProcessingChain, SampleFilter, SensorChannel};
use crate::error::{ErrorCode, ManagerError};
use crate::ident;
use crate::loader::PluginRegistry;
use crate::pipe::{SampleRecord, SampleSink};
use crate::properties::PropertyHandler;
use crate::registry::{
    AdaptorStore, ChainStore, FilterFactory, SensorFactory, SensorServices,
};
use crate::session::{SessionId, SessionIdAllocator};
use crate::socket::SessionSocket;
use crate::transport::{sensor_object_path, Transport, MANAGER_OBJECT_PATH, SERVICE_NAME};

/// Asynchronous notifications emitted by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerSignal {
    /// A manager-level operation failed with this code.
    Error(ErrorCode),
    /// Background calibration must stop (display off or power-save mode).
    StopCalibration,
    /// Background calibration may resume.
    ResumeCalibration,
    /// The display turned on.
    DisplayOn,
}

/// Observable state of one sensor registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorStatus {
    pub type_tag: String,
    pub present: bool,
    pub running: bool,
    pub controlling_session: Option<SessionId>,
    pub listen_sessions: Vec<SessionId>,
}

enum SessionRole {
    Control,
    Listen,
}

struct SensorInstanceEntry {
    type_tag: String,
    instance: Option<Box<dyn SensorChannel>>,
    controlling_session: Option<SessionId>,
    listen_sessions: Vec<SessionId>,
    chain_deps: Vec<String>,
    adaptor_deps: Vec<String>,
}

/// The manager façade composing the registry, arbiter, stores, property
/// handler, reaper entry point, and power hooks.
pub struct SensorManager {
    sensors: HashMap<String, SensorInstanceEntry>,
    sensor_factories: HashMap<String, SensorFactory>,
    filter_factories: HashMap<String, FilterFactory>,
    chains: ChainStore,
    adaptors: AdaptorStore,
    properties: PropertyHandler,
    sink: SampleSink,
    socket: Arc<dyn SessionSocket>,
    transport: Box<dyn Transport>,
    plugins: PluginRegistry,
    signals: broadcast::Sender<ManagerSignal>,
    sessions: SessionIdAllocator,
    last_error: (ErrorCode, String),
    display_on: bool,
    psm: bool,
}

impl SensorManager {
    pub fn new(
        socket: Arc<dyn SessionSocket>,
        transport: Box<dyn Transport>,
        sink: SampleSink,
        plugins: PluginRegistry,
    ) -> Self {
        let (signals, _) = broadcast::channel(32);
        Self {
            sensors: HashMap::new(),
            sensor_factories: HashMap::new(),
            filter_factories: HashMap::new(),
            chains: ChainStore::default(),
            adaptors: AdaptorStore::default(),
            properties: PropertyHandler::new(),
            sink,
            socket,
            transport,
            plugins,
            signals,
            sessions: SessionIdAllocator::new(),
            last_error: (ErrorCode::None, String::new()),
            display_on: true,
            psm: false,
        }
    }

    // =========================================================================
    // Transport and plugin surface
    // =========================================================================

    /// Publishes the manager object and service name on the transport.
    pub fn register_service(&mut self) -> Result<(), ManagerError> {
        self.clear_error();
        let result = self.register_service_inner();
        if let Err(err) = &result {
            self.set_error(err);
        }
        result
    }

    fn register_service_inner(&mut self) -> Result<(), ManagerError> {
        if !self.transport.is_connected() {
            return Err(ManagerError::NotConnected(
                "naming transport is not connected".to_string(),
            ));
        }
        self.transport
            .register_object(MANAGER_OBJECT_PATH)
            .map_err(ManagerError::CanNotRegisterObject)?;
        self.transport
            .register_service(SERVICE_NAME)
            .map_err(ManagerError::CanNotRegisterService)?;
        Ok(())
    }

    /// Runs the named plugin's registration, installing its factories and
    /// registry slots. Loading a plugin twice is a no-op.
    pub fn load_plugin(&mut self, name: &str) -> Result<(), ManagerError> {
        self.clear_error();
        if self.plugins.is_loaded(name) {
            return Ok(());
        }
        let Some(registration) = self.plugins.lookup(name) else {
            let err =
                ManagerError::CanNotRegisterObject(format!("plugin '{name}' is not available"));
            self.set_error(&err);
            return Err(err);
        };
        registration(self);
        self.plugins.mark_loaded(name);
        info!(plugin = name, "plugin loaded");
        Ok(())
    }

    // =========================================================================
    // Registration (called by plugin registration functions)
    // =========================================================================

    pub fn register_sensor_slot(&mut self, id: &str, type_tag: &str) {
        debug_assert!(!ident::has_parameters(id), "slot ids carry no parameters");
        self.sensors
            .entry(id.to_string())
            .or_insert_with(|| SensorInstanceEntry {
                type_tag: type_tag.to_string(),
                instance: None,
                controlling_session: None,
                listen_sessions: Vec::new(),
                chain_deps: Vec::new(),
                adaptor_deps: Vec::new(),
            });
    }

    pub fn register_sensor_factory(&mut self, type_tag: &str, factory: SensorFactory) {
        self.sensor_factories.insert(type_tag.to_string(), factory);
    }

    pub fn register_chain_slot(&mut self, id: &str, type_tag: &str) {
        self.chains.register_slot(id, type_tag);
    }

    pub fn register_chain_factory(&mut self, type_tag: &str, factory: crate::registry::ChainFactory) {
        self.chains.register_factory(type_tag, factory);
    }

    pub fn register_adaptor_slot(
        &mut self,
        id: &str,
        type_tag: &str,
        properties: HashMap<String, String>,
    ) {
        self.adaptors.register_slot(id, type_tag, properties);
    }

    pub fn register_adaptor_factory(
        &mut self,
        type_tag: &str,
        factory: crate::registry::AdaptorFactory,
    ) {
        self.adaptors.register_factory(type_tag, factory);
    }

    pub fn register_filter_factory(&mut self, name: &str, factory: FilterFactory) {
        self.filter_factories.insert(name.to_string(), factory);
    }

    /// Instantiates a named filter, or `None` with a warning when the name is
    /// unknown.
    pub fn instantiate_filter(&self, name: &str) -> Option<Box<dyn SampleFilter>> {
        match self.filter_factories.get(name) {
            Some(factory) => Some(factory()),
            None => {
                warn!(filter = name, "filter not found");
                None
            }
        }
    }

    // =========================================================================
    // Session arbiter
    // =========================================================================

    /// Binds a fresh session as the sensor's single controller, constructing
    /// the sensor when no session holds it yet.
    pub fn request_control(&mut self, id: &str) -> Result<SessionId, ManagerError> {
        self.clear_error();
        match self.request_control_inner(id) {
            Ok(session) => Ok(session),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    fn request_control_inner(&mut self, id: &str) -> Result<SessionId, ManagerError> {
        let clean = ident::clean_id(id);
        let has_listeners = {
            let entry = self.sensors.get(&clean).ok_or_else(|| {
                ManagerError::IdNotRegistered(format!(
                    "requested control sensor id '{clean}' not registered"
                ))
            })?;
            if entry.controlling_session.is_some() {
                return Err(ManagerError::AlreadyUnderControl);
            }
            !entry.listen_sessions.is_empty()
        };

        let session = self.sessions.next_id();
        if has_listeners {
            // The sensor already exists for its listeners; just bind control.
            if let Some(entry) = self.sensors.get_mut(&clean) {
                entry.controlling_session = Some(session);
            }
        } else {
            self.add_sensor(id, &clean, session, SessionRole::Control)?;
        }
        debug!(id, session, "control session bound");
        Ok(session)
    }

    /// Binds a fresh session as a listener, constructing the sensor when no
    /// session holds it yet.
    pub fn request_listen(&mut self, id: &str) -> Result<SessionId, ManagerError> {
        self.clear_error();
        match self.request_listen_inner(id) {
            Ok(session) => Ok(session),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    fn request_listen_inner(&mut self, id: &str) -> Result<SessionId, ManagerError> {
        let clean = ident::clean_id(id);
        let present = {
            let entry = self.sensors.get(&clean).ok_or_else(|| {
                ManagerError::IdNotRegistered(format!(
                    "requested listen sensor id '{clean}' not registered"
                ))
            })?;
            entry.controlling_session.is_some() || !entry.listen_sessions.is_empty()
        };

        let session = self.sessions.next_id();
        if present {
            if let Some(entry) = self.sensors.get_mut(&clean) {
                entry.listen_sessions.push(session);
            }
        } else {
            self.add_sensor(id, &clean, session, SessionRole::Listen)?;
        }
        debug!(id, session, "listen session bound");
        Ok(session)
    }

    /// Detaches `session` from the sensor, tearing the sensor down when it
    /// was the last holder. The session's socket is dropped even when the
    /// session turns out to be bogus.
    pub fn release(&mut self, id: &str, session: SessionId) -> Result<(), ManagerError> {
        self.clear_error();
        let result = self.release_inner(id, session);
        self.socket.remove_session(session);
        if let Err(err) = &result {
            self.set_error(err);
        }
        result
    }

    fn release_inner(&mut self, id: &str, session: SessionId) -> Result<(), ManagerError> {
        debug_assert!(
            !ident::has_parameters(id),
            "no parameter passing in release"
        );

        if !self.sensors.contains_key(id) {
            return Err(ManagerError::IdNotRegistered(format!(
                "requested sensor id '{id}' not registered"
            )));
        }

        // The departing session's requests are cleared whether or not it
        // turns out to hold this sensor.
        let touched = self.properties.clear_requests(session);
        if let Some(entry) = self.sensors.get_mut(id) {
            if let Some(sensor) = entry.instance.as_mut() {
                sensor.set_standby_override(session, false);
                sensor.remove_interval_request(session);
                sensor.remove_data_range_request(session);
            }
        }
        for (property, adaptor) in touched {
            self.apply_property(&property, &adaptor);
        }

        enum Outcome {
            Kept,
            Teardown,
            Failed(ManagerError),
        }

        let outcome = match self.sensors.get_mut(id) {
            None => Outcome::Failed(ManagerError::IdNotRegistered(format!(
                "requested sensor id '{id}' not registered"
            ))),
            Some(entry) => {
                if entry.controlling_session.is_none() && entry.listen_sessions.is_empty() {
                    Outcome::Failed(ManagerError::NotInstantiated(
                        "sensor has not been instantiated, no session to release".to_string(),
                    ))
                } else if entry.controlling_session == Some(session) {
                    entry.controlling_session = None;
                    if entry.listen_sessions.is_empty() {
                        Outcome::Teardown
                    } else {
                        // Listeners keep the sensor alive.
                        Outcome::Kept
                    }
                } else if let Some(pos) =
                    entry.listen_sessions.iter().position(|s| *s == session)
                {
                    entry.listen_sessions.remove(pos);
                    if entry.listen_sessions.is_empty() && entry.controlling_session.is_none() {
                        Outcome::Teardown
                    } else {
                        Outcome::Kept
                    }
                } else {
                    Outcome::Failed(ManagerError::NotInstantiated(
                        "invalid session id, no session to release".to_string(),
                    ))
                }
            }
        };

        match outcome {
            Outcome::Kept => Ok(()),
            Outcome::Teardown => {
                self.remove_sensor(id);
                Ok(())
            }
            Outcome::Failed(err) => Err(err),
        }
    }

    /// Dispatches a per-sensor control-surface call; the transport layer
    /// routes remote method invocations on a sensor object through here.
    /// `None` when the sensor has no live instance.
    pub fn with_sensor<R>(
        &mut self,
        id: &str,
        operate: impl FnOnce(&mut dyn SensorChannel) -> R,
    ) -> Option<R> {
        let clean = ident::clean_id(id);
        match self.sensors.get_mut(&clean) {
            Some(entry) => match entry.instance.as_deref_mut() {
                Some(channel) => Some(operate(channel)),
                None => None,
            },
            None => None,
        }
    }

    fn add_sensor(
        &mut self,
        full_id: &str,
        clean: &str,
        session: SessionId,
        role: SessionRole,
    ) -> Result<(), ManagerError> {
        let type_tag = match self.sensors.get(clean) {
            Some(entry) => entry.type_tag.clone(),
            None => {
                return Err(ManagerError::IdNotRegistered(format!(
                    "instance for sensor type '{clean}' not registered"
                )))
            }
        };
        let factory = match self.sensor_factories.get(&type_tag) {
            Some(factory) => *factory,
            None => {
                return Err(ManagerError::FactoryNotRegistered(format!(
                    "factory for sensor type '{type_tag}' not registered"
                )))
            }
        };

        debug!(id = full_id, type_tag = %type_tag, "constructing sensor");
        let mut services = SensorServices::new(&mut self.chains, &mut self.adaptors, &self.sink);
        let sensor = match factory(full_id, &mut services) {
            Ok(sensor) => sensor,
            Err(err) => {
                services.rollback();
                return Err(err);
            }
        };
        if !sensor.is_valid() {
            services.rollback();
            return Err(ManagerError::NotInstantiated(format!(
                "sensor '{full_id}' failed validation after construction"
            )));
        }
        let (chain_deps, adaptor_deps) = services.into_acquired();

        if let Err(message) = self.transport.register_object(&sensor_object_path(clean)) {
            self.release_deps(&chain_deps, &adaptor_deps);
            return Err(ManagerError::CanNotRegisterObject(message));
        }

        if let Some(entry) = self.sensors.get_mut(clean) {
            debug_assert!(entry.instance.is_none());
            debug_assert!(
                entry.controlling_session.is_none() && entry.listen_sessions.is_empty()
            );
            entry.instance = Some(sensor);
            entry.chain_deps = chain_deps;
            entry.adaptor_deps = adaptor_deps;
            match role {
                SessionRole::Control => entry.controlling_session = Some(session),
                SessionRole::Listen => entry.listen_sessions.push(session),
            }
        }
        Ok(())
    }

    fn remove_sensor(&mut self, id: &str) {
        let (chain_deps, adaptor_deps) = {
            let Some(entry) = self.sensors.get_mut(id) else {
                return;
            };
            debug_assert!(
                entry.controlling_session.is_none() && entry.listen_sessions.is_empty()
            );
            self.transport.unregister_object(&sensor_object_path(id));
            // Drop the instance before its dependencies: the sensor's shared
            // handles must die before the stores destroy the leaves.
            entry.instance = None;
            (
                std::mem::take(&mut entry.chain_deps),
                std::mem::take(&mut entry.adaptor_deps),
            )
        };
        self.release_deps(&chain_deps, &adaptor_deps);
        debug!(id, "sensor instance destroyed");
    }

    fn release_deps(&mut self, chain_deps: &[String], adaptor_deps: &[String]) {
        for id in chain_deps.iter().rev() {
            let _ = self.chains.release(id, &mut self.adaptors);
        }
        for id in adaptor_deps.iter().rev() {
            let _ = self.adaptors.release(id);
        }
    }

    // =========================================================================
    // Chain and adaptor sharing
    // =========================================================================

    pub fn request_chain(
        &mut self,
        id: &str,
    ) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError> {
        self.clear_error();
        match self.chains.request(id, &mut self.adaptors, &self.sink) {
            Ok(chain) => Ok(chain),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    pub fn release_chain(&mut self, id: &str) -> Result<(), ManagerError> {
        self.clear_error();
        match self.chains.release(id, &mut self.adaptors) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    pub fn request_adaptor(
        &mut self,
        id: &str,
    ) -> Result<Arc<Mutex<dyn DeviceAdaptor>>, ManagerError> {
        self.clear_error();
        match self.adaptors.request(id) {
            Ok(adaptor) => Ok(adaptor),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    pub fn release_adaptor(&mut self, id: &str) -> Result<(), ManagerError> {
        self.clear_error();
        match self.adaptors.release(id) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_error(&err);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Sample forwarding
    // =========================================================================

    /// Producer handle for worker threads.
    pub fn sample_sink(&self) -> SampleSink {
        self.sink.clone()
    }

    /// Enqueues one sample for `session` through the cross-thread pipe.
    /// Must be called from a producer thread, never the control context.
    pub fn write(&self, session: SessionId, payload: &[u8]) -> bool {
        self.sink.write(session, payload)
    }

    /// Hands a dequeued record to the session's socket. The buffer dies here
    /// whatever the socket write reports.
    pub fn writeout(&mut self, record: SampleRecord) {
        if !self.socket.write(record.session_id, &record.payload) {
            warn!(
                session = record.session_id,
                len = record.payload.len(),
                "failed to write sample to session socket"
            );
        }
    }

    // =========================================================================
    // Property handler
    // =========================================================================

    /// Records a session's integer property request for `(property, adaptor)`
    /// and reapplies the effective value.
    pub fn set_property_request(
        &mut self,
        session: SessionId,
        property: &str,
        adaptor: &str,
        value: i32,
    ) {
        self.properties.set_request(session, property, adaptor, value);
        self.apply_property(property, adaptor);
    }

    fn apply_property(&mut self, property: &str, adaptor: &str) {
        let effective = self.properties.highest_value(property, adaptor).unwrap_or(0);
        match self.adaptors.instance(adaptor) {
            Some(instance) => lock(&instance).set_property(property, effective),
            None => warn!(
                property,
                adaptor, "setting property for adaptor with no instance"
            ),
        }
    }

    // =========================================================================
    // Liveness reaper
    // =========================================================================

    /// Tears down whatever the lost session held. Only the first matching
    /// entry is processed; a session is bound to at most one sensor.
    pub fn lost_client(&mut self, session: SessionId) {
        let key = self
            .sensors
            .iter()
            .find(|(_, entry)| {
                entry.controlling_session == Some(session)
                    || entry.listen_sessions.contains(&session)
            })
            .map(|(key, _)| key.clone());

        let Some(key) = key else {
            debug!(session, "lost session held no sensor");
            return;
        };

        info!(session, sensor = %key, "lost session, releasing");
        if let Some(entry) = self.sensors.get_mut(&key) {
            if let Some(sensor) = entry.instance.as_mut() {
                sensor.stop(session);
            }
        }
        if let Err(err) = self.release(&key, session) {
            warn!(session, sensor = %key, %err, "cleanup release failed");
        }
    }

    // =========================================================================
    // Power and display hooks
    // =========================================================================

    /// Routes a display-state transition: calibration gating plus
    /// standby/resume on every present adaptor.
    pub fn display_state_changed(&mut self, display_on: bool) {
        debug!(display_on, "display state changed");
        self.display_on = display_on;

        if display_on {
            let _ = self.signals.send(ManagerSignal::DisplayOn);
            if !self.psm {
                let _ = self.signals.send(ManagerSignal::ResumeCalibration);
            }
        } else {
            let _ = self.signals.send(ManagerSignal::StopCalibration);
        }

        self.adaptors.for_each_present(|adaptor| {
            if display_on {
                adaptor.set_screen_blanked(false);
                adaptor.resume();
            } else {
                adaptor.set_screen_blanked(true);
                adaptor.standby();
            }
        });
    }

    /// Routes a power-save-mode transition; gates calibration only.
    pub fn psm_state_changed(&mut self, psm: bool) {
        debug!(psm, "power save mode changed");
        self.psm = psm;
        if psm {
            let _ = self.signals.send(ManagerSignal::StopCalibration);
        } else if self.display_on {
            let _ = self.signals.send(ManagerSignal::ResumeCalibration);
        }
    }

    pub fn display_state(&self) -> bool {
        self.display_on
    }

    pub fn psm_state(&self) -> bool {
        self.psm
    }

    // =========================================================================
    // Error channel
    // =========================================================================

    /// Subscribes to the manager's asynchronous signal stream.
    pub fn signals(&self) -> broadcast::Receiver<ManagerSignal> {
        self.signals.subscribe()
    }

    pub fn error_code(&self) -> ErrorCode {
        self.last_error.0
    }

    pub fn error_string(&self) -> &str {
        &self.last_error.1
    }

    fn clear_error(&mut self) {
        self.last_error = (ErrorCode::None, String::new());
    }

    fn set_error(&mut self, err: &ManagerError) {
        warn!(code = ?err.code(), "sensor manager error: {err}");
        self.last_error = (err.code(), err.to_string());
        let _ = self.signals.send(ManagerSignal::Error(err.code()));
    }

    // =========================================================================
    // Status and introspection
    // =========================================================================

    /// Human-readable registry dump for operators.
    pub fn print_status(&self) -> Vec<String> {
        let mut output = Vec::new();

        output.push("Adaptors:".to_string());
        for (id, type_tag, refcount) in self.adaptors.status_rows() {
            output.push(format!("  {type_tag} ({id}) [{refcount} listener(s)]"));
        }

        output.push("Chains:".to_string());
        for (id, type_tag, refcount, running) in self.chains.status_rows() {
            output.push(format!(
                "  {type_tag} ({id}) [{refcount} listener(s)]. {}",
                if running { "Running" } else { "Stopped" }
            ));
        }

        output.push("Logical sensors:".to_string());
        let mut keys: Vec<_> = self.sensors.keys().collect();
        keys.sort();
        for key in keys {
            let entry = &self.sensors[key];
            let mut line = format!("  {} [", entry.type_tag);
            match entry.controlling_session {
                Some(session) => {
                    line.push_str(&format!("Control (PID: {}) + ", self.session_pid(session)));
                }
                None => line.push_str("No control, "),
            }
            if entry.listen_sessions.is_empty() {
                line.push_str("no listen sessions]");
            } else {
                let pids: Vec<String> = entry
                    .listen_sessions
                    .iter()
                    .map(|session| self.session_pid(*session))
                    .collect();
                line.push_str(&format!(
                    "{} listen session(s), PID(s): {}]",
                    entry.listen_sessions.len(),
                    pids.join(", ")
                ));
            }
            let running = entry
                .instance
                .as_ref()
                .is_some_and(|sensor| sensor.running());
            line.push_str(if running { ". Running" } else { ". Stopped" });
            output.push(line);
        }

        output
    }

    fn session_pid(&self, session: SessionId) -> String {
        match self.socket.peer_pid(session) {
            Some(pid) => pid.to_string(),
            None => "n/a".to_string(),
        }
    }

    pub fn sensor_status(&self, id: &str) -> Option<SensorStatus> {
        self.sensors.get(id).map(|entry| SensorStatus {
            type_tag: entry.type_tag.clone(),
            present: entry.instance.is_some(),
            running: entry
                .instance
                .as_ref()
                .is_some_and(|sensor| sensor.running()),
            controlling_session: entry.controlling_session,
            listen_sessions: entry.listen_sessions.clone(),
        })
    }

    pub fn chain_refcount(&self, id: &str) -> Option<u32> {
        self.chains.refcount(id)
    }

    pub fn adaptor_refcount(&self, id: &str) -> Option<u32> {
        self.adaptors.refcount(id)
    }

    /// Live chain instance, without touching the refcount.
    pub fn chain_instance(&self, id: &str) -> Option<Arc<Mutex<dyn ProcessingChain>>> {
        self.chains.instance(id)
    }

    /// Live adaptor instance, without touching the refcount.
    pub fn adaptor_instance(&self, id: &str) -> Option<Arc<Mutex<dyn DeviceAdaptor>>> {
        self.adaptors.instance(id)
    }
}

impl Drop for SensorManager {
    fn drop(&mut self) {
        for (id, entry) in &self.sensors {
            if entry.instance.is_some() {
                error!(sensor = %id, "sensor not released at shutdown");
            }
        }
        for id in self.chains.leaked() {
            error!(chain = %id, "chain not released at shutdown");
        }
        for id in self.adaptors.leaked() {
            error!(adaptor = %id, "adaptor not released at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{self, SampleReceiver};
    use crate::plugins::mock::MockAdaptor;
    use crate::transport::LocalTransport;

    #[derive(Default)]
    struct RecordingSocket {
        written: Mutex<Vec<(SessionId, Vec<u8>)>>,
        removed: Mutex<Vec<SessionId>>,
    }

    impl SessionSocket for RecordingSocket {
        fn write(&self, session: SessionId, payload: &[u8]) -> bool {
            lock(&self.written).push((session, payload.to_vec()));
            true
        }

        fn remove_session(&self, session: SessionId) {
            lock(&self.removed).push(session);
        }

        fn peer_pid(&self, _session: SessionId) -> Option<i32> {
            None
        }
    }

    fn mock_manager() -> (SensorManager, Arc<RecordingSocket>, SampleReceiver) {
        let (sink, rx) = pipe::channel(16);
        let socket = Arc::new(RecordingSocket::default());
        let mut manager = SensorManager::new(
            Arc::clone(&socket) as Arc<dyn SessionSocket>,
            Box::new(LocalTransport::new()),
            sink,
            PluginRegistry::with_builtin_plugins(),
        );
        manager.load_plugin("mocksensor").expect("mock plugin");
        (manager, socket, rx)
    }

    #[test]
    fn listeners_then_controller_share_one_instance() {
        let (mut manager, _socket, _rx) = mock_manager();

        let first = manager.request_listen("mocksensor").expect("listen");
        let second = manager.request_listen("mocksensor").expect("listen");
        let controller = manager.request_control("mocksensor").expect("control");
        assert_eq!((first, second, controller), (1, 2, 3));

        let status = manager.sensor_status("mocksensor").expect("status");
        assert!(status.present);
        assert_eq!(status.controlling_session, Some(3));
        assert_eq!(status.listen_sessions, vec![1, 2]);

        // Controller leaves; listeners keep the sensor alive.
        manager.release("mocksensor", 3).expect("release");
        let status = manager.sensor_status("mocksensor").expect("status");
        assert!(status.present);
        assert_eq!(status.controlling_session, None);

        manager.release("mocksensor", 1).expect("release");
        manager.release("mocksensor", 2).expect("release");
        let status = manager.sensor_status("mocksensor").expect("status");
        assert!(!status.present);
        assert_eq!(manager.chain_refcount("mockchain"), Some(0));
        assert_eq!(manager.adaptor_refcount("mockadaptor"), Some(0));
    }

    #[test]
    fn second_controller_is_refused() {
        let (mut manager, _socket, _rx) = mock_manager();
        manager.request_control("mocksensor").expect("control");

        let err = manager
            .request_control("mocksensor")
            .expect_err("second controller");
        assert_eq!(err, ManagerError::AlreadyUnderControl);
        assert_eq!(manager.error_code(), ErrorCode::AlreadyUnderControl);

        // No state change: one controller, no listeners, still present.
        let status = manager.sensor_status("mocksensor").expect("status");
        assert_eq!(status.controlling_session, Some(1));
        assert!(status.listen_sessions.is_empty());
    }

    #[test]
    fn unknown_sensor_is_reported() {
        let (mut manager, _socket, _rx) = mock_manager();
        let err = manager.request_listen("nosuchsensor").expect_err("listen");
        assert!(matches!(err, ManagerError::IdNotRegistered(_)));
        assert_eq!(manager.error_code(), ErrorCode::IdNotRegistered);
    }

    #[test]
    fn parameterised_id_looks_up_the_clean_slot() {
        let (mut manager, _socket, _rx) = mock_manager();
        let session = manager
            .request_listen("mocksensor;interval=50")
            .expect("listen");
        let status = manager.sensor_status("mocksensor").expect("status");
        assert!(status.present);
        assert_eq!(status.listen_sessions, vec![session]);

        manager.release("mocksensor", session).expect("release");
        assert!(!manager.sensor_status("mocksensor").expect("status").present);
    }

    #[test]
    fn invalid_sensor_construction_changes_nothing() {
        let (mut manager, _socket, _rx) = mock_manager();
        let err = manager
            .request_listen("mocksensor;valid=false")
            .expect_err("invalid sensor");
        assert!(matches!(err, ManagerError::NotInstantiated(_)));

        let status = manager.sensor_status("mocksensor").expect("status");
        assert!(!status.present);
        assert!(status.listen_sessions.is_empty());
        // The dependencies acquired during construction were rolled back.
        assert_eq!(manager.chain_refcount("mockchain"), Some(0));
        assert_eq!(manager.adaptor_refcount("mockadaptor"), Some(0));
    }

    #[test]
    fn release_with_bogus_session_fails_but_drops_the_socket() {
        let (mut manager, socket, _rx) = mock_manager();
        let session = manager.request_listen("mocksensor").expect("listen");

        let err = manager
            .release("mocksensor", session + 100)
            .expect_err("bogus session");
        assert!(matches!(err, ManagerError::NotInstantiated(_)));
        // Cleanup over strictness.
        assert_eq!(*lock(&socket.removed), vec![session + 100]);
        assert!(manager.sensor_status("mocksensor").expect("status").present);
    }

    #[test]
    fn release_without_instance_reports_not_instantiated() {
        let (mut manager, _socket, _rx) = mock_manager();
        let err = manager.release("mocksensor", 1).expect_err("no instance");
        assert!(matches!(err, ManagerError::NotInstantiated(_)));
    }

    #[test]
    fn lost_client_releases_the_first_matching_entry() {
        let (mut manager, socket, _rx) = mock_manager();
        let session = manager.request_listen("mocksensor").expect("listen");

        manager.lost_client(session);
        assert!(!manager.sensor_status("mocksensor").expect("status").present);
        assert_eq!(*lock(&socket.removed), vec![session]);

        // A session that holds nothing is ignored.
        manager.lost_client(9999);
    }

    #[test]
    fn display_off_blanks_and_suspends_present_adaptors() {
        let (mut manager, _socket, _rx) = mock_manager();
        let mut signals = manager.signals();
        let _session = manager.request_listen("mocksensor").expect("listen");

        manager.display_state_changed(false);
        assert!(!manager.display_state());
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::StopCalibration));

        let adaptor = manager.adaptor_instance("mockadaptor").expect("instance");
        {
            let guard = lock(&adaptor);
            let mock = guard.as_any().downcast_ref::<MockAdaptor>().expect("mock");
            assert!(mock.screen_blanked());
            assert!(mock.in_standby());
        }

        manager.display_state_changed(true);
        assert!(manager.display_state());
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::DisplayOn));
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::ResumeCalibration));
        {
            let guard = lock(&adaptor);
            let mock = guard.as_any().downcast_ref::<MockAdaptor>().expect("mock");
            assert!(!mock.screen_blanked());
            assert!(!mock.in_standby());
        }
    }

    #[test]
    fn power_save_mode_gates_calibration() {
        let (mut manager, _socket, _rx) = mock_manager();
        let mut signals = manager.signals();

        manager.psm_state_changed(true);
        assert!(manager.psm_state());
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::StopCalibration));

        // Display-on while in PSM must not resume calibration.
        manager.display_state_changed(true);
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::DisplayOn));
        assert!(signals.try_recv().is_err());

        manager.psm_state_changed(false);
        assert_eq!(signals.try_recv(), Ok(ManagerSignal::ResumeCalibration));
    }

    #[test]
    fn property_requests_resolve_to_the_maximum() {
        let (mut manager, _socket, _rx) = mock_manager();
        let first = manager.request_listen("mocksensor").expect("listen");
        let second = manager.request_listen("mocksensor").expect("listen");

        manager.set_property_request(first, "interval", "mockadaptor", 10);
        manager.set_property_request(second, "interval", "mockadaptor", 40);

        let adaptor = manager.adaptor_instance("mockadaptor").expect("instance");
        {
            let guard = lock(&adaptor);
            let mock = guard.as_any().downcast_ref::<MockAdaptor>().expect("mock");
            assert_eq!(mock.property("interval"), Some(40));
        }

        // Releasing the maximum holder recomputes the effective value.
        manager.release("mocksensor", second).expect("release");
        {
            let guard = lock(&adaptor);
            let mock = guard.as_any().downcast_ref::<MockAdaptor>().expect("mock");
            assert_eq!(mock.property("interval"), Some(10));
        }
    }

    #[test]
    fn writeout_forwards_to_the_session_socket() {
        let (mut manager, socket, mut rx) = mock_manager();
        let sink = manager.sample_sink();

        let producer = std::thread::spawn(move || {
            let payload: Vec<u8> = (0..128).collect();
            assert!(sink.write(5, &payload));
        });
        producer.join().expect("producer thread");

        let record = rx.blocking_recv().expect("record");
        manager.writeout(record);

        let written = lock(&socket.written);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, 5);
        assert_eq!(written[0].1, (0..128).collect::<Vec<u8>>());
    }

    #[test]
    fn errors_are_broadcast_on_the_signal_stream() {
        let (mut manager, _socket, _rx) = mock_manager();
        let mut signals = manager.signals();

        let _ = manager.request_listen("nosuchsensor");
        assert_eq!(
            signals.try_recv(),
            Ok(ManagerSignal::Error(ErrorCode::IdNotRegistered))
        );

        // The next successful operation clears the slot.
        manager.request_listen("mocksensor").expect("listen");
        assert_eq!(manager.error_code(), ErrorCode::None);
        assert!(manager.error_string().is_empty());
    }

    #[test]
    fn load_plugin_is_idempotent_and_rejects_unknown_names() {
        let (mut manager, _socket, _rx) = mock_manager();
        manager.load_plugin("mocksensor").expect("reload");

        let err = manager.load_plugin("warpdrive").expect_err("unknown");
        assert_eq!(err.code(), ErrorCode::CanNotRegisterObject);
    }

    #[test]
    fn status_dump_lists_all_three_registries() {
        let (mut manager, _socket, _rx) = mock_manager();
        let _session = manager.request_listen("mocksensor").expect("listen");

        let status = manager.print_status();
        let text = status.join("\n");
        assert!(text.contains("Adaptors:"));
        assert!(text.contains("mockadaptor"));
        assert!(text.contains("Chains:"));
        assert!(text.contains("mockchain"));
        assert!(text.contains("Logical sensors:"));
        assert!(text.contains("No control, 1 listen session(s)"));
    }

    #[test]
    fn register_service_publishes_object_and_service() {
        let (mut manager, _socket, _rx) = mock_manager();
        manager.register_service().expect("register");
        // Registering twice hits the duplicate object path.
        let err = manager.register_service().expect_err("duplicate");
        assert_eq!(err.code(), ErrorCode::CanNotRegisterObject);
    }
}
