//! Capability traits for the sensor, chain, and adaptor families.
//!
//! Concrete variants are supplied by plugins at load time and stored behind
//! their factory functions in the registry. Sensors compose chains and
//! adaptors; chains compose adaptors; adaptors are leaves that speak to the
//! hardware. Ownership is acyclic: the registry slots own the instances,
//! sensors and chains hold shared handles to their dependencies, and nothing
//! points back up.

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

use crate::session::SessionId;

/// Requested measurement range for a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRange {
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

/// A user-visible logical sensor (e.g. magnetometer).
///
/// One instance serves every session bound to its registry entry; the
/// per-session operations carry the session identifier so the instance can
/// keep per-session request state (interval, data range, standby override)
/// and resolve the effective values itself.
pub trait SensorChannel: Send {
    /// The full identifier the sensor was constructed with, parameters
    /// included.
    fn id(&self) -> &str;

    /// False when construction left the sensor unusable; invalid sensors are
    /// discarded by the manager instead of entering the registry.
    fn is_valid(&self) -> bool;

    /// Starts sample delivery for a session. Returns false when the session
    /// was already started or the hardware refused.
    fn start(&mut self, session: SessionId) -> bool;

    /// Stops sample delivery for a session.
    fn stop(&mut self, session: SessionId) -> bool;

    /// True while any session is started.
    fn running(&self) -> bool;

    fn set_interval(&mut self, session: SessionId, interval_ms: u32) -> bool;

    fn remove_interval_request(&mut self, session: SessionId);

    fn set_data_rate(&mut self, session: SessionId, rate_hz: f64) -> bool;

    fn set_standby_override(&mut self, session: SessionId, value: bool) -> bool;

    fn request_data_range(&mut self, session: SessionId, range: DataRange);

    fn remove_data_range_request(&mut self, session: SessionId);

    /// Drops accumulated state and returns the sensor to its post-construction
    /// defaults.
    fn reset(&mut self);
}

/// A reusable processing pipeline shared across sensors.
pub trait ProcessingChain: Send {
    fn id(&self) -> &str;

    fn running(&self) -> bool;
}

/// The component that speaks to one hardware device and emits raw samples.
pub trait DeviceAdaptor: Send {
    /// Applies the static per-registration property bag. Called once, between
    /// construction and [`DeviceAdaptor::start_adaptor`].
    fn configure(&mut self, properties: &std::collections::HashMap<String, String>) {
        let _ = properties;
    }

    /// Brings the hardware up. Returning false leaves the registry slot empty.
    fn start_adaptor(&mut self) -> bool;

    /// Brings the hardware down. Called when the last reference is released.
    fn stop_adaptor(&mut self);

    /// Display-off power state; the adaptor may keep running for sessions
    /// holding a standby override.
    fn standby(&mut self) -> bool;

    /// Leaves the standby state after display-on.
    fn resume(&mut self) -> bool;

    fn set_screen_blanked(&mut self, blanked: bool);

    /// Applies the effective value of an aggregated session property request.
    fn set_property(&mut self, name: &str, value: i32);

    /// Concrete-type access for callers that need adaptor-specific state.
    fn as_any(&self) -> &dyn Any;
}

/// A single processing step instantiable by name from the filter table.
pub trait SampleFilter: Send {
    fn name(&self) -> &str;

    fn process(&mut self, payload: &mut Vec<u8>);
}

/// Locks a shared instance handle, recovering the guard if a holder panicked
/// while locking.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
