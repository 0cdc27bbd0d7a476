//! Remote-object naming transport.
//!
//! The daemon publishes itself and each live sensor under an object path on
//! a naming transport. The transport itself is an external collaborator;
//! this module carries the trait the manager programs against and a local
//! in-process implementation used by the daemon binary and the tests.

use std::collections::HashSet;

use tracing::debug;

/// Object path the manager itself is registered under.
pub const MANAGER_OBJECT_PATH: &str = "/SensorManager";

/// Service name published once the manager object is registered.
pub const SERVICE_NAME: &str = "org.sensord.SensorManager";

/// Builds the object path a sensor is registered under.
pub fn sensor_object_path(id: &str) -> String {
    format!("{MANAGER_OBJECT_PATH}/{id}")
}

/// Name registration on the remote-object transport.
pub trait Transport: Send {
    /// False when the underlying bus is unreachable.
    fn is_connected(&self) -> bool;

    /// Claims an object path. `Err` carries the transport's message.
    fn register_object(&mut self, path: &str) -> Result<(), String>;

    fn unregister_object(&mut self, path: &str);

    /// Claims the service name.
    fn register_service(&mut self, name: &str) -> Result<(), String>;
}

/// In-process transport: tracks claimed names, refuses duplicates.
#[derive(Debug, Default)]
pub struct LocalTransport {
    objects: HashSet<String>,
    services: HashSet<String>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_object(&self, path: &str) -> bool {
        self.objects.contains(path)
    }
}

impl Transport for LocalTransport {
    fn is_connected(&self) -> bool {
        true
    }

    fn register_object(&mut self, path: &str) -> Result<(), String> {
        if !self.objects.insert(path.to_string()) {
            return Err(format!("object path '{path}' already registered"));
        }
        debug!(path, "object registered");
        Ok(())
    }

    fn unregister_object(&mut self, path: &str) {
        self.objects.remove(path);
        debug!(path, "object unregistered");
    }

    fn register_service(&mut self, name: &str) -> Result<(), String> {
        if !self.services.insert(name.to_string()) {
            return Err(format!("service name '{name}' already registered"));
        }
        Ok(())
    }
}
