//! Registry slots, factory tables, and the reference-counted stores for
//! chains and adaptors.
//!
//! Slots are created at plugin-registration time and never removed;
//! instances are created lazily on first request and destroyed when the last
//! holder releases them. Sensors and chains acquire their dependencies
//! through a construction-time service view which records every successful
//! acquisition, so a failed construction can roll back and a destroyed
//! instance can release exactly what it acquired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::channel::{lock, DeviceAdaptor, ProcessingChain, SensorChannel};
use crate::error::ManagerError;
use crate::pipe::SampleSink;

/// Constructs a logical sensor from its full (parameter-bearing) identifier.
pub type SensorFactory =
    fn(&str, &mut SensorServices<'_>) -> Result<Box<dyn SensorChannel>, ManagerError>;

/// Constructs a processing chain; may acquire adaptors through the services.
pub type ChainFactory =
    fn(&str, &mut ChainServices<'_>) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError>;

/// Constructs a device adaptor. The store configures and starts it.
pub type AdaptorFactory = fn(&str) -> Arc<Mutex<dyn DeviceAdaptor>>;

/// Constructs a named sample filter.
pub type FilterFactory = fn() -> Box<dyn crate::channel::SampleFilter>;

/// Registry slot for one processing chain identifier.
struct ChainInstanceEntry {
    type_tag: String,
    instance: Option<Arc<Mutex<dyn ProcessingChain>>>,
    refcount: u32,
    adaptor_deps: Vec<String>,
}

/// Registry slot for one device adaptor identifier.
struct AdaptorInstanceEntry {
    type_tag: String,
    instance: Option<Arc<Mutex<dyn DeviceAdaptor>>>,
    refcount: u32,
    property_map: HashMap<String, String>,
}

/// Reference-counted store of device adaptors.
#[derive(Default)]
pub struct AdaptorStore {
    factories: HashMap<String, AdaptorFactory>,
    entries: HashMap<String, AdaptorInstanceEntry>,
}

impl AdaptorStore {
    pub fn register_factory(&mut self, type_tag: &str, factory: AdaptorFactory) {
        self.factories.insert(type_tag.to_string(), factory);
    }

    /// Creates the registry slot for `id`, or updates its static property bag
    /// when the slot already exists.
    pub fn register_slot(
        &mut self,
        id: &str,
        type_tag: &str,
        properties: HashMap<String, String>,
    ) {
        debug_assert!(!id.contains(';'), "no parameter passing for adaptors");
        self.entries
            .entry(id.to_string())
            .and_modify(|entry| entry.property_map = properties.clone())
            .or_insert_with(|| AdaptorInstanceEntry {
                type_tag: type_tag.to_string(),
                instance: None,
                refcount: 0,
                property_map: properties,
            });
    }

    /// Acquires a shared reference, instantiating and starting the adaptor on
    /// first request. A failed start leaves the slot empty so a later request
    /// retries construction.
    pub fn request(&mut self, id: &str) -> Result<Arc<Mutex<dyn DeviceAdaptor>>, ManagerError> {
        debug_assert!(!id.contains(';'), "no parameter passing for adaptors");

        let entry = self.entries.get_mut(id).ok_or_else(|| {
            ManagerError::IdNotRegistered(format!("unknown adaptor id '{id}'"))
        })?;

        if let Some(adaptor) = &entry.instance {
            entry.refcount += 1;
            return Ok(Arc::clone(adaptor));
        }

        let factory = *self.factories.get(&entry.type_tag).ok_or_else(|| {
            ManagerError::FactoryNotRegistered(format!(
                "unknown adaptor type '{}'",
                entry.type_tag
            ))
        })?;

        debug!(id, type_tag = %entry.type_tag, "instantiating adaptor");
        let adaptor = factory(id);
        let started = {
            let mut guard = lock(&adaptor);
            guard.configure(&entry.property_map);
            guard.start_adaptor()
        };
        if !started {
            return Err(ManagerError::AdaptorNotStarted(format!(
                "adaptor '{id}' can not be started"
            )));
        }

        entry.instance = Some(Arc::clone(&adaptor));
        entry.refcount = 1;
        Ok(adaptor)
    }

    /// Drops one reference; the last release stops and destroys the instance.
    pub fn release(&mut self, id: &str) -> Result<(), ManagerError> {
        debug_assert!(!id.contains(';'), "no parameter passing for adaptors");

        let entry = self.entries.get_mut(id).ok_or_else(|| {
            ManagerError::IdNotRegistered(format!("unknown adaptor id '{id}'"))
        })?;

        let Some(adaptor) = &entry.instance else {
            return Err(ManagerError::NotInstantiated(format!(
                "adaptor '{id}' not instantiated, cannot release"
            )));
        };

        entry.refcount -= 1;
        if entry.refcount == 0 {
            debug!(id, "stopping adaptor, last reference released");
            lock(adaptor).stop_adaptor();
            entry.instance = None;
        }
        Ok(())
    }

    /// Shared handle to a live instance, without touching the refcount.
    pub fn instance(&self, id: &str) -> Option<Arc<Mutex<dyn DeviceAdaptor>>> {
        self.entries.get(id).and_then(|entry| entry.instance.clone())
    }

    pub fn refcount(&self, id: &str) -> Option<u32> {
        self.entries.get(id).map(|entry| entry.refcount)
    }

    /// Runs `f` over every live adaptor instance.
    pub fn for_each_present<F: FnMut(&mut dyn DeviceAdaptor)>(&self, mut f: F) {
        for entry in self.entries.values() {
            if let Some(adaptor) = &entry.instance {
                f(&mut *lock(adaptor));
            }
        }
    }

    /// `(id, type tag, refcount)` rows for the status dump, id-sorted.
    pub fn status_rows(&self) -> Vec<(String, String, u32)> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.type_tag.clone(), entry.refcount))
            .collect();
        rows.sort();
        rows
    }

    /// Ids of entries still holding an instance; used by the manager's
    /// destructor-time leak check.
    pub fn leaked(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.instance.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Reference-counted store of processing chains.
#[derive(Default)]
pub struct ChainStore {
    factories: HashMap<String, ChainFactory>,
    entries: HashMap<String, ChainInstanceEntry>,
}

impl ChainStore {
    pub fn register_factory(&mut self, type_tag: &str, factory: ChainFactory) {
        self.factories.insert(type_tag.to_string(), factory);
    }

    pub fn register_slot(&mut self, id: &str, type_tag: &str) {
        debug_assert!(!id.contains(';'), "no parameter passing for chains");
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| ChainInstanceEntry {
                type_tag: type_tag.to_string(),
                instance: None,
                refcount: 0,
                adaptor_deps: Vec::new(),
            });
    }

    /// Acquires a shared reference, instantiating the chain on first request.
    /// Adaptors the factory acquires are recorded against the entry and
    /// released when the chain itself is destroyed.
    pub fn request(
        &mut self,
        id: &str,
        adaptors: &mut AdaptorStore,
        sink: &SampleSink,
    ) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError> {
        debug_assert!(!id.contains(';'), "no parameter passing for chains");

        let entry = self.entries.get_mut(id).ok_or_else(|| {
            ManagerError::IdNotRegistered(format!("unknown chain id '{id}'"))
        })?;

        if let Some(chain) = &entry.instance {
            entry.refcount += 1;
            return Ok(Arc::clone(chain));
        }

        let factory = *self.factories.get(&entry.type_tag).ok_or_else(|| {
            ManagerError::FactoryNotRegistered(format!("unknown chain type '{}'", entry.type_tag))
        })?;

        debug!(id, type_tag = %entry.type_tag, "instantiating chain");
        let mut services = ChainServices {
            adaptors,
            sink,
            acquired: Vec::new(),
        };
        match factory(id, &mut services) {
            Ok(chain) => {
                entry.instance = Some(Arc::clone(&chain));
                entry.refcount = 1;
                entry.adaptor_deps = services.acquired;
                Ok(chain)
            }
            Err(err) => {
                services.rollback();
                Err(err)
            }
        }
    }

    /// Drops one reference; the last release destroys the instance and
    /// releases the adaptors it acquired at construction.
    pub fn release(&mut self, id: &str, adaptors: &mut AdaptorStore) -> Result<(), ManagerError> {
        let entry = self.entries.get_mut(id).ok_or_else(|| {
            ManagerError::IdNotRegistered(format!("unknown chain id '{id}'"))
        })?;

        if entry.instance.is_none() {
            return Err(ManagerError::NotInstantiated(format!(
                "chain '{id}' not instantiated, cannot release"
            )));
        }

        entry.refcount -= 1;
        if entry.refcount == 0 {
            debug!(id, "destroying chain, last reference released");
            entry.instance = None;
            for dep in entry.adaptor_deps.drain(..).rev() {
                let _ = adaptors.release(&dep);
            }
        }
        Ok(())
    }

    pub fn instance(&self, id: &str) -> Option<Arc<Mutex<dyn ProcessingChain>>> {
        self.entries.get(id).and_then(|entry| entry.instance.clone())
    }

    pub fn refcount(&self, id: &str) -> Option<u32> {
        self.entries.get(id).map(|entry| entry.refcount)
    }

    /// `(id, type tag, refcount, running)` rows for the status dump.
    pub fn status_rows(&self) -> Vec<(String, String, u32, bool)> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let running = entry
                    .instance
                    .as_ref()
                    .is_some_and(|chain| lock(chain).running());
                (id.clone(), entry.type_tag.clone(), entry.refcount, running)
            })
            .collect();
        rows.sort();
        rows
    }

    pub fn leaked(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.instance.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Construction-time view handed to chain factories.
pub struct ChainServices<'a> {
    adaptors: &'a mut AdaptorStore,
    sink: &'a SampleSink,
    acquired: Vec<String>,
}

impl ChainServices<'_> {
    pub fn request_adaptor(
        &mut self,
        id: &str,
    ) -> Result<Arc<Mutex<dyn DeviceAdaptor>>, ManagerError> {
        let adaptor = self.adaptors.request(id)?;
        self.acquired.push(id.to_string());
        Ok(adaptor)
    }

    /// A producer handle for the chain's worker thread.
    pub fn sample_sink(&self) -> SampleSink {
        self.sink.clone()
    }

    fn rollback(self) {
        for id in self.acquired.into_iter().rev() {
            let _ = self.adaptors.release(&id);
        }
    }
}

/// Construction-time view handed to sensor factories.
pub struct SensorServices<'a> {
    chains: &'a mut ChainStore,
    adaptors: &'a mut AdaptorStore,
    sink: &'a SampleSink,
    acquired_chains: Vec<String>,
    acquired_adaptors: Vec<String>,
}

impl<'a> SensorServices<'a> {
    pub(crate) fn new(
        chains: &'a mut ChainStore,
        adaptors: &'a mut AdaptorStore,
        sink: &'a SampleSink,
    ) -> Self {
        Self {
            chains,
            adaptors,
            sink,
            acquired_chains: Vec::new(),
            acquired_adaptors: Vec::new(),
        }
    }

    pub fn request_chain(
        &mut self,
        id: &str,
    ) -> Result<Arc<Mutex<dyn ProcessingChain>>, ManagerError> {
        let chain = self.chains.request(id, self.adaptors, self.sink)?;
        self.acquired_chains.push(id.to_string());
        Ok(chain)
    }

    pub fn request_adaptor(
        &mut self,
        id: &str,
    ) -> Result<Arc<Mutex<dyn DeviceAdaptor>>, ManagerError> {
        let adaptor = self.adaptors.request(id)?;
        self.acquired_adaptors.push(id.to_string());
        Ok(adaptor)
    }

    /// A producer handle for the sensor's worker thread.
    pub fn sample_sink(&self) -> SampleSink {
        self.sink.clone()
    }

    /// Consumes the view, yielding the acquired `(chains, adaptors)` so the
    /// registry entry can release them at teardown.
    pub(crate) fn into_acquired(self) -> (Vec<String>, Vec<String>) {
        (self.acquired_chains, self.acquired_adaptors)
    }

    /// Releases everything acquired so far; used when construction fails.
    pub(crate) fn rollback(self) {
        for id in self.acquired_chains.into_iter().rev() {
            let _ = self.chains.release(&id, self.adaptors);
        }
        for id in self.acquired_adaptors.into_iter().rev() {
            let _ = self.adaptors.release(&id);
        }
    }
}
