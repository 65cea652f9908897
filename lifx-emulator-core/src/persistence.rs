//! Optional persistence hooks. Implementations may no-op either or both; the engine logs and
//! discards any error a hook returns rather than letting it interrupt packet processing.

use lifx_protocol::{HSBK, LifxString};

use crate::scenario::ScenarioConfig;
use crate::serial::Serial;

/// A snapshot of the externally-visible parts of a device's state, handed to
/// [DevicePersistenceHook] after a mutating request.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub serial: Serial,
    pub label: LifxString,
    pub power: bool,
    pub color: HSBK,
}

/// Persists device state across restarts. The default implementation does nothing.
#[allow(async_fn_in_trait)]
pub trait DevicePersistenceHook: Send + Sync {
    async fn save_device(&self, _snapshot: &DeviceSnapshot) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Persists the scenario hierarchy across restarts. The default implementation does nothing.
#[allow(async_fn_in_trait)]
pub trait ScenarioPersistenceHook: Send + Sync {
    async fn save_scenario(&self, _config: &ScenarioConfig) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// The hook used when no persistence is configured.
pub struct NoopPersistence;

impl DevicePersistenceHook for NoopPersistence {}
impl ScenarioPersistenceHook for NoopPersistence {}
