//! Per-device state: everything a handler can read or mutate when answering a packet.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lifx_protocol::{HSBK, LastHevCycleResult, LifxIdent, LifxString, MultiZoneEffectType, TileDevice};
use tokio::sync::RwLock;

use crate::capability::Capabilities;
use crate::clock::Clock;
use crate::product::{self, UnknownProduct};
use crate::scenario::ResolvedScenario;
use crate::serial::Serial;

/// Default firmware version reported by `StateHostFirmware`/`StateWifiFirmware` unless a
/// scenario overrides it. Matches a plausible recent LIFX firmware.
pub const DEFAULT_FIRMWARE_VERSION: (u16, u16) = (3, 70);

/// Number of relays modeled on a switch-capable device.
const DEFAULT_RELAY_COUNT: usize = 4;

/// Default zone count for a multizone device constructed via [Device::new], matching a small
/// LIFX Z strip. Callers that need a specific length use [Device::with_zone_count].
const DEFAULT_ZONE_COUNT: usize = 8;

/// Default tile count for a chain-capable (multi-tile) device, matching a standard LIFX Tile kit.
const DEFAULT_CHAIN_LENGTH: u32 = 5;

/// The standard LIFX LAN UDP port, reported by `StateService` until a server rewrites it to its
/// own bound port.
pub const DEFAULT_PORT: u16 = 56700;

fn zero_hsbk() -> HSBK {
    HSBK {
        hue: 0,
        saturation: 0,
        brightness: 0,
        kelvin: 3500,
    }
}

/// State associated with an in-progress or completed HEV (germicidal UV) cycle.
///
/// `running` is not stored: a cycle's running flag expires without an explicit tick, so it's
/// computed on demand by comparing the current clock reading to `cycle_end_unix_nanos`.
#[derive(Debug, Clone)]
pub struct HevState {
    pub duration_secs: u32,
    pub cycle_end_unix_nanos: Option<u64>,
    pub last_power: bool,
    pub indication: bool,
    pub default_duration_secs: u32,
    pub last_result: LastHevCycleResult,
}

impl Default for HevState {
    fn default() -> Self {
        HevState {
            duration_secs: 0,
            cycle_end_unix_nanos: None,
            last_power: false,
            indication: false,
            default_duration_secs: 7200,
            last_result: LastHevCycleResult::None,
        }
    }
}

/// State of a running multizone firmware effect (`MultiZone.SetMultiZoneEffect`/`StateMultiZoneEffect`).
#[derive(Debug, Clone, Default)]
pub struct MultizoneEffectState {
    pub instance_id: u32,
    pub typ: Option<MultiZoneEffectType>,
    pub speed_ms: u32,
    pub duration_ns: u64,
    pub parameters: [u8; 32],
}

/// A single tile's metadata plus its own framebuffer of `width * height` zones.
#[derive(Debug, Clone)]
pub struct TileState {
    pub device: TileDevice,
    pub framebuffer: Vec<HSBK>,
}

impl TileState {
    pub fn new(device: TileDevice) -> TileState {
        let len = device.width as usize * device.height as usize;
        TileState {
            device,
            framebuffer: vec![zero_hsbk(); len],
        }
    }
}

/// An 8x8 tile with no orientation/position data set, the shape every matrix-capable product
/// reports out of the box until a client repositions or reflashes it.
fn default_tile(vendor: u32, product: u32) -> TileDevice {
    TileDevice {
        accel_meas_x: 0,
        accel_meas_y: 0,
        accel_meas_z: 0,
        reserved1: 0,
        #[cfg(not(fuzzing))]
        user_x: 0.0,
        #[cfg(fuzzing)]
        user_x: 0.0f32.into(),
        #[cfg(not(fuzzing))]
        user_y: 0.0,
        #[cfg(fuzzing)]
        user_y: 0.0f32.into(),
        width: 8,
        height: 8,
        reserved2: 0,
        device_version_vendor: vendor,
        device_version_product: product,
        device_version_reserved: 0,
        firmware_build: 0,
        reserved3: 0,
        firmware_version_minor: DEFAULT_FIRMWARE_VERSION.1,
        firmware_version_major: DEFAULT_FIRMWARE_VERSION.0,
        reserved4: 0,
    }
}

/// The mutable half of a device: everything the engine reads or writes while handling a packet.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub label: LifxString,
    pub power: bool,
    pub color: HSBK,
    pub infrared_brightness: u16,
    pub location: (LifxIdent, LifxString, u64),
    pub group: (LifxIdent, LifxString, u64),
    pub firmware_version: (u16, u16),
    pub zones: Vec<HSBK>,
    pub multizone_effect: MultizoneEffectState,
    pub tiles: Vec<TileState>,
    pub hev: HevState,
    pub relays: Vec<u16>,
}

/// An emulated LIFX device: immutable identity plus a lock-guarded [DeviceState].
pub struct Device {
    pub serial: Serial,
    pub vendor: u32,
    pub product: u32,
    pub capabilities: Capabilities,
    pub clock: Arc<dyn Clock>,
    pub constructed_at: Instant,
    pub state: RwLock<DeviceState>,
    /// The most recently resolved scenario for this device, valid as long as its `generation`
    /// matches [crate::scenario::HierarchicalScenario::generation].
    pub scenario_cache: RwLock<Option<ResolvedScenario>>,
    /// The UDP port `StateService` reports. Rewritten by [crate::manager::DeviceManager] /
    /// the server when a device is registered against a bound socket.
    port: AtomicU16,
}

impl Device {
    /// Construct a device with default state for its product.
    ///
    /// Fails if `(vendor, product)` isn't in the product registry.
    pub fn new(
        serial: Serial,
        vendor: u32,
        product: u32,
        label: LifxString,
        clock: Arc<dyn Clock>,
    ) -> Result<Device, UnknownProduct> {
        Device::with_zone_count(serial, vendor, product, label, clock, DEFAULT_ZONE_COUNT)
    }

    /// Construct a multizone-capable device with a specific zone count instead of the default
    /// strip length. Ignored for products without the `multizone` capability.
    pub fn with_zone_count(
        serial: Serial,
        vendor: u32,
        product: u32,
        label: LifxString,
        clock: Arc<dyn Clock>,
        zone_count: usize,
    ) -> Result<Device, UnknownProduct> {
        let info = product::lookup(vendor, product)?;
        let capabilities = product::capabilities_for(info, product);

        let zones = if capabilities.multizone {
            vec![zero_hsbk(); zone_count.max(1)]
        } else {
            Vec::new()
        };
        let relays = if capabilities.relays {
            vec![0u16; DEFAULT_RELAY_COUNT]
        } else {
            Vec::new()
        };
        let tile_count = if capabilities.chain {
            DEFAULT_CHAIN_LENGTH
        } else if capabilities.matrix {
            1
        } else {
            0
        };
        let tiles = (0..tile_count)
            .map(|_| TileState::new(default_tile(vendor, product)))
            .collect();

        let state = DeviceState {
            label,
            power: false,
            color: zero_hsbk(),
            infrared_brightness: 0,
            location: (LifxIdent([0; 16]), empty_string(), 0),
            group: (LifxIdent([0; 16]), empty_string(), 0),
            firmware_version: DEFAULT_FIRMWARE_VERSION,
            zones,
            multizone_effect: MultizoneEffectState::default(),
            tiles,
            hev: HevState::default(),
            relays,
        };

        let constructed_at = clock.now();

        Ok(Device {
            serial,
            vendor,
            product,
            capabilities,
            clock,
            constructed_at,
            state: RwLock::new(state),
            scenario_cache: RwLock::new(None),
            port: AtomicU16::new(DEFAULT_PORT),
        })
    }

    /// Nanoseconds of uptime since construction, using the injected clock.
    pub fn uptime_nanos(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.constructed_at)
            .as_nanos() as u64
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Release);
    }

    /// Resolves this device's scenario against `hierarchy`, reusing the cached resolution as
    /// long as the hierarchy's generation hasn't moved since it was computed.
    pub async fn resolved_scenario(
        &self,
        hierarchy: &crate::scenario::HierarchicalScenario,
    ) -> crate::scenario::ScenarioConfig {
        let current_generation = hierarchy.generation();
        {
            let cached = self.scenario_cache.read().await;
            if let Some(resolved) = cached.as_ref() {
                if resolved.generation == current_generation {
                    return resolved.config.clone();
                }
            }
        }

        let (location, group) = {
            let state = self.state.read().await;
            (state.location.0.clone(), state.group.0.clone())
        };
        let resolved = hierarchy.resolve(self.product, &location, &group, self.serial).await;
        tracing::debug!(serial = %self.serial, generation = resolved.generation, "scenario resolved");
        let config = resolved.config.clone();
        *self.scenario_cache.write().await = Some(resolved);
        config
    }
}

fn empty_string() -> LifxString {
    LifxString::new(std::ffi::CStr::from_bytes_with_nul(b"\0").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn test_serial() -> Serial {
        Serial([0xd0, 0x73, 0xd5, 0x01, 0x02, 0x03])
    }

    #[test]
    fn construction_fails_for_unknown_product() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let result = Device::new(test_serial(), 1, 999_999, empty_string(), clock);
        assert!(result.is_err());
    }

    #[test]
    fn color_bulb_has_no_zones_or_relays() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let device = Device::new(test_serial(), 1, 1, empty_string(), clock).unwrap();
        assert!(device.capabilities.color);
        assert!(!device.capabilities.multizone);
        assert!(!device.capabilities.relays);
    }

    #[test]
    fn tile_device_starts_with_a_five_tile_chain() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let device = Device::new(test_serial(), 1, 55, empty_string(), clock).unwrap();
        let state = device.state.try_read().unwrap();
        assert_eq!(state.tiles.len(), 5);
        assert_eq!(state.tiles[0].framebuffer.len(), 64);
    }

    #[test]
    fn candle_has_a_single_tile_and_no_chain_capability() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let device = Device::new(test_serial(), 1, 57, empty_string(), clock).unwrap();
        assert!(!device.capabilities.chain);
        assert!(device.capabilities.matrix);
        let state = device.state.try_read().unwrap();
        assert_eq!(state.tiles.len(), 1);
    }

    #[test]
    fn multizone_device_starts_with_eight_zones() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let device = Device::new(test_serial(), 1, 32, empty_string(), clock).unwrap();
        let state = device.state.try_read().unwrap();
        assert_eq!(state.zones.len(), 8);
    }
}
