//! Hierarchical fault-injection configuration: global -> product type -> location -> group ->
//! device, merged into a single resolved [ScenarioConfig] per device and cached until the
//! hierarchy's generation counter moves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use lifx_protocol::LifxIdent;
use tokio::sync::RwLock;

use crate::serial::Serial;

/// One level's worth of overlay. Every field is optional: `None` means "this level has nothing
/// to say about this knob", and resolution falls through to the next-less-specific level.
#[derive(Debug, Clone, Default)]
pub struct ScenarioOverlay {
    /// Per packet-type drop probability, in `[0.0, 1.0]`. Map-overlay: keys are merged across
    /// levels, with a more specific level's value winning per key.
    pub drop_packets: Option<HashMap<u16, f64>>,
    /// Per packet-type delay, in milliseconds, applied to that response. Map-overlay, same as
    /// `drop_packets`. The ack (type 45) is addressable here like any other response type.
    pub response_delays: Option<HashMap<u16, u64>>,
    /// Override `(major, minor)` firmware version reported by the device. Scalar-replace.
    pub firmware_version: Option<(u16, u16)>,
    /// Packet types whose response payload should be replaced with the `0xAA` marker.
    /// Set-replace: the most specific level that defines this field wins wholesale.
    pub malformed_packets: Option<HashSet<u16>>,
    /// Packet types whose numeric/dimension fields get clamped to extreme values. Set-replace.
    pub invalid_field_values: Option<HashSet<u16>>,
    /// Packet types whose multi-datagram responses get truncated. Set-replace.
    pub partial_responses: Option<HashSet<u16>>,
    /// Whether an unsupported-but-decodable packet gets a `StateUnhandled` reply instead of
    /// silence. Scalar-replace.
    pub send_unhandled: Option<bool>,
}

impl ScenarioOverlay {
    fn layer_onto(&self, base: &mut ScenarioConfig) {
        if let Some(ref m) = self.drop_packets {
            for (k, v) in m {
                base.drop_packets.insert(*k, *v);
            }
        }
        if let Some(ref m) = self.response_delays {
            for (k, v) in m {
                base.response_delays.insert(*k, *v);
            }
        }
        if let Some(v) = self.firmware_version {
            base.firmware_version = Some(v);
        }
        if let Some(ref s) = self.malformed_packets {
            base.malformed_packets = s.clone();
        }
        if let Some(ref s) = self.invalid_field_values {
            base.invalid_field_values = s.clone();
        }
        if let Some(ref s) = self.partial_responses {
            base.partial_responses = s.clone();
        }
        if let Some(v) = self.send_unhandled {
            base.send_unhandled = v;
        }
    }
}

/// The flattened result of merging all five levels for one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioConfig {
    pub drop_packets: HashMap<u16, f64>,
    pub response_delays: HashMap<u16, u64>,
    pub firmware_version: Option<(u16, u16)>,
    pub malformed_packets: HashSet<u16>,
    pub invalid_field_values: HashSet<u16>,
    pub partial_responses: HashSet<u16>,
    pub send_unhandled: bool,
}

/// A scenario resolved for one device, tagged with the generation it was computed against.
#[derive(Debug, Clone, Default)]
pub struct ResolvedScenario {
    pub generation: u64,
    pub config: ScenarioConfig,
}

/// A key identifying a location or group by its LIFX identifier.
///
/// `lifx_protocol::LifxIdent` doesn't implement `Hash`/`Eq` (it's a foreign type from the wire
/// codec crate), so it's wrapped here for use as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentKey(pub [u8; 16]);

impl From<&LifxIdent> for IdentKey {
    fn from(ident: &LifxIdent) -> IdentKey {
        IdentKey(ident.0)
    }
}

pub type LocationKey = IdentKey;
pub type GroupKey = IdentKey;

#[derive(Debug, Default)]
struct ScenarioLayers {
    global: ScenarioOverlay,
    by_product: HashMap<u32, ScenarioOverlay>,
    by_location: HashMap<LocationKey, ScenarioOverlay>,
    by_group: HashMap<GroupKey, ScenarioOverlay>,
    by_device: HashMap<Serial, ScenarioOverlay>,
}

/// The full scenario hierarchy shared by a running server, guarded by a single lock and a
/// generation counter devices use to invalidate their cached resolution.
#[derive(Debug, Default)]
pub struct HierarchicalScenario {
    generation: AtomicU64,
    layers: RwLock<ScenarioLayers>,
}

impl HierarchicalScenario {
    pub fn new() -> HierarchicalScenario {
        HierarchicalScenario::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub async fn set_global(&self, overlay: ScenarioOverlay) {
        self.layers.write().await.global = overlay;
        self.bump_generation();
    }

    pub async fn set_for_product(&self, product: u32, overlay: ScenarioOverlay) {
        self.layers.write().await.by_product.insert(product, overlay);
        self.bump_generation();
    }

    pub async fn set_for_location(&self, location: LocationKey, overlay: ScenarioOverlay) {
        self.layers.write().await.by_location.insert(location, overlay);
        self.bump_generation();
    }

    pub async fn set_for_group(&self, group: GroupKey, overlay: ScenarioOverlay) {
        self.layers.write().await.by_group.insert(group, overlay);
        self.bump_generation();
    }

    pub async fn set_for_device(&self, serial: Serial, overlay: ScenarioOverlay) {
        self.layers.write().await.by_device.insert(serial, overlay);
        self.bump_generation();
    }

    pub async fn clear_for_device(&self, serial: Serial) {
        self.layers.write().await.by_device.remove(&serial);
        self.bump_generation();
    }

    /// Merge global -> product -> location -> group -> device, most-specific last.
    pub async fn resolve(
        &self,
        product: u32,
        location: &LifxIdent,
        group: &LifxIdent,
        serial: Serial,
    ) -> ResolvedScenario {
        let layers = self.layers.read().await;
        let mut config = ScenarioConfig::default();
        let location_key = LocationKey::from(location);
        let group_key = GroupKey::from(group);

        layers.global.layer_onto(&mut config);
        if let Some(overlay) = layers.by_product.get(&product) {
            overlay.layer_onto(&mut config);
        }
        if let Some(overlay) = layers.by_location.get(&location_key) {
            overlay.layer_onto(&mut config);
        }
        if let Some(overlay) = layers.by_group.get(&group_key) {
            overlay.layer_onto(&mut config);
        }
        if let Some(overlay) = layers.by_device.get(&serial) {
            overlay.layer_onto(&mut config);
        }

        ResolvedScenario {
            generation: self.generation(),
            config,
        }
    }
}
