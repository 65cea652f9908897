//! The boolean capability set a device is constructed with, derived once from its product id
//! and never mutated afterwards.

/// Which LIFX feature areas a device supports.
///
/// Every field here gates a family of packet types in the handler registry: a device that
/// doesn't have `hev` never responds to `Light.GetHevCycle`, for instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub color: bool,
    pub infrared: bool,
    pub multizone: bool,
    /// Derived, not stored: a multizone device also has this set unless it's a first-generation
    /// LIFX Z (product id 31), which predates the extended (`StateExtendedColorZones`) firmware.
    pub extended_multizone: bool,
    pub matrix: bool,
    pub chain: bool,
    pub hev: bool,
    pub relays: bool,
    pub buttons: bool,
}
