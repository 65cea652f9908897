//! Protocol engine for emulating a fleet of LIFX LAN devices over UDP.
//!
//! This crate owns everything above the wire codec: per-device state, the hierarchical
//! fault-injection scenario resolver, the packet handler registry, the device engine that turns
//! one decoded request into zero or more outgoing datagrams, the UDP server that ties a socket
//! to a set of devices, and the observer/persistence hook contracts the management layer plugs
//! into.

pub mod capability;
pub mod clock;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod manager;
pub mod persistence;
pub mod product;
pub mod scenario;
pub mod serial;
pub mod server;

pub use capability::Capabilities;
pub use clock::{Clock, SteppedClock, SystemClock};
pub use device::{Device, DeviceState};
pub use error::ConstructionError;
pub use manager::DeviceManager;
pub use scenario::{HierarchicalScenario, ScenarioConfig, ScenarioOverlay};
pub use serial::Serial;
pub use server::{EmulatedServer, Observers, ServerStats};
