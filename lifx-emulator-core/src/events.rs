//! Activity and lifecycle observation. These traits are intentionally synchronous: bridging
//! them to an async consumer (a WebSocket layer, a log shipper) is the implementer's job.

use std::net::SocketAddr;
use std::time::SystemTime;

use crate::serial::Serial;

/// One packet's worth of activity: either a request the engine received, or a response it sent.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub serial: Serial,
    pub pkt_type: u16,
    pub peer: SocketAddr,
    pub direction: PacketDirection,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Inbound,
    Outbound,
}

/// Observes every packet the engine processes, in order.
pub trait ActivityObserver: Send + Sync {
    fn on_packet(&self, event: &PacketEvent);
}

/// Observes devices being added to or removed from a [crate::manager::DeviceManager].
pub trait DeviceLifecycleObserver: Send + Sync {
    fn on_device_added(&self, serial: Serial) {
        let _ = serial;
    }
    fn on_device_removed(&self, serial: Serial) {
        let _ = serial;
    }
}

/// Observes a device's externally-visible state changing as a result of processing a packet.
///
/// `duration_ms` is the transition time the request itself carried (e.g. `LightSetColor.duration`),
/// letting an external consumer synthesize an animation timeline; the engine never interpolates
/// state over that duration itself.
pub trait StateChangeObserver: Send + Sync {
    fn on_state_changed(&self, serial: Serial, pkt_type: u16, duration_ms: u32) {
        let _ = (serial, pkt_type, duration_ms);
    }
}

/// An in-memory [ActivityObserver] that keeps the most recent `capacity` events, FIFO.
pub struct ActivityLog {
    capacity: usize,
    events: std::sync::Mutex<std::collections::VecDeque<PacketEvent>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> ActivityLog {
        ActivityLog {
            capacity,
            events: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
        }
    }

    pub fn recent(&self) -> Vec<PacketEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl ActivityObserver for ActivityLog {
    fn on_packet(&self, event: &PacketEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> PacketEvent {
        PacketEvent {
            serial: Serial([0; 6]),
            pkt_type: 2,
            peer: "127.0.0.1:56700".parse().unwrap(),
            direction: PacketDirection::Inbound,
            at: SystemTime::now(),
        }
    }

    #[test]
    fn activity_log_drops_oldest_past_capacity() {
        let log = ActivityLog::new(2);
        log.on_packet(&sample_event());
        log.on_packet(&sample_event());
        log.on_packet(&sample_event());
        assert_eq!(log.recent().len(), 2);
    }
}
