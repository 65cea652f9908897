//! The UDP server: owns one socket, decodes incoming datagrams, routes them to one or many
//! devices, and schedules outgoing datagrams independently so a slow response never blocks a
//! later one.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use lifx_protocol::{decode_header, Message, RawMessage};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::clock::Clock;
use crate::device::Device;
use crate::engine;
use crate::error::ConstructionError;
use crate::events::{ActivityObserver, DeviceLifecycleObserver, PacketDirection, PacketEvent, StateChangeObserver};
use crate::manager::{DeviceManager, DuplicateSerial};
use crate::persistence::{DevicePersistenceHook, DeviceSnapshot};
use crate::scenario::HierarchicalScenario;
use crate::serial::Serial;

const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
}

/// What the server notifies when packets and devices come and go. Constructed once and shared
/// for the server's lifetime; every field defaults to no observers at all.
#[derive(Default)]
pub struct Observers {
    pub activity: Vec<Arc<dyn ActivityObserver>>,
    pub lifecycle: Vec<Arc<dyn DeviceLifecycleObserver>>,
    pub state_change: Vec<Arc<dyn StateChangeObserver>>,
}

/// A running (or stopped) emulated LIFX network, reachable over one UDP socket.
pub struct EmulatedServer {
    socket: Arc<UdpSocket>,
    manager: RwLock<DeviceManager>,
    scenario: Arc<HierarchicalScenario>,
    counters: Counters,
    observers: Observers,
    device_persistence: Option<Arc<dyn DevicePersistenceHook>>,
    tasks: Mutex<JoinSet<()>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl EmulatedServer {
    /// Binds a UDP socket at `addr` and returns a server with no devices registered.
    pub async fn bind(
        addr: SocketAddr,
        scenario: Arc<HierarchicalScenario>,
        observers: Observers,
        device_persistence: Option<Arc<dyn DevicePersistenceHook>>,
    ) -> io::Result<EmulatedServer> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(EmulatedServer {
            socket: Arc::new(socket),
            manager: RwLock::new(DeviceManager::new()),
            scenario,
            counters: Counters::default(),
            observers,
            device_persistence,
            tasks: Mutex::new(JoinSet::new()),
            reader: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers a device, rewriting its reported UDP port to this server's bound port.
    pub async fn add_device(self: &Arc<Self>, device: Device) -> Result<(), DuplicateSerial> {
        if let Ok(addr) = self.local_addr() {
            device.set_port(addr.port());
        }
        let lifecycle: Vec<&dyn DeviceLifecycleObserver> =
            self.observers.lifecycle.iter().map(|o| o.as_ref()).collect();
        self.manager.write().await.add_device(device, &lifecycle)
    }

    /// Convenience wrapper over [Device::new] and [EmulatedServer::add_device] for callers that
    /// only have a human-readable serial string (e.g. from a scenario config file).
    pub async fn add_device_by_serial(
        self: &Arc<Self>,
        serial: &str,
        vendor: u32,
        product: u32,
        label: lifx_protocol::LifxString,
        clock: Arc<dyn Clock>,
    ) -> Result<(), ConstructionError> {
        let serial: Serial = serial.parse()?;
        let device = Device::new(serial, vendor, product, label, clock)?;
        self.add_device(device).await?;
        Ok(())
    }

    pub async fn remove_device(self: &Arc<Self>, serial: Serial) -> Option<()> {
        let lifecycle: Vec<&dyn DeviceLifecycleObserver> =
            self.observers.lifecycle.iter().map(|o| o.as_ref()).collect();
        self.manager.write().await.remove_device(serial, &lifecycle).map(|_| ())
    }

    pub async fn get_device(&self, serial: Serial) -> Option<DeviceSnapshot> {
        let manager = self.manager.read().await;
        let device = manager.get_device(serial)?;
        let state = device.state.read().await;
        Some(DeviceSnapshot {
            serial: device.serial,
            label: state.label.clone(),
            power: state.power,
            color: state.color,
        })
    }

    pub async fn get_all_devices(&self) -> Vec<DeviceSnapshot> {
        let manager = self.manager.read().await;
        let mut snapshots = Vec::with_capacity(manager.len());
        for device in manager.iter() {
            let state = device.state.read().await;
            snapshots.push(DeviceSnapshot {
                serial: device.serial,
                label: state.label.clone(),
                power: state.power,
                color: state.color,
            });
        }
        snapshots
    }

    pub fn get_stats(&self) -> ServerStats {
        ServerStats {
            packets_received: self.counters.received.load(Ordering::Relaxed),
            packets_sent: self.counters.sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Starts the reader loop as a background task. Returns once the loop is spawned, not once
    /// it stops; call [EmulatedServer::stop] to shut it down.
    pub fn start(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (amt, peer) = match server.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let datagram = buf[..amt].to_vec();
                let server = Arc::clone(&server);
                let mut tasks = server.tasks.lock().await;
                tasks.spawn(async move { server.handle_datagram(datagram, peer).await });
            }
        });
        // `try_lock` is safe here: nothing else holds `reader` before the server has started.
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = Some(handle);
        }
    }

    /// Stops the reader loop and every outstanding per-datagram/per-response task, then flushes
    /// device state through the persistence hook (if one is configured).
    pub async fn stop(self: &Arc<Self>) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.tasks.lock().await.abort_all();

        if let Some(hook) = &self.device_persistence {
            for snapshot in self.get_all_devices().await {
                if let Err(err) = hook.save_device(&snapshot).await {
                    tracing::warn!(serial = %snapshot.serial, error = %err, "persistence hook failed at shutdown");
                }
            }
        }
    }

    async fn handle_datagram(self: Arc<Self>, buf: Vec<u8>, peer: SocketAddr) {
        let header = match decode_header(&buf) {
            Ok(header) => header,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%peer, error = %err, "failed to decode header");
                return;
            }
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%peer, pkt_type = header.pkt_type, target = header.target, "packet received");

        let request = RawMessage::unpack(&buf).ok().and_then(|raw| Message::from_raw(&raw).ok());

        for observer in &self.observers.activity {
            observer.on_packet(&PacketEvent {
                serial: Serial::from_target(header.target),
                pkt_type: header.pkt_type,
                peer,
                direction: PacketDirection::Inbound,
                at: SystemTime::now(),
            });
        }

        let broadcast = header.tagged || header.target == 0;
        let manager = self.manager.read().await;
        let state_observers: Vec<&dyn StateChangeObserver> =
            self.observers.state_change.iter().map(|o| o.as_ref()).collect();

        let mut outgoing = Vec::new();
        if broadcast {
            for device in manager.iter() {
                self.process_one(device, &header, request.as_ref(), &state_observers, &mut outgoing)
                    .await;
            }
        } else {
            let target = Serial::from_target(header.target);
            if let Some(device) = manager.get_device(target) {
                self.process_one(device, &header, request.as_ref(), &state_observers, &mut outgoing)
                    .await;
            }
        }
        drop(manager);

        let mut tasks = self.tasks.lock().await;
        for (serial, datagram) in outgoing {
            let socket = Arc::clone(&self.socket);
            let server = Arc::clone(&self);
            tasks.spawn(async move {
                if !datagram.delay.is_zero() {
                    tokio::time::sleep(datagram.delay).await;
                }
                if socket.send_to(&datagram.bytes, peer).await.is_ok() {
                    server.counters.sent.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%peer, %serial, "packet sent");
                    for observer in &server.observers.activity {
                        observer.on_packet(&PacketEvent {
                            serial,
                            pkt_type: decode_header(&datagram.bytes).map(|h| h.pkt_type).unwrap_or(0),
                            peer,
                            direction: PacketDirection::Outbound,
                            at: SystemTime::now(),
                        });
                    }
                }
            });
        }
    }

    async fn process_one(
        &self,
        device: &Device,
        header: &lifx_protocol::Header,
        request: Option<&Message>,
        state_observers: &[&dyn StateChangeObserver],
        outgoing: &mut Vec<(Serial, engine::OutgoingDatagram)>,
    ) {
        let config = device.resolved_scenario(&self.scenario).await;
        let mut rng = rand::thread_rng();
        let datagrams = {
            let mut state = device.state.write().await;
            engine::process_request(device, &mut state, header, request, &config, state_observers, &mut rng)
        };
        outgoing.extend(datagrams.into_iter().map(|d| (device.serial, d)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::ffi::CStr;
    use std::net::Ipv4Addr;

    fn label(text: &[u8]) -> lifx_protocol::LifxString {
        lifx_protocol::LifxString::new(CStr::from_bytes_with_nul(text).unwrap())
    }

    async fn make_server() -> Arc<EmulatedServer> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Arc::new(
            EmulatedServer::bind(addr, Arc::new(HierarchicalScenario::new()), Observers::default(), None)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn get_service_round_trips_the_bound_port() {
        let server = make_server().await;
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        let device = Device::new(Serial([1, 2, 3, 4, 5, 6]), 1, 1, label(b"\0"), clock).unwrap();
        server.add_device(device).await.unwrap();

        let bound_port = server.local_addr().unwrap().port();
        server.start();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let raw = RawMessage::build(&lifx_protocol::BuildOptions::default(), Message::GetService).unwrap();
        client.send_to(&raw.pack().unwrap(), server.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (amt, _) = tokio::time::timeout(std::time::Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response_raw = RawMessage::unpack(&buf[..amt]).unwrap();
        match Message::from_raw(&response_raw).unwrap() {
            Message::StateService { port, .. } => assert_eq!(port, bound_port as u32),
            other => panic!("expected StateService, got {other:?}"),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_device() {
        let server = make_server().await;
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        for n in 0..3u8 {
            let device = Device::new(Serial([n, 0, 0, 0, 0, 0]), 1, 1, label(b"\0"), clock.clone()).unwrap();
            server.add_device(device).await.unwrap();
        }
        server.start();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let raw = RawMessage::build(&lifx_protocol::BuildOptions::default(), Message::GetService).unwrap();
        client.send_to(&raw.pack().unwrap(), server.local_addr().unwrap()).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (amt, _) = tokio::time::timeout(std::time::Duration::from_secs(1), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let response_raw = RawMessage::unpack(&buf[..amt]).unwrap();
            seen.insert(response_raw.frame_addr.target);
        }
        assert_eq!(seen.len(), 3);

        server.stop().await;
    }
}
