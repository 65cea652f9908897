//! End-to-end tests driving [lifx_emulator_core::EmulatedServer] over real loopback UDP sockets,
//! one test per documented device behavior rather than mechanical round-trip grids.

use std::ffi::CStr;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lifx_emulator_core::{Device, EmulatedServer, HierarchicalScenario, Observers, ScenarioOverlay, Serial, SystemClock};
use lifx_protocol::{
    ApplicationRequest, BuildOptions, HSBK, Message, RawMessage, TileBufferRect,
};
use tokio::net::UdpSocket;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

fn label(text: &[u8]) -> lifx_protocol::LifxString {
    lifx_protocol::LifxString::new(CStr::from_bytes_with_nul(text).unwrap())
}

async fn server_with_scenario(scenario: Arc<HierarchicalScenario>) -> Arc<EmulatedServer> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    Arc::new(
        EmulatedServer::bind(addr, scenario, Observers::default(), None)
            .await
            .unwrap(),
    )
}

async fn server() -> Arc<EmulatedServer> {
    server_with_scenario(Arc::new(HierarchicalScenario::new())).await
}

async fn client() -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
}

async fn send_to_target(client: &UdpSocket, addr: SocketAddr, target: u64, request: Message, ack_required: bool, res_required: bool) {
    let options = BuildOptions {
        target: Some(target),
        ack_required,
        res_required,
        sequence: 1,
        source: 0xdead_beef,
    };
    let raw = RawMessage::build(&options, request).unwrap();
    client.send_to(&raw.pack().unwrap(), addr).await.unwrap();
}

async fn recv_message(client: &UdpSocket) -> Message {
    let mut buf = [0u8; 2048];
    let (amt, _) = tokio::time::timeout(RECV_TIMEOUT, client.recv_from(&mut buf)).await.unwrap().unwrap();
    let raw = RawMessage::unpack(&buf[..amt]).unwrap();
    Message::from_raw(&raw).unwrap()
}

async fn try_recv_message(client: &UdpSocket) -> Option<Message> {
    let mut buf = [0u8; 2048];
    let result = tokio::time::timeout(RECV_TIMEOUT, client.recv_from(&mut buf)).await;
    let (amt, _) = result.ok()?.ok()?;
    let raw = RawMessage::unpack(&buf[..amt]).ok()?;
    Message::from_raw(&raw).ok()
}

fn zero_color() -> HSBK {
    HSBK {
        hue: 0,
        saturation: 0,
        brightness: 0,
        kelvin: 3500,
    }
}

#[tokio::test]
async fn extended_color_zones_chunks_by_eighty_two() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);

    let serials = [(Serial([1, 0, 0, 0, 0, 0]), 120usize), (Serial([2, 0, 0, 0, 0, 0]), 82), (Serial([3, 0, 0, 0, 0, 0]), 60)];
    for (serial, zone_count) in serials {
        let device = Device::with_zone_count(serial, 1, 32, label(b"\0"), clock.clone(), zone_count).unwrap();
        server.add_device(device).await.unwrap();
    }
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    for (serial, zone_count) in serials {
        send_to_target(&client, addr, serial.as_target(), Message::GetExtendedColorZone, false, true).await;
        let expected_packets = zone_count.div_ceil(82);
        let mut seen = Vec::new();
        for _ in 0..expected_packets {
            match recv_message(&client).await {
                Message::StateExtendedColorZones {
                    zones_count,
                    zone_index,
                    colors_count,
                    ..
                } => seen.push((zone_index, colors_count, zones_count)),
                other => panic!("expected StateExtendedColorZones, got {other:?}"),
            }
        }
        assert_eq!(seen.len(), expected_packets);
        for (i, (index, count, total)) in seen.iter().enumerate() {
            assert_eq!(*index as usize, i * 82);
            assert_eq!(*total as usize, zone_count);
            assert_eq!(*count as usize, (zone_count - i * 82).min(82));
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn set_extended_color_zones_applies_a_contiguous_slice() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let serial = Serial([9, 0, 0, 0, 0, 0]);
    let device = Device::with_zone_count(serial, 1, 32, label(b"\0"), clock, 10).unwrap();
    server.add_device(device).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    let red = HSBK {
        hue: 0,
        saturation: 65535,
        brightness: 65535,
        kelvin: 3500,
    };
    let mut colors = [zero_color(); 82];
    colors[0] = red;
    colors[1] = red;
    send_to_target(
        &client,
        addr,
        serial.as_target(),
        Message::SetExtendedColorZones {
            duration: 0,
            apply: ApplicationRequest::Apply,
            zone_index: 2,
            colors_count: 2,
            colors,
        },
        false,
        true,
    )
    .await;

    match recv_message(&client).await {
        Message::StateExtendedColorZones { colors, .. } => {
            assert_eq!(colors[2], red);
            assert_eq!(colors[3], red);
            assert_eq!(colors[4], zero_color());
        }
        other => panic!("expected StateExtendedColorZones, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn tile_get64_respects_requested_length() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let serial = Serial([4, 0, 0, 0, 0, 0]);
    let device = Device::new(serial, 1, 55, label(b"\0"), clock).unwrap();
    server.add_device(device).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    let rect = TileBufferRect { x: 0, y: 0, width: 8 };

    for (tile_index, length, expected) in [(0u8, 3u8, 3usize), (3, 5, 2), (0, 5, 5)] {
        send_to_target(
            &client,
            addr,
            serial.as_target(),
            Message::Get64 { tile_index, length, rect },
            false,
            true,
        )
        .await;
        let mut got = Vec::new();
        for _ in 0..expected {
            match recv_message(&client).await {
                Message::State64 { tile_index, .. } => got.push(tile_index),
                other => panic!("expected State64, got {other:?}"),
            }
        }
        assert_eq!(got.len(), expected);
    }

    server.stop().await;
}

#[tokio::test]
async fn matrix_only_device_answers_get64_and_set64_without_chain_capability() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let serial = Serial([14, 0, 0, 0, 0, 0]);
    // Product 57: LIFX Candle, matrix-capable but chain-incapable (a single built-in tile).
    let device = Device::new(serial, 1, 57, label(b"\0"), clock).unwrap();
    server.add_device(device).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    let rect = TileBufferRect { x: 0, y: 0, width: 8 };
    send_to_target(
        &client,
        addr,
        serial.as_target(),
        Message::Get64 { tile_index: 0, length: 1, rect },
        false,
        true,
    )
    .await;
    match recv_message(&client).await {
        Message::State64 { tile_index, .. } => assert_eq!(tile_index, 0),
        other => panic!("expected State64, got {other:?}"),
    }

    let colors = [zero_color(); 64];
    send_to_target(
        &client,
        addr,
        serial.as_target(),
        Message::Set64 {
            tile_index: 0,
            length: 1,
            rect,
            duration: 0,
            colors,
        },
        false,
        true,
    )
    .await;
    match recv_message(&client).await {
        Message::State64 { tile_index, .. } => assert_eq!(tile_index, 0),
        other => panic!("expected State64, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn partial_response_scenario_truncates_multizone_state() {
    let scenario = Arc::new(HierarchicalScenario::new());
    let server = server_with_scenario(scenario.clone()).await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);

    let plain = Serial([5, 0, 0, 0, 0, 0]);
    let truncated = Serial([6, 0, 0, 0, 0, 0]);
    server
        .add_device(Device::with_zone_count(plain, 1, 32, label(b"\0"), clock.clone(), 120).unwrap())
        .await
        .unwrap();
    server
        .add_device(Device::with_zone_count(truncated, 1, 32, label(b"\0"), clock, 120).unwrap())
        .await
        .unwrap();

    let mut partial = std::collections::HashSet::new();
    partial.insert(506u16); // StateMultiZone
    scenario
        .set_for_device(
            truncated,
            ScenarioOverlay {
                partial_responses: Some(partial),
                ..Default::default()
            },
        )
        .await;

    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    send_to_target(&client, addr, plain.as_target(), Message::GetColorZones { start_index: 0, end_index: 119 }, false, true).await;
    let mut plain_count = 0;
    while let Some(msg) = try_recv_message(&client).await {
        plain_count += 1;
        if !matches!(msg, Message::StateMultiZone { .. }) {
            break;
        }
    }
    assert_eq!(plain_count, 15);

    send_to_target(&client, addr, truncated.as_target(), Message::GetColorZones { start_index: 0, end_index: 119 }, false, true).await;
    let mut truncated_count = 0;
    while let Some(msg) = try_recv_message(&client).await {
        truncated_count += 1;
        if !matches!(msg, Message::StateMultiZone { .. }) {
            break;
        }
    }
    assert!((1..15).contains(&truncated_count), "expected 1..15 packets, got {truncated_count}");

    server.stop().await;
}

#[tokio::test]
async fn switch_without_color_reports_state_unhandled_for_light_get() {
    let scenario = Arc::new(HierarchicalScenario::new());
    scenario
        .set_global(ScenarioOverlay {
            send_unhandled: Some(true),
            ..Default::default()
        })
        .await;
    let server = server_with_scenario(scenario).await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let serial = Serial([7, 0, 0, 0, 0, 0]);
    // Product 70: LIFX Switch, relays+buttons only, no color capability.
    let device = Device::new(serial, 1, 70, label(b"\0"), clock).unwrap();
    server.add_device(device).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    send_to_target(&client, addr, serial.as_target(), Message::LightGet, false, true).await;
    match recv_message(&client).await {
        Message::StateUnhandled { unhandled_type } => assert_eq!(unhandled_type, 101),
        other => panic!("expected StateUnhandled, got {other:?}"),
    }
    assert!(try_recv_message(&client).await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn broadcast_get_service_reaches_devices_of_differing_capability() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);

    // A color bulb, a multizone strip, and a relay switch: three distinct capability sets.
    let serials = [
        (Serial([10, 0, 0, 0, 0, 0]), 1u32),
        (Serial([11, 0, 0, 0, 0, 0]), 32u32),
        (Serial([12, 0, 0, 0, 0, 0]), 70u32),
    ];
    for (serial, product) in serials {
        let device = Device::new(serial, 1, product, label(b"\0"), clock.clone()).unwrap();
        server.add_device(device).await.unwrap();
    }
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    // Tagged broadcast: target 0, tagged true (BuildOptions derives tagged from target == None).
    let raw = RawMessage::build(&BuildOptions::default(), Message::GetService).unwrap();
    client.send_to(&raw.pack().unwrap(), addr).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..3 {
        let mut buf = [0u8; 2048];
        let (amt, _) = tokio::time::timeout(RECV_TIMEOUT, client.recv_from(&mut buf)).await.unwrap().unwrap();
        let raw = RawMessage::unpack(&buf[..amt]).unwrap();
        seen.insert(raw.frame_addr.target);
        match Message::from_raw(&raw).unwrap() {
            Message::StateService { port, .. } => assert_eq!(port, addr.port() as u32),
            other => panic!("expected StateService, got {other:?}"),
        }
    }
    assert_eq!(seen.len(), 3);

    server.stop().await;
}

#[tokio::test]
async fn ack_is_sent_before_the_dispatched_response() {
    let server = server().await;
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let serial = Serial([13, 0, 0, 0, 0, 0]);
    let device = Device::new(serial, 1, 1, label(b"\0"), clock).unwrap();
    server.add_device(device).await.unwrap();
    server.start();
    let addr = server.local_addr().unwrap();
    let client = client().await;

    send_to_target(
        &client,
        addr,
        serial.as_target(),
        Message::LightSetColor {
            reserved: 0,
            color: zero_color(),
            duration: 0,
        },
        true,
        true,
    )
    .await;

    match recv_message(&client).await {
        Message::Acknowledgement { seq } => assert_eq!(seq, 1),
        other => panic!("expected Acknowledgement first, got {other:?}"),
    }
    match recv_message(&client).await {
        Message::LightState { .. } => {}
        other => panic!("expected LightState second, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn two_servers_run_independently_on_separate_ports() {
    let clock: Arc<dyn lifx_emulator_core::Clock> = Arc::new(SystemClock);
    let server_a = server().await;
    let server_b = server().await;

    let serial_a = Serial([20, 0, 0, 0, 0, 0]);
    let serial_b = Serial([21, 0, 0, 0, 0, 0]);
    server_a.add_device(Device::new(serial_a, 1, 1, label(b"\0"), clock.clone()).unwrap()).await.unwrap();
    server_b.add_device(Device::new(serial_b, 1, 1, label(b"\0"), clock).unwrap()).await.unwrap();
    server_a.start();
    server_b.start();

    let addr_a = server_a.local_addr().unwrap();
    let addr_b = server_b.local_addr().unwrap();
    assert_ne!(addr_a.port(), addr_b.port());

    let client = client().await;

    send_to_target(&client, addr_a, serial_a.as_target(), Message::GetService, false, true).await;
    match recv_message(&client).await {
        Message::StateService { port, .. } => assert_eq!(port, addr_a.port() as u32),
        other => panic!("expected StateService, got {other:?}"),
    }

    send_to_target(&client, addr_b, serial_b.as_target(), Message::GetService, false, true).await;
    match recv_message(&client).await {
        Message::StateService { port, .. } => assert_eq!(port, addr_b.port() as u32),
        other => panic!("expected StateService, got {other:?}"),
    }

    // A device registered only with server_a is invisible to server_b.
    send_to_target(&client, addr_b, serial_a.as_target(), Message::GetService, false, true).await;
    assert!(try_recv_message(&client).await.is_none());

    server_a.stop().await;
    server_b.stop().await;
}
