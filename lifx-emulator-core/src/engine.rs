//! The device engine: turns one decoded request into zero or more outgoing datagrams, following
//! the fixed pipeline (capability gate -> drop filter -> ack -> dispatch -> post-filters ->
//! header attach -> delay hint -> notify).

use std::time::Duration;

use lifx_protocol::{BuildOptions, Header, Message, RawMessage};
use rand::Rng;

use crate::device::Device;
use crate::events::StateChangeObserver;
use crate::handlers::{self, HandlerContext};
use crate::scenario::ScenarioConfig;
use crate::serial::Serial;

/// One packet ready to be sent, paired with how long to wait before sending it.
pub struct OutgoingDatagram {
    pub bytes: Vec<u8>,
    pub delay: Duration,
}

/// The marker byte used to fill a malformed response's payload.
const MALFORMED_MARKER: u8 = 0xAA;

/// `Acknowledgement`'s own wire packet type, so a scenario can target it in `drop_packets`/
/// `response_delays` the same way it targets any dispatched response.
const ACK_PKT_TYPE: u16 = 45;

/// The transition time, in milliseconds, a mutating request asked for, if any. Reported to
/// [StateChangeObserver] alongside the packet type so an external consumer can synthesize an
/// animation timeline; the engine itself never interpolates over this duration.
fn request_duration_ms(request: &Message) -> u32 {
    match request {
        Message::LightSetColor { duration, .. } => *duration,
        Message::LightSetPower { duration, .. } => *duration,
        Message::SetColorZones { duration, .. } => *duration,
        Message::SetExtendedColorZones { duration, .. } => *duration,
        Message::Set64 { duration, .. } => *duration,
        _ => 0,
    }
}

/// Process one decoded request against one device, producing the datagrams to send back.
///
/// `header` is the already-decoded fixed header of the incoming packet; `request` is `None`
/// when the payload type wasn't decodable at all (unknown message type), in which case only
/// the unhandled-packet and ack paths are reachable.
pub fn process_request(
    device: &Device,
    state: &mut crate::device::DeviceState,
    header: &Header,
    request: Option<&Message>,
    config: &ScenarioConfig,
    observers: &[&dyn StateChangeObserver],
    rng: &mut impl Rng,
) -> Vec<OutgoingDatagram> {
    let mut out = Vec::new();

    if header.target != 0 && Serial::from_target(header.target) != device.serial {
        return out;
    }

    let drop_probability = config.drop_packets.get(&header.pkt_type).copied().unwrap_or(0.0);
    if drop_probability > 0.0 && rng.gen_range(0.0..1.0) < drop_probability {
        return out;
    }

    if let Some(fw) = config.firmware_version {
        state.firmware_version = fw;
    }

    // The ack is targetable by a scenario like any other response (type 45). Untargeted, it's
    // emitted unconditionally ahead of dispatch; targeted, it's folded into the response list so
    // the same drop/delay/malformed/partial-response filters apply to it.
    let ack_targeted = config.drop_packets.contains_key(&ACK_PKT_TYPE) || config.response_delays.contains_key(&ACK_PKT_TYPE);
    if header.ack_required && !ack_targeted {
        let ack = Message::Acknowledgement { seq: header.sequence };
        if let Some(bytes) = encode_response(device, header, &ack) {
            out.push(OutgoingDatagram { bytes, delay: Duration::ZERO });
        }
    }

    let entry = handlers::registry().get(&header.pkt_type);
    let supported = entry.map(|e| (e.capability)(&device.capabilities)).unwrap_or(false);

    let mut responses = if let (Some(entry), Some(request)) = (entry, request) {
        if supported {
            if entry.always_respond || header.res_required {
                let mut ctx = HandlerContext {
                    request,
                    state,
                    capabilities: &device.capabilities,
                    vendor: device.vendor,
                    product: device.product,
                    uptime_nanos: device.uptime_nanos(),
                    now_unix_nanos: device.clock.now_unix_nanos(),
                    port: device.port(),
                };
                let responses = (entry.handler)(&mut ctx);
                let duration_ms = request_duration_ms(request);
                for observer in observers {
                    observer.on_state_changed(device.serial, header.pkt_type, duration_ms);
                }
                responses
            } else {
                // Set-style request with res_required unset: apply the mutation but report
                // nothing beyond the ack already queued above.
                let mut ctx = HandlerContext {
                    request,
                    state,
                    capabilities: &device.capabilities,
                    vendor: device.vendor,
                    product: device.product,
                    uptime_nanos: device.uptime_nanos(),
                    now_unix_nanos: device.clock.now_unix_nanos(),
                    port: device.port(),
                };
                (entry.handler)(&mut ctx);
                let duration_ms = request_duration_ms(request);
                for observer in observers {
                    observer.on_state_changed(device.serial, header.pkt_type, duration_ms);
                }
                Vec::new()
            }
        } else if config.send_unhandled {
            vec![Message::StateUnhandled { unhandled_type: header.pkt_type }]
        } else {
            Vec::new()
        }
    } else if config.send_unhandled {
        vec![Message::StateUnhandled { unhandled_type: header.pkt_type }]
    } else {
        Vec::new()
    };

    if header.ack_required && ack_targeted {
        let ack_drop_probability = config.drop_packets.get(&ACK_PKT_TYPE).copied().unwrap_or(0.0);
        if ack_drop_probability <= 0.0 || rng.gen_range(0.0..1.0) >= ack_drop_probability {
            responses.insert(0, Message::Acknowledgement { seq: header.sequence });
        }
    }

    if config.partial_responses.contains(&header.pkt_type) && responses.len() > 1 {
        let keep = rng.gen_range(1..responses.len());
        responses.truncate(keep);
    }

    for response in &mut responses {
        let response_type = response.get_num();
        if config.invalid_field_values.contains(&response_type) {
            apply_invalid_field_values(response);
        }
    }

    for response in &responses {
        let response_type = response.get_num();
        let delay = Duration::from_millis(config.response_delays.get(&response_type).copied().unwrap_or(0));
        if config.malformed_packets.contains(&response_type) {
            if let Some(bytes) = encode_malformed(device, header, response) {
                out.push(OutgoingDatagram { bytes, delay });
            }
        } else if let Some(bytes) = encode_response(device, header, response) {
            out.push(OutgoingDatagram { bytes, delay });
        }
    }

    out
}

fn encode_response(device: &Device, header: &Header, message: &Message) -> Option<Vec<u8>> {
    let options = BuildOptions {
        target: Some(device.serial.as_target()),
        ack_required: false,
        res_required: false,
        sequence: header.sequence,
        source: header.source,
    };
    let raw = RawMessage::build(&options, message.clone()).ok()?;
    raw.pack().ok()
}

/// Build a response datagram whose payload has been replaced with the malformed marker byte,
/// keeping the header (and hence declared `size`) consistent with a real response of this type.
fn encode_malformed(device: &Device, header: &Header, message: &Message) -> Option<Vec<u8>> {
    let mut bytes = encode_response(device, header, message)?;
    let payload_start = lifx_protocol::HEADER_SIZE;
    for byte in bytes.iter_mut().skip(payload_start) {
        *byte = MALFORMED_MARKER;
    }
    Some(bytes)
}

/// Push numeric/dimension fields in a response to extreme values. Enum-backed fields are left
/// alone since the wire format has no room to signal an invalid discriminant without corrupting
/// adjacent fields.
fn apply_invalid_field_values(message: &mut Message) {
    match message {
        Message::StateService { port, .. } => *port = u32::MAX,
        Message::StatePower { level } => *level = u16::MAX,
        Message::LightStatePower { level } => *level = u16::MAX,
        Message::LightStateInfrared { brightness } => *brightness = u16::MAX,
        Message::StateInfo { time, uptime, downtime } => {
            *time = u64::MAX;
            *uptime = u64::MAX;
            *downtime = u64::MAX;
        }
        Message::StateHostInfo { tx, rx, .. } => {
            *tx = u32::MAX;
            *rx = u32::MAX;
        }
        Message::StateVersion { vendor, product, .. } => {
            *vendor = u32::MAX;
            *product = u32::MAX;
        }
        Message::StateZone { count, index, .. } => {
            *count = 0;
            *index = 0;
        }
        Message::StateMultiZone { count, index, .. } => {
            *count = 0;
            *index = 0;
        }
        Message::StateExtendedColorZones {
            zones_count,
            zone_index,
            colors_count,
            ..
        } => {
            *zones_count = 0;
            *zone_index = 0;
            *colors_count = 0;
        }
        Message::StateDeviceChain {
            tile_devices,
            tile_devices_count,
            ..
        } => {
            *tile_devices_count = 0;
            for tile in tile_devices.iter_mut() {
                tile.width = 0;
                tile.height = 0;
            }
        }
        Message::State64 { rect, .. } => {
            rect.width = 0;
        }
        Message::RelayStatePower { level, .. } => *level = u16::MAX,
        Message::StateMultiZoneEffect { speed, duration, .. } => {
            *speed = u32::MAX;
            *duration = u64::MAX;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::serial::Serial;
    use lifx_protocol::decode_header;
    use std::sync::Arc;

    fn make_device(product: u32) -> Device {
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        Device::new(
            Serial([1, 2, 3, 4, 5, 6]),
            1,
            product,
            lifx_protocol::LifxString::new(std::ffi::CStr::from_bytes_with_nul(b"\0").unwrap()),
            clock,
        )
        .unwrap()
    }

    fn request_header(pkt_type: u16, ack_required: bool, res_required: bool) -> Header {
        Header {
            size: 36,
            origin: 0,
            tagged: false,
            addressable: true,
            protocol: 1024,
            source: 42,
            target: 0,
            ack_required,
            res_required,
            sequence: 7,
            pkt_type,
        }
    }

    #[test]
    fn get_power_produces_one_response() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_POWER, false, true);
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetPower),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        let decoded = decode_header(&out[0].bytes).unwrap();
        assert_eq!(decoded.pkt_type, 22); // StatePower
    }

    #[test]
    fn ack_required_produces_ack_before_dispatch_response() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::SET_LABEL, true, true);
        let request = Message::SetLabel {
            label: lifx_protocol::LifxString::new(
                std::ffi::CStr::from_bytes_with_nul(b"kitchen\0").unwrap(),
            ),
        };
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&request),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(decode_header(&out[0].bytes).unwrap().pkt_type, 45); // Acknowledgement
        assert_eq!(decode_header(&out[1].bytes).unwrap().pkt_type, 25); // StateLabel
    }

    #[test]
    fn unsupported_capability_sends_nothing_without_send_unhandled() {
        let device = make_device(1); // color bulb, no multizone
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_COLOR_ZONES, false, true);
        let request = Message::GetColorZones { start_index: 0, end_index: 7 };
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&request),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn send_unhandled_reports_the_unsupported_type() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_COLOR_ZONES, false, true);
        let request = Message::GetColorZones { start_index: 0, end_index: 7 };
        let config = ScenarioConfig {
            send_unhandled: true,
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        let out = process_request(&device, &mut state, &header, Some(&request), &config, &[], &mut rng);
        assert_eq!(out.len(), 1);
        assert_eq!(decode_header(&out[0].bytes).unwrap().pkt_type, 223);
    }

    #[test]
    fn set_style_request_without_res_required_only_acks() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::SET_LABEL, true, false);
        let request = Message::SetLabel {
            label: lifx_protocol::LifxString::new(
                std::ffi::CStr::from_bytes_with_nul(b"kitchen\0").unwrap(),
            ),
        };
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&request),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(decode_header(&out[0].bytes).unwrap().pkt_type, 45); // Acknowledgement only
    }

    #[test]
    fn packet_targeted_at_another_serial_is_ignored() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let mut header = request_header(handlers::pkt::GET_POWER, false, true);
        header.target = Serial([9, 9, 9, 9, 9, 9]).as_target();
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetPower),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn get_service_reports_the_devices_port() {
        let device = make_device(1);
        device.set_port(12345);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_SERVICE, false, true);
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetService),
            &ScenarioConfig::default(),
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        let raw = lifx_protocol::RawMessage::unpack(&out[0].bytes).unwrap();
        match Message::from_raw(&raw).unwrap() {
            Message::StateService { port, .. } => assert_eq!(port, 12345),
            other => panic!("expected StateService, got {other:?}"),
        }
    }

    #[test]
    fn dropped_packet_suppresses_even_the_ack() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_POWER, true, true);
        let mut config = ScenarioConfig::default();
        config.drop_packets.insert(handlers::pkt::GET_POWER, 1.0);
        let mut rng = rand::thread_rng();
        let out = process_request(&device, &mut state, &header, None, &config, &[], &mut rng);
        assert!(out.is_empty());
    }

    #[test]
    fn ack_targeted_by_drop_packets_is_dropped_without_suppressing_the_response() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_POWER, true, true);
        let mut config = ScenarioConfig::default();
        config.drop_packets.insert(ACK_PKT_TYPE, 1.0);
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetPower),
            &config,
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(decode_header(&out[0].bytes).unwrap().pkt_type, 22); // StatePower, ack dropped
    }

    #[test]
    fn ack_targeted_by_response_delays_is_folded_and_delayed() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_POWER, true, true);
        let mut config = ScenarioConfig::default();
        config.response_delays.insert(ACK_PKT_TYPE, 250);
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetPower),
            &config,
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(decode_header(&out[0].bytes).unwrap().pkt_type, 45); // Acknowledgement
        assert_eq!(out[0].delay, Duration::from_millis(250));
        assert_eq!(decode_header(&out[1].bytes).unwrap().pkt_type, 22); // StatePower
        assert_eq!(out[1].delay, Duration::ZERO);
    }

    #[test]
    fn response_delays_apply_per_packet_type() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_POWER, false, true);
        let mut config = ScenarioConfig::default();
        config.response_delays.insert(22, 100); // StatePower
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetPower),
            &config,
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delay, Duration::from_millis(100));
    }

    #[test]
    fn firmware_version_override_is_applied_before_dispatch() {
        let device = make_device(1);
        let mut state = device.state.try_write().unwrap();
        let header = request_header(handlers::pkt::GET_HOST_FIRMWARE, false, true);
        let config = ScenarioConfig {
            firmware_version: Some((9, 9)),
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        let out = process_request(
            &device,
            &mut state,
            &header,
            Some(&Message::GetHostFirmware),
            &config,
            &[],
            &mut rng,
        );
        assert_eq!(out.len(), 1);
        let raw = lifx_protocol::RawMessage::unpack(&out[0].bytes).unwrap();
        match Message::from_raw(&raw).unwrap() {
            Message::StateHostFirmware { version_major, version_minor, .. } => {
                assert_eq!((version_major, version_minor), (9, 9));
            }
            other => panic!("expected StateHostFirmware, got {other:?}"),
        }
    }
}
