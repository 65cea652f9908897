//! The packet handler registry: a static lookup table from request packet type to the pure
//! function that answers it, plus the capability gate each entry is checked against before the
//! engine ever calls the handler.
//!
//! Handlers are deliberately "pure" in the sense the engine's concurrency model requires: given
//! a request and a mutable view of device state, they return the full response list and mutate
//! state synchronously, with no `.await` point anywhere in this module.

use std::collections::HashMap;
use std::sync::OnceLock;

use lifx_protocol::{
    ApplicationRequest, HSBK, LastHevCycleResult, Message, MultiZoneEffectType, PowerLevel,
    Service, TileBufferRect, TileDevice,
};

use crate::capability::Capabilities;
use crate::device::DeviceState;

/// Packet type numbers, mirrored from the doc comments on [lifx_protocol::Message] so the
/// registry can be keyed before a [Message] value exists.
pub mod pkt {
    pub const GET_SERVICE: u16 = 2;
    pub const GET_HOST_INFO: u16 = 12;
    pub const GET_HOST_FIRMWARE: u16 = 14;
    pub const GET_WIFI_INFO: u16 = 16;
    pub const GET_WIFI_FIRMWARE: u16 = 18;
    pub const GET_POWER: u16 = 20;
    pub const SET_POWER: u16 = 21;
    pub const GET_LABEL: u16 = 23;
    pub const SET_LABEL: u16 = 24;
    pub const GET_VERSION: u16 = 32;
    pub const GET_INFO: u16 = 34;
    pub const GET_LOCATION: u16 = 48;
    pub const SET_LOCATION: u16 = 49;
    pub const GET_GROUP: u16 = 51;
    pub const SET_GROUP: u16 = 52;
    pub const ECHO_REQUEST: u16 = 58;
    pub const LIGHT_GET: u16 = 101;
    pub const LIGHT_SET_COLOR: u16 = 102;
    pub const SET_WAVEFORM: u16 = 103;
    pub const LIGHT_GET_POWER: u16 = 116;
    pub const LIGHT_SET_POWER: u16 = 117;
    pub const SET_WAVEFORM_OPTIONAL: u16 = 119;
    pub const LIGHT_GET_INFRARED: u16 = 120;
    pub const LIGHT_SET_INFRARED: u16 = 122;
    pub const LIGHT_GET_HEV_CYCLE: u16 = 142;
    pub const LIGHT_SET_HEV_CYCLE: u16 = 143;
    pub const LIGHT_GET_HEV_CYCLE_CONFIGURATION: u16 = 145;
    pub const LIGHT_SET_HEV_CYCLE_CONFIGURATION: u16 = 146;
    pub const LIGHT_GET_LAST_HEV_CYCLE_RESULT: u16 = 148;
    pub const SET_COLOR_ZONES: u16 = 501;
    pub const GET_COLOR_ZONES: u16 = 502;
    pub const GET_MULTI_ZONE_EFFECT: u16 = 507;
    pub const SET_EXTENDED_COLOR_ZONES: u16 = 510;
    pub const GET_EXTENDED_COLOR_ZONE: u16 = 511;
    pub const GET_DEVICE_CHAIN: u16 = 701;
    pub const SET_USER_POSITION: u16 = 703;
    pub const GET64: u16 = 707;
    pub const SET64: u16 = 715;
    pub const RELAY_GET_POWER: u16 = 816;
    pub const RELAY_SET_POWER: u16 = 817;
}

/// What a handler needs from the engine to answer one request.
pub struct HandlerContext<'a> {
    pub request: &'a Message,
    pub state: &'a mut DeviceState,
    pub capabilities: &'a Capabilities,
    pub vendor: u32,
    pub product: u32,
    pub uptime_nanos: u64,
    pub now_unix_nanos: u64,
    pub port: u16,
}

pub type HandlerFn = fn(&mut HandlerContext<'_>) -> Vec<Message>;

pub struct HandlerEntry {
    pub capability: fn(&Capabilities) -> bool,
    pub handler: HandlerFn,
    /// `Get*`-style requests respond unconditionally; `Set*`-style requests only respond when
    /// the request's `res_required` flag is set.
    pub always_respond: bool,
}

fn always(_: &Capabilities) -> bool {
    true
}
fn needs_color(c: &Capabilities) -> bool {
    c.color
}
fn needs_infrared(c: &Capabilities) -> bool {
    c.infrared
}
fn needs_multizone(c: &Capabilities) -> bool {
    c.multizone
}
fn needs_extended_multizone(c: &Capabilities) -> bool {
    c.extended_multizone
}
fn needs_chain(c: &Capabilities) -> bool {
    c.chain
}
fn needs_chain_or_matrix(c: &Capabilities) -> bool {
    c.chain || c.matrix
}
fn needs_hev(c: &Capabilities) -> bool {
    c.hev
}
fn needs_relays(c: &Capabilities) -> bool {
    c.relays
}

/// Build (once) the full request-type -> handler table.
pub fn registry() -> &'static HashMap<u16, HandlerEntry> {
    static REGISTRY: OnceLock<HashMap<u16, HandlerEntry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<u16, HandlerEntry> = HashMap::new();
        let mut add = |typ: u16,
                       capability: fn(&Capabilities) -> bool,
                       handler: HandlerFn,
                       always_respond: bool| {
            m.insert(
                typ,
                HandlerEntry {
                    capability,
                    handler,
                    always_respond,
                },
            );
        };

        add(pkt::GET_SERVICE, always, get_service, true);
        add(pkt::GET_HOST_INFO, always, get_host_info, true);
        add(pkt::GET_HOST_FIRMWARE, always, get_host_firmware, true);
        add(pkt::GET_WIFI_INFO, always, get_wifi_info, true);
        add(pkt::GET_WIFI_FIRMWARE, always, get_wifi_firmware, true);
        add(pkt::GET_POWER, always, get_power, true);
        add(pkt::SET_POWER, always, set_power, false);
        add(pkt::GET_LABEL, always, get_label, true);
        add(pkt::SET_LABEL, always, set_label, false);
        add(pkt::GET_VERSION, always, get_version, true);
        add(pkt::GET_INFO, always, get_info, true);
        add(pkt::GET_LOCATION, always, get_location, true);
        add(pkt::SET_LOCATION, always, set_location, false);
        add(pkt::GET_GROUP, always, get_group, true);
        add(pkt::SET_GROUP, always, set_group, false);
        add(pkt::ECHO_REQUEST, always, echo_request, true);

        add(pkt::LIGHT_GET, needs_color, light_get, true);
        add(pkt::LIGHT_SET_COLOR, needs_color, light_set_color, false);
        add(pkt::SET_WAVEFORM, needs_color, set_waveform, false);
        add(pkt::SET_WAVEFORM_OPTIONAL, needs_color, set_waveform_optional, false);
        add(pkt::LIGHT_GET_POWER, needs_color, light_get_power, true);
        add(pkt::LIGHT_SET_POWER, needs_color, light_set_power, false);

        add(pkt::LIGHT_GET_INFRARED, needs_infrared, light_get_infrared, true);
        add(pkt::LIGHT_SET_INFRARED, needs_infrared, light_set_infrared, false);

        add(pkt::LIGHT_GET_HEV_CYCLE, needs_hev, light_get_hev_cycle, true);
        add(pkt::LIGHT_SET_HEV_CYCLE, needs_hev, light_set_hev_cycle, false);
        add(
            pkt::LIGHT_GET_HEV_CYCLE_CONFIGURATION,
            needs_hev,
            light_get_hev_cycle_configuration,
            true,
        );
        add(
            pkt::LIGHT_SET_HEV_CYCLE_CONFIGURATION,
            needs_hev,
            light_set_hev_cycle_configuration,
            false,
        );
        add(
            pkt::LIGHT_GET_LAST_HEV_CYCLE_RESULT,
            needs_hev,
            light_get_last_hev_cycle_result,
            true,
        );

        add(pkt::SET_COLOR_ZONES, needs_multizone, set_color_zones, false);
        add(pkt::GET_COLOR_ZONES, needs_multizone, get_color_zones, true);
        add(pkt::GET_MULTI_ZONE_EFFECT, needs_multizone, get_multizone_effect, true);
        add(
            pkt::SET_EXTENDED_COLOR_ZONES,
            needs_extended_multizone,
            set_extended_color_zones,
            false,
        );
        add(
            pkt::GET_EXTENDED_COLOR_ZONE,
            needs_extended_multizone,
            get_extended_color_zones,
            true,
        );

        add(pkt::GET_DEVICE_CHAIN, needs_chain, get_device_chain, true);
        add(pkt::SET_USER_POSITION, needs_chain, set_user_position, false);
        add(pkt::GET64, needs_chain_or_matrix, get64, true);
        add(pkt::SET64, needs_chain_or_matrix, set64, false);

        add(pkt::RELAY_GET_POWER, needs_relays, relay_get_power, true);
        add(pkt::RELAY_SET_POWER, needs_relays, relay_set_power, false);

        m
    })
}

fn zero_hsbk() -> HSBK {
    HSBK {
        hue: 0,
        saturation: 0,
        brightness: 0,
        kelvin: 3500,
    }
}

// --- device info -----------------------------------------------------------

fn get_service(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateService {
        service: Service::UDP,
        port: ctx.port as u32,
    }]
}

fn get_host_info(_ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateHostInfo {
        #[cfg(not(fuzzing))]
        signal: 0.0,
        #[cfg(fuzzing)]
        signal: 0.0f32.into(),
        tx: 0,
        rx: 0,
        reserved: 0,
    }]
}

fn get_host_firmware(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (major, minor) = ctx.state.firmware_version;
    vec![Message::StateHostFirmware {
        build: 0,
        reserved: 0,
        version_minor: minor,
        version_major: major,
    }]
}

fn get_wifi_info(_ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateWifiInfo {
        #[cfg(not(fuzzing))]
        signal: 0.0,
        #[cfg(fuzzing)]
        signal: 0.0f32.into(),
        reserved6: 0,
        reserved7: 0,
        reserved: 0,
    }]
}

fn get_wifi_firmware(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (major, minor) = ctx.state.firmware_version;
    vec![Message::StateWifiFirmware {
        build: 0,
        reserved: 0,
        version_minor: minor,
        version_major: major,
    }]
}

fn get_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StatePower {
        level: if ctx.state.power { PowerLevel::Enabled as u16 } else { PowerLevel::Standby as u16 },
    }]
}

fn set_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetPower { level } = ctx.request {
        ctx.state.power = *level == PowerLevel::Enabled;
    }
    get_power(ctx)
}

fn get_label(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateLabel {
        label: ctx.state.label.clone(),
    }]
}

fn set_label(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetLabel { label } = ctx.request {
        ctx.state.label = label.clone();
    }
    get_label(ctx)
}

fn get_version(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateVersion {
        vendor: ctx.vendor,
        product: ctx.product,
        reserved: 0,
    }]
}

fn get_info(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::StateInfo {
        time: ctx.now_unix_nanos,
        uptime: ctx.uptime_nanos,
        downtime: 0,
    }]
}

fn get_location(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (location, label, updated_at) = ctx.state.location.clone();
    vec![Message::StateLocation {
        location,
        label,
        updated_at,
    }]
}

fn set_location(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetLocation {
        location,
        label,
        updated_at,
    } = ctx.request
    {
        if *updated_at >= ctx.state.location.2 {
            ctx.state.location = (location.clone(), label.clone(), *updated_at);
        }
    }
    get_location(ctx)
}

fn get_group(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (group, label, updated_at) = ctx.state.group.clone();
    vec![Message::StateGroup {
        group,
        label,
        updated_at,
    }]
}

fn set_group(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetGroup {
        group,
        label,
        updated_at,
    } = ctx.request
    {
        if *updated_at >= ctx.state.group.2 {
            ctx.state.group = (group.clone(), label.clone(), *updated_at);
        }
    }
    get_group(ctx)
}

fn echo_request(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::EchoRequest { payload } = ctx.request {
        vec![Message::EchoResponse { payload: *payload }]
    } else {
        Vec::new()
    }
}

// --- light -------------------------------------------------------------

fn light_state(ctx: &HandlerContext<'_>) -> Message {
    Message::LightState {
        color: ctx.state.color,
        reserved: 0,
        power: if ctx.state.power { PowerLevel::Enabled as u16 } else { PowerLevel::Standby as u16 },
        label: ctx.state.label.clone(),
        reserved2: 0,
    }
}

fn light_get(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![light_state(ctx)]
}

fn light_set_color(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::LightSetColor { color, .. } = ctx.request {
        ctx.state.color = *color;
    }
    vec![light_state(ctx)]
}

fn set_waveform(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetWaveform { color, .. } = ctx.request {
        ctx.state.color = *color;
    }
    vec![light_state(ctx)]
}

fn set_waveform_optional(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetWaveformOptional {
        color,
        set_hue,
        set_saturation,
        set_brightness,
        set_kelvin,
        ..
    } = ctx.request
    {
        let mut next = ctx.state.color;
        if *set_hue {
            next.hue = color.hue;
        }
        if *set_saturation {
            next.saturation = color.saturation;
        }
        if *set_brightness {
            next.brightness = color.brightness;
        }
        if *set_kelvin {
            next.kelvin = color.kelvin;
        }
        ctx.state.color = next;
    }
    vec![light_state(ctx)]
}

fn light_get_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::LightStatePower {
        level: if ctx.state.power { PowerLevel::Enabled as u16 } else { PowerLevel::Standby as u16 },
    }]
}

fn light_set_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::LightSetPower { level, .. } = ctx.request {
        ctx.state.power = *level != 0;
    }
    light_get_power(ctx)
}

fn light_get_infrared(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    vec![Message::LightStateInfrared {
        brightness: ctx.state.infrared_brightness,
    }]
}

fn light_set_infrared(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::LightSetInfrared { brightness } = ctx.request {
        ctx.state.infrared_brightness = *brightness;
    }
    light_get_infrared(ctx)
}

// --- hev -----------------------------------------------------------------

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Whether a HEV cycle is still running, and the seconds remaining, derived purely from the
/// stored end timestamp and the current clock reading (no explicit tick updates this).
fn hev_running_and_remaining(hev: &crate::device::HevState, now_unix_nanos: u64) -> (bool, u32) {
    match hev.cycle_end_unix_nanos {
        Some(end) if end > now_unix_nanos => {
            let remaining_secs = (end - now_unix_nanos).div_ceil(NANOS_PER_SEC);
            (true, remaining_secs.min(hev.duration_secs as u64) as u32)
        }
        _ => (false, 0),
    }
}

fn light_get_hev_cycle(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (_, remaining) = hev_running_and_remaining(&ctx.state.hev, ctx.now_unix_nanos);
    vec![Message::LightStateHevCycle {
        duration: ctx.state.hev.duration_secs,
        remaining,
        last_power: ctx.state.hev.last_power,
    }]
}

fn light_set_hev_cycle(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::LightSetHevCycle { enable, duration } = ctx.request {
        let now = ctx.now_unix_nanos;
        let hev = &mut ctx.state.hev;
        if *enable {
            let effective = if *duration == 0 {
                hev.default_duration_secs
            } else {
                *duration
            };
            hev.duration_secs = effective;
            hev.cycle_end_unix_nanos = Some(now + effective as u64 * NANOS_PER_SEC);
            hev.last_power = ctx.state.power;
            hev.last_result = LastHevCycleResult::Busy;
        } else {
            hev.cycle_end_unix_nanos = None;
            hev.last_result = LastHevCycleResult::InterruptedByLan;
        }
    }
    light_get_hev_cycle(ctx)
}

fn light_get_hev_cycle_configuration(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let hev = &ctx.state.hev;
    vec![Message::LightStateHevCycleConfiguration {
        indication: hev.indication,
        duration: hev.default_duration_secs,
    }]
}

fn light_set_hev_cycle_configuration(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::LightSetHevCycleConfiguration {
        indication,
        duration,
    } = ctx.request
    {
        ctx.state.hev.indication = *indication;
        ctx.state.hev.default_duration_secs = *duration;
    }
    light_get_hev_cycle_configuration(ctx)
}

fn light_get_last_hev_cycle_result(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let (running, _) = hev_running_and_remaining(&ctx.state.hev, ctx.now_unix_nanos);
    let result = if !running && matches!(ctx.state.hev.last_result, LastHevCycleResult::Busy) {
        LastHevCycleResult::Success
    } else {
        ctx.state.hev.last_result
    };
    vec![Message::LightStateLastHevCycleResult { result }]
}

// --- multizone -------------------------------------------------------------

fn set_color_zones(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetColorZones {
        start_index,
        end_index,
        color,
        apply,
        ..
    } = ctx.request
    {
        if !matches!(apply, ApplicationRequest::ApplyOnly) {
            let start = *start_index as usize;
            let end = (*end_index as usize).min(ctx.state.zones.len().saturating_sub(1));
            for zone in ctx.state.zones.iter_mut().take(end + 1).skip(start) {
                *zone = *color;
            }
        }
    }
    let last = (ctx.state.zones.len().max(1) - 1) as u8;
    get_color_zones_response(&*ctx, 0, last)
}

fn get_color_zones(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::GetColorZones {
        start_index,
        end_index,
    } = ctx.request
    {
        get_color_zones_response(ctx, *start_index, *end_index)
    } else {
        Vec::new()
    }
}

fn get_color_zones_response(ctx: &HandlerContext<'_>, start_index: u8, end_index: u8) -> Vec<Message> {
    let zones = &ctx.state.zones;
    let count = zones.len() as u8;
    if zones.is_empty() {
        return Vec::new();
    }
    if start_index == end_index {
        let index = start_index.min(count - 1);
        return vec![Message::StateZone {
            count,
            index,
            color: zones[index as usize],
        }];
    }

    let mut responses = Vec::new();
    let mut index = start_index;
    while index <= end_index {
        let mut colors = [zero_hsbk(); 8];
        for (offset, slot) in colors.iter_mut().enumerate() {
            let zone_idx = (index as usize + offset).min(zones.len() - 1);
            *slot = zones[zone_idx];
        }
        responses.push(Message::StateMultiZone {
            count,
            index,
            color0: colors[0],
            color1: colors[1],
            color2: colors[2],
            color3: colors[3],
            color4: colors[4],
            color5: colors[5],
            color6: colors[6],
            color7: colors[7],
        });
        index = match index.checked_add(8) {
            Some(next) => next,
            None => break,
        };
    }
    responses
}

fn get_multizone_effect(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let effect = &ctx.state.multizone_effect;
    vec![Message::StateMultiZoneEffect {
        instance_id: effect.instance_id,
        typ: effect.typ.unwrap_or(MultiZoneEffectType::Off),
        reserved: 0,
        speed: effect.speed_ms,
        duration: effect.duration_ns,
        reserved7: 0,
        reserved8: 0,
        parameters: effect.parameters,
    }]
}

fn set_extended_color_zones(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetExtendedColorZones {
        apply,
        zone_index,
        colors_count,
        colors,
        ..
    } = ctx.request
    {
        if !matches!(apply, ApplicationRequest::ApplyOnly) {
            let start = *zone_index as usize;
            let count = *colors_count as usize;
            for (slot, color) in ctx.state.zones.iter_mut().skip(start).take(count).zip(colors.iter()) {
                *slot = *color;
            }
        }
    }
    get_extended_color_zones(ctx)
}

/// Chunks the whole zone array into `ceil(zones.len() / 82)` packets, each carrying up to 82
/// zones starting at a multiple of 82.
fn get_extended_color_zones(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let zones = &ctx.state.zones;
    let total = zones.len();
    let chunk_count = total.div_ceil(82).max(1);
    let mut responses = Vec::with_capacity(chunk_count);
    for i in 0..chunk_count {
        let start = i * 82;
        let count = total.saturating_sub(start).min(82);
        let mut colors = [zero_hsbk(); 82];
        for (slot, zone) in colors.iter_mut().zip(zones[start..start + count].iter()) {
            *slot = *zone;
        }
        responses.push(Message::StateExtendedColorZones {
            zones_count: total as u16,
            zone_index: start as u16,
            colors_count: count as u8,
            colors,
        });
    }
    responses
}

// --- tile / matrix -----------------------------------------------------------

fn get_device_chain(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    let mut tile_devices = [default_tile_device(); 16];
    let count = ctx.state.tiles.len().min(16);
    for (slot, tile) in tile_devices.iter_mut().zip(ctx.state.tiles.iter()) {
        *slot = tile.device;
    }
    vec![Message::StateDeviceChain {
        start_index: 0,
        tile_devices,
        tile_devices_count: count as u8,
    }]
}

fn default_tile_device() -> TileDevice {
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
        device_version_vendor: 1,
        device_version_product: 0,
        device_version_reserved: 0,
        firmware_build: 0,
        reserved3: 0,
        firmware_version_minor: 0,
        firmware_version_major: 0,
        reserved4: 0,
    }
}

fn set_user_position(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::SetUserPosition {
        tile_index,
        user_x,
        user_y,
        ..
    } = ctx.request
    {
        if let Some(tile) = ctx.state.tiles.get_mut(*tile_index as usize) {
            #[cfg(not(fuzzing))]
            {
                tile.device.user_x = *user_x;
                tile.device.user_y = *user_y;
            }
            #[cfg(fuzzing)]
            {
                tile.device.user_x = user_x.clone();
                tile.device.user_y = user_y.clone();
            }
        }
    }
    Vec::new()
}

fn get64(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::Get64 {
        tile_index,
        length,
        rect,
    } = ctx.request
    {
        let total = ctx.state.tiles.len();
        if *tile_index as usize >= total {
            return Vec::new();
        }
        let available = (total - *tile_index as usize) as u8;
        let actual = (*length).min(available);
        let mut responses = Vec::with_capacity(actual as usize);
        for offset in 0..actual {
            let idx = *tile_index + offset;
            let tile = &ctx.state.tiles[idx as usize];
            let mut colors = [zero_hsbk(); 64];
            for (slot, zone) in colors.iter_mut().zip(tile.framebuffer.iter()) {
                *slot = *zone;
            }
            responses.push(Message::State64 {
                tile_index: idx,
                rect: *rect,
                colors,
            });
        }
        responses
    } else {
        Vec::new()
    }
}

fn set64(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::Set64 {
        tile_index,
        rect,
        colors,
        ..
    } = ctx.request
    {
        if let Some(tile) = ctx.state.tiles.get_mut(*tile_index as usize) {
            write_rect(&mut tile.framebuffer, tile.device.width as usize, rect, colors);
        }
    }
    Vec::new()
}

fn write_rect(framebuffer: &mut [HSBK], stride: usize, rect: &TileBufferRect, colors: &[HSBK; 64]) {
    if stride == 0 {
        return;
    }
    let width = rect.width as usize;
    if width == 0 {
        return;
    }
    for (i, color) in colors.iter().enumerate() {
        let col = rect.x as usize + i % width;
        let row = rect.y as usize + i / width;
        let dest = row * stride + col;
        if dest < framebuffer.len() {
            framebuffer[dest] = *color;
        }
    }
}

// --- relays ------------------------------------------------------------

fn relay_get_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::RelayGetPower { relay_index } = ctx.request {
        let level = ctx.state.relays.get(*relay_index as usize).copied().unwrap_or(0);
        vec![Message::RelayStatePower {
            relay_index: *relay_index,
            level,
        }]
    } else {
        Vec::new()
    }
}

fn relay_set_power(ctx: &mut HandlerContext<'_>) -> Vec<Message> {
    if let Message::RelaySetPower { relay_index, level } = ctx.request {
        if let Some(slot) = ctx.state.relays.get_mut(*relay_index as usize) {
            *slot = *level;
        }
        vec![Message::RelayStatePower {
            relay_index: *relay_index,
            level: *level,
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifx_protocol::LifxString;
    use std::ffi::CStr;

    fn state_with_zones(count: usize) -> DeviceState {
        DeviceState {
            label: LifxString::new(CStr::from_bytes_with_nul(b"\0").unwrap()),
            power: false,
            color: HSBK {
                hue: 0,
                saturation: 0,
                brightness: 0,
                kelvin: 3500,
            },
            infrared_brightness: 0,
            location: (lifx_protocol::LifxIdent([0; 16]), LifxString::new(CStr::from_bytes_with_nul(b"\0").unwrap()), 0),
            group: (lifx_protocol::LifxIdent([0; 16]), LifxString::new(CStr::from_bytes_with_nul(b"\0").unwrap()), 0),
            firmware_version: (3, 70),
            zones: vec![
                HSBK {
                    hue: 0,
                    saturation: 0,
                    brightness: 0,
                    kelvin: 3500,
                };
                count
            ],
            multizone_effect: Default::default(),
            tiles: Vec::new(),
            hev: Default::default(),
            relays: Vec::new(),
        }
    }

    fn chunk_shape(count: usize) -> Vec<(u16, u8, u16)> {
        let mut state = state_with_zones(count);
        let request = Message::GetExtendedColorZone;
        let mut ctx = HandlerContext {
            request: &request,
            state: &mut state,
            capabilities: &Capabilities::default(),
            vendor: 1,
            product: 32,
            uptime_nanos: 0,
            now_unix_nanos: 0,
            port: 56700,
        };
        get_extended_color_zones(&mut ctx)
            .into_iter()
            .map(|m| match m {
                Message::StateExtendedColorZones {
                    zones_count,
                    zone_index,
                    colors_count,
                    ..
                } => (zone_index, colors_count, zones_count),
                other => panic!("expected StateExtendedColorZones, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn exact_multiple_of_82_yields_one_full_packet() {
        assert_eq!(chunk_shape(82), vec![(0, 82, 82)]);
    }

    #[test]
    fn under_82_yields_one_partial_packet() {
        assert_eq!(chunk_shape(60), vec![(0, 60, 60)]);
    }

    #[test]
    fn over_82_yields_two_packets_with_the_remainder_in_the_second() {
        assert_eq!(chunk_shape(120), vec![(0, 82, 120), (82, 38, 120)]);
    }

    fn ctx_at<'a>(request: &'a Message, state: &'a mut DeviceState, now_unix_nanos: u64) -> HandlerContext<'a> {
        HandlerContext {
            request,
            state,
            capabilities: &Capabilities::default(),
            vendor: 1,
            product: 31,
            uptime_nanos: 0,
            now_unix_nanos,
            port: 56700,
        }
    }

    #[test]
    fn hev_cycle_reports_running_until_its_end_timestamp() {
        let mut state = state_with_zones(0);
        let start_request = Message::LightSetHevCycle { enable: true, duration: 10 };
        light_set_hev_cycle(&mut ctx_at(&start_request, &mut state, 0));

        let get_request = Message::LightGetHevCycle;
        match &light_get_hev_cycle(&mut ctx_at(&get_request, &mut state, 5_000_000_000))[0] {
            Message::LightStateHevCycle { remaining, .. } => assert_eq!(*remaining, 5),
            other => panic!("expected LightStateHevCycle, got {other:?}"),
        }

        // Past the 10-second end timestamp, the cycle has expired without any explicit tick.
        match &light_get_hev_cycle(&mut ctx_at(&get_request, &mut state, 11_000_000_000))[0] {
            Message::LightStateHevCycle { remaining, .. } => assert_eq!(*remaining, 0),
            other => panic!("expected LightStateHevCycle, got {other:?}"),
        }
    }

    #[test]
    fn hev_cycle_result_reports_success_once_it_expires_on_its_own() {
        let mut state = state_with_zones(0);
        let start_request = Message::LightSetHevCycle { enable: true, duration: 10 };
        light_set_hev_cycle(&mut ctx_at(&start_request, &mut state, 0));

        let result_request = Message::LightGetLastHevCycleResult;
        match &light_get_last_hev_cycle_result(&mut ctx_at(&result_request, &mut state, 11_000_000_000))[0] {
            Message::LightStateLastHevCycleResult { result } => {
                assert!(matches!(result, LastHevCycleResult::Success))
            }
            other => panic!("expected LightStateLastHevCycleResult, got {other:?}"),
        }
    }
}
