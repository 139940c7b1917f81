//! Configuration endpoints as plain route tables.
//!
//! Handlers never touch hardware themselves. They mutate the clock state they
//! are lent and record follow-up work in [`Effects`], which the orchestrator
//! applies once the poll has finished.

use chrono::NaiveDateTime;
use log::{info, warn};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::{
    config::{deserialize_hours, deserialize_number, ClockConfig, SUMMER_TZ_HOURS, WINTER_TZ_HOURS},
    connectivity::ConnectivityManager,
    hal::WifiRadio,
    time_sync::{is_dst, SyncState},
    types::{ClockStatus, ConnectionState, ProvisioningView, Rgb},
};

pub const CONTENT_JSON: &str = "application/json";
pub const CONTENT_TEXT: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            path: path.into(),
            body: body.into(),
        }
    }

    fn json<T: DeserializeOwned>(&self) -> Result<T, Response> {
        serde_json::from_slice(&self.body)
            .map_err(|err| Response::error(400, &format!("invalid request body: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    msg: &'a str,
}

impl Response {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_JSON,
                body,
            },
            Err(err) => Self::error(500, &err.to_string()),
        }
    }

    pub fn message(msg: &str) -> Self {
        Self::json(200, &MessageBody { msg })
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TEXT,
            body: body.into(),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_string(&ErrorBody { error: message })
            .unwrap_or_else(|_| String::from("{\"error\":\"internal\"}"));
        Self {
            status,
            content_type: CONTENT_JSON,
            body,
        }
    }
}

/// Work a handler asks for that has to happen outside the poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    pub persist: bool,
    pub redraw: bool,
    pub blank: bool,
    pub apply_brightness: bool,
    pub resync: bool,
    pub restart: bool,
}

pub struct RouteContext<'a> {
    pub config: &'a mut ClockConfig,
    pub light_allowed: &'a mut bool,
    pub effects: &'a mut Effects,
    pub connectivity: &'a mut ConnectivityManager,
    pub radio: &'a mut dyn WifiRadio,
    pub device_id: &'a str,
    pub sync: SyncState,
    pub local_now: NaiveDateTime,
}

pub type Handler = fn(&mut RouteContext<'_>, &Request, Option<&str>) -> Response;

pub struct Route {
    pub methods: &'static [Method],
    /// Literal path, or a prefix ending in `<action>` that captures one segment.
    pub pattern: &'static str,
    pub handler: Handler,
}

pub const PROVISIONING_ROUTES: &[Route] = &[
    Route {
        methods: &[Method::Get],
        pattern: "/",
        handler: visible_networks,
    },
    Route {
        methods: &[Method::Post],
        pattern: "/connect",
        handler: save_credential,
    },
];

pub const STATION_ROUTES: &[Route] = &[
    Route {
        methods: &[Method::Get],
        pattern: "/",
        handler: status,
    },
    Route {
        methods: &[Method::Post],
        pattern: "/controlColor",
        handler: set_color,
    },
    Route {
        methods: &[Method::Post],
        pattern: "/setTimeZone",
        handler: set_time_zone,
    },
    Route {
        methods: &[Method::Post],
        pattern: "/setBrightness",
        handler: set_brightness,
    },
    Route {
        methods: &[Method::Get, Method::Post],
        pattern: "/control/<action>",
        handler: control,
    },
];

/// The table served in `state`. Nothing is served while connecting or after
/// the radio was disabled.
pub fn routes_for(state: ConnectionState) -> &'static [Route] {
    match state {
        ConnectionState::AccessPointActive => PROVISIONING_ROUTES,
        ConnectionState::StationConnected => STATION_ROUTES,
        ConnectionState::Disconnected | ConnectionState::StationConnecting => &[],
    }
}

/// `Some(capture)` when `path` matches `pattern`. Query strings and a single
/// trailing slash are ignored.
fn match_path<'p>(pattern: &str, path: &'p str) -> Option<Option<&'p str>> {
    let path = path.split('?').next().unwrap_or(path);
    let path = match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    };

    match pattern.strip_suffix("<action>") {
        Some(prefix) => {
            let capture = path.strip_prefix(prefix)?;
            if capture.is_empty() || capture.contains('/') {
                None
            } else {
                Some(Some(capture))
            }
        }
        None if path == pattern => Some(None),
        None => None,
    }
}

pub fn dispatch(routes: &[Route], ctx: &mut RouteContext<'_>, request: &Request) -> Response {
    let mut path_known = false;
    for route in routes {
        let Some(capture) = match_path(route.pattern, &request.path) else {
            continue;
        };
        if !route.methods.contains(&request.method) {
            path_known = true;
            continue;
        }
        return (route.handler)(ctx, request, capture);
    }

    if path_known {
        Response::error(405, "method not allowed")
    } else {
        Response::error(404, "not found")
    }
}

fn yes() -> bool {
    true
}

fn full_percent() -> f64 {
    100.0
}

fn deserialize_channel<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_number(deserializer)?.round().clamp(0.0, 255.0) as u8)
}

fn deserialize_percent<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_number(deserializer)
}

#[derive(Debug, Deserialize)]
struct CredentialBody {
    ssid: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct ColorBody {
    #[serde(default, deserialize_with = "deserialize_channel")]
    r: u8,
    #[serde(default, deserialize_with = "deserialize_channel")]
    g: u8,
    #[serde(default, deserialize_with = "deserialize_channel")]
    b: u8,
}

#[derive(Debug, Deserialize)]
struct TimeZoneBody {
    #[serde(default, deserialize_with = "deserialize_hours")]
    tz: i32,
    #[serde(default = "yes")]
    auto_dst: bool,
}

#[derive(Debug, Deserialize)]
struct BrightnessBody {
    #[serde(default = "yes")]
    auto_brightness: bool,
    #[serde(default = "full_percent", deserialize_with = "deserialize_percent")]
    brightness: f64,
}

fn visible_networks(ctx: &mut RouteContext<'_>, _: &Request, _: Option<&str>) -> Response {
    let view = ProvisioningView {
        id: ctx.device_id.to_string(),
        networks: ctx.radio.scan(),
    };
    Response::json(200, &view)
}

fn save_credential(ctx: &mut RouteContext<'_>, request: &Request, _: Option<&str>) -> Response {
    let body: CredentialBody = match request.json() {
        Ok(body) => body,
        Err(response) => return response,
    };
    let ssid = body.ssid.trim();
    if ssid.is_empty() {
        return Response::error(400, "ssid must not be empty");
    }

    if ctx.config.add_credential(ssid, &body.password) {
        info!("stored credentials for `{ssid}`");
        ctx.effects.persist = true;
    } else {
        info!("credentials for `{ssid}` already stored");
    }
    ctx.effects.restart = true;
    Response::message("Credentials saved, restarting")
}

fn status(ctx: &mut RouteContext<'_>, _: &Request, _: Option<&str>) -> Response {
    let config = &*ctx.config;
    let view = ClockStatus {
        id: ctx.device_id.to_string(),
        hostname: ctx.connectivity.hostname().map(str::to_string),
        connection: ctx.connectivity.state().as_str(),
        color: config.color.to_hex(),
        tz: config.timezone_offset,
        auto_dst: config.auto_dst,
        dst_active: config.auto_dst && is_dst(ctx.local_now),
        auto_brightness: config.auto_brightness,
        brightness: config.brightness,
        light_allowed: *ctx.light_allowed,
        time_synced: ctx.sync.has_synced_once,
        last_sync_epoch: ctx.sync.last_sync_timestamp,
        local_time: ctx.local_now.format("%Y-%m-%d %H:%M:%S").to_string(),
        networks: config.ssids(),
    };
    Response::json(200, &view)
}

fn set_color(ctx: &mut RouteContext<'_>, request: &Request, _: Option<&str>) -> Response {
    let body: ColorBody = match request.json() {
        Ok(body) => body,
        Err(response) => return response,
    };

    let color = Rgb::new(body.r, body.g, body.b);
    if ctx.config.set_color(color) {
        ctx.effects.persist = true;
    }
    ctx.effects.redraw = true;
    Response::message("Color set")
}

fn set_time_zone(ctx: &mut RouteContext<'_>, request: &Request, _: Option<&str>) -> Response {
    let body: TimeZoneBody = match request.json() {
        Ok(body) => body,
        Err(response) => return response,
    };

    ctx.config.set_timezone(body.tz, body.auto_dst);
    ctx.effects.persist = true;
    ctx.effects.resync = true;
    Response::message("Timezone set")
}

fn set_brightness(ctx: &mut RouteContext<'_>, request: &Request, _: Option<&str>) -> Response {
    let body: BrightnessBody = match request.json() {
        Ok(body) => body,
        Err(response) => return response,
    };

    ctx.config
        .set_brightness(body.auto_brightness, body.brightness as f32);
    ctx.effects.persist = true;
    ctx.effects.apply_brightness = true;
    Response::message("Brightness set")
}

fn control(ctx: &mut RouteContext<'_>, _: &Request, action: Option<&str>) -> Response {
    let action = action.unwrap_or_default();
    match action {
        "light_on" => {
            *ctx.light_allowed = true;
            ctx.effects.redraw = true;
        }
        "light_off" => {
            *ctx.light_allowed = false;
            ctx.effects.blank = true;
        }
        "disable_wifi" => ctx.connectivity.request_disable(),
        "tz_summer" | "tz_winter" => {
            let hours = if action == "tz_summer" {
                SUMMER_TZ_HOURS
            } else {
                WINTER_TZ_HOURS
            };
            let auto_dst = ctx.config.auto_dst;
            ctx.config.set_timezone(hours, auto_dst);
            ctx.effects.persist = true;
            ctx.effects.resync = true;
        }
        _ => {
            warn!("unknown control action `{action}`");
            return Response::text(400, format!("Unknown action ({action})"));
        }
    }
    Response::text(200, format!("Action ({action}) performed"))
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::Value;

    use super::*;
    use crate::{error::ConnectError, hal::ApAddressing};

    struct ScanRadio;

    impl WifiRadio for ScanRadio {
        fn connect(&mut self, _: &str, _: &str, _: Duration) -> Result<(), ConnectError> {
            Ok(())
        }

        fn start_access_point(&mut self, _: &str, _: ApAddressing) -> Result<(), ConnectError> {
            Ok(())
        }

        fn scan(&mut self) -> Vec<String> {
            vec!["home".to_string(), "cafe".to_string()]
        }

        fn disable(&mut self) {}

        fn station_ip(&self) -> Option<Ipv4Addr> {
            None
        }

        fn access_point_ip(&self) -> Option<Ipv4Addr> {
            None
        }
    }

    struct Harness {
        config: ClockConfig,
        light_allowed: bool,
        effects: Effects,
        connectivity: ConnectivityManager,
        radio: ScanRadio,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: ClockConfig::default(),
                light_allowed: true,
                effects: Effects::default(),
                connectivity: ConnectivityManager::new("c0ffee"),
                radio: ScanRadio,
            }
        }

        fn send(&mut self, routes: &[Route], method: Method, path: &str, body: &str) -> Response {
            let mut ctx = RouteContext {
                config: &mut self.config,
                light_allowed: &mut self.light_allowed,
                effects: &mut self.effects,
                connectivity: &mut self.connectivity,
                radio: &mut self.radio,
                device_id: "c0ffee",
                sync: SyncState::default(),
                local_now: NaiveDate::from_ymd_opt(2024, 7, 1)
                    .unwrap()
                    .and_hms_opt(14, 27, 0)
                    .unwrap(),
            };
            dispatch(routes, &mut ctx, &Request::new(method, path, body))
        }
    }

    fn body(response: &Response) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn provisioning_index_lists_scanned_networks() {
        let mut harness = Harness::new();

        let response = harness.send(PROVISIONING_ROUTES, Method::Get, "/", "");

        assert_eq!(response.status, 200);
        assert_eq!(body(&response)["networks"], serde_json::json!(["home", "cafe"]));
        assert_eq!(body(&response)["id"], "c0ffee");
    }

    #[test]
    fn connect_stores_credential_and_restarts() {
        let mut harness = Harness::new();

        let response = harness.send(
            PROVISIONING_ROUTES,
            Method::Post,
            "/connect",
            r#"{"ssid": "home", "password": "secret"}"#,
        );

        assert_eq!(response.status, 200);
        assert_eq!(harness.config.ssids(), vec!["home"]);
        assert!(harness.effects.persist);
        assert!(harness.effects.restart);
    }

    #[test]
    fn connect_with_known_ssid_keeps_first_password() {
        let mut harness = Harness::new();
        harness.config.add_credential("home", "first");

        harness.send(
            PROVISIONING_ROUTES,
            Method::Post,
            "/connect",
            r#"{"ssid": "home", "password": "second"}"#,
        );

        assert_eq!(harness.config.credentials.len(), 1);
        assert_eq!(harness.config.credentials[0].password, "first");
        assert!(!harness.effects.persist);
        assert!(harness.effects.restart);
    }

    #[test]
    fn malformed_body_is_rejected_without_side_effects() {
        let mut harness = Harness::new();

        let response = harness.send(STATION_ROUTES, Method::Post, "/controlColor", "{nope");

        assert_eq!(response.status, 400);
        assert!(body(&response)["error"].is_string());
        assert_eq!(harness.effects, Effects::default());
    }

    #[test]
    fn status_never_echoes_passwords() {
        let mut harness = Harness::new();
        harness.config.add_credential("home", "hunter2");

        let response = harness.send(STATION_ROUTES, Method::Get, "/", "");

        assert_eq!(response.status, 200);
        assert!(!response.body.contains("hunter2"));
        let view = body(&response);
        assert_eq!(view["networks"], serde_json::json!(["home"]));
        assert_eq!(view["color"], "#ff0000");
        assert_eq!(view["dstActive"], true);
        assert_eq!(view["localTime"], "2024-07-01 14:27:00");
    }

    #[test]
    fn color_channels_are_clamped() {
        let mut harness = Harness::new();

        let response = harness.send(
            STATION_ROUTES,
            Method::Post,
            "/controlColor",
            r#"{"r": 300, "g": "12", "b": -4}"#,
        );

        assert_eq!(body(&response)["msg"], "Color set");
        assert_eq!(harness.config.color, Rgb::new(255, 12, 0));
        assert!(harness.effects.persist);
        assert!(harness.effects.redraw);
    }

    #[test]
    fn time_zone_accepts_string_and_requests_resync() {
        let mut harness = Harness::new();

        harness.send(
            STATION_ROUTES,
            Method::Post,
            "/setTimeZone",
            r#"{"tz": "3", "auto_dst": false}"#,
        );

        assert_eq!(harness.config.timezone_offset, 3);
        assert!(!harness.config.auto_dst);
        assert!(harness.effects.resync);
        assert!(harness.effects.persist);
    }

    #[test]
    fn brightness_from_settings_page_string() {
        let mut harness = Harness::new();

        harness.send(
            STATION_ROUTES,
            Method::Post,
            "/setBrightness",
            r#"{"auto_brightness": false, "brightness": "40"}"#,
        );

        assert!(!harness.config.auto_brightness);
        assert!((harness.config.brightness - 0.4).abs() < 1e-6);
        assert!(harness.effects.apply_brightness);
    }

    #[rstest]
    #[case(Method::Get, "/control/light_off")]
    #[case(Method::Post, "/control/light_off/")]
    fn control_accepts_both_methods_and_trailing_slash(#[case] method: Method, #[case] path: &str) {
        let mut harness = Harness::new();

        let response = harness.send(STATION_ROUTES, method, path, "");

        assert_eq!(response.body, "Action (light_off) performed");
        assert!(!harness.light_allowed);
        assert!(harness.effects.blank);
    }

    #[rstest]
    #[case("tz_summer", 2)]
    #[case("tz_winter", 1)]
    fn season_actions_set_offset(#[case] action: &str, #[case] hours: i32) {
        let mut harness = Harness::new();
        harness.config.timezone_offset = 5;

        harness.send(STATION_ROUTES, Method::Post, &format!("/control/{action}"), "");

        assert_eq!(harness.config.timezone_offset, hours);
        assert!(harness.effects.resync);
    }

    #[test]
    fn disable_wifi_is_only_queued() {
        let mut harness = Harness::new();

        harness.send(STATION_ROUTES, Method::Get, "/control/disable_wifi", "");

        assert!(harness.connectivity.disable_pending());
        assert_eq!(harness.effects, Effects::default());
    }

    #[test]
    fn unknown_action_has_no_side_effects() {
        let mut harness = Harness::new();
        let before = harness.config.clone();

        let response = harness.send(STATION_ROUTES, Method::Get, "/control/dance", "");

        assert_eq!(response.body, "Unknown action (dance)");
        assert_eq!(harness.config, before);
        assert_eq!(harness.effects, Effects::default());
        assert!(harness.light_allowed);
        assert!(!harness.connectivity.disable_pending());
    }

    #[rstest]
    #[case(Method::Get, "/connect", 404)]
    #[case(Method::Get, "/controlColor", 405)]
    #[case(Method::Post, "/nowhere", 404)]
    fn unmatched_requests(#[case] method: Method, #[case] path: &str, #[case] code: u16) {
        let mut harness = Harness::new();

        let response = harness.send(STATION_ROUTES, method, path, "");

        assert_eq!(response.status, code);
        assert!(body(&response)["error"].is_string());
    }

    #[test]
    fn tables_follow_connection_state() {
        assert_eq!(routes_for(ConnectionState::AccessPointActive).len(), 2);
        assert_eq!(routes_for(ConnectionState::StationConnected).len(), 5);
        assert!(routes_for(ConnectionState::Disconnected).is_empty());
    }
}
