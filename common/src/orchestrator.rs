//! The clock's main loop: boot once, then tick forever.

use chrono::Timelike;
use log::{debug, info, warn};

use crate::{
    brightness::{BrightnessController, FULL_BRIGHTNESS},
    config::ClockConfig,
    connectivity::ConnectivityManager,
    error::ClockError,
    hal::Devices,
    render::{render, LitSet, FILLER_DOTS, LED_COUNT},
    routes::{dispatch, routes_for, Effects, Request, RouteContext},
    scroll::ScrollText,
    time_sync::{SyncState, TimeSyncService},
    types::{ConnectionState, Rgb},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// A handler asked for a device restart, e.g. after new credentials.
    Restart,
}

pub struct Orchestrator {
    devices: Devices,
    device_id: String,
    config: ClockConfig,
    connectivity: ConnectivityManager,
    sync: TimeSyncService,
    brightness: BrightnessController,
    scroll: ScrollText,
    scroll_text: String,
    light_allowed: bool,
    dark: bool,
    last_rendered: Option<(u8, u8)>,
    applied_brightness: Option<f32>,
    reserved: LitSet,
}

impl Orchestrator {
    pub fn new(devices: Devices, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            devices,
            connectivity: ConnectivityManager::new(&device_id),
            device_id,
            config: ClockConfig::default(),
            sync: TimeSyncService::default(),
            brightness: BrightnessController::new(),
            scroll: ScrollText::default(),
            scroll_text: String::new(),
            light_allowed: true,
            dark: false,
            last_rendered: None,
            applied_brightness: None,
            reserved: LitSet::empty(),
        }
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connectivity.state()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.connectivity.hostname()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn is_scrolling(&self) -> bool {
        self.scroll.is_active()
    }

    pub fn light_allowed(&self) -> bool {
        self.light_allowed
    }

    /// Pixels the clock never blanks. Words that cover them are still drawn.
    pub fn reserve_pixels(&mut self, indices: &[u8]) {
        for index in indices {
            self.reserved.insert(*index);
        }
    }

    /// Hands the drivers back, e.g. to boot a fresh orchestrator after a
    /// restart request.
    pub fn into_devices(self) -> Devices {
        self.devices
    }

    pub fn boot(&mut self) -> Result<(), ClockError> {
        self.config = self.load_config();
        info!("config loaded: {} saved network(s)", self.config.credentials.len());

        // "Connecting" indicator while the radio comes up.
        for dot in FILLER_DOTS {
            self.devices.pixels.set(usize::from(dot), self.config.color);
        }
        self.devices.pixels.show()?;

        let state = self.connectivity.start(
            &self.config.credentials,
            self.devices.radio.as_mut(),
            self.devices.mdns.as_mut(),
            self.devices.diagnostics.as_mut(),
        );
        self.scroll_text = self.connectivity.display_address(self.devices.radio.as_ref());
        info!("boot finished in state {}, address {}", state.as_str(), self.scroll_text);

        self.write_lit(LitSet::empty(), Rgb::BLACK);
        self.devices.pixels.show()?;
        Ok(())
    }

    fn load_config(&mut self) -> ClockConfig {
        match self.devices.store.load() {
            Ok(Some(mut config)) => {
                config.sanitize();
                config
            }
            Ok(None) => {
                info!("no stored config, writing defaults");
                let config = ClockConfig::default();
                if let Err(err) = self.devices.store.save(&config) {
                    warn!("failed to write default config: {err}");
                }
                config
            }
            Err(err) => {
                warn!("failed to load config, using defaults: {err}");
                ClockConfig::default()
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Result<TickOutcome, ClockError> {
        if self.scroll.is_active() {
            self.scroll_step(now_ms)?;
        } else if self.light_allowed {
            self.show_time()?;
        } else if !self.dark {
            self.blank()?;
        }

        self.connectivity
            .apply_pending_disable(self.devices.radio.as_mut(), self.devices.server.as_mut());

        let mut effects = Effects::default();
        if self.connectivity.state() != ConnectionState::Disconnected {
            self.poll_server(&mut effects);
        }
        let outcome = self.apply_effects(effects)?;

        if self.connectivity.state() == ConnectionState::StationConnected
            && self.sync.is_due(self.devices.clock.now())
        {
            self.sync_time();
        }

        Ok(outcome)
    }

    fn scroll_step(&mut self, now_ms: u64) -> Result<(), ClockError> {
        let provisioning = self.connectivity.state() == ConnectionState::AccessPointActive;
        let color = if provisioning { Rgb::RED } else { Rgb::GREEN };

        if let Some(lit) = self.scroll.step(now_ms, &self.scroll_text, !provisioning) {
            if self.applied_brightness != Some(FULL_BRIGHTNESS) {
                self.devices.pixels.set_brightness(FULL_BRIGHTNESS);
                self.applied_brightness = Some(FULL_BRIGHTNESS);
            }
            self.write_lit(lit, color);
            self.devices.pixels.show()?;
        }

        if !self.scroll.is_active() {
            info!("address scroll finished");
            self.last_rendered = None;
        }
        Ok(())
    }

    /// Redraws only when the displayed minute moved, and pushes brightness
    /// only when the level changed.
    fn show_time(&mut self) -> Result<(), ClockError> {
        let now = self.devices.clock.now();
        let hour = now.hour() as u8;
        let minute = now.minute() as u8;
        let mut dirty = false;

        if self.last_rendered != Some((hour % 12, minute)) {
            let frame = render(hour, minute, self.config.color, self.config.phrasing);
            self.write_lit(frame.lit, frame.color);
            self.last_rendered = Some((hour % 12, minute));
            self.dark = false;
            dirty = true;
            debug!("rendered {hour:02}:{minute:02}");
        }

        let ambient = &mut self.devices.ambient;
        let level = self
            .brightness
            .current_level(&self.config, || ambient.read_raw());
        if self.applied_brightness != Some(level) {
            self.devices.pixels.set_brightness(level);
            self.applied_brightness = Some(level);
            dirty = true;
        }

        if dirty {
            self.devices.pixels.show()?;
        }
        Ok(())
    }

    fn blank(&mut self) -> Result<(), ClockError> {
        self.write_lit(LitSet::empty(), Rgb::BLACK);
        self.devices.pixels.show()?;
        self.dark = true;
        self.last_rendered = None;
        Ok(())
    }

    /// Lit indices get `color`, everything else that is not reserved goes dark.
    fn write_lit(&mut self, lit: LitSet, color: Rgb) {
        for index in 0..LED_COUNT {
            let Ok(id) = u8::try_from(index) else {
                break;
            };
            if lit.contains(id) {
                self.devices.pixels.set(index, color);
            } else if !self.reserved.contains(id) {
                self.devices.pixels.set(index, Rgb::BLACK);
            }
        }
    }

    fn poll_server(&mut self, effects: &mut Effects) {
        let Self {
            devices,
            device_id,
            config,
            connectivity,
            sync,
            light_allowed,
            ..
        } = self;
        let routes = routes_for(connectivity.state());
        let local_now = devices.clock.now();
        let sync_state = sync.state();
        let radio = &mut devices.radio;

        let mut handle = |request: &Request| {
            debug!("{:?} {}", request.method, request.path);
            let mut ctx = RouteContext {
                config: &mut *config,
                light_allowed: &mut *light_allowed,
                effects: &mut *effects,
                connectivity: &mut *connectivity,
                radio: radio.as_mut(),
                device_id: device_id.as_str(),
                sync: sync_state,
                local_now,
            };
            dispatch(routes, &mut ctx, request)
        };

        match devices.server.poll(&mut handle) {
            Ok(0) => {}
            Ok(handled) => debug!("handled {handled} request(s)"),
            Err(err) => {
                warn!("{err}");
                devices.diagnostics.append(&err.to_string());
            }
        }
    }

    fn apply_effects(&mut self, effects: Effects) -> Result<TickOutcome, ClockError> {
        if effects.persist {
            if let Err(err) = self.devices.store.save(&self.config) {
                warn!("failed to persist config: {err}");
            }
        }

        if effects.blank && !self.scroll.is_active() {
            self.blank()?;
        }

        if effects.redraw {
            self.last_rendered = None;
        }
        if effects.apply_brightness {
            self.applied_brightness = None;
        }
        if (effects.redraw || effects.apply_brightness)
            && self.light_allowed
            && !self.scroll.is_active()
        {
            self.show_time()?;
        }

        if effects.resync {
            if self.connectivity.state() == ConnectionState::StationConnected {
                self.sync_time();
            } else {
                info!("not connected, resync skipped");
            }
        }

        if effects.restart {
            info!("restart requested");
            return Ok(TickOutcome::Restart);
        }
        Ok(TickOutcome::Continue)
    }

    fn sync_time(&mut self) {
        let result = self.sync.sync(
            &self.config,
            self.devices.network_time.as_mut(),
            self.devices.clock.as_mut(),
        );
        if let Err(err) = result {
            warn!("time sync failed: {err}");
            self.devices.diagnostics.append(&err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::{HashSet, VecDeque},
        net::Ipv4Addr,
        rc::Rc,
        time::Duration,
    };

    use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        connectivity::AP_ADDRESSING,
        error::{ConfigIoError, ConnectError, DisplayError, MdnsError, ServerPollError, SyncError},
        hal::{
            AmbientSensor, ApAddressing, ConfigStore, DiagnosticLog, MdnsAdvertiser, NetworkTime,
            PixelSink, RequestServer, WallClock, WifiRadio,
        },
        render::{ES, HOUR_WORDS, UHR},
        routes::{Method, Response},
    };

    struct Radio {
        accepts: HashSet<String>,
        disabled: Rc<Cell<bool>>,
    }

    impl WifiRadio for Radio {
        fn connect(&mut self, ssid: &str, _: &str, _: Duration) -> Result<(), ConnectError> {
            if self.accepts.contains(ssid) {
                Ok(())
            } else {
                Err(ConnectError::Timeout {
                    ssid: ssid.to_string(),
                })
            }
        }

        fn start_access_point(&mut self, _: &str, _: ApAddressing) -> Result<(), ConnectError> {
            Ok(())
        }

        fn scan(&mut self) -> Vec<String> {
            vec!["home".to_string()]
        }

        fn disable(&mut self) {
            self.disabled.set(true);
        }

        fn station_ip(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(10, 0, 0, 7))
        }

        fn access_point_ip(&self) -> Option<Ipv4Addr> {
            Some(AP_ADDRESSING.address)
        }
    }

    struct Mdns;

    impl MdnsAdvertiser for Mdns {
        fn advertise(&mut self, _: &str) -> Result<(), MdnsError> {
            Ok(())
        }
    }

    struct FixedNetworkTime {
        at: DateTime<Utc>,
        queries: Rc<Cell<u32>>,
        failing: Rc<Cell<bool>>,
    }

    impl NetworkTime for FixedNetworkTime {
        fn query(&mut self) -> Result<DateTime<Utc>, SyncError> {
            self.queries.set(self.queries.get() + 1);
            if self.failing.get() {
                return Err(SyncError::Timeout);
            }
            Ok(self.at)
        }
    }

    struct ManualClock(Rc<Cell<NaiveDateTime>>);

    impl WallClock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            self.0.get()
        }

        fn set(&mut self, local: NaiveDateTime) {
            self.0.set(local);
        }
    }

    struct PixelLog {
        colors: [Rgb; LED_COUNT],
        brightness: f32,
        frames: Vec<[Rgb; LED_COUNT]>,
        broken: bool,
    }

    struct Pixels(Rc<RefCell<PixelLog>>);

    impl PixelSink for Pixels {
        fn set(&mut self, index: usize, color: Rgb) {
            self.0.borrow_mut().colors[index] = color;
        }

        fn set_brightness(&mut self, level: f32) {
            self.0.borrow_mut().brightness = level;
        }

        fn show(&mut self) -> Result<(), DisplayError> {
            let mut log = self.0.borrow_mut();
            if log.broken {
                return Err(DisplayError("strip unplugged".to_string()));
            }
            let frame = log.colors;
            log.frames.push(frame);
            Ok(())
        }
    }

    struct Ambient(u32);

    impl AmbientSensor for Ambient {
        fn read_raw(&mut self) -> u32 {
            self.0
        }
    }

    struct MemoryStore {
        record: Rc<RefCell<Option<ClockConfig>>>,
        saves: Rc<Cell<u32>>,
    }

    impl ConfigStore for MemoryStore {
        fn load(&mut self) -> Result<Option<ClockConfig>, ConfigIoError> {
            Ok(self.record.borrow().clone())
        }

        fn save(&mut self, config: &ClockConfig) -> Result<(), ConfigIoError> {
            self.saves.set(self.saves.get() + 1);
            *self.record.borrow_mut() = Some(config.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct ServerLog {
        pending: VecDeque<Request>,
        responses: Vec<Response>,
        stopped: bool,
        broken: bool,
    }

    struct QueueServer(Rc<RefCell<ServerLog>>);

    impl RequestServer for QueueServer {
        fn poll(
            &mut self,
            handle: &mut dyn FnMut(&Request) -> Response,
        ) -> Result<usize, ServerPollError> {
            let mut log = self.0.borrow_mut();
            if log.broken {
                return Err(ServerPollError("socket closed".to_string()));
            }
            let mut handled = 0;
            while let Some(request) = log.pending.pop_front() {
                let response = handle(&request);
                log.responses.push(response);
                handled += 1;
            }
            Ok(handled)
        }

        fn stop(&mut self) {
            self.0.borrow_mut().stopped = true;
        }
    }

    struct Diagnostics(Rc<RefCell<Vec<String>>>);

    impl DiagnosticLog for Diagnostics {
        fn append(&mut self, message: &str) {
            self.0.borrow_mut().push(message.to_string());
        }
    }

    struct Rig {
        clock: Rc<Cell<NaiveDateTime>>,
        pixels: Rc<RefCell<PixelLog>>,
        record: Rc<RefCell<Option<ClockConfig>>>,
        saves: Rc<Cell<u32>>,
        server: Rc<RefCell<ServerLog>>,
        radio_disabled: Rc<Cell<bool>>,
        time_queries: Rc<Cell<u32>>,
        time_failing: Rc<Cell<bool>>,
        diagnostics: Rc<RefCell<Vec<String>>>,
        now_ms: u64,
    }

    impl Rig {
        fn build(stored: Option<ClockConfig>, accepts: &[&str]) -> (Self, Orchestrator) {
            let boot_time = NaiveDate::from_ymd_opt(2000, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let rig = Rig {
                clock: Rc::new(Cell::new(boot_time)),
                pixels: Rc::new(RefCell::new(PixelLog {
                    colors: [Rgb::BLACK; LED_COUNT],
                    brightness: 0.0,
                    frames: Vec::new(),
                    broken: false,
                })),
                record: Rc::new(RefCell::new(stored)),
                saves: Rc::new(Cell::new(0)),
                server: Rc::new(RefCell::new(ServerLog::default())),
                radio_disabled: Rc::new(Cell::new(false)),
                time_queries: Rc::new(Cell::new(0)),
                time_failing: Rc::new(Cell::new(false)),
                diagnostics: Rc::new(RefCell::new(Vec::new())),
                now_ms: 0,
            };

            let devices = Devices {
                radio: Box::new(Radio {
                    accepts: accepts.iter().map(|s| s.to_string()).collect(),
                    disabled: rig.radio_disabled.clone(),
                }),
                mdns: Box::new(Mdns),
                // 12:00 local in winter with the default offset.
                network_time: Box::new(FixedNetworkTime {
                    at: Utc.with_ymd_and_hms(2024, 1, 10, 11, 0, 0).unwrap(),
                    queries: rig.time_queries.clone(),
                    failing: rig.time_failing.clone(),
                }),
                clock: Box::new(ManualClock(rig.clock.clone())),
                pixels: Box::new(Pixels(rig.pixels.clone())),
                ambient: Box::new(Ambient(1000)),
                store: Box::new(MemoryStore {
                    record: rig.record.clone(),
                    saves: rig.saves.clone(),
                }),
                server: Box::new(QueueServer(rig.server.clone())),
                diagnostics: Box::new(Diagnostics(rig.diagnostics.clone())),
            };
            (rig, Orchestrator::new(devices, "c0ffee"))
        }

        fn station() -> (Self, Orchestrator) {
            let mut config = ClockConfig::default();
            config.add_credential("home", "pw");
            config.auto_brightness = false;
            let (mut rig, mut clock) = Self::build(Some(config), &["home"]);
            clock.boot().unwrap();
            rig.finish_scroll(&mut clock);
            (rig, clock)
        }

        fn tick(&mut self, clock: &mut Orchestrator) -> TickOutcome {
            self.now_ms += 100;
            clock.tick(self.now_ms).unwrap()
        }

        fn finish_scroll(&mut self, clock: &mut Orchestrator) {
            for _ in 0..1_000 {
                if !clock.is_scrolling() {
                    return;
                }
                self.tick(clock);
            }
            panic!("scroll never finished");
        }

        fn send(&self, method: Method, path: &str, body: &str) {
            self.server
                .borrow_mut()
                .pending
                .push_back(Request::new(method, path, body));
        }

        fn local_time(&self) -> NaiveDateTime {
            self.clock.get()
        }

        fn color_at(&self, index: u8) -> Rgb {
            self.pixels.borrow().colors[usize::from(index)]
        }

        fn frame_count(&self) -> usize {
            self.pixels.borrow().frames.len()
        }
    }

    #[test]
    fn first_boot_writes_defaults_once() {
        let (rig, mut clock) = Rig::build(None, &[]);

        clock.boot().unwrap();

        assert_eq!(rig.saves.get(), 1);
        assert_eq!(*rig.record.borrow(), Some(ClockConfig::default()));
        assert_eq!(clock.connection_state(), ConnectionState::AccessPointActive);
    }

    #[test]
    fn boot_shows_connecting_dots_then_clears() {
        let (rig, mut clock) = Rig::build(Some(ClockConfig::default()), &[]);

        clock.boot().unwrap();

        let frames = &rig.pixels.borrow().frames;
        assert_eq!(frames.len(), 2);
        for dot in FILLER_DOTS {
            assert_eq!(frames[0][usize::from(dot)], Rgb::RED);
        }
        assert!(frames[1].iter().all(|color| *color == Rgb::BLACK));
        assert_eq!(rig.saves.get(), 0);
    }

    #[test]
    fn provisioning_scroll_never_stops() {
        let (mut rig, mut clock) = Rig::build(None, &[]);
        clock.boot().unwrap();

        for _ in 0..500 {
            rig.tick(&mut clock);
        }

        assert!(clock.is_scrolling());
        let log = rig.pixels.borrow();
        assert!(log
            .colors
            .iter()
            .all(|color| *color == Rgb::RED || *color == Rgb::BLACK));
        assert_eq!(log.brightness, FULL_BRIGHTNESS);
    }

    #[test]
    fn station_clock_syncs_and_renders_after_scroll() {
        let (mut rig, mut clock) = Rig::station();

        rig.tick(&mut clock);

        assert!(clock.sync_state().has_synced_once);
        assert_eq!(
            rig.clock.get(),
            NaiveDate::from_ymd_opt(2024, 1, 10)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        );
        for word in [ES, UHR, HOUR_WORDS[0]] {
            assert_eq!(rig.color_at(word.first), Rgb::RED);
            assert_eq!(rig.color_at(word.last), Rgb::RED);
        }
        assert_eq!(rig.pixels.borrow().brightness, 1.0);
    }

    #[test]
    fn unchanged_minute_is_not_redrawn() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);
        let frames = rig.frame_count();

        rig.tick(&mut clock);
        rig.tick(&mut clock);
        assert_eq!(rig.frame_count(), frames);

        rig.clock.set(rig.clock.get() + chrono::Duration::minutes(1));
        rig.tick(&mut clock);
        assert_eq!(rig.frame_count(), frames + 1);
    }

    #[test]
    fn light_off_blanks_and_light_on_redraws() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);

        rig.send(Method::Get, "/control/light_off", "");
        rig.tick(&mut clock);
        assert!(!clock.light_allowed());
        assert_eq!(rig.color_at(ES.first), Rgb::BLACK);

        let frames = rig.frame_count();
        rig.tick(&mut clock);
        assert_eq!(rig.frame_count(), frames);

        rig.send(Method::Post, "/control/light_on", "");
        rig.tick(&mut clock);
        assert_eq!(rig.color_at(ES.first), Rgb::RED);
    }

    #[test]
    fn reserved_pixels_survive_blanking() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);
        rig.pixels.borrow_mut().colors[113] = Rgb::GREEN;
        clock.reserve_pixels(&[113]);

        rig.send(Method::Get, "/control/light_off", "");
        rig.tick(&mut clock);

        assert_eq!(rig.color_at(113), Rgb::GREEN);
        assert_eq!(rig.color_at(ES.first), Rgb::BLACK);
    }

    #[test]
    fn color_change_is_persisted_and_drawn_immediately() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);
        let saves = rig.saves.get();

        rig.send(Method::Post, "/controlColor", r#"{"r": 0, "g": 0, "b": 255}"#);
        rig.tick(&mut clock);

        assert_eq!(rig.color_at(ES.first), Rgb::new(0, 0, 255));
        assert_eq!(rig.saves.get(), saves + 1);
        assert_eq!(
            rig.record.borrow().as_ref().map(|config| config.color),
            Some(Rgb::new(0, 0, 255))
        );
    }

    #[test]
    fn fixed_brightness_applies_immediately() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);

        rig.send(
            Method::Post,
            "/setBrightness",
            r#"{"auto_brightness": false, "brightness": "30"}"#,
        );
        rig.tick(&mut clock);

        assert!((rig.pixels.borrow().brightness - 0.3).abs() < 1e-6);
    }

    #[test]
    fn auto_brightness_follows_ambient_window() {
        let mut config = ClockConfig::default();
        config.add_credential("home", "pw");
        let (mut rig, mut clock) = Rig::build(Some(config), &["home"]);
        clock.boot().unwrap();
        rig.finish_scroll(&mut clock);

        for _ in 0..60 {
            rig.tick(&mut clock);
        }

        // A full window of 1000 reads lands in the 0.20 step.
        assert_eq!(rig.pixels.borrow().brightness, 0.20);
    }

    #[test]
    fn credentials_in_provisioning_request_restart() {
        let (mut rig, mut clock) = Rig::build(None, &[]);
        clock.boot().unwrap();

        rig.send(
            Method::Post,
            "/connect",
            r#"{"ssid": "home", "password": "pw"}"#,
        );
        let outcome = rig.tick(&mut clock);

        assert_eq!(outcome, TickOutcome::Restart);
        let stored = rig.record.borrow().clone().unwrap();
        assert_eq!(stored.ssids(), vec!["home"]);
    }

    #[test]
    fn station_routes_are_not_served_in_provisioning() {
        let (mut rig, mut clock) = Rig::build(None, &[]);
        clock.boot().unwrap();

        rig.send(Method::Post, "/controlColor", r#"{"r": 1, "g": 2, "b": 3}"#);
        rig.tick(&mut clock);

        assert_eq!(rig.server.borrow().responses[0].status, 404);
        assert_eq!(clock.config().color, Rgb::RED);
    }

    #[test]
    fn disable_wifi_takes_effect_next_tick() {
        let (mut rig, mut clock) = Rig::station();

        rig.send(Method::Get, "/control/disable_wifi", "");
        rig.tick(&mut clock);
        assert_eq!(clock.connection_state(), ConnectionState::StationConnected);
        assert!(!rig.radio_disabled.get());

        rig.tick(&mut clock);
        assert_eq!(clock.connection_state(), ConnectionState::Disconnected);
        assert!(rig.radio_disabled.get());
        assert!(rig.server.borrow().stopped);

        rig.send(Method::Get, "/", "");
        rig.tick(&mut clock);
        assert_eq!(rig.server.borrow().pending.len(), 1);
    }

    #[test]
    fn display_failure_is_fatal() {
        let (mut rig, mut clock) = Rig::station();
        rig.pixels.borrow_mut().broken = true;
        rig.clock.set(rig.clock.get() + chrono::Duration::minutes(1));

        let result = clock.tick(rig.now_ms + 100);

        assert!(matches!(result, Err(ClockError::Display(_))));
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn timezone_change_resyncs_before_interval() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);
        assert_eq!(rig.local_time(), at(12));
        let queries = rig.time_queries.get();

        rig.send(Method::Post, "/setTimeZone", r#"{"tz": 3}"#);
        rig.tick(&mut clock);

        assert_eq!(rig.time_queries.get(), queries + 1);
        assert_eq!(rig.local_time(), at(14));
        assert_eq!(clock.config().timezone_offset, 3);
    }

    #[test]
    fn season_actions_resync_immediately() {
        let (mut rig, mut clock) = Rig::station();
        rig.tick(&mut clock);
        let queries = rig.time_queries.get();

        rig.send(Method::Get, "/control/tz_summer", "");
        rig.tick(&mut clock);
        assert_eq!(rig.local_time(), at(13));

        rig.send(Method::Post, "/control/tz_winter", "");
        rig.tick(&mut clock);
        assert_eq!(rig.local_time(), at(12));

        assert_eq!(rig.time_queries.get(), queries + 2);
    }

    #[test]
    fn resync_is_skipped_without_station_link() {
        let (mut rig, mut clock) = Rig::station();
        rig.send(Method::Get, "/control/disable_wifi", "");
        rig.tick(&mut clock);
        rig.tick(&mut clock);
        assert_eq!(clock.connection_state(), ConnectionState::Disconnected);
        let queries = rig.time_queries.get();
        let before = rig.local_time();

        let outcome = clock
            .apply_effects(Effects {
                resync: true,
                ..Effects::default()
            })
            .unwrap();

        assert_eq!(outcome, TickOutcome::Continue);
        assert_eq!(rig.time_queries.get(), queries);
        assert_eq!(rig.local_time(), before);
    }

    #[test]
    fn failed_connect_and_sync_are_recorded() {
        let mut config = ClockConfig::default();
        config.add_credential("cafe", "pw");
        config.add_credential("home", "pw");
        let (mut rig, mut clock) = Rig::build(Some(config), &["home"]);
        rig.time_failing.set(true);

        clock.boot().unwrap();
        rig.tick(&mut clock);

        let diagnostics = rig.diagnostics.borrow();
        assert_eq!(diagnostics[0], "timed out connecting to `cafe`");
        assert_eq!(diagnostics[1], "network time query timed out");
        assert!(!clock.sync_state().has_synced_once);
    }

    #[test]
    fn poll_failure_is_recorded() {
        let (mut rig, mut clock) = Rig::station();
        rig.server.borrow_mut().broken = true;

        let outcome = rig.tick(&mut clock);

        assert_eq!(outcome, TickOutcome::Continue);
        assert_eq!(
            rig.diagnostics.borrow().last().map(String::as_str),
            Some("server poll failed: socket closed")
        );
    }
}
