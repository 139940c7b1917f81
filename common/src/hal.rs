//! Capabilities the firmware targets provide to the clock core.

use std::{net::Ipv4Addr, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{
    config::ClockConfig,
    error::{ConfigIoError, ConnectError, DisplayError, MdnsError, ServerPollError, SyncError},
    routes::{Request, Response},
    types::Rgb,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApAddressing {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

pub trait WifiRadio {
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration)
        -> Result<(), ConnectError>;
    fn start_access_point(&mut self, ssid: &str, addressing: ApAddressing)
        -> Result<(), ConnectError>;
    fn scan(&mut self) -> Vec<String>;
    fn disable(&mut self);
    fn station_ip(&self) -> Option<Ipv4Addr>;
    fn access_point_ip(&self) -> Option<Ipv4Addr>;
}

pub trait MdnsAdvertiser {
    /// Claims `hostname` and advertises the HTTP service on port 80.
    /// A collision must surface as [`MdnsError::NameTaken`].
    fn advertise(&mut self, hostname: &str) -> Result<(), MdnsError>;
}

pub trait NetworkTime {
    fn query(&mut self) -> Result<DateTime<Utc>, SyncError>;
}

/// The device clock. It holds local wall time, not UTC.
pub trait WallClock {
    fn now(&self) -> NaiveDateTime;
    fn set(&mut self, local: NaiveDateTime);
}

pub trait PixelSink {
    fn set(&mut self, index: usize, color: Rgb);
    fn set_brightness(&mut self, level: f32);
    fn show(&mut self) -> Result<(), DisplayError>;
}

pub trait AmbientSensor {
    /// Raw reading on a 16-bit scale.
    fn read_raw(&mut self) -> u32;
}

pub trait ConfigStore {
    /// `Ok(None)` means no record has been written yet.
    fn load(&mut self) -> Result<Option<ClockConfig>, ConfigIoError>;
    fn save(&mut self, config: &ClockConfig) -> Result<(), ConfigIoError>;
}

/// The HTTP side. Requests are only ever applied from inside `poll`.
pub trait RequestServer {
    fn poll(
        &mut self,
        handle: &mut dyn FnMut(&Request) -> Response,
    ) -> Result<usize, ServerPollError>;
    fn stop(&mut self);
}

/// Persistent record of tolerated failures. It survives restarts, unlike the
/// console log.
pub trait DiagnosticLog {
    fn append(&mut self, message: &str);
}

/// Everything the orchestrator drives, boxed so each target can plug in its
/// own drivers.
pub struct Devices {
    pub radio: Box<dyn WifiRadio>,
    pub mdns: Box<dyn MdnsAdvertiser>,
    pub network_time: Box<dyn NetworkTime>,
    pub clock: Box<dyn WallClock>,
    pub pixels: Box<dyn PixelSink>,
    pub ambient: Box<dyn AmbientSensor>,
    pub store: Box<dyn ConfigStore>,
    pub server: Box<dyn RequestServer>,
    pub diagnostics: Box<dyn DiagnosticLog>,
}
