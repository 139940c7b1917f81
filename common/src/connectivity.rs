use std::{net::Ipv4Addr, time::Duration};

use log::{info, warn};

use crate::{
    config::Credential,
    error::MdnsError,
    hal::{ApAddressing, DiagnosticLog, MdnsAdvertiser, RequestServer, WifiRadio},
    types::ConnectionState,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const BASE_HOSTNAME: &str = "wordclock";
pub const AP_SSID_PREFIX: &str = "WordClock_";

pub const AP_ADDRESSING: ApAddressing = ApAddressing {
    address: Ipv4Addr::new(192, 168, 251, 1),
    netmask: Ipv4Addr::new(255, 255, 255, 0),
    gateway: Ipv4Addr::new(192, 168, 251, 254),
};

pub fn access_point_ssid(device_id: &str) -> String {
    format!("{AP_SSID_PREFIX}{device_id}")
}

/// `wordclock`, `wordclock1`, `wordclock2`, …
pub fn hostname_candidate(attempt: u32) -> String {
    if attempt == 0 {
        BASE_HOSTNAME.to_string()
    } else {
        format!("{BASE_HOSTNAME}{attempt}")
    }
}

/// Claims the first free hostname. Collisions retry without bound; any other
/// advertiser failure gives up.
pub fn claim_hostname(mdns: &mut dyn MdnsAdvertiser) -> Result<String, MdnsError> {
    let mut attempt = 0;
    loop {
        let hostname = hostname_candidate(attempt);
        match mdns.advertise(&hostname) {
            Ok(()) => {
                info!("registered mDNS: {hostname}.local");
                return Ok(hostname);
            }
            Err(MdnsError::NameTaken(_)) => {
                info!("hostname {hostname}.local is taken, trying next");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    state: ConnectionState,
    ap_ssid: String,
    hostname: Option<String>,
    connected_ssid: Option<String>,
    disable_requested: bool,
}

impl ConnectivityManager {
    pub fn new(device_id: &str) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            ap_ssid: access_point_ssid(device_id),
            hostname: None,
            connected_ssid: None,
            disable_requested: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn ap_ssid(&self) -> &str {
        &self.ap_ssid
    }

    pub fn connected_ssid(&self) -> Option<&str> {
        self.connected_ssid.as_deref()
    }

    /// Joins the first saved network that accepts us, otherwise opens the
    /// provisioning access point. Either way the hostname is claimed after.
    pub fn start(
        &mut self,
        credentials: &[Credential],
        radio: &mut dyn WifiRadio,
        mdns: &mut dyn MdnsAdvertiser,
        diagnostics: &mut dyn DiagnosticLog,
    ) -> ConnectionState {
        if credentials.is_empty() {
            info!("no saved wifi credentials");
        }

        for entry in credentials {
            self.state = ConnectionState::StationConnecting;
            info!("trying to connect to `{}`", entry.ssid);
            match radio.connect(&entry.ssid, &entry.password, CONNECT_TIMEOUT) {
                Ok(()) => {
                    info!("connected to `{}`", entry.ssid);
                    self.state = ConnectionState::StationConnected;
                    self.connected_ssid = Some(entry.ssid.clone());
                    break;
                }
                Err(err) => {
                    warn!("failed to connect to `{}`: {err}", entry.ssid);
                    diagnostics.append(&err.to_string());
                }
            }
        }

        if self.state != ConnectionState::StationConnected {
            self.start_access_point(radio);
        }

        if self.state.is_online() {
            match claim_hostname(mdns) {
                Ok(hostname) => self.hostname = Some(hostname),
                Err(err) => warn!("mDNS registration failed: {err}"),
            }
        }

        self.state
    }

    fn start_access_point(&mut self, radio: &mut dyn WifiRadio) {
        info!("starting access point `{}`", self.ap_ssid);
        match radio.start_access_point(&self.ap_ssid, AP_ADDRESSING) {
            Ok(()) => {
                self.state = ConnectionState::AccessPointActive;
                info!(
                    "access point `{}` up at {}",
                    self.ap_ssid, AP_ADDRESSING.address
                );
            }
            Err(err) => {
                warn!("access point start failed: {err}");
                self.state = ConnectionState::Disconnected;
            }
        }
    }

    pub fn request_disable(&mut self) {
        self.disable_requested = true;
    }

    pub fn disable_pending(&self) -> bool {
        self.disable_requested
    }

    /// Applies a queued disable request. Only a station connection is torn
    /// down; the provisioning access point must stay reachable.
    pub fn apply_pending_disable(
        &mut self,
        radio: &mut dyn WifiRadio,
        server: &mut dyn RequestServer,
    ) -> bool {
        if !std::mem::take(&mut self.disable_requested) {
            return false;
        }
        if self.state != ConnectionState::StationConnected {
            warn!("ignoring wifi disable request in state {}", self.state.as_str());
            return false;
        }

        info!("disabling wifi");
        server.stop();
        radio.disable();
        self.state = ConnectionState::Disconnected;
        self.connected_ssid = None;
        true
    }

    pub fn display_address(&self, radio: &dyn WifiRadio) -> String {
        let address = match self.state {
            ConnectionState::AccessPointActive => radio.access_point_ip(),
            _ => radio.station_ip(),
        };
        address.unwrap_or(Ipv4Addr::UNSPECIFIED).to_string()
    }
}
