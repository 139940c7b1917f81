use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    StationConnecting,
    StationConnected,
    AccessPointActive,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::StationConnecting => "STATION_CONNECTING",
            Self::StationConnected => "STATION_CONNECTED",
            Self::AccessPointActive => "ACCESS_POINT_ACTIVE",
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, Self::StationConnected | Self::AccessPointActive)
    }
}

/// What `GET /` returns in station mode.
#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub id: String,
    pub hostname: Option<String>,
    pub connection: &'static str,
    pub color: String,
    pub tz: i32,
    #[serde(rename = "autoDst")]
    pub auto_dst: bool,
    #[serde(rename = "dstActive")]
    pub dst_active: bool,
    #[serde(rename = "autoBrightness")]
    pub auto_brightness: bool,
    pub brightness: f32,
    #[serde(rename = "lightAllowed")]
    pub light_allowed: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "lastSyncEpoch")]
    pub last_sync_epoch: i64,
    #[serde(rename = "localTime")]
    pub local_time: String,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningView {
    pub id: String,
    pub networks: Vec<String>,
}
