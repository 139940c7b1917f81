use thiserror::Error;

/// Reading or writing the persisted configuration record failed.
#[derive(Debug, Error)]
pub enum ConfigIoError {
    #[error("config read failed: {0}")]
    Read(String),
    #[error("config write failed: {0}")]
    Write(String),
    #[error("config record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single station connect attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out connecting to `{ssid}`")]
    Timeout { ssid: String },
    #[error("connecting to `{ssid}` failed: {reason}")]
    Rejected { ssid: String, reason: String },
    #[error("access point start failed: {0}")]
    AccessPoint(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network time query failed: {0}")]
    Network(String),
    #[error("network time query timed out")]
    Timeout,
    #[error("network time server returned an invalid time")]
    InvalidTime,
}

#[derive(Debug, Error)]
#[error("server poll failed: {0}")]
pub struct ServerPollError(pub String);

#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("hostname `{0}` is already taken")]
    NameTaken(String),
    #[error("mdns advertisement failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
#[error("pixel output failed: {0}")]
pub struct DisplayError(pub String);

/// Anything that escapes a tick. Every other failure is logged and recovered
/// in place.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error(transparent)]
    Display(#[from] DisplayError),
}
