pub mod brightness;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod hal;
pub mod orchestrator;
pub mod render;
pub mod routes;
pub mod scroll;
pub mod time_sync;
pub mod types;

pub use brightness::BrightnessController;
pub use config::{ClockConfig, Credential, Phrasing};
pub use connectivity::ConnectivityManager;
pub use error::{
    ClockError, ConfigIoError, ConnectError, DisplayError, MdnsError, ServerPollError, SyncError,
};
pub use hal::Devices;
pub use orchestrator::{Orchestrator, TickOutcome};
pub use render::{render, Frame, LitSet, LED_COUNT};
pub use routes::{Method, Request, Response};
pub use time_sync::TimeSyncService;
pub use types::{ConnectionState, Rgb};
