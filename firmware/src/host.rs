use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::{ErrorKind, Write as _},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method as HttpMethod, StatusCode, Uri},
    response::IntoResponse,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{self, error::TryRecvError},
        oneshot,
    },
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use wordclock_common::{
    error::{ConfigIoError, ConnectError, DisplayError, MdnsError, ServerPollError, SyncError},
    hal::{
        AmbientSensor, ApAddressing, ConfigStore, DiagnosticLog, Devices, MdnsAdvertiser,
        NetworkTime, PixelSink, RequestServer, WifiRadio,
    },
    scroll::{grid_index, GRID_HEIGHT, GRID_WIDTH},
    ClockConfig, ClockError, Method, Orchestrator, Request, Response, Rgb, TickOutcome,
    LED_COUNT,
};

use crate::clock::{monotonic_ms, OffsetClock};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "./.wordclock";
const DEFAULT_DEVICE_ID: &str = "0000c10c";
const DEFAULT_AMBIENT: u32 = 1000;
const DEFAULT_NTP_SERVER: &str = "pool.ntp.org:123";
const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "logfile.txt";

const REQUEST_QUEUE_DEPTH: usize = 16;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const NTP_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_millis(10);
const RESTART_DELAY: Duration = Duration::from_secs(2);
const FATAL_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Seconds between the NTP era start (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

#[derive(Debug, Clone)]
struct HostSettings {
    http_port: u16,
    data_dir: PathBuf,
    device_id: String,
    /// `None` lets any credential connect.
    networks: Option<HashMap<String, String>>,
    taken_hostnames: HashSet<String>,
    ambient: u32,
    ntp_server: String,
}

impl HostSettings {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let http_port = lookup("WORDCLOCK_HTTP_PORT")
            .map(|value| {
                value
                    .parse::<u16>()
                    .with_context(|| format!("invalid WORDCLOCK_HTTP_PORT `{value}`"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_HTTP_PORT);
        let ambient = lookup("WORDCLOCK_AMBIENT")
            .map(|value| {
                value
                    .parse::<u32>()
                    .with_context(|| format!("invalid WORDCLOCK_AMBIENT `{value}`"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_AMBIENT);

        Ok(Self {
            http_port,
            data_dir: lookup("WORDCLOCK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            device_id: lookup("WORDCLOCK_DEVICE_ID").unwrap_or_else(|| DEFAULT_DEVICE_ID.into()),
            networks: lookup("WORDCLOCK_SIM_NETWORKS").map(|raw| parse_networks(&raw)),
            taken_hostnames: lookup("WORDCLOCK_TAKEN_HOSTNAMES")
                .map(|raw| parse_list(&raw).collect())
                .unwrap_or_default(),
            ambient,
            ntp_server: lookup("WORDCLOCK_NTP_SERVER")
                .unwrap_or_else(|| DEFAULT_NTP_SERVER.into()),
        })
    }
}

fn parse_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
}

/// `ssid:password,ssid2:password2`. A missing password means an open network.
fn parse_networks(raw: &str) -> HashMap<String, String> {
    parse_list(raw)
        .map(|entry| {
            let (ssid, password) = entry.split_once(':').unwrap_or((entry.as_str(), ""));
            (ssid.to_string(), password.to_string())
        })
        .collect()
}

struct Pending {
    request: Request,
    reply: oneshot::Sender<Response>,
}

#[derive(Clone)]
struct HttpState {
    requests: mpsc::Sender<Pending>,
    accepting: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env()?;
    info!(
        "simulated clock `{}` with data in {}",
        settings.device_id,
        settings.data_dir.display()
    );

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let accepting = Arc::new(AtomicBool::new(false));
    let app = Router::new()
        .fallback(forward_request)
        .with_state(HttpState {
            requests: request_tx,
            accepting: accepting.clone(),
        })
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("config endpoints on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("http server stopped: {err}");
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let mut clock_task = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || run_clock(settings, request_rx, accepting, &running))
    };

    tokio::select! {
        result = &mut clock_task => result.context("clock loop panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            running.store(false, Ordering::Relaxed);
            clock_task.await.context("clock loop panicked")?
        }
    }
}

async fn forward_request(
    State(state): State<HttpState>,
    method: HttpMethod,
    uri: Uri,
    body: Bytes,
) -> axum::response::Response {
    if !state.accepting.load(Ordering::Relaxed) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "clock is not serving");
    }
    let Some(method) = Method::parse(method.as_str()) else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    };

    let (reply, response) = oneshot::channel();
    let pending = Pending {
        request: Request::new(method, uri.path(), body.to_vec()),
        reply,
    };
    if state.requests.send(pending).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "clock loop stopped");
    }

    match tokio::time::timeout(REPLY_TIMEOUT, response).await {
        Ok(Ok(response)) => into_http(response),
        Ok(Err(_)) => error_response(StatusCode::SERVICE_UNAVAILABLE, "request dropped"),
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "clock loop busy"),
    }
}

fn into_http(response: Response) -> axum::response::Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Boots the clock and ticks it until shutdown. Restart requests and fatal
/// errors boot a fresh orchestrator with fresh simulated drivers.
fn run_clock(
    settings: HostSettings,
    requests: mpsc::Receiver<Pending>,
    accepting: Arc<AtomicBool>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let requests = Rc::new(RefCell::new(requests));

    while running.load(Ordering::Relaxed) {
        let devices = build_devices(&settings, requests.clone(), accepting.clone());
        let mut clock = Orchestrator::new(devices, settings.device_id.clone());

        let delay = match run_until_restart(&mut clock, running) {
            Ok(true) => RESTART_DELAY,
            Ok(false) => break,
            Err(err) => {
                warn!("fatal clock error: {err}");
                LogFile::in_dir(&settings.data_dir).append(&err.to_string());
                FATAL_RESTART_DELAY
            }
        };
        accepting.store(false, Ordering::Relaxed);

        info!("restarting in {}s", delay.as_secs());
        sleep_while_running(delay, running);
    }
    Ok(())
}

/// `Ok(true)` when the clock asked for a restart, `Ok(false)` on shutdown.
fn run_until_restart(clock: &mut Orchestrator, running: &AtomicBool) -> Result<bool, ClockError> {
    clock.boot()?;
    while running.load(Ordering::Relaxed) {
        if clock.tick(monotonic_ms())? == TickOutcome::Restart {
            return Ok(true);
        }
        thread::sleep(TICK_INTERVAL);
    }
    Ok(false)
}

fn sleep_while_running(delay: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < delay && running.load(Ordering::Relaxed) {
        thread::sleep(step);
        waited += step;
    }
}

/// Timestamped lines in `<data dir>/logfile.txt`, for fatal and tolerated
/// errors alike.
struct LogFile {
    path: PathBuf,
}

impl LogFile {
    fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(LOG_FILE),
        }
    }
}

impl DiagnosticLog for LogFile {
    fn append(&mut self, message: &str) {
        let result = self
            .path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                writeln!(file, "{} {message}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"))
            });
        if let Err(io_err) = result {
            warn!("failed to append to {}: {io_err}", self.path.display());
        }
    }
}

fn build_devices(
    settings: &HostSettings,
    requests: Rc<RefCell<mpsc::Receiver<Pending>>>,
    accepting: Arc<AtomicBool>,
) -> Devices {
    Devices {
        radio: Box::new(SimRadio {
            networks: settings.networks.clone(),
            mode: RadioMode::Off,
        }),
        mdns: Box::new(SimMdns {
            taken: settings.taken_hostnames.clone(),
        }),
        network_time: Box::new(SntpClient {
            server: settings.ntp_server.clone(),
            timeout: NTP_TIMEOUT,
        }),
        clock: Box::new(OffsetClock::new()),
        pixels: Box::new(ConsolePixels::new()),
        ambient: Box::new(FixedAmbient(settings.ambient)),
        store: Box::new(JsonFileStore {
            path: settings.data_dir.join(CONFIG_FILE),
        }),
        server: Box::new(ChannelServer::new(requests, accepting)),
        diagnostics: Box::new(LogFile::in_dir(&settings.data_dir)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioMode {
    Off,
    Station,
    AccessPoint(Ipv4Addr),
}

struct SimRadio {
    networks: Option<HashMap<String, String>>,
    mode: RadioMode,
}

impl WifiRadio for SimRadio {
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<(), ConnectError> {
        debug!("simulated connect to `{ssid}` (timeout {timeout:?})");
        if let Some(networks) = &self.networks {
            match networks.get(ssid) {
                Some(expected) if expected == password => {}
                Some(_) => {
                    return Err(ConnectError::Rejected {
                        ssid: ssid.to_string(),
                        reason: "wrong password".to_string(),
                    })
                }
                None => {
                    return Err(ConnectError::Timeout {
                        ssid: ssid.to_string(),
                    })
                }
            }
        }
        self.mode = RadioMode::Station;
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str, addressing: ApAddressing) -> Result<(), ConnectError> {
        info!(
            "simulated access point `{ssid}` at {} mask {} gateway {}",
            addressing.address, addressing.netmask, addressing.gateway
        );
        self.mode = RadioMode::AccessPoint(addressing.address);
        Ok(())
    }

    fn scan(&mut self) -> Vec<String> {
        let mut visible: Vec<String> = self
            .networks
            .as_ref()
            .map(|networks| networks.keys().cloned().collect())
            .unwrap_or_default();
        visible.sort();
        visible
    }

    fn disable(&mut self) {
        self.mode = RadioMode::Off;
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        (self.mode == RadioMode::Station).then_some(Ipv4Addr::LOCALHOST)
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        match self.mode {
            RadioMode::AccessPoint(address) => Some(address),
            _ => None,
        }
    }
}

struct SimMdns {
    taken: HashSet<String>,
}

impl MdnsAdvertiser for SimMdns {
    fn advertise(&mut self, hostname: &str) -> Result<(), MdnsError> {
        if self.taken.contains(hostname) {
            return Err(MdnsError::NameTaken(hostname.to_string()));
        }
        info!("simulated _http._tcp service on {hostname}.local:80");
        Ok(())
    }
}

struct SntpClient {
    server: String,
    timeout: Duration,
}

fn network_error(err: std::io::Error) -> SyncError {
    SyncError::Network(err.to_string())
}

impl NetworkTime for SntpClient {
    fn query(&mut self) -> Result<DateTime<Utc>, SyncError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(network_error)?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(network_error)?;
        socket.connect(&self.server).map_err(network_error)?;

        // LI=0, VN=3, Mode=3 (client)
        let mut packet = [0_u8; 48];
        packet[0] = 0x1B;
        socket.send(&packet).map_err(network_error)?;

        let mut response = [0_u8; 48];
        let len = match socket.recv(&mut response) {
            Ok(len) => len,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(SyncError::Timeout)
            }
            Err(err) => return Err(network_error(err)),
        };
        parse_ntp_response(&response[..len])
    }
}

/// Transmit timestamp of a server reply. Stratum 0 (kiss-o'-death) and an
/// unset timestamp are rejected.
fn parse_ntp_response(packet: &[u8]) -> Result<DateTime<Utc>, SyncError> {
    if packet.len() < 48 || packet[1] == 0 {
        return Err(SyncError::InvalidTime);
    }

    let mut seconds = [0_u8; 4];
    seconds.copy_from_slice(&packet[40..44]);
    let mut fraction = [0_u8; 4];
    fraction.copy_from_slice(&packet[44..48]);

    let seconds = u32::from_be_bytes(seconds);
    if seconds == 0 {
        return Err(SyncError::InvalidTime);
    }
    let nanos = (u64::from(u32::from_be_bytes(fraction)) * 1_000_000_000) >> 32;

    DateTime::from_timestamp(i64::from(seconds) - NTP_UNIX_OFFSET, nanos as u32)
        .ok_or(SyncError::InvalidTime)
}

/// Prints frames instead of driving LEDs: a summary at debug, the grid at
/// trace.
struct ConsolePixels {
    colors: [Rgb; LED_COUNT],
    brightness: f32,
    last_shown: Option<([Rgb; LED_COUNT], f32)>,
}

impl ConsolePixels {
    fn new() -> Self {
        Self {
            colors: [Rgb::BLACK; LED_COUNT],
            brightness: 1.0,
            last_shown: None,
        }
    }

    fn grid(&self) -> String {
        let mut out = String::new();
        for y in 0..GRID_HEIGHT {
            for x in 0..GRID_WIDTH {
                let lit = grid_index(x, y)
                    .map(|index| self.colors[usize::from(index)] != Rgb::BLACK)
                    .unwrap_or(false);
                out.push(if lit { '#' } else { '.' });
            }
            out.push('\n');
        }
        let status_row = GRID_WIDTH as usize * GRID_HEIGHT as usize;
        for color in &self.colors[status_row..] {
            out.push(if *color != Rgb::BLACK { '*' } else { '.' });
        }
        out
    }
}

impl PixelSink for ConsolePixels {
    fn set(&mut self, index: usize, color: Rgb) {
        if let Some(slot) = self.colors.get_mut(index) {
            *slot = color;
        }
    }

    fn set_brightness(&mut self, level: f32) {
        self.brightness = level;
    }

    fn show(&mut self) -> Result<(), DisplayError> {
        let frame = (self.colors, self.brightness);
        if self.last_shown == Some(frame) {
            return Ok(());
        }

        let lit = self.colors.iter().filter(|color| **color != Rgb::BLACK).count();
        debug!("frame: {lit} lit at brightness {:.2}", self.brightness);
        trace!("\n{}", self.grid());
        self.last_shown = Some(frame);
        Ok(())
    }
}

struct FixedAmbient(u32);

impl AmbientSensor for FixedAmbient {
    fn read_raw(&mut self) -> u32 {
        self.0
    }
}

struct JsonFileStore {
    path: PathBuf,
}

impl ConfigStore for JsonFileStore {
    fn load(&mut self) -> Result<Option<ClockConfig>, ConfigIoError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConfigIoError::Read(format!("{}: {err}", self.path.display()))),
        }
    }

    fn save(&mut self, config: &ClockConfig) -> Result<(), ConfigIoError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ConfigIoError::Write(format!("{}: {err}", parent.display())))?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        fs::write(&self.path, payload)
            .map_err(|err| ConfigIoError::Write(format!("{}: {err}", self.path.display())))
    }
}

/// Hands queued HTTP requests to the tick loop and sends each reply back.
struct ChannelServer {
    requests: Rc<RefCell<mpsc::Receiver<Pending>>>,
    accepting: Arc<AtomicBool>,
}

impl ChannelServer {
    fn new(requests: Rc<RefCell<mpsc::Receiver<Pending>>>, accepting: Arc<AtomicBool>) -> Self {
        accepting.store(true, Ordering::Relaxed);
        Self {
            requests,
            accepting,
        }
    }
}

impl RequestServer for ChannelServer {
    fn poll(
        &mut self,
        handle: &mut dyn FnMut(&Request) -> Response,
    ) -> Result<usize, ServerPollError> {
        let mut requests = self
            .requests
            .try_borrow_mut()
            .map_err(|_| ServerPollError("request queue already borrowed".to_string()))?;

        let mut handled = 0;
        loop {
            match requests.try_recv() {
                Ok(pending) => {
                    let response = handle(&pending.request);
                    handled += 1;
                    if pending.reply.send(response).is_err() {
                        debug!("client left before the reply was ready");
                    }
                }
                Err(TryRecvError::Empty) => return Ok(handled),
                Err(TryRecvError::Disconnected) => {
                    return Err(ServerPollError("http front end is gone".to_string()))
                }
            }
        }
    }

    fn stop(&mut self) {
        info!("http endpoints stopped");
        self.accepting.store(false, Ordering::Relaxed);
    }
}
