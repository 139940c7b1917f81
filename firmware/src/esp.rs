use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, Utc};
use embedded_svc::{
    http::{Headers, Method as HttpMethod},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
    },
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{config::TransmitConfig, PinState, Pulse, RmtChannel, TxRmtDriver, VariableLengthSignal},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    mdns::EspMdns,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use wordclock_common::{
    error::{ConfigIoError, ConnectError, DisplayError, MdnsError, ServerPollError, SyncError},
    hal::{
        AmbientSensor, ApAddressing, ConfigStore, DiagnosticLog, Devices, MdnsAdvertiser,
        NetworkTime, PixelSink, RequestServer, WifiRadio,
    },
    ClockConfig, Method, Orchestrator, Request, Response, Rgb, TickOutcome, LED_COUNT,
};

use crate::clock::{monotonic_ms, OffsetClock};

const NVS_NAMESPACE: &str = "wordclock";
const NVS_CONFIG_KEY: &str = "config";
const NVS_LOG_KEY: &str = "error_log";
const NVS_BUFFER_SIZE: usize = 4096;
const LOG_CAPACITY: usize = 1024;
const MAX_HTTP_BODY: usize = 4096;
const CLOCK_STACK_SIZE: usize = 16 * 1024;
const TICK_INTERVAL: Duration = Duration::from_millis(10);
const RESTART_DELAY: Duration = Duration::from_secs(2);
const FATAL_RESTART_DELAY: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const WIFI_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SNTP_TIMEOUT: Duration = Duration::from_secs(20);
const SNTP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MDNS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MDNS_INSTANCE_NAME: &str = "Word Clock";
const HTTP_PORT: u16 = 80;

/// Readings below this year mean SNTP has not set the RTC yet.
const MIN_VALID_YEAR: i32 = 2024;

// WS2812 bit timings.
const T0H_NS: u64 = 350;
const T0L_NS: u64 = 800;
const T1H_NS: u64 = 700;
const T1L_NS: u64 = 600;

/// The LDR is sampled at 12 bits; the brightness table expects 16.
const ADC_TO_RAW_SHIFT: u32 = 4;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let mut fatal_log = NvsLog::new(nvs_partition.clone())?;

    let device_id = device_id();
    info!("word clock {device_id} starting");

    let clock_thread = thread::Builder::new()
        .name("clock".into())
        .stack_size(CLOCK_STACK_SIZE)
        .spawn(move || run_clock(peripherals, sys_loop, nvs_partition, device_id))
        .context("failed to spawn clock thread")?;

    let result = clock_thread
        .join()
        .map_err(|_| anyhow!("clock thread panicked"))
        .and_then(|result| result);

    match result {
        Ok(()) => {
            info!("restarting in {}s", RESTART_DELAY.as_secs());
            thread::sleep(RESTART_DELAY);
        }
        Err(err) => {
            error!("fatal clock error: {err:#}");
            fatal_log.append(&format!("{err:#}"));
            thread::sleep(FATAL_RESTART_DELAY);
        }
    }

    unsafe { esp_idf_svc::sys::esp_restart() }
}

/// Returns `Ok(())` only when the clock asked for a restart.
fn run_clock(
    peripherals: Peripherals,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    device_id: String,
) -> anyhow::Result<()> {
    let devices = build_devices(peripherals, sys_loop, nvs_partition)?;
    let mut clock = Orchestrator::new(devices, device_id);

    clock.boot().context("boot failed")?;
    loop {
        if clock.tick(monotonic_ms()).context("tick failed")? == TickOutcome::Restart {
            return Ok(());
        }
        thread::sleep(TICK_INTERVAL);
    }
}

fn build_devices(
    peripherals: Peripherals,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<Devices> {
    let Peripherals {
        modem,
        rmt,
        adc2,
        pins,
        ..
    } = peripherals;

    let pixels = Ws2812Strip::new(rmt.channel0, pins.gpio15).context("LED strip init failed")?;

    let adc = AdcDriver::new(adc2)?;
    let adc_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut ldr = AdcChannelDriver::new(adc, pins.gpio11, &adc_config)?;
    let ambient = LdrSensor {
        read: Box::new(move || ldr.read()),
    };

    let radio = EspRadio::new(modem, sys_loop, nvs_partition.clone())?;
    let diagnostics = NvsLog::new(nvs_partition.clone())?;
    let store = NvsConfigStore {
        nvs: EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?,
    };
    let server = EspRequestServer::start()?;

    Ok(Devices {
        radio: Box::new(radio),
        mdns: Box::new(EspMdnsAdvertiser {
            mdns: EspMdns::take().context("mDNS init failed")?,
        }),
        network_time: Box::new(EspNetworkTime { sntp: None }),
        clock: Box::new(OffsetClock::new()),
        pixels: Box::new(pixels),
        ambient: Box::new(ambient),
        store: Box::new(store),
        server: Box::new(server),
        diagnostics: Box::new(diagnostics),
    })
}

fn device_id() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read base MAC: esp_err_t={rc}");
    }
    mac.iter().map(|byte| format!("{byte:02x}")).collect()
}

struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        })
    }

    fn stop_if_started(&mut self) {
        if self.wifi.is_started().unwrap_or(false) {
            if let Err(err) = self.wifi.stop() {
                warn!("failed to stop wifi: {err}");
            }
        }
    }
}

impl WifiRadio for EspRadio {
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<(), ConnectError> {
        let rejected = |reason: String| ConnectError::Rejected {
            ssid: ssid.to_string(),
            reason,
        };
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| rejected("ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| rejected("password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        self.stop_if_started();
        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| rejected(err.to_string()))?;
        self.wifi.start().map_err(|err| rejected(err.to_string()))?;
        self.wifi
            .wifi_mut()
            .connect()
            .map_err(|err| rejected(err.to_string()))?;

        let deadline = Instant::now() + timeout;
        while !self.wifi.is_connected().unwrap_or(false) {
            if Instant::now() >= deadline {
                let _ = self.wifi.wifi_mut().disconnect();
                return Err(ConnectError::Timeout {
                    ssid: ssid.to_string(),
                });
            }
            thread::sleep(WIFI_POLL_INTERVAL);
        }

        self.wifi
            .wait_netif_up()
            .map_err(|err| rejected(format!("netif did not come up: {err}")))
    }

    fn start_access_point(&mut self, ssid: &str, addressing: ApAddressing) -> Result<(), ConnectError> {
        let failed = |err: String| ConnectError::AccessPoint(err);

        let mask = Mask::try_from(addressing.netmask)
            .map_err(|_| failed(format!("invalid netmask {}", addressing.netmask)))?;
        // In router mode the subnet gateway is the access point's own address.
        debug!("upstream gateway {} is not announced", addressing.gateway);
        let netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: addressing.address,
                    mask,
                },
                dhcp_enabled: true,
                dns: None,
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })
        .map_err(|err| failed(err.to_string()))?;

        self.stop_if_started();
        self.wifi
            .wifi_mut()
            .swap_netif_ap(netif)
            .map_err(|err| failed(err.to_string()))?;

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| failed("access point ssid too long".to_string()))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))
            .map_err(|err| failed(err.to_string()))?;
        self.wifi.start().map_err(|err| failed(err.to_string()))?;
        self.wifi
            .wait_netif_up()
            .map_err(|err| failed(err.to_string()))
    }

    fn scan(&mut self) -> Vec<String> {
        match self.wifi.scan() {
            Ok(found) => {
                let mut networks: Vec<String> = found
                    .iter()
                    .map(|info| info.ssid.to_string())
                    .filter(|ssid| !ssid.is_empty())
                    .collect();
                networks.sort();
                networks.dedup();
                networks
            }
            Err(err) => {
                warn!("wifi scan failed: {err}");
                Vec::new()
            }
        }
    }

    fn disable(&mut self) {
        self.stop_if_started();
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        let info = self.wifi.wifi().sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn access_point_ip(&self) -> Option<Ipv4Addr> {
        let info = self.wifi.wifi().ap_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }
}

struct EspMdnsAdvertiser {
    mdns: EspMdns,
}

impl MdnsAdvertiser for EspMdnsAdvertiser {
    fn advertise(&mut self, hostname: &str) -> Result<(), MdnsError> {
        if let Ok(owner) = self.mdns.query_a(hostname, MDNS_PROBE_TIMEOUT) {
            debug!("{hostname}.local already answers from {owner}");
            return Err(MdnsError::NameTaken(hostname.to_string()));
        }

        let failed = |err: EspError| MdnsError::Failed(err.to_string());
        self.mdns.set_hostname(hostname).map_err(failed)?;
        self.mdns
            .set_instance_name(MDNS_INSTANCE_NAME)
            .map_err(failed)?;
        self.mdns
            .add_service(None, "_http", "_tcp", HTTP_PORT, &[])
            .map_err(failed)
    }
}

/// Each query restarts SNTP and waits for a fresh completion, then reads the
/// RTC it set.
struct EspNetworkTime {
    sntp: Option<EspSntp<'static>>,
}

impl NetworkTime for EspNetworkTime {
    fn query(&mut self) -> Result<DateTime<Utc>, SyncError> {
        self.sntp = None;
        let sntp = EspSntp::new_default().map_err(|err| SyncError::Network(err.to_string()))?;

        let started = Instant::now();
        while sntp.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= SNTP_TIMEOUT {
                self.sntp = Some(sntp);
                return Err(SyncError::Timeout);
            }
            thread::sleep(SNTP_POLL_INTERVAL);
        }
        debug!("SNTP completed after {}ms", started.elapsed().as_millis());
        self.sntp = Some(sntp);

        let now = Utc::now();
        if now.year() < MIN_VALID_YEAR {
            return Err(SyncError::InvalidTime);
        }
        Ok(now)
    }
}

struct Ws2812Strip {
    tx: TxRmtDriver<'static>,
    bit0: [Pulse; 2],
    bit1: [Pulse; 2],
    colors: [Rgb; LED_COUNT],
    brightness: f32,
}

impl Ws2812Strip {
    fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        let ticks_hz = tx.counter_clock()?;
        let pulse = |state: PinState, nanos: u64| {
            Pulse::new_with_duration(ticks_hz, state, &Duration::from_nanos(nanos))
        };

        Ok(Self {
            bit0: [pulse(PinState::High, T0H_NS)?, pulse(PinState::Low, T0L_NS)?],
            bit1: [pulse(PinState::High, T1H_NS)?, pulse(PinState::Low, T1L_NS)?],
            tx,
            colors: [Rgb::BLACK; LED_COUNT],
            brightness: 1.0,
        })
    }

    fn scale(&self, channel: u8) -> u8 {
        (f32::from(channel) * self.brightness).round().clamp(0.0, 255.0) as u8
    }
}

impl PixelSink for Ws2812Strip {
    fn set(&mut self, index: usize, color: Rgb) {
        if let Some(slot) = self.colors.get_mut(index) {
            *slot = color;
        }
    }

    fn set_brightness(&mut self, level: f32) {
        self.brightness = level.clamp(0.0, 1.0);
    }

    fn show(&mut self) -> Result<(), DisplayError> {
        let failed = |err: EspError| DisplayError(err.to_string());

        let mut signal = VariableLengthSignal::with_capacity(LED_COUNT * 24 * 2);
        for color in &self.colors {
            // WS2812 wants green first.
            for byte in [self.scale(color.g), self.scale(color.r), self.scale(color.b)] {
                for bit in (0..8).rev() {
                    let pulses = if byte & (1 << bit) != 0 {
                        &self.bit1
                    } else {
                        &self.bit0
                    };
                    signal.push(pulses.iter()).map_err(failed)?;
                }
            }
        }

        self.tx.start_blocking(&signal).map_err(failed)
    }
}

struct LdrSensor {
    read: Box<dyn FnMut() -> Result<u16, EspError>>,
}

impl AmbientSensor for LdrSensor {
    fn read_raw(&mut self) -> u32 {
        match (self.read)() {
            Ok(value) => u32::from(value) << ADC_TO_RAW_SHIFT,
            Err(err) => {
                warn!("LDR read failed: {err}");
                0
            }
        }
    }
}

struct NvsConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl ConfigStore for NvsConfigStore {
    fn load(&mut self) -> Result<Option<ClockConfig>, ConfigIoError> {
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];
        match self.nvs.get_str(NVS_CONFIG_KEY, &mut buffer) {
            Ok(Some(raw)) => Ok(Some(serde_json::from_str(raw)?)),
            Ok(None) => Ok(None),
            Err(err) => Err(ConfigIoError::Read(err.to_string())),
        }
    }

    fn save(&mut self, config: &ClockConfig) -> Result<(), ConfigIoError> {
        let payload = serde_json::to_string(config)?;
        self.nvs
            .set_str(NVS_CONFIG_KEY, &payload)
            .map_err(|err| ConfigIoError::Write(err.to_string()))
    }
}

/// Tail of fatal and tolerated errors kept in NVS so they survive a restart.
struct NvsLog {
    nvs: EspNvs<NvsDefault>,
}

impl NvsLog {
    fn new(nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?,
        })
    }
}

impl DiagnosticLog for NvsLog {
    fn append(&mut self, message: &str) {
        let mut buffer = vec![0_u8; LOG_CAPACITY * 2];
        let mut log = match self.nvs.get_str(NVS_LOG_KEY, &mut buffer) {
            Ok(Some(previous)) => previous.to_string(),
            _ => String::new(),
        };
        log.push_str(&format!("{} {message}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")));

        if log.len() > LOG_CAPACITY {
            let excess = log.len() - LOG_CAPACITY;
            let cut = (excess..log.len())
                .find(|index| log.is_char_boundary(*index))
                .unwrap_or(log.len());
            log.drain(..cut);
        }

        if let Err(err) = self.nvs.set_str(NVS_LOG_KEY, &log) {
            warn!("failed to persist error log: {err}");
        }
    }
}

struct Pending {
    request: Request,
    reply: mpsc::SyncSender<Response>,
}

/// The HTTP server threads only queue requests; the tick loop answers them.
struct EspRequestServer {
    http: Option<EspHttpServer<'static>>,
    requests: mpsc::Receiver<Pending>,
}

impl EspRequestServer {
    fn start() -> anyhow::Result<Self> {
        let (tx, requests) = mpsc::channel();
        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for (method, http_method) in [(Method::Get, HttpMethod::Get), (Method::Post, HttpMethod::Post)] {
            let tx = tx.clone();
            server.fn_handler::<anyhow::Error, _>("/*", http_method, move |mut req| {
                let path = req.uri().split('?').next().unwrap_or("/").to_string();
                let body = read_request_body(&mut req)?;

                let (reply, response) = mpsc::sync_channel(1);
                tx.send(Pending {
                    request: Request::new(method, path, body),
                    reply,
                })
                .map_err(|_| anyhow!("clock loop stopped"))?;

                let response = response
                    .recv_timeout(REPLY_TIMEOUT)
                    .unwrap_or_else(|_| Response::error(504, "clock loop busy"));
                write_response(req, &response)
            })?;
        }

        Ok(Self {
            http: Some(server),
            requests,
        })
    }
}

impl RequestServer for EspRequestServer {
    fn poll(
        &mut self,
        handle: &mut dyn FnMut(&Request) -> Response,
    ) -> Result<usize, ServerPollError> {
        let mut handled = 0;
        loop {
            match self.requests.try_recv() {
                Ok(pending) => {
                    let response = handle(&pending.request);
                    handled += 1;
                    if pending.reply.send(response).is_err() {
                        debug!("http handler gave up before the reply");
                    }
                }
                Err(mpsc::TryRecvError::Empty) => return Ok(handled),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(ServerPollError("http server is gone".to_string()))
                }
            }
        }
    }

    fn stop(&mut self) {
        if self.http.take().is_some() {
            info!("http server stopped");
        }
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_response(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    response: &Response,
) -> anyhow::Result<()> {
    req.into_response(
        response.status,
        None,
        &[("Content-Type", response.content_type)],
    )?
    .write_all(response.body.as_bytes())?;
    Ok(())
}
