//! Desktop simulator for the sck-rs sensor kit.
//!
//! Runs the sck-core mode controller against a simulated main board, a
//! scripted wireless co-processor and synthetic sensors. Simulated time runs
//! faster than wall time; sleeps of the kit skip ahead on the simulated clock.
//!
//! # Usage
//!
//! ```text
//! sck-simulator [net|sd] [minutes]
//! ```
//!
//! `net` (default) publishes through the scripted co-processor, `sd` writes
//! daily CSV files to an in-memory card. Set `RUST_LOG=info` (or `debug`) to
//! follow the controller.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use embassy_futures::block_on;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

use sck_core::config::{ConfigStore, Configuration, KitMode, bounded};
use sck_core::controller::{CoprocessorPower, ModeController};
use sck_core::hal::{LedPattern, Platform, StatusLed, SystemControl};
use sck_core::link::message::{
    ConfigAction, InboundKind, InboundMessage, OutboundKind, OutboundMessage, Payload,
};
use sck_core::link::{DatagramLink, FRAME_SIZE, LinkError, LinkFramer, PeerState};
use sck_core::power::{ChargeStatus, PowerMonitor, PowerSample};
use sck_core::sensors::{SensorBoard, SensorError, SensorPoll, SensorType};
use sck_core::state::Identity;
use sck_core::storage::CardFs;
use sck_core::time::{Clock, Rtc};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Simulated time per controller tick.
const TICK: Duration = Duration::from_millis(100);

/// Wall time per tick; 100 ms simulated in 5 ms is a 20x speedup.
const TICK_PACING: StdDuration = StdDuration::from_millis(5);

/// Time the scripted co-processor needs from power on to its boot message.
const PEER_BOOT_TIME: Duration = Duration::from_millis(800);

const DEFAULT_MINUTES: u64 = 10;

// ---------------------------------------------------------------------------
// Shared world
// ---------------------------------------------------------------------------

/// State shared by the simulated board and co-processor.
struct World {
    now_ms: u64,
    /// Real wall clock at simulation start, as the network would report it.
    network_epoch: u32,
    /// RTC reading at `now_ms == 0`, `None` while unset.
    rtc_base: Option<u32>,
    peer_on: bool,
    peer_boot_at: Option<u64>,
    battery_millivolts: u16,
}

impl World {
    fn network_time(&self) -> u32 {
        self.network_epoch + (self.now_ms / 1000) as u32
    }

    fn instant(&self) -> Instant {
        Instant::from_millis(self.now_ms)
    }
}

type SharedWorld = Rc<RefCell<World>>;

// ---------------------------------------------------------------------------
// Main board
// ---------------------------------------------------------------------------

struct SimBoard {
    world: SharedWorld,
    charging: bool,
    led: Option<LedPattern>,
}

impl Clock for SimBoard {
    fn now(&self) -> Instant {
        self.world.borrow().instant()
    }
}

impl Rtc for SimBoard {
    fn epoch(&self) -> u32 {
        let world = self.world.borrow();
        world.rtc_base.unwrap_or(0) + (world.now_ms / 1000) as u32
    }

    fn set_epoch(&mut self, epoch: u32) {
        let mut world = self.world.borrow_mut();
        world.rtc_base = Some(epoch.saturating_sub((world.now_ms / 1000) as u32));
    }

    fn is_configured(&self) -> bool {
        self.world.borrow().rtc_base.is_some()
    }
}

impl PowerMonitor for SimBoard {
    fn sample(&mut self) -> PowerSample {
        let mut world = self.world.borrow_mut();
        // Roughly one millivolt per simulated minute.
        let drained = (world.now_ms / 60_000) as u16;
        let millivolts = 4000u16.saturating_sub(drained);
        world.battery_millivolts = millivolts;
        PowerSample {
            usb_present: false,
            charge_status: ChargeStatus::NotCharging,
            battery_millivolts: millivolts,
            below_sys_min: false,
        }
    }

    fn set_charging(&mut self, enabled: bool) {
        self.charging = enabled;
    }

    fn charging(&self) -> bool {
        self.charging
    }
}

impl CoprocessorPower for SimBoard {
    type Error = Infallible;

    fn power_on(&mut self) -> Result<(), Infallible> {
        let mut world = self.world.borrow_mut();
        world.peer_on = true;
        world.peer_boot_at = Some(world.now_ms + PEER_BOOT_TIME.as_millis());
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Infallible> {
        let mut world = self.world.borrow_mut();
        world.peer_on = false;
        world.peer_boot_at = None;
        Ok(())
    }
}

impl SystemControl for SimBoard {
    async fn deep_sleep(&mut self, duration: Option<Duration>) {
        // Nobody presses the button in the simulator, wake after a minute.
        let duration = duration.unwrap_or(Duration::from_secs(60));
        debug!("Board sleeps for {} ms", duration.as_millis());
        self.world.borrow_mut().now_ms += duration.as_millis();
    }

    async fn delay(&mut self, duration: Duration) {
        self.world.borrow_mut().now_ms += duration.as_millis();
    }

    fn system_reset(&mut self) {
        warn!("System reset requested, the simulator keeps running");
    }

    fn unique_id(&self) -> heapless::String<32> {
        bounded("53434b53494d000000000001")
    }

    fn card_inserted(&mut self) -> bool {
        true
    }
}

impl StatusLed for SimBoard {
    fn show(&mut self, pattern: LedPattern) {
        if self.led != Some(pattern) {
            info!("LED: {:?}", pattern);
            self.led = Some(pattern);
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted co-processor
// ---------------------------------------------------------------------------

/// Frames in flight on the simulated UART, one queue per direction.
#[derive(Default)]
struct Wire {
    to_peer: VecDeque<Vec<u8>>,
    to_kit: VecDeque<Vec<u8>>,
}

type SharedWire = Rc<RefCell<Wire>>;

/// Kit end of the wire. Frames are acknowledged only while the co-processor
/// has power.
struct KitPort {
    world: SharedWorld,
    wire: SharedWire,
}

impl DatagramLink for KitPort {
    async fn send_acked(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.world.borrow().peer_on {
            return Err(LinkError::NoAck);
        }
        self.wire.borrow_mut().to_peer.push_back(frame.to_vec());
        Ok(())
    }

    async fn try_receive(&mut self, buf: &mut [u8; FRAME_SIZE]) -> Option<usize> {
        let frame = self.wire.borrow_mut().to_kit.pop_front()?;
        let len = frame.len().min(FRAME_SIZE);
        buf[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }

    fn reset(&mut self) {
        self.wire.borrow_mut().to_kit.clear();
    }
}

/// Co-processor end of the wire.
struct PeerPort {
    wire: SharedWire,
}

impl DatagramLink for PeerPort {
    async fn send_acked(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.wire.borrow_mut().to_kit.push_back(frame.to_vec());
        Ok(())
    }

    async fn try_receive(&mut self, buf: &mut [u8; FRAME_SIZE]) -> Option<usize> {
        let frame = self.wire.borrow_mut().to_peer.pop_front()?;
        let len = frame.len().min(FRAME_SIZE);
        buf[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }
}

/// Co-processor answering every request with success. It speaks the same
/// framing as the kit through its own [`LinkFramer`].
struct SimPeer {
    world: SharedWorld,
    wire: SharedWire,
    framer: LinkFramer<PeerPort>,
}

impl SimPeer {
    fn new(world: SharedWorld, wire: SharedWire) -> Self {
        Self {
            world,
            framer: LinkFramer::new(PeerPort { wire: wire.clone() }),
            wire,
        }
    }

    /// Boot when due, then answer everything the kit sent.
    async fn step(&mut self) {
        if !self.world.borrow().peer_on {
            self.wire.borrow_mut().to_peer.clear();
            return;
        }
        if self.boot_due() {
            self.framer.reset();
            self.send(
                InboundKind::Booted,
                Payload::new()
                    .with("mac", "5C:CF:7F:51:4D:01")
                    .with("ver", "sim-0.1")
                    .with("bd", "2024-01-01"),
            )
            .await;
            self.send(InboundKind::WifiConnected, Payload::new()).await;
        }

        loop {
            let now = self.world.borrow().instant();
            let decoded = match self.framer.poll(PeerState::Ready, now).await {
                Some(bytes) => OutboundMessage::decode(bytes),
                None => break,
            };
            match decoded {
                Ok(message) => self.answer(message).await,
                Err(e) => warn!("Co-processor dropped a message: {}", e),
            }
        }
    }

    fn boot_due(&mut self) -> bool {
        let mut world = self.world.borrow_mut();
        match world.peer_boot_at {
            Some(at) if world.now_ms >= at => {
                world.peer_boot_at = None;
                true
            }
            _ => false,
        }
    }

    async fn send(&mut self, kind: InboundKind, payload: Payload) {
        let bytes = match InboundMessage::new(kind, payload).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Simulated co-processor can't encode {:?}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = self.framer.send(PeerState::Ready, &bytes).await {
            warn!("Simulated co-processor can't send {:?}: {}", kind, e);
        }
    }

    async fn answer(&mut self, message: OutboundMessage) {
        let payload = &message.payload;
        match message.kind {
            OutboundKind::SetConfig => {
                let action = payload
                    .int("ac")
                    .and_then(|ac| u8::try_from(ac).ok())
                    .and_then(ConfigAction::from_tag);
                info!(
                    "Co-processor got config for \"{}\", action {:?}",
                    payload.text("ss").unwrap_or_default(),
                    action
                );
            }
            OutboundKind::GetTime => {
                let epoch = self.world.borrow().network_time();
                self.send(InboundKind::Time, Payload::new().with("t", epoch)).await;
            }
            OutboundKind::GetNetInfo => {
                self.send(
                    InboundKind::NetInfo,
                    Payload::new().with("ip", "10.0.0.42").with("hn", "sck-sim"),
                )
                .await
            }
            OutboundKind::MqttHello => self.send(InboundKind::MqttHelloOk, Payload::new()).await,
            OutboundKind::MqttInfo => self.send(InboundKind::MqttInfoOk, Payload::new()).await,
            OutboundKind::MqttPublish => {
                info!("Platform received {} values", payload.len());
                for (key, value) in payload.iter() {
                    debug!("  {} = {:?}", key, value);
                }
                self.send(InboundKind::MqttPublishOk, Payload::new()).await;
            }
            OutboundKind::MqttCustom => self.send(InboundKind::MqttCustomOk, Payload::new()).await,
            OutboundKind::StopAp | OutboundKind::LedOff => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic sensors
// ---------------------------------------------------------------------------

/// Urban board readings varying slowly with simulated time.
struct SimUrban {
    world: SharedWorld,
}

impl SensorBoard for SimUrban {
    async fn start(&mut self, _sensor: SensorType) -> Result<(), SensorError> {
        Ok(())
    }

    async fn stop(&mut self, _sensor: SensorType) -> Result<(), SensorError> {
        Ok(())
    }

    async fn reading(&mut self, sensor: SensorType) -> SensorPoll {
        let t = self.world.borrow().now_ms as f32 / 1000.0;
        let value = match sensor {
            SensorType::Temperature => 23.0 + 3.0 * (t / 120.0).sin(),
            SensorType::Humidity => 50.0 + 10.0 * (t / 180.0).sin(),
            SensorType::Noise => 45.0 + 8.0 * (t / 13.0).cos(),
            SensorType::Light => (300.0 + 250.0 * (t / 600.0).sin()).max(0.0),
            SensorType::Pressure => 101.3 + 0.2 * (t / 900.0).sin(),
            SensorType::Pm1 => 4.0 + (t / 70.0).sin(),
            SensorType::Pm25 => 8.0 + 2.0 * (t / 70.0).sin(),
            SensorType::Pm10 => 12.0 + 3.0 * (t / 70.0).sin(),
            SensorType::Vocs => 120.0 + 40.0 * (t / 300.0).cos(),
            SensorType::Eco2 => 600.0 + 200.0 * (t / 300.0).sin(),
            _ => return SensorPoll::Failed,
        };
        SensorPoll::Ready(value)
    }

    async fn control(&mut self, sensor: SensorType, command: &str) -> Result<String, SensorError> {
        Ok(format!("{:?} ok: {}", sensor, command))
    }
}

/// Auxiliary bus with only an external temperature and humidity sensor.
struct SimAux;

impl SimAux {
    fn fitted(sensor: SensorType) -> bool {
        matches!(sensor, SensorType::ExtTemperature | SensorType::ExtHumidity)
    }
}

impl SensorBoard for SimAux {
    async fn start(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        if Self::fitted(sensor) {
            Ok(())
        } else {
            Err(SensorError::NotPresent { sensor })
        }
    }

    async fn stop(&mut self, _sensor: SensorType) -> Result<(), SensorError> {
        Ok(())
    }

    async fn reading(&mut self, sensor: SensorType) -> SensorPoll {
        match sensor {
            SensorType::ExtTemperature => SensorPoll::Ready(14.5),
            SensorType::ExtHumidity => SensorPoll::Ready(71.0),
            _ => SensorPoll::Failed,
        }
    }

    async fn control(&mut self, sensor: SensorType, _command: &str) -> Result<String, SensorError> {
        Err(SensorError::NotControllable { sensor })
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Card kept in memory. Appended CSV rows are echoed to the log.
#[derive(Default)]
struct SimCard {
    files: BTreeMap<String, Vec<u8>>,
}

impl CardFs for SimCard {
    type Error = Infallible;

    fn exists(&mut self, name: &str) -> Result<bool, Infallible> {
        Ok(self.files.contains_key(name))
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), Infallible> {
        if name.ends_with(".CSV") {
            for row in String::from_utf8_lossy(data).lines() {
                info!("{}: {}", name, row);
            }
        }
        self.files.entry(name.into()).or_default().extend_from_slice(data);
        Ok(())
    }

    fn size(&mut self, name: &str) -> Result<u32, Infallible> {
        Ok(self.files.get(name).map_or(0, |f| f.len() as u32))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Infallible> {
        if let Some(contents) = self.files.remove(from) {
            self.files.insert(to.into(), contents);
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), Infallible> {
        self.files.remove(name);
        Ok(())
    }
}

#[derive(Default)]
struct SimConfigStore {
    record: Vec<u8>,
}

impl ConfigStore for SimConfigStore {
    type Error = Infallible;

    fn load(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let len = self.record.len().min(buf.len());
        buf[..len].copy_from_slice(&self.record[..len]);
        Ok(len)
    }

    fn save(&mut self, record: &[u8]) -> Result<(), Infallible> {
        self.record = record.to_vec();
        Ok(())
    }
}

struct Simulator;

impl Platform for Simulator {
    type Board = SimBoard;
    type Link = KitPort;
    type Urban = SimUrban;
    type Aux = SimAux;
    type Card = SimCard;
    type ConfigStore = SimConfigStore;
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn configuration(mode: KitMode) -> Configuration {
    let mut config = Configuration::default();
    config.mode = mode;
    config.credentials.set = true;
    config.credentials.ssid = bounded("sim-network");
    config.credentials.pass = bounded("sim-password");
    if mode == KitMode::Network {
        config.token.set = true;
        config.token.token = bounded("s1m0k3");
    }
    config
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mode = match args.next().as_deref() {
        Some("sd") => KitMode::StorageOnly,
        _ => KitMode::Network,
    };
    let minutes = args
        .next()
        .and_then(|m| m.parse::<u64>().ok())
        .unwrap_or(DEFAULT_MINUTES);
    info!("Starting sck-rs simulator in {:?} mode for {} minutes", mode, minutes);

    let network_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    let world = Rc::new(RefCell::new(World {
        now_ms: 0,
        network_epoch,
        // Storage mode has a battery backed RTC already set.
        rtc_base: (mode == KitMode::StorageOnly).then_some(network_epoch),
        peer_on: false,
        peer_boot_at: None,
        battery_millivolts: 0,
    }));

    let mut config_store = SimConfigStore::default();
    if let Err(e) = configuration(mode).save(&mut config_store) {
        warn!("Can't store the initial configuration: {}", e);
    }

    let identity = Identity {
        hardware_version: bounded("2.1"),
        firmware_version: bounded(env!("CARGO_PKG_VERSION")),
        build_date: bounded("simulator"),
        ..Identity::default()
    };
    let wire = SharedWire::default();
    let mut peer = SimPeer::new(world.clone(), wire.clone());
    let board = SimBoard {
        world: world.clone(),
        charging: false,
        led: None,
    };
    let mut kit = ModeController::<Simulator>::new(
        board,
        KitPort {
            world: world.clone(),
            wire,
        },
        SimUrban {
            world: world.clone(),
        },
        SimAux,
        SimCard::default(),
        config_store,
        identity,
    );

    block_on(kit.setup());

    let end_ms = minutes * 60_000;
    let mut last_report = 0u64;
    while world.borrow().now_ms < end_ms {
        world.borrow_mut().now_ms += TICK.as_millis();
        block_on(kit.update());
        block_on(peer.step());

        let now_ms = world.borrow().now_ms;
        if now_ms - last_report >= 60_000 {
            last_report = now_ms;
            let battery = world.borrow().battery_millivolts;
            info!(
                "[{} min] {} groups in memory, battery {} mV",
                now_ms / 60_000,
                kit.readings().count_groups(),
                battery
            );
        }
        std::thread::sleep(TICK_PACING);
    }

    info!("Simulator exiting");
}
