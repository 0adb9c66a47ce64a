//! Test doubles shared by the unit tests.
//!
//! Handles are cheap clones over shared state, so a test keeps one copy
//! while the code under test owns the other.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::config::ConfigStore;
use crate::controller::CoprocessorPower;
use crate::hal::{LedPattern, Platform, StatusLed, SystemControl};
use crate::link::message::{InboundMessage, OutboundKind, OutboundMessage};
use crate::link::{CHUNK_SIZE, CONTINUATION_FLAG, DatagramLink, FRAME_SIZE, LinkError};
use crate::power::{ChargeStatus, PowerMonitor, PowerSample};
use crate::sensors::{NoBoard, SENSOR_COUNT, SensorBoard, SensorError, SensorPoll, SensorType};
use crate::storage::CardFs;
use crate::time::{Clock, Rtc};

#[derive(Default)]
struct LinkState {
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    fail_after: Option<usize>,
    resets: usize,
}

/// Loopback datagram link recording every frame sent.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Rc<RefCell<LinkState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent.clone()
    }

    /// Times the link was told the peer lost power.
    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    pub fn push_inbound(&self, frame: &[u8]) {
        self.state.borrow_mut().inbound.push_back(frame.to_vec());
    }

    /// The first `n` frames are acknowledged, later ones fail.
    pub fn fail_sends_after(&self, n: usize) {
        self.state.borrow_mut().fail_after = Some(n);
    }

    /// Fragment and queue a message as the co-processor would send it.
    pub fn push_message(&self, message: &InboundMessage) {
        let bytes = message.encode().unwrap();
        let total = bytes.len().div_ceil(CHUNK_SIZE) as u8;
        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            let header = if index == 0 {
                total
            } else {
                CONTINUATION_FLAG | index as u8
            };
            let mut frame = vec![header];
            frame.extend_from_slice(chunk);
            self.push_inbound(&frame);
        }
    }

    /// Reassemble every message sent so far.
    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        let mut buf = Vec::new();
        let mut expected = 0u8;
        let mut received = 0u8;
        for frame in self.sent() {
            if frame[0] & CONTINUATION_FLAG == 0 {
                buf.clear();
                expected = frame[0];
                received = 0;
            }
            buf.extend_from_slice(&frame[1..]);
            received += 1;
            if received == expected {
                messages.push(OutboundMessage::decode(&buf).unwrap());
            }
        }
        messages
    }

    pub fn sent_kinds(&self) -> Vec<OutboundKind> {
        self.sent_messages().into_iter().map(|m| m.kind).collect()
    }

    pub fn count_sent(&self, kind: OutboundKind) -> usize {
        self.sent_kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl DatagramLink for MockLink {
    async fn send_acked(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if let Some(limit) = state.fail_after {
            if state.sent.len() >= limit {
                return Err(LinkError::NoAck);
            }
        }
        state.sent.push(frame.to_vec());
        Ok(())
    }

    async fn try_receive(&mut self, buf: &mut [u8; FRAME_SIZE]) -> Option<usize> {
        let frame = self.state.borrow_mut().inbound.pop_front()?;
        let len = frame.len().min(FRAME_SIZE);
        buf[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }

    fn reset(&mut self) {
        self.state.borrow_mut().resets += 1;
    }
}

struct SensorsState {
    values: [Option<SensorPoll>; SENSOR_COUNT],
    absent: Vec<SensorType>,
    started: Vec<SensorType>,
}

/// Sensor board answering `Ready(1.0)` unless told otherwise.
#[derive(Clone)]
pub struct MockSensors {
    state: Rc<RefCell<SensorsState>>,
}

impl Default for MockSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSensors {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SensorsState {
                values: [None; SENSOR_COUNT],
                absent: Vec::new(),
                started: Vec::new(),
            })),
        }
    }

    pub fn set_value(&self, sensor: SensorType, poll: SensorPoll) {
        self.state.borrow_mut().values[sensor.index()] = Some(poll);
    }

    /// `start` fails for this sensor.
    pub fn set_absent(&self, sensor: SensorType) {
        self.state.borrow_mut().absent.push(sensor);
    }

    pub fn started(&self) -> Vec<SensorType> {
        self.state.borrow().started.clone()
    }
}

impl SensorBoard for MockSensors {
    async fn start(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        let mut state = self.state.borrow_mut();
        if state.absent.contains(&sensor) {
            return Err(SensorError::NotPresent { sensor });
        }
        state.started.push(sensor);
        Ok(())
    }

    async fn stop(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        self.state.borrow_mut().started.retain(|s| *s != sensor);
        Ok(())
    }

    async fn reading(&mut self, sensor: SensorType) -> SensorPoll {
        self.state.borrow().values[sensor.index()].unwrap_or(SensorPoll::Ready(1.0))
    }

    async fn control(
        &mut self,
        sensor: SensorType,
        command: &str,
    ) -> Result<String, SensorError> {
        Ok(format!("{:?}: {}", sensor, command))
    }
}

#[derive(Default)]
struct CardState {
    files: BTreeMap<String, String>,
    unusable: bool,
}

/// Card filesystem kept in memory.
#[derive(Clone, Default)]
pub struct MemCard {
    state: Rc<RefCell<CardState>>,
}

impl MemCard {
    pub fn insert(&self, name: &str, contents: &str) {
        self.state
            .borrow_mut()
            .files
            .insert(name.into(), contents.into());
    }

    pub fn contents(&self, name: &str) -> Option<String> {
        self.state.borrow().files.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.borrow().files.keys().cloned().collect()
    }

    /// Probing and writing fail from now on.
    pub fn set_unusable(&self, unusable: bool) {
        self.state.borrow_mut().unusable = unusable;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardError {
    Unusable,
    NotFound,
}

impl CardFs for MemCard {
    type Error = CardError;

    fn probe(&mut self) -> Result<(), CardError> {
        if self.state.borrow().unusable {
            Err(CardError::Unusable)
        } else {
            Ok(())
        }
    }

    fn exists(&mut self, name: &str) -> Result<bool, CardError> {
        Ok(self.state.borrow().files.contains_key(name))
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), CardError> {
        if self.state.borrow().unusable {
            return Err(CardError::Unusable);
        }
        let text = String::from_utf8_lossy(data);
        self.state
            .borrow_mut()
            .files
            .entry(name.into())
            .or_default()
            .push_str(&text);
        Ok(())
    }

    fn size(&mut self, name: &str) -> Result<u32, CardError> {
        let state = self.state.borrow();
        let contents = state.files.get(name).ok_or(CardError::NotFound)?;
        Ok(contents.len() as u32)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), CardError> {
        let mut state = self.state.borrow_mut();
        let contents = state.files.remove(from).ok_or(CardError::NotFound)?;
        state.files.insert(to.into(), contents);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), CardError> {
        self.state.borrow_mut().files.remove(name);
        Ok(())
    }
}

/// Configuration record kept in memory.
#[derive(Clone, Default)]
pub struct MemConfigStore {
    record: Rc<RefCell<Vec<u8>>>,
}

impl ConfigStore for MemConfigStore {
    type Error = Infallible;

    fn load(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let record = self.record.borrow();
        let len = record.len().min(buf.len());
        buf[..len].copy_from_slice(&record[..len]);
        Ok(len)
    }

    fn save(&mut self, record: &[u8]) -> Result<(), Infallible> {
        *self.record.borrow_mut() = record.to_vec();
        Ok(())
    }
}

/// Charger returning a fixed sample.
pub struct MockPower {
    sample: PowerSample,
    charging: bool,
}

impl MockPower {
    pub fn new(sample: PowerSample) -> Self {
        Self {
            sample,
            charging: false,
        }
    }

    pub fn set(&mut self, sample: PowerSample) {
        self.sample = sample;
    }
}

impl PowerMonitor for MockPower {
    fn sample(&mut self) -> PowerSample {
        self.sample
    }

    fn set_charging(&mut self, enabled: bool) {
        self.charging = enabled;
    }

    fn charging(&self) -> bool {
        self.charging
    }
}

pub const ON_BATTERY: PowerSample = PowerSample {
    usb_present: false,
    charge_status: ChargeStatus::NotCharging,
    battery_millivolts: 3900,
    below_sys_min: false,
};

pub const ON_USB: PowerSample = PowerSample {
    usb_present: true,
    charge_status: ChargeStatus::FastCharging,
    battery_millivolts: 3900,
    below_sys_min: false,
};

struct BoardState {
    now_ms: u64,
    /// RTC reading at `now_ms == 0`.
    epoch_base: u32,
    rtc_configured: bool,
    power: MockPower,
    coprocessor_on: bool,
    power_ons: usize,
    card_inserted: bool,
    sleeps: Vec<Option<Duration>>,
    resets: usize,
    leds: Vec<LedPattern>,
}

/// Main board with a simulated clock. Sleeping and delays advance it.
#[derive(Clone)]
pub struct MockBoard {
    state: Rc<RefCell<BoardState>>,
}

impl MockBoard {
    /// `epoch` of `None` leaves the RTC unset.
    pub fn new(epoch: Option<u32>) -> Self {
        Self {
            state: Rc::new(RefCell::new(BoardState {
                now_ms: 0,
                epoch_base: epoch.unwrap_or(0),
                rtc_configured: epoch.is_some(),
                power: MockPower::new(ON_BATTERY),
                coprocessor_on: false,
                power_ons: 0,
                card_inserted: false,
                sleeps: Vec::new(),
                resets: 0,
                leds: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.state.borrow_mut().now_ms += ms;
    }

    pub fn set_power(&self, sample: PowerSample) {
        self.state.borrow_mut().power.set(sample);
    }

    pub fn set_card_inserted(&self, inserted: bool) {
        self.state.borrow_mut().card_inserted = inserted;
    }

    pub fn coprocessor_on(&self) -> bool {
        self.state.borrow().coprocessor_on
    }

    pub fn power_ons(&self) -> usize {
        self.state.borrow().power_ons
    }

    pub fn sleeps(&self) -> Vec<Option<Duration>> {
        self.state.borrow().sleeps.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    pub fn last_led(&self) -> Option<LedPattern> {
        self.state.borrow().leds.last().copied()
    }

    pub fn showed(&self, pattern: LedPattern) -> bool {
        self.state.borrow().leds.contains(&pattern)
    }
}

impl Clock for MockBoard {
    fn now(&self) -> Instant {
        Instant::from_millis(self.state.borrow().now_ms)
    }
}

impl Rtc for MockBoard {
    fn epoch(&self) -> u32 {
        let state = self.state.borrow();
        state.epoch_base + (state.now_ms / 1000) as u32
    }

    fn set_epoch(&mut self, epoch: u32) {
        let mut state = self.state.borrow_mut();
        state.epoch_base = epoch.saturating_sub((state.now_ms / 1000) as u32);
        state.rtc_configured = true;
    }

    fn is_configured(&self) -> bool {
        self.state.borrow().rtc_configured
    }
}

impl PowerMonitor for MockBoard {
    fn sample(&mut self) -> PowerSample {
        self.state.borrow_mut().power.sample()
    }

    fn set_charging(&mut self, enabled: bool) {
        self.state.borrow_mut().power.set_charging(enabled);
    }

    fn charging(&self) -> bool {
        self.state.borrow().power.charging()
    }
}

impl CoprocessorPower for MockBoard {
    type Error = Infallible;

    fn power_on(&mut self) -> Result<(), Infallible> {
        let mut state = self.state.borrow_mut();
        state.coprocessor_on = true;
        state.power_ons += 1;
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), Infallible> {
        self.state.borrow_mut().coprocessor_on = false;
        Ok(())
    }
}

impl SystemControl for MockBoard {
    async fn deep_sleep(&mut self, duration: Option<Duration>) {
        let mut state = self.state.borrow_mut();
        state.sleeps.push(duration);
        state.now_ms += duration.unwrap_or(Duration::from_secs(60)).as_millis();
    }

    async fn delay(&mut self, duration: Duration) {
        self.state.borrow_mut().now_ms += duration.as_millis();
    }

    fn system_reset(&mut self) {
        self.state.borrow_mut().resets += 1;
    }

    fn unique_id(&self) -> heapless::String<32> {
        crate::config::bounded("53434b0000000001")
    }

    fn card_inserted(&mut self) -> bool {
        self.state.borrow().card_inserted
    }
}

impl StatusLed for MockBoard {
    fn show(&mut self, pattern: LedPattern) {
        self.state.borrow_mut().leds.push(pattern);
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Board = MockBoard;
    type Link = MockLink;
    type Urban = MockSensors;
    type Aux = NoBoard;
    type Card = MemCard;
    type ConfigStore = MemConfigStore;
}
