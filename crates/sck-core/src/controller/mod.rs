//! Mode controller
//!
//! [`ModeController`] owns every collaborator of the kit and is driven by
//! calling [`ModeController::update`] in a loop. Each call:
//!
//! 1. drains and dispatches complete messages from the co-processor,
//! 2. supervises power once per second,
//! 3. reviews the state machine every 500 ms (`review_state`).
//!
//! The review follows a fixed priority: shell and setup take over
//! completely, an unconfigured kit enters setup, network mode walks time
//! sync, hello, info and data publish in that order, and storage mode needs
//! a card and a synced clock before sampling to the card. Failures are
//! bounded by the [`Status`](crate::status::Status) trackers in
//! [`DeviceState`] and end in a co-processor reboot or power down, never in
//! a controller error.

mod coprocessor;
mod inbound;
mod publish;


pub use coprocessor::{BOOT_TIMEOUT, CoprocessorCommand, CoprocessorPower, PinCoprocessorPower};

use embassy_time::{Duration, Instant};

use crate::config::{Configuration, KitMode};
use crate::error::KitError;
use crate::hal::{LedPattern, Platform, StatusLed, SystemControl};
use crate::link::LinkFramer;
use crate::link::message::{InboundMessage, OutboundKind, OutboundMessage};
use crate::power::PowerSupervisor;
use crate::sensors::{
    BaseReadings, CycleOutcome, Sampler, SensorLocation, SensorSuite, SensorType,
};
use crate::state::{DeviceState, Identity};
use crate::storage::{CardFs, CardPublisher, PublishFlag, ReadingStore};
use crate::time::{Clock, Rtc, epoch_to_iso};

pub const REVIEW_INTERVAL: Duration = Duration::from_millis(500);
pub const POWER_INTERVAL: Duration = Duration::from_secs(1);

/// Co-processor configuration sync cadence and attempts before a reboot.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_SYNC_ATTEMPTS: u8 = 3;

/// No sleep this soon after a button press, card or USB event.
pub const USER_EVENT_WAIT: Duration = Duration::from_secs(30);

pub const SLEEP_DURATION: Duration = Duration::from_millis(2500);
pub const EMERGENCY_SLEEP: Duration = Duration::from_secs(60);

/// Complete messages dispatched per tick at most.
const MAX_MESSAGES_PER_TICK: usize = 8;

pub struct ModeController<P: Platform> {
    board: P::Board,
    framer: LinkFramer<P::Link>,
    suite: SensorSuite<P::Urban, P::Aux>,
    card: P::Card,
    config_store: P::ConfigStore,

    config: Configuration,
    state: DeviceState,
    identity: Identity,
    store: ReadingStore,
    sampler: Sampler,
    card_out: CardPublisher,
    power: PowerSupervisor,

    peer_started: Option<Instant>,
    pending_sync_config: bool,
    sync_attempts: u8,
    last_sync_attempt: Option<Instant>,
    net_info_received: bool,
    info_published: bool,
    time_synced_since_boot: bool,
    token_error: bool,
    card_init_pending: bool,
    debug_hour: Option<u32>,

    last_review: Option<Instant>,
    last_power: Option<Instant>,
    last_user_event: Option<Instant>,
    fully_off: bool,
    emergency: bool,
    led: Option<LedPattern>,
}

fn elapsed(since: Option<Instant>, now: Instant, interval: Duration) -> bool {
    since.is_none_or(|t| now.saturating_duration_since(t) >= interval)
}

impl<P: Platform> ModeController<P> {
    /// `identity` carries the firmware version, build date and hardware
    /// version; the rest is filled in at runtime.
    pub fn new(
        board: P::Board,
        link: P::Link,
        urban: P::Urban,
        aux: P::Aux,
        card: P::Card,
        config_store: P::ConfigStore,
        identity: Identity,
    ) -> Self {
        Self {
            board,
            framer: LinkFramer::new(link),
            suite: SensorSuite::new(urban, aux),
            card,
            config_store,
            config: Configuration::default(),
            state: DeviceState::default(),
            identity,
            store: ReadingStore::new(),
            sampler: Sampler::new(),
            card_out: CardPublisher::new(),
            power: PowerSupervisor::new(),
            peer_started: None,
            pending_sync_config: false,
            sync_attempts: 0,
            last_sync_attempt: None,
            net_info_received: false,
            info_published: false,
            time_synced_since_boot: false,
            token_error: false,
            card_init_pending: false,
            debug_hour: None,
            last_review: None,
            last_power: None,
            last_user_event: None,
            fully_off: false,
            emergency: false,
            led: None,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn readings(&self) -> &ReadingStore {
        &self.store
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    /// Boot sequence: clock check, co-processor restart, configuration and
    /// sensor start.
    pub async fn setup(&mut self) {
        log::info!(
            "Starting kit, firmware {} ({})",
            self.identity.firmware_version,
            self.identity.build_date
        );
        self.identity.unique_id = self.board.unique_id();

        if self.board.is_synced() {
            log::info!("RTC time: {}", epoch_to_iso(self.board.epoch()));
            self.state.time.set_ok();
        } else {
            log::info!("RTC is not synced");
        }

        self.last_power = Some(self.board.now());
        self.update_power();

        if self.board.card_inserted() {
            self.card_init_pending = true;
        }

        self.coprocessor(CoprocessorCommand::Reboot).await;
        self.load_config().await;
        if self.state.mode == KitMode::NotConfigured {
            self.card_out.mark_header_dirty();
        }
        self.start_sensors().await;
    }

    /// One cooperative tick.
    pub async fn update(&mut self) {
        self.receive_messages().await;

        if self.emergency {
            self.emergency_tick().await;
            return;
        }

        let now = self.board.now();
        if elapsed(self.last_power, now, POWER_INTERVAL) {
            self.last_power = Some(now);
            self.update_power();
        }
        if elapsed(self.last_review, now, REVIEW_INTERVAL) {
            self.last_review = Some(now);
            self.review_state().await;
        }
    }

    async fn receive_messages(&mut self) {
        for _ in 0..MAX_MESSAGES_PER_TICK {
            let now = self.board.now();
            let decoded = match self.framer.poll(self.state.peer, now).await {
                Some(bytes) => InboundMessage::decode(bytes),
                None => return,
            };
            match decoded {
                Ok(message) => self.handle_message(message).await,
                Err(e) => log::warn!("Dropping message from co-processor: {}", e),
            }
        }
    }

    pub(crate) async fn send(&mut self, message: OutboundMessage) -> Result<(), KitError> {
        let buf = message.encode()?;
        self.framer.send(self.state.peer, &buf).await?;
        log::debug!("Sent {:?} to co-processor", message.kind);
        Ok(())
    }

    async fn review_state(&mut self) {
        let now = self.board.now();

        self.check_boot_watchdog().await;
        self.sync_config_if_pending(now).await;
        if self.card_init_pending {
            self.init_card();
        }
        if self.config.debug_to_card && self.state.card_present {
            self.write_debug_log();
        }

        if self.state.on_shell || self.state.on_setup {
            return;
        }
        if self.fully_off {
            if self.sleep_allowed(now) {
                self.go_to_sleep().await;
            } else if self.sampler.pending_count() > 0 {
                // Finish the readings in flight before powering down.
                self.update_sensors().await;
            }
            return;
        }

        match self.state.mode {
            KitMode::NotConfigured => self.enter_setup().await,
            KitMode::Network => self.review_network(now).await,
            KitMode::StorageOnly => self.review_storage(now).await,
        }
    }

    async fn review_network(&mut self, now: Instant) {
        if !self.state.wifi_set {
            if !self.state.wifi.is_error() {
                log::warn!("Wifi is not configured");
                self.coprocessor(CoprocessorCommand::Off).await;
                self.show(LedPattern::NetworkError);
                self.state.wifi.set_error();
            }
            return;
        }
        if !self.state.token_set {
            if !self.token_error {
                log::warn!("Token is not configured");
                self.coprocessor(CoprocessorCommand::Off).await;
                self.show(LedPattern::NetworkError);
                self.token_error = true;
            }
            return;
        }

        let publish_due = self.sampler.time_to_publish() && self.has_publishable_group();
        if self.state.hello_pending || !self.state.time.is_ok() || publish_due || !self.info_published {
            self.drive_network(now, publish_due).await;
            return;
        }

        if self.sleep_allowed(now) {
            self.go_to_sleep().await;
        }
        self.update_sensors().await;
        if self.store.count_groups() > 0 {
            self.sd_publish();
        }
    }

    /// Network steps in order: wifi, time, hello, info, data.
    async fn drive_network(&mut self, now: Instant, publish_due: bool) {
        if !self.state.wifi.is_ok() {
            if self.state.wifi.retry(now) {
                self.coprocessor(CoprocessorCommand::On).await;
            } else if self.state.wifi.is_error() {
                log::warn!("Can't publish without wifi, keeping readings on the card");
                self.sd_publish();
                self.coprocessor(CoprocessorCommand::Off).await;
                self.show(LedPattern::NetworkError);
                self.sampler.mark_published(self.board.epoch());
                self.state.wifi.reset();
            }
            return;
        }

        self.show(LedPattern::Network);

        if !self.state.time.is_ok() {
            if self.state.time.retry(now) {
                if self.send(OutboundMessage::bare(OutboundKind::GetTime)).await.is_ok() {
                    log::info!("Asking time to co-processor...");
                }
            } else if self.state.time.is_error() {
                log::warn!("Can't get time from the network");
                self.coprocessor(CoprocessorCommand::Reboot).await;
                self.show(LedPattern::NetworkError);
                self.state.time.reset();
            }
        } else if self.state.hello_pending {
            if self.state.hello.retry(now) {
                if self.send(OutboundMessage::bare(OutboundKind::MqttHello)).await.is_ok() {
                    log::info!("Hello sent");
                }
            } else if self.state.hello.is_error() {
                log::warn!("Hello to the platform failed");
                self.coprocessor(CoprocessorCommand::Reboot).await;
                self.show(LedPattern::NetworkError);
                self.state.hello.reset();
            }
        } else if !self.info_published {
            if self.state.info.retry(now) {
                if self.publish_info().await {
                    log::info!("Kit info sent");
                }
            } else if self.state.info.is_error() {
                log::warn!("Sending kit info to the platform failed");
                self.state.info.reset();
            }
        } else if publish_due {
            self.drive_publish(now).await;
        }
    }

    async fn drive_publish(&mut self, now: Instant) {
        let epoch = self.board.epoch();
        if self.state.publish.is_ok() {
            self.sampler.restart_publish_interval(epoch);
            self.state.publish.reset();

            self.store.set_flag(0, PublishFlag::Network, true);
            self.sd_publish();
            if let Some(time) = self.store.time(0) {
                log::info!("({}) Published, erasing from memory", epoch_to_iso(time));
            }
            self.store.evict_flagged(PublishFlag::Network);

            if self.has_publishable_group() {
                if self.state.publish.retry(now) {
                    self.net_publish().await;
                }
            } else {
                self.sampler.clear_time_to_publish();
            }
        } else if self.state.publish.retry(now) {
            self.net_publish().await;
        } else if self.state.publish.is_error() {
            log::warn!("Publish failed, will retry on next publish interval");
            self.sd_publish();
            self.show(LedPattern::NetworkError);
            self.coprocessor(CoprocessorCommand::Off).await;
            self.sampler.mark_published(epoch);
            self.state.publish.reset();
        }
    }

    async fn review_storage(&mut self, now: Instant) {
        if !self.state.card_present {
            if !self.state.card_present_error {
                log::warn!("Can't find a card");
                self.show(LedPattern::StorageError);
                self.state.card_present_error = true;
            }
            if self.state.peer_on() && !self.pending_sync_config {
                self.coprocessor(CoprocessorCommand::Off).await;
            }
            return;
        }

        if !self.state.time.is_ok() {
            self.sync_time_over_wifi(now).await;
            return;
        }

        if self.sleep_allowed(now) && !self.sampler.time_to_publish() {
            self.go_to_sleep().await;
        }
        self.update_sensors().await;

        self.show(LedPattern::Storage);
        if self.state.peer_on() && !self.pending_sync_config {
            self.coprocessor(CoprocessorCommand::Off).await;
        }

        if self.sampler.time_to_publish() && self.store.count_groups() > 0 {
            if self.sd_publish() {
                self.sampler.mark_published(self.board.epoch());
            } else {
                log::warn!("Failed writing readings to the card");
                self.show(LedPattern::StorageError);
            }
        }
    }

    /// Storage mode has no other time source than the network.
    async fn sync_time_over_wifi(&mut self, now: Instant) {
        if !self.state.wifi_set {
            if !self.state.wifi.is_error() {
                log::warn!("Time is not synced and no wifi is set");
                self.coprocessor(CoprocessorCommand::Off).await;
                self.show(LedPattern::StorageError);
                self.state.wifi.set_error();
            }
            return;
        }

        if !self.state.wifi.is_ok() {
            if self.state.wifi.retry(now) {
                self.coprocessor(CoprocessorCommand::On).await;
            } else if self.state.wifi.is_error() {
                log::warn!("Time is not synced, no wifi found");
                self.coprocessor(CoprocessorCommand::Off).await;
                self.show(LedPattern::StorageError);
                self.state.wifi.reset();
            }
        } else if self.state.time.retry(now) {
            if self.send(OutboundMessage::bare(OutboundKind::GetTime)).await.is_ok() {
                log::info!("Asking time to co-processor...");
            }
        } else if self.state.time.is_error() {
            log::warn!("Time sync failed");
            self.state.time.reset();
            self.coprocessor(CoprocessorCommand::Off).await;
            self.show(LedPattern::StorageError);
        }
    }

    async fn sync_config_if_pending(&mut self, now: Instant) {
        if !self.pending_sync_config || !elapsed(self.last_sync_attempt, now, SYNC_INTERVAL) {
            return;
        }
        self.last_sync_attempt = Some(now);

        if self.sync_attempts > MAX_SYNC_ATTEMPTS {
            log::warn!("Co-processor did not take the configuration, restarting it");
            self.coprocessor(CoprocessorCommand::Reboot).await;
            self.sync_attempts = 0;
        } else if self.state.peer_on() {
            if !self.state.peer_booting() {
                self.send_config().await;
            }
            self.sync_attempts += 1;
        } else {
            self.coprocessor(CoprocessorCommand::On).await;
        }
    }

    fn has_publishable_group(&self) -> bool {
        self.store.count_groups() > 0 && self.store.is_complete(0)
    }

    fn user_event_recent(&self, now: Instant) -> bool {
        self.last_user_event
            .is_some_and(|t| now.saturating_duration_since(t) < USER_EVENT_WAIT)
    }

    fn sleep_allowed(&self, now: Instant) -> bool {
        !self.power.on_usb() && self.sampler.pending_count() == 0 && !self.user_event_recent(now)
    }

    async fn go_to_sleep(&mut self) {
        self.show(LedPattern::Off);
        if self.state.peer_on() {
            self.coprocessor(CoprocessorCommand::Sleep).await;
        }

        if self.fully_off {
            log::info!("Going off, press the button to wake up");
            self.board.deep_sleep(None).await;
            self.fully_off = false;
            self.last_user_event = Some(self.board.now());
        } else {
            log::debug!("Sleeping");
            self.state.sleeping = true;
            self.board.deep_sleep(Some(SLEEP_DURATION)).await;
            self.state.sleeping = false;
        }
        self.show_mode();
    }

    async fn update_sensors(&mut self) {
        if !self.board.is_synced() {
            self.state.time.reset();
        }
        if !self.state.time.is_ok()
            || self.state.hello_pending
            || self.state.on_setup
            || (self.state.mode == KitMode::StorageOnly && !self.state.card_present)
        {
            return;
        }

        let base = BaseReadings {
            battery_percent: self.power.percent(),
            battery_volts: self.power.volts(),
            card_present: self.state.card_present,
        };

        let mut outcome = self.run_cycle(&base).await;
        if outcome == CycleOutcome::StoreFull {
            if self.relieve_full_store() {
                outcome = self.run_cycle(&base).await;
            }
            if outcome == CycleOutcome::StoreFull {
                log::error!("Reading store is full and can't be flushed, resetting");
                self.board.system_reset();
            }
        }
    }

    async fn run_cycle(&mut self, base: &BaseReadings) -> CycleOutcome {
        let epoch = self.board.epoch();
        self.sampler
            .update(epoch, &self.config, &mut self.suite, base, &mut self.store)
            .await
    }

    /// Flush to the card and drop what is safely stored there. Returns
    /// `true` if room was made.
    fn relieve_full_store(&mut self) -> bool {
        if !self.state.card_present {
            return false;
        }
        log::warn!("Reading store is full, flushing to the card");
        let before = self.store.count_groups();
        // Storage mode already evicts what the card took.
        self.sd_publish();
        self.store.evict_flagged(PublishFlag::Storage);
        self.store.count_groups() < before
    }

    fn update_power(&mut self) {
        let now = self.board.now();
        let update = self.power.update(&mut self.board);
        if update.usb_changed {
            self.last_user_event = Some(now);
        }
        if update.emergency && !self.emergency {
            self.emergency = true;
            // Events seen before the emergency must not end it.
            self.last_user_event = None;
        }
    }

    /// Long sleeps until USB comes back or the user does something.
    async fn emergency_tick(&mut self) {
        let now = self.board.now();
        if self.power.on_usb() || self.user_event_recent(now) {
            log::info!("Leaving emergency sleep");
            self.emergency = false;
            self.show_mode();
            return;
        }

        self.show(LedPattern::LowBattery);
        if self.state.peer_on() {
            self.coprocessor(CoprocessorCommand::Off).await;
        }
        self.show(LedPattern::Off);
        self.board.deep_sleep(Some(EMERGENCY_SLEEP)).await;

        self.last_power = Some(self.board.now());
        self.update_power();
    }

    async fn load_config(&mut self) {
        match Configuration::load(&mut self.config_store) {
            Ok(config) => {
                log::info!("Configuration loaded");
                self.config = config;
                self.sampler.load(&self.config);
                self.mirror_config();
                self.show_mode();
            }
            Err(e) => {
                log::warn!("Can't load configuration ({}), loading defaults", e);
                self.save_config(true).await;
            }
        }
    }

    fn mirror_config(&mut self) {
        self.state.mode = self.config.mode;
        self.state.wifi_set = self.config.credentials.set;
        self.state.token_set = self.config.token.set;
        self.token_error = false;
    }

    fn persist_config(&mut self) {
        if let Err(e) = self.config.save(&mut self.config_store) {
            log::error!("Saving configuration failed: {}", e);
        }
    }

    /// Store the configuration and apply it. With `defaults` everything but
    /// a learned MAC address is reset first.
    pub async fn save_config(&mut self, defaults: bool) {
        if defaults {
            self.config.reset_to_defaults();
            self.sampler.load(&self.config);
            self.pending_sync_config = true;
        } else {
            self.sampler.store_into(&mut self.config);
        }
        self.persist_config();
        log::info!("Configuration saved");

        self.mirror_config();
        self.state.wifi.reset();
        self.sampler.schedule_now(self.board.epoch(), &self.config);
        if self.state.wifi_set || self.state.token_set {
            self.pending_sync_config = true;
        }

        match self.state.mode {
            KitMode::Network => {
                if self.state.wifi_set && self.state.token_set {
                    self.info_published = false;
                    self.state.hello_pending = true;
                    self.state.on_setup = false;
                    self.show(LedPattern::Network);
                    self.stop_access_point().await;
                } else {
                    log::warn!("Network mode needs wifi and token");
                    self.coprocessor(CoprocessorCommand::Off).await;
                    self.show(LedPattern::NetworkError);
                }
            }
            KitMode::StorageOnly => {
                self.state.hello_pending = false;
                self.state.on_setup = false;
                self.show(LedPattern::Storage);
                self.stop_access_point().await;
            }
            KitMode::NotConfigured => {}
        }

        if self.pending_sync_config && !self.state.peer_on() {
            self.coprocessor(CoprocessorCommand::On).await;
        }
    }

    async fn stop_access_point(&mut self) {
        if let Err(e) = self.send(OutboundMessage::bare(OutboundKind::StopAp)).await {
            log::debug!("Access point stop not sent: {}", e);
        }
    }

    /// Opens the setup access point through the co-processor.
    pub async fn enter_setup(&mut self) {
        log::info!("Entering setup mode");
        self.state.on_setup = true;
        self.show(LedPattern::Setup);
        self.token_error = false;
        self.state.card_present_error = false;
        self.coprocessor(CoprocessorCommand::Reboot).await;
    }

    /// Start enabled board sensors and pick up auxiliary sensors that
    /// answer.
    async fn start_sensors(&mut self) {
        let mut changed = false;
        for sensor in SensorType::PRIORITY {
            let location = sensor.location();
            let enabled = self.sampler.is_enabled(sensor);
            if location == SensorLocation::Base || (location == SensorLocation::Urban && !enabled) {
                continue;
            }

            match self.suite.start(sensor).await {
                Ok(()) => {
                    if location == SensorLocation::Urban {
                        self.suite.urban_present = true;
                    }
                    if !enabled {
                        log::info!("Found {}", sensor.info().title);
                        self.sampler.set_enabled(sensor, true);
                        changed = true;
                    }
                }
                Err(e) if enabled => {
                    log::warn!("Disabling {}: {}", sensor.info().title, e);
                    self.sampler.set_enabled(sensor, false);
                    changed = true;
                }
                Err(_) => {}
            }
        }

        if changed {
            self.card_out.mark_header_dirty();
            self.save_config(false).await;
        }
    }

    pub async fn enable_sensor(&mut self, sensor: SensorType) -> Result<(), KitError> {
        self.sampler.enable(&mut self.suite, sensor).await?;
        self.sensors_changed();
        Ok(())
    }

    pub async fn disable_sensor(&mut self, sensor: SensorType) -> Result<(), KitError> {
        self.sampler.disable(&mut self.suite, sensor).await?;
        self.sensors_changed();
        Ok(())
    }

    fn sensors_changed(&mut self) {
        self.card_out.mark_header_dirty();
        self.sampler.store_into(&mut self.config);
        self.persist_config();
    }

    pub async fn control_sensor(
        &mut self,
        sensor: SensorType,
        command: &str,
    ) -> Result<alloc::string::String, KitError> {
        Ok(self.suite.control(sensor, command).await?)
    }

    fn init_card(&mut self) {
        self.card_init_pending = false;
        match self.card.probe() {
            Ok(()) => {
                log::info!("Card ready");
                self.state.card_present = true;
                self.state.card_present_error = false;
                self.card_out.mark_info_stale();
                self.save_info();
            }
            Err(e) => {
                log::warn!("Card is not usable: {:?}", e);
                self.state.card_present = false;
            }
        }
    }

    /// Short press: toggle setup mode.
    pub async fn button_event(&mut self) {
        self.last_user_event = Some(self.board.now());
        if self.state.on_setup {
            log::info!("Leaving setup mode");
            self.state.on_setup = false;
            self.save_config(false).await;
        } else {
            self.enter_setup().await;
        }
    }

    /// Mirror the log to the card from now on, or stop doing so.
    pub fn set_card_debug(&mut self, on: bool) {
        self.config.debug_to_card = on;
        self.debug_hour = None;
        self.persist_config();
    }

    /// Long press or shell command: sleep until the button wakes the kit.
    pub fn set_fully_off(&mut self, off: bool) {
        self.fully_off = off;
        if off {
            self.last_user_event = None;
        }
    }

    pub fn card_detect(&mut self, present: bool) {
        self.last_user_event = Some(self.board.now());
        if present {
            log::info!("Card inserted");
            self.card_init_pending = true;
        } else {
            log::info!("Card removed");
            self.state.card_present = false;
            self.state.card_present_error = false;
        }
    }

    pub fn enter_shell(&mut self) {
        self.last_user_event = Some(self.board.now());
        self.state.on_shell = true;
    }

    pub fn exit_shell(&mut self) {
        self.last_user_event = Some(self.board.now());
        self.state.on_shell = false;
    }

    fn show(&mut self, pattern: LedPattern) {
        if self.led != Some(pattern) {
            self.led = Some(pattern);
            self.board.show(pattern);
        }
    }

    fn show_mode(&mut self) {
        let pattern = if self.state.on_setup {
            LedPattern::Setup
        } else {
            match self.state.mode {
                KitMode::NotConfigured => LedPattern::Setup,
                KitMode::Network => LedPattern::Network,
                KitMode::StorageOnly => LedPattern::Storage,
            }
        };
        self.show(pattern);
    }
}
