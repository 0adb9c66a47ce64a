//! Outbound data: network publish, card output, kit info and the
//! co-processor configuration.

use alloc::string::ToString;

use super::{CoprocessorCommand, ModeController};
use crate::config::KitMode;
use crate::error::KitError;
use crate::hal::Platform;
use crate::link::message::{ConfigAction, OutboundKind, OutboundMessage, Payload};
use crate::storage::PublishFlag;
use crate::storage::debug_log::{CARD_LOG, MAX_DEBUG_SIZE, rotate_debug, write_debug};
use crate::time::{Rtc, epoch_to_iso};

impl<P: Platform> ModeController<P> {
    /// Send the oldest reading group. Null readings are left out.
    pub(super) async fn net_publish(&mut self) -> bool {
        if !self.has_publishable_group() || self.store.flag(0, PublishFlag::Network) {
            return false;
        }
        let Some(time) = self.store.time(0) else {
            return false;
        };
        let iso = epoch_to_iso(time);

        let mut payload = Payload::new().with("t", iso.as_str());
        for index in 0..self.store.count_readings(0) {
            let Some(reading) = self.store.read_reading(0, index) else {
                continue;
            };
            let id = reading.sensor.info().id;
            if id == 0 {
                continue;
            }
            if let Some(value) = reading.value {
                payload.insert(&id.to_string(), value);
            }
        }

        log::info!("({}) Publishing {} readings", iso, payload.len() - 1);
        match self
            .send(OutboundMessage::new(OutboundKind::MqttPublish, payload))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Publish not sent: {}", e);
                false
            }
        }
    }

    /// Write complete groups to the card. In storage-only mode the written
    /// groups leave memory.
    pub(super) fn sd_publish(&mut self) -> bool {
        if !self.state.card_present {
            return false;
        }
        let enabled = self.sampler.enabled_set();
        match self
            .card_out
            .publish(&mut self.card, &mut self.store, &enabled)
        {
            Ok(written) => {
                if written > 0 {
                    log::debug!("{} groups written to the card", written);
                }
                if self.state.mode == KitMode::StorageOnly {
                    self.store.evict_flagged(PublishFlag::Storage);
                }
                self.save_info();
                true
            }
            Err(e) => {
                log::warn!("Writing to the card failed: {}", e);
                false
            }
        }
    }

    /// Move queued log lines to the card, checking the file size once an
    /// hour. A failing card counts as removed.
    pub(super) fn write_debug_log(&mut self) {
        let epoch = self.board.epoch();
        let hour = epoch / 3600;
        if self.debug_hour != Some(hour) {
            self.debug_hour = Some(hour);
            if let Err(e) = rotate_debug(&mut self.card, MAX_DEBUG_SIZE) {
                log::warn!("Checking the debug file failed: {}", e);
                self.state.card_present = false;
                return;
            }
        }

        let pending = CARD_LOG.take();
        if pending.is_empty() {
            return;
        }
        if let Err(e) = write_debug(&mut self.card, epoch, &pending) {
            log::warn!("Writing the debug file failed: {}", e);
            self.state.card_present = false;
        }
    }

    pub(super) fn save_info(&mut self) {
        if !self.state.card_present || self.card_out.info_saved() {
            return;
        }
        if let Err(e) = self.card_out.save_info(&mut self.card, &self.identity) {
            log::warn!("Writing the info file failed: {}", e);
        }
    }

    /// Hardware and firmware identity to the platform. Asks for the network
    /// info first if it has not arrived yet.
    pub(super) async fn publish_info(&mut self) -> bool {
        if !self.net_info_received {
            if let Err(e) = self
                .send(OutboundMessage::bare(OutboundKind::GetNetInfo))
                .await
            {
                log::debug!("Network info request not sent: {}", e);
            }
            return false;
        }
        if !self.state.peer_on() {
            self.coprocessor(CoprocessorCommand::On).await;
            return false;
        }

        let identity = &self.identity;
        let payload = Payload::new()
            .with("time", epoch_to_iso(self.board.epoch()).as_str())
            .with("hw_ver", identity.hardware_version.as_str())
            .with("id", identity.unique_id.as_str())
            .with("sam_ver", identity.firmware_version.as_str())
            .with("sam_bd", identity.build_date.as_str())
            .with("mac", identity.peer_mac.as_str())
            .with("esp_ver", identity.peer_version.as_str())
            .with("esp_bd", identity.peer_build_date.as_str());
        self.send(OutboundMessage::new(OutboundKind::MqttInfo, payload))
            .await
            .is_ok()
    }

    /// Hand wifi credentials and token to the co-processor, telling it to
    /// connect or to open the setup access point.
    pub(super) async fn send_config(&mut self) -> bool {
        if !self.state.peer_on() {
            self.coprocessor(CoprocessorCommand::On).await;
            return false;
        }
        if self.state.peer_booting() {
            return false;
        }

        let connect = !self.state.on_setup
            && match self.state.mode {
                KitMode::Network => self.state.wifi_set && self.state.token_set,
                KitMode::StorageOnly => self.state.wifi_set,
                KitMode::NotConfigured => false,
            };
        let action = if connect {
            ConfigAction::Connect
        } else {
            ConfigAction::StartAp
        };

        let config = &self.config;
        let payload = Payload::new()
            .with("cs", config.credentials.set)
            .with("ss", config.credentials.ssid.as_str())
            .with("pa", config.credentials.pass.as_str())
            .with("ts", config.token.set)
            .with("to", config.token.token.as_str())
            .with("ver", self.identity.firmware_version.as_str())
            .with("bd", self.identity.build_date.as_str())
            .with("ac", action.tag());

        match self
            .send(OutboundMessage::new(OutboundKind::SetConfig, payload))
            .await
        {
            Ok(()) => {
                log::info!("Configuration synced with co-processor");
                self.pending_sync_config = false;
                self.sync_attempts = 0;
                true
            }
            Err(e) => {
                log::debug!("Configuration sync failed: {}", e);
                false
            }
        }
    }

    /// Publish free-form `payload` on MQTT `topic`.
    pub async fn mqtt_custom(&mut self, topic: &str, payload: &str) -> Result<(), KitError> {
        let payload = Payload::new().with("to", topic).with("pl", payload);
        self.send(OutboundMessage::new(OutboundKind::MqttCustom, payload))
            .await
    }
}
