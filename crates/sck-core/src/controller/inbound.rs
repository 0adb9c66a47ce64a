//! Dispatch of messages from the co-processor

use super::ModeController;
use crate::config::{KitMode, MacAddress, bounded};
use crate::hal::Platform;
use crate::link::PeerState;
use crate::link::message::{InboundKind, InboundMessage, OutboundKind, OutboundMessage, Payload};
use crate::time::{Clock, RTC_SET_TOLERANCE_SECS, Rtc, epoch_to_iso};

impl<P: Platform> ModeController<P> {
    pub(super) async fn handle_message(&mut self, message: InboundMessage) {
        let payload = &message.payload;
        match message.kind {
            InboundKind::SetConfig => {
                log::info!("New configuration from setup");
                self.apply_remote_config(&message.payload).await;
            }
            InboundKind::Debug => {
                log::debug!("Co-processor: {}", payload.text("m").unwrap_or_default());
            }
            InboundKind::NetInfo => {
                self.identity.peer_ip = bounded(payload.text("ip").unwrap_or_default());
                self.identity.peer_hostname = bounded(payload.text("hn").unwrap_or_default());
                self.net_info_received = true;
                log::info!(
                    "IP address: {}, hostname: {}",
                    self.identity.peer_ip,
                    self.identity.peer_hostname
                );
            }
            InboundKind::WifiConnected => {
                log::info!("Connected to wifi");
                self.state.wifi.set_ok();
                let now = self.board.now();
                if !self.time_synced_since_boot
                    && self.state.time.retry(now)
                    && self
                        .send(OutboundMessage::bare(OutboundKind::GetTime))
                        .await
                        .is_ok()
                {
                    log::info!("Asking time to co-processor...");
                }
            }
            InboundKind::SsidError => {
                log::warn!("Can't find the configured wifi network");
                self.state.wifi.set_error();
            }
            InboundKind::PassError => {
                log::warn!("Wrong wifi password");
                self.state.wifi.set_error();
            }
            InboundKind::WifiUnknownError => {
                log::warn!("Wifi connection failed");
                self.state.wifi.set_error();
            }
            InboundKind::Time => match time_field(payload) {
                Some(epoch) => {
                    self.set_time(epoch);
                }
                None => log::warn!("Time message without a usable time"),
            },
            InboundKind::MqttHelloOk => {
                log::info!("Hello OK");
                self.state.hello_pending = false;
                self.state.hello.set_ok();
            }
            InboundKind::MqttPublishOk => self.state.publish.set_ok(),
            InboundKind::MqttPublishError => {
                log::warn!("Platform rejected the readings");
                self.state.publish.set_error();
            }
            InboundKind::MqttInfoOk => {
                self.state.info.set_ok();
                self.info_published = true;
            }
            InboundKind::MqttInfoError => {
                log::warn!("Platform rejected the kit info");
                self.state.info.set_error();
            }
            InboundKind::MqttCustomOk => log::info!("Custom MQTT message published"),
            InboundKind::MqttCustomError => log::warn!("Custom MQTT message failed"),
            InboundKind::Booted => {
                self.peer_booted(&message.payload);
            }
        }
    }

    /// Write `epoch` to the RTC. Accepted only if it reads back close enough.
    pub fn set_time(&mut self, epoch: u32) -> bool {
        self.board.set_epoch(epoch);
        if self.board.epoch().abs_diff(epoch) < RTC_SET_TOLERANCE_SECS {
            log::info!("RTC updated: {}", epoch_to_iso(epoch));
            self.state.time.set_ok();
            self.time_synced_since_boot = true;
            true
        } else {
            log::warn!("RTC update failed");
            false
        }
    }

    async fn apply_remote_config(&mut self, payload: &Payload) {
        self.config.mode = match payload.text("mo") {
            Some("net") => KitMode::Network,
            Some("sd") => KitMode::StorageOnly,
            _ => KitMode::NotConfigured,
        };
        self.config.apply_publish_interval(payload.int("pi"));

        if let Some(ssid) = payload.text("ss") {
            self.config.credentials.set = true;
            self.config.credentials.ssid = bounded(ssid);
            self.config.credentials.pass = bounded(payload.text("pa").unwrap_or_default());
        }
        if let Some(token) = payload.text("to") {
            self.config.token.set = true;
            self.config.token.token = bounded(token);
        }

        self.state.hello_pending = true;
        self.save_config(false).await;
    }

    fn peer_booted(&mut self, payload: &Payload) {
        log::info!("Co-processor ready");
        self.state.peer = PeerState::Ready;

        if let Some(mac) = payload.text("mac") {
            self.identity.peer_mac = bounded(mac);
            if !self.config.mac.valid {
                log::info!("Saving new MAC address: {}", mac);
                self.config.mac = MacAddress {
                    valid: true,
                    address: bounded(mac),
                };
                self.persist_config();
            }
        }
        self.identity.peer_version = bounded(payload.text("ver").unwrap_or_default());
        self.identity.peer_build_date = bounded(payload.text("bd").unwrap_or_default());
        log::debug!(
            "Co-processor firmware {} ({})",
            self.identity.peer_version,
            self.identity.peer_build_date
        );

        self.save_info();
        self.pending_sync_config = true;
        self.sync_attempts = 0;
    }
}

/// `t` is an epoch, either as a number or as decimal text.
fn time_field(payload: &Payload) -> Option<u32> {
    let epoch = match payload.text("t") {
        Some(text) => text.trim().parse::<i64>().ok()?,
        None => payload.int("t")?,
    };
    u32::try_from(epoch).ok()
}
