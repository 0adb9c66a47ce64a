//! Device state mirrored by the controller

use embassy_time::Duration;
use heapless::String;

use crate::config::KitMode;
use crate::link::PeerState;
use crate::status::Status;

pub const WIFI_RETRIES: u8 = 15;
pub const WIFI_TIMEOUT: Duration = Duration::from_secs(2);
pub const TIME_RETRIES: u8 = 3;
pub const TIME_TIMEOUT: Duration = Duration::from_secs(5);
pub const HELLO_RETRIES: u8 = 3;
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
pub const INFO_RETRIES: u8 = 3;
pub const INFO_TIMEOUT: Duration = Duration::from_secs(3);
pub const PUBLISH_RETRIES: u8 = 3;
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub mode: KitMode,
    pub on_setup: bool,
    pub on_shell: bool,
    pub peer: PeerState,
    pub wifi_set: bool,
    pub token_set: bool,
    pub hello_pending: bool,
    pub card_present: bool,
    pub card_present_error: bool,
    pub sleeping: bool,

    pub wifi: Status,
    pub time: Status,
    pub hello: Status,
    pub info: Status,
    pub publish: Status,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            mode: KitMode::NotConfigured,
            on_setup: false,
            on_shell: false,
            peer: PeerState::Off,
            wifi_set: false,
            token_set: false,
            hello_pending: false,
            card_present: false,
            card_present_error: false,
            sleeping: false,
            wifi: Status::new(WIFI_RETRIES, WIFI_TIMEOUT),
            time: Status::new(TIME_RETRIES, TIME_TIMEOUT),
            hello: Status::new(HELLO_RETRIES, HELLO_TIMEOUT),
            info: Status::new(INFO_RETRIES, INFO_TIMEOUT),
            publish: Status::new(PUBLISH_RETRIES, PUBLISH_TIMEOUT),
        }
    }
}

impl DeviceState {
    /// Co-processor powered (booting or ready).
    pub fn peer_on(&self) -> bool {
        self.peer != PeerState::Off
    }

    pub fn peer_booting(&self) -> bool {
        self.peer == PeerState::Booting
    }
}

/// Hardware and firmware identity of the kit and its co-processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub hardware_version: String<8>,
    pub unique_id: String<32>,
    pub firmware_version: String<24>,
    pub build_date: String<24>,
    pub peer_mac: String<18>,
    pub peer_version: String<24>,
    pub peer_build_date: String<24>,
    pub peer_ip: String<16>,
    pub peer_hostname: String<32>,
}
