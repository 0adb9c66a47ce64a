//! Hardware seams
//!
//! The controller only talks to hardware through these traits. A target
//! implements [`Board`] once and names its concrete types in a [`Platform`].

use core::future::Future;

use embassy_time::Duration;

use crate::config::ConfigStore;
use crate::controller::CoprocessorPower;
use crate::link::DatagramLink;
use crate::power::PowerMonitor;
use crate::sensors::SensorBoard;
use crate::storage::CardFs;
use crate::time::{Clock, Rtc};

/// Status LED states, one per controller situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Off,
    /// Setup access point is open.
    Setup,
    Network,
    NetworkError,
    Storage,
    StorageError,
    /// Short flash before an emergency sleep.
    LowBattery,
}

pub trait StatusLed {
    fn show(&mut self, pattern: LedPattern);
}

pub trait SystemControl {
    /// Full-system low power sleep. `None` sleeps until a physical
    /// interaction (button) wakes the kit.
    fn deep_sleep(&mut self, duration: Option<Duration>) -> impl Future<Output = ()>;

    fn delay(&mut self, duration: Duration) -> impl Future<Output = ()>;

    /// Last resort on unrecoverable state. Does not return on hardware.
    fn system_reset(&mut self);

    /// Chip serial number as hex.
    fn unique_id(&self) -> heapless::String<32>;

    /// Card detect switch.
    fn card_inserted(&mut self) -> bool;
}

/// Everything on the main board the controller needs.
pub trait Board: Clock + Rtc + PowerMonitor + CoprocessorPower + SystemControl + StatusLed {}

impl<T> Board for T where T: Clock + Rtc + PowerMonitor + CoprocessorPower + SystemControl + StatusLed {}

/// Concrete types of one target.
pub trait Platform {
    type Board: Board;
    type Link: DatagramLink;
    type Urban: SensorBoard;
    type Aux: SensorBoard;
    type Card: CardFs;
    type ConfigStore: ConfigStore;
}
