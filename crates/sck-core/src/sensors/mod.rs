//! Sensor catalogue and board dispatch
//!
//! Each [`SensorType`] lives on one [`SensorLocation`]. Base sensors
//! (battery, card presence) are answered from kit state, the urban and
//! auxiliary boards are reached through the [`SensorBoard`] capability trait.

mod sampler;

pub use sampler::{CycleOutcome, Sampler};

use alloc::string::String;
use core::future::Future;
use thiserror_no_std::Error;

/// Number of sensor types known to the kit.
pub const SENSOR_COUNT: usize = 18;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor:?} is not present on its board")]
    NotPresent { sensor: SensorType },
    #[error("{sensor:?} failed to start: {details}")]
    StartFailed {
        sensor: SensorType,
        details: &'static str,
    },
    #[error("{sensor:?} does not accept commands")]
    NotControllable { sensor: SensorType },
    #[error("{sensor:?} rejected command: {details}")]
    CommandFailed {
        sensor: SensorType,
        details: &'static str,
    },
}

/// Board a sensor is physically attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorLocation {
    Base,
    Urban,
    Aux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorType {
    BatteryPercent,
    BatteryVoltage,
    SdCard,
    Light,
    Temperature,
    Humidity,
    Noise,
    Pressure,
    Pm1,
    Pm25,
    Pm10,
    Vocs,
    Eco2,
    ExtTemperature,
    ExtHumidity,
    GasSlot1,
    GasSlot2,
    GasSlot3,
}

/// Static description of a sensor type.
#[derive(Debug, Clone, Copy)]
pub struct SensorInfo {
    pub title: &'static str,
    pub short_title: &'static str,
    pub unit: &'static str,
    /// Platform id used when publishing; `0` means never sent to the network.
    pub id: u16,
    pub location: SensorLocation,
    pub default_enabled: bool,
    pub controllable: bool,
}

const fn info(
    title: &'static str,
    short_title: &'static str,
    unit: &'static str,
    id: u16,
    location: SensorLocation,
    default_enabled: bool,
    controllable: bool,
) -> SensorInfo {
    SensorInfo {
        title,
        short_title,
        unit,
        id,
        location,
        default_enabled,
        controllable,
    }
}

impl SensorType {
    pub const ALL: [SensorType; SENSOR_COUNT] = [
        Self::BatteryPercent,
        Self::BatteryVoltage,
        Self::SdCard,
        Self::Light,
        Self::Temperature,
        Self::Humidity,
        Self::Noise,
        Self::Pressure,
        Self::Pm1,
        Self::Pm25,
        Self::Pm10,
        Self::Vocs,
        Self::Eco2,
        Self::ExtTemperature,
        Self::ExtHumidity,
        Self::GasSlot1,
        Self::GasSlot2,
        Self::GasSlot3,
    ];

    /// Read order. Slow sensors go first so their answers have the most time
    /// to become ready within a cycle; this is also the card column order.
    pub const PRIORITY: [SensorType; SENSOR_COUNT] = [
        Self::Pm1,
        Self::Pm25,
        Self::Pm10,
        Self::Vocs,
        Self::Eco2,
        Self::GasSlot1,
        Self::GasSlot2,
        Self::GasSlot3,
        Self::Noise,
        Self::Light,
        Self::Temperature,
        Self::Humidity,
        Self::Pressure,
        Self::ExtTemperature,
        Self::ExtHumidity,
        Self::BatteryPercent,
        Self::BatteryVoltage,
        Self::SdCard,
    ];

    /// Position in [`Self::ALL`]; used to index per-sensor tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn info(self) -> SensorInfo {
        use SensorLocation::*;
        match self {
            Self::BatteryPercent => info("Battery", "BATT", "%", 10, Base, true, false),
            Self::BatteryVoltage => info("Battery voltage", "BATT_VOLT", "V", 0, Base, false, false),
            Self::SdCard => info("SD card", "SDCARD", "", 0, Base, true, false),
            Self::Light => info("Light", "LIGHT", "Lux", 14, Urban, true, false),
            Self::Temperature => info("Temperature", "TEMP", "C", 55, Urban, true, false),
            Self::Humidity => info("Humidity", "HUM", "%", 56, Urban, true, false),
            Self::Noise => info("Noise dBA", "NOISE_A", "dBA", 53, Urban, true, false),
            Self::Pressure => info("Barometric pressure", "PRESS", "kPa", 58, Urban, true, false),
            Self::Pm1 => info("PM 1.0", "PM_1", "ug/m3", 89, Urban, true, true),
            Self::Pm25 => info("PM 2.5", "PM_25", "ug/m3", 87, Urban, true, true),
            Self::Pm10 => info("PM 10.0", "PM_10", "ug/m3", 88, Urban, true, true),
            Self::Vocs => info("VOC Gas CCS811", "CCS811_VOCS", "ppb", 113, Urban, true, true),
            Self::Eco2 => info("eCO2 Gas CCS811", "CCS811_ECO2", "ppm", 112, Urban, true, true),
            Self::ExtTemperature => info("Ext Temperature", "EXT_TEMP", "C", 79, Aux, false, false),
            Self::ExtHumidity => info("Ext Humidity", "EXT_HUM", "%", 80, Aux, false, false),
            Self::GasSlot1 => info("Gas slot 1 working", "AS_1_W", "nA", 65, Aux, false, true),
            Self::GasSlot2 => info("Gas slot 2 working", "AS_2_W", "nA", 66, Aux, false, true),
            Self::GasSlot3 => info("Gas slot 3 working", "AS_3_W", "nA", 67, Aux, false, true),
        }
    }

    pub const fn location(self) -> SensorLocation {
        self.info().location
    }

    pub fn from_id(id: u16) -> Option<Self> {
        if id == 0 {
            return None;
        }
        Self::ALL.into_iter().find(|s| s.info().id == id)
    }
}

/// Answer of a single reading request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorPoll {
    Ready(f32),
    /// The sensor needs more time; ask again on a later tick.
    Pending,
    /// The sensor answered with an error. Stored as a null reading.
    Failed,
}

/// Uniform capability interface of a sensor board.
pub trait SensorBoard {
    /// Power up / initialise a sensor. Used for detection at boot.
    fn start(&mut self, sensor: SensorType) -> impl Future<Output = Result<(), SensorError>>;

    fn stop(&mut self, sensor: SensorType) -> impl Future<Output = Result<(), SensorError>>;

    fn reading(&mut self, sensor: SensorType) -> impl Future<Output = SensorPoll>;

    /// Free-form command for controllable sensors; returns the board's answer.
    fn control(
        &mut self,
        sensor: SensorType,
        command: &str,
    ) -> impl Future<Output = Result<String, SensorError>>;
}

/// Snapshot of the values base sensors report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaseReadings {
    /// `None` when no battery is connected.
    pub battery_percent: Option<u8>,
    pub battery_volts: Option<f32>,
    pub card_present: bool,
}

impl BaseReadings {
    fn reading(&self, sensor: SensorType) -> SensorPoll {
        match sensor {
            SensorType::BatteryPercent => {
                SensorPoll::Ready(self.battery_percent.map_or(-1.0, f32::from))
            }
            SensorType::BatteryVoltage => SensorPoll::Ready(self.battery_volts.unwrap_or(-1.0)),
            SensorType::SdCard => SensorPoll::Ready(if self.card_present { 1.0 } else { 0.0 }),
            _ => SensorPoll::Failed,
        }
    }
}

/// All sensor boards of the kit, dispatched by [`SensorLocation`].
pub struct SensorSuite<U, A> {
    pub urban: U,
    pub aux: A,
    /// Whether the urban board answered at boot.
    pub urban_present: bool,
}

impl<U: SensorBoard, A: SensorBoard> SensorSuite<U, A> {
    pub fn new(urban: U, aux: A) -> Self {
        Self {
            urban,
            aux,
            urban_present: false,
        }
    }

    pub async fn start(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        match sensor.location() {
            // Battery can be enabled without a battery so -1 gets published.
            SensorLocation::Base => Ok(()),
            SensorLocation::Urban => self.urban.start(sensor).await,
            SensorLocation::Aux => self.aux.start(sensor).await,
        }
    }

    pub async fn stop(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        match sensor.location() {
            SensorLocation::Base => Ok(()),
            SensorLocation::Urban => self.urban.stop(sensor).await,
            SensorLocation::Aux => self.aux.stop(sensor).await,
        }
    }

    pub async fn reading(&mut self, sensor: SensorType, base: &BaseReadings) -> SensorPoll {
        match sensor.location() {
            SensorLocation::Base => base.reading(sensor),
            SensorLocation::Urban => self.urban.reading(sensor).await,
            SensorLocation::Aux => self.aux.reading(sensor).await,
        }
    }

    pub async fn control(&mut self, sensor: SensorType, command: &str) -> Result<String, SensorError> {
        if !sensor.info().controllable {
            return Err(SensorError::NotControllable { sensor });
        }
        log::info!("{}: {}", sensor.info().title, command);
        match sensor.location() {
            SensorLocation::Base => Err(SensorError::NotControllable { sensor }),
            SensorLocation::Urban => self.urban.control(sensor, command).await,
            SensorLocation::Aux => self.aux.control(sensor, command).await,
        }
    }
}

/// Sensors that are not on the kit at all (e.g. no auxiliary board fitted).
pub struct NoBoard;

impl SensorBoard for NoBoard {
    async fn start(&mut self, sensor: SensorType) -> Result<(), SensorError> {
        Err(SensorError::NotPresent { sensor })
    }

    async fn stop(&mut self, _sensor: SensorType) -> Result<(), SensorError> {
        Ok(())
    }

    async fn reading(&mut self, _sensor: SensorType) -> SensorPoll {
        SensorPoll::Failed
    }

    async fn control(&mut self, sensor: SensorType, _command: &str) -> Result<String, SensorError> {
        Err(SensorError::NotPresent { sensor })
    }
}
