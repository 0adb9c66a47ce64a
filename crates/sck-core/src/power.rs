//! Battery and USB supervision
//!
//! [`PowerSupervisor::update`] runs once per second on a fresh
//! [`PowerSample`]. It keeps the battery estimate, drives the charger and
//! classifies the battery into [`BatteryBand`]s. Acting on the emergency
//! band (long sleeps) is left to the controller.

/// Discharge curve: millivolts at 1 %, 2 %, ... 100 %.
const BATTERY_TABLE: [u16; 100] = [
    3324, 3326, 3335, 3357, 3376, 3394, 3411, 3428, 3436, 3447, 3460, 3467, 3471, 3482, 3495, 3502,
    3511, 3516, 3524, 3525, 3533, 3533, 3544, 3550, 3554, 3561, 3565, 3571, 3571, 3577, 3583, 3593,
    3594, 3594, 3603, 3605, 3605, 3612, 3617, 3619, 3622, 3625, 3629, 3634, 3641, 3641, 3647, 3651,
    3655, 3659, 3665, 3672, 3679, 3686, 3693, 3696, 3700, 3708, 3717, 3723, 3731, 3740, 3748, 3753,
    3766, 3771, 3778, 3784, 3791, 3799, 3809, 3819, 3826, 3832, 3843, 3852, 3858, 3867, 3880, 3892,
    3901, 3911, 3917, 3926, 3942, 3950, 3959, 3968, 3975, 3986, 4001, 4011, 4025, 4042, 4055, 4069,
    4100, 4117, 4152, 4201,
];

/// Charging is kept on below this voltage.
pub const MAX_CHARGE_MILLIVOLTS: u16 = 4100;

pub const LOW_THRESHOLD_PERCENT: u8 = 10;
pub const EMERGENCY_THRESHOLD_PERCENT: u8 = 2;

/// Consecutive samples in a band before it is acted on.
pub const BAND_SAMPLES: u8 = 5;

/// State of charge from the calibration table.
pub fn percent_from_millivolts(millivolts: u16) -> u8 {
    BATTERY_TABLE.iter().take_while(|&&mv| mv <= millivolts).count() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    NotCharging,
    PreCharge,
    FastCharging,
    ChargeDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSample {
    pub usb_present: bool,
    pub charge_status: ChargeStatus,
    pub battery_millivolts: u16,
    /// Battery voltage below the charger's minimum system voltage.
    pub below_sys_min: bool,
}

/// Charger and fuel gauge.
pub trait PowerMonitor {
    fn sample(&mut self) -> PowerSample;
    fn set_charging(&mut self, enabled: bool);
    fn charging(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryBand {
    Normal,
    Low,
    Emergency,
}

/// What the charge LED overlay should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeIndicator {
    None,
    Charging,
    Finished,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerUpdate {
    /// USB was plugged or unplugged since the last update.
    pub usb_changed: bool,
    /// Emergency band confirmed; the kit should go into emergency sleep.
    pub emergency: bool,
}

#[derive(Debug)]
pub struct PowerSupervisor {
    on_usb: bool,
    battery_present: bool,
    millivolts: u16,
    percent: u8,
    low_counter: u8,
    emergency_counter: u8,
    indicator: ChargeIndicator,
}

impl Default for PowerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSupervisor {
    pub const fn new() -> Self {
        Self {
            on_usb: false,
            battery_present: false,
            millivolts: 0,
            percent: 100,
            low_counter: 0,
            emergency_counter: 0,
            indicator: ChargeIndicator::None,
        }
    }

    pub fn update<M: PowerMonitor>(&mut self, monitor: &mut M) -> PowerUpdate {
        let sample = monitor.sample();
        let mut result = PowerUpdate::default();

        if sample.usb_present != self.on_usb {
            log::info!(
                "{}",
                if sample.usb_present { "USB connected" } else { "USB disconnected" }
            );
            self.on_usb = sample.usb_present;
            result.usb_changed = true;
        }

        self.millivolts = sample.battery_millivolts;
        self.percent = percent_from_millivolts(sample.battery_millivolts);

        if self.on_usb {
            self.low_counter = 0;
            self.emergency_counter = 0;
            self.update_on_usb(monitor, &sample);
        } else {
            self.battery_present = true;
            result.emergency = self.update_bands();
        }

        result
    }

    fn update_on_usb<M: PowerMonitor>(&mut self, monitor: &mut M, sample: &PowerSample) {
        match sample.charge_status {
            ChargeStatus::NotCharging => {
                if sample.below_sys_min {
                    if self.battery_present {
                        log::info!("Battery removed");
                    }
                    self.battery_present = false;
                    self.indicator = ChargeIndicator::None;
                } else {
                    if !self.battery_present {
                        log::info!("Battery connected");
                    }
                    self.battery_present = true;
                    if sample.battery_millivolts < MAX_CHARGE_MILLIVOLTS {
                        monitor.set_charging(true);
                    } else {
                        self.indicator = ChargeIndicator::Finished;
                    }
                }
            }
            ChargeStatus::ChargeDone => {
                // Stop charging so the next sample shows whether a battery is there.
                if monitor.charging() {
                    monitor.set_charging(false);
                }
            }
            ChargeStatus::PreCharge | ChargeStatus::FastCharging => {
                self.battery_present = true;
                self.indicator = ChargeIndicator::Charging;
            }
        }
    }

    /// Returns `true` when the emergency band is confirmed.
    fn update_bands(&mut self) -> bool {
        match self.band() {
            BatteryBand::Emergency => {
                if self.emergency_counter < BAND_SAMPLES {
                    self.emergency_counter += 1;
                    false
                } else {
                    log::warn!("Battery at {}%, entering emergency sleep", self.percent);
                    true
                }
            }
            BatteryBand::Low => {
                self.emergency_counter = 0;
                if self.low_counter < BAND_SAMPLES {
                    self.low_counter += 1;
                } else {
                    if self.indicator != ChargeIndicator::Low {
                        log::warn!("Low battery: {}%", self.percent);
                    }
                    self.indicator = ChargeIndicator::Low;
                }
                false
            }
            BatteryBand::Normal => {
                self.emergency_counter = 0;
                self.low_counter = 0;
                self.indicator = ChargeIndicator::None;
                false
            }
        }
    }

    pub fn band(&self) -> BatteryBand {
        if self.percent < EMERGENCY_THRESHOLD_PERCENT {
            BatteryBand::Emergency
        } else if self.percent < LOW_THRESHOLD_PERCENT {
            BatteryBand::Low
        } else {
            BatteryBand::Normal
        }
    }

    pub fn on_usb(&self) -> bool {
        self.on_usb
    }

    pub fn battery_present(&self) -> bool {
        self.battery_present
    }

    /// `None` when no battery is connected.
    pub fn percent(&self) -> Option<u8> {
        self.battery_present.then_some(self.percent)
    }

    pub fn volts(&self) -> Option<f32> {
        self.battery_present
            .then(|| f32::from(self.millivolts) / 1000.0)
    }

    pub fn indicator(&self) -> ChargeIndicator {
        self.indicator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPower;

    fn battery(mv: u16) -> PowerSample {
        PowerSample {
            usb_present: false,
            charge_status: ChargeStatus::NotCharging,
            battery_millivolts: mv,
            below_sys_min: false,
        }
    }

    #[test]
    fn test_percent_table_edges() {
        assert_eq!(percent_from_millivolts(3000), 0);
        assert_eq!(percent_from_millivolts(3324), 1);
        assert_eq!(percent_from_millivolts(3700), 57);
        assert_eq!(percent_from_millivolts(4201), 100);
        assert_eq!(percent_from_millivolts(4400), 100);
    }

    #[test]
    fn test_emergency_after_consecutive_samples() {
        let mut monitor = MockPower::new(battery(3326)); // 2 entries -> 2 % is not emergency
        let mut supervisor = PowerSupervisor::new();
        supervisor.update(&mut monitor);
        assert_eq!(supervisor.band(), BatteryBand::Low);

        monitor.set(battery(3324)); // 1 %
        for _ in 0..BAND_SAMPLES {
            assert!(!supervisor.update(&mut monitor).emergency);
        }
        assert!(supervisor.update(&mut monitor).emergency);
    }

    #[test]
    fn test_recovering_battery_resets_counter() {
        let mut monitor = MockPower::new(battery(3324));
        let mut supervisor = PowerSupervisor::new();
        for _ in 0..BAND_SAMPLES {
            supervisor.update(&mut monitor);
        }
        monitor.set(battery(3900));
        supervisor.update(&mut monitor);
        monitor.set(battery(3324));
        assert!(!supervisor.update(&mut monitor).emergency);
    }

    #[test]
    fn test_low_band_sets_indicator() {
        let mut monitor = MockPower::new(battery(3400)); // 6 %
        let mut supervisor = PowerSupervisor::new();
        for _ in 0..=BAND_SAMPLES {
            supervisor.update(&mut monitor);
        }
        assert_eq!(supervisor.indicator(), ChargeIndicator::Low);
    }

    #[test]
    fn test_usb_without_battery() {
        let mut monitor = MockPower::new(PowerSample {
            usb_present: true,
            charge_status: ChargeStatus::NotCharging,
            battery_millivolts: 0,
            below_sys_min: true,
        });
        let mut supervisor = PowerSupervisor::new();
        let update = supervisor.update(&mut monitor);
        assert!(update.usb_changed);
        assert!(supervisor.on_usb());
        assert_eq!(supervisor.percent(), None);
        assert!(!monitor.charging());
    }

    #[test]
    fn test_usb_enables_charging_below_max() {
        let mut monitor = MockPower::new(PowerSample {
            usb_present: true,
            charge_status: ChargeStatus::NotCharging,
            battery_millivolts: 3800,
            below_sys_min: false,
        });
        let mut supervisor = PowerSupervisor::new();
        supervisor.update(&mut monitor);
        assert!(supervisor.battery_present());
        assert!(monitor.charging());

        let done = PowerSample {
            charge_status: ChargeStatus::ChargeDone,
            ..monitor.sample()
        };
        monitor.set(done);
        supervisor.update(&mut monitor);
        assert!(!monitor.charging());
    }
}
