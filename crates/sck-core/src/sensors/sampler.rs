//! Read cycle scheduling
//!
//! Every `read_interval` seconds a new reading group is opened and each
//! enabled sensor that is due is asked for a value in priority order.
//! Sensors that are not ready yet go to the pending list and are asked
//! again on every tick until they answer or the next cycle begins.

use heapless::Vec;

use super::{BaseReadings, SENSOR_COUNT, SensorBoard, SensorError, SensorPoll, SensorSuite, SensorType};
use crate::config::Configuration;
use crate::storage::{EnabledSet, ReadingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SensorRuntime {
    enabled: bool,
    every_n_int: u8,
    /// Epoch of the cycle that last produced a value.
    last_reading_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was due.
    Idle,
    /// A group is open and waiting for `pending` sensors.
    Waiting { pending: usize },
    /// The current group was closed.
    Completed,
    /// No group could be opened. The cycle is attempted again on the next call.
    StoreFull,
}

pub struct Sampler {
    sensors: [SensorRuntime; SENSOR_COUNT],
    pending: Vec<SensorType, SENSOR_COUNT>,
    last_update: u32,
    last_publish: u32,
    time_to_publish: bool,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            sensors: [SensorRuntime {
                enabled: false,
                every_n_int: 1,
                last_reading_time: 0,
            }; SENSOR_COUNT],
            pending: Vec::new(),
            last_update: 0,
            last_publish: 0,
            time_to_publish: false,
        }
    }

    /// Take the enabled set and read multipliers from the configuration.
    pub fn load(&mut self, config: &Configuration) {
        for sensor in SensorType::ALL {
            let cfg = config.sensor(sensor);
            let runtime = &mut self.sensors[sensor.index()];
            runtime.enabled = cfg.enabled;
            runtime.every_n_int = cfg.every_n_int.max(1);
        }
    }

    /// Write the enabled set and multipliers back before saving.
    pub fn store_into(&self, config: &mut Configuration) {
        for sensor in SensorType::ALL {
            let runtime = self.sensors[sensor.index()];
            let cfg = config.sensor_mut(sensor);
            cfg.enabled = runtime.enabled;
            cfg.every_n_int = runtime.every_n_int;
        }
    }

    /// Make both a read cycle and a publish due right away.
    pub fn schedule_now(&mut self, epoch: u32, config: &Configuration) {
        self.last_update = epoch.saturating_sub(config.read_interval);
        self.last_publish = epoch.saturating_sub(config.publish_interval);
    }

    pub fn is_enabled(&self, sensor: SensorType) -> bool {
        self.sensors[sensor.index()].enabled
    }

    pub fn set_enabled(&mut self, sensor: SensorType, enabled: bool) {
        self.sensors[sensor.index()].enabled = enabled;
    }

    pub fn enabled_set(&self) -> EnabledSet {
        self.sensors.map(|s| s.enabled)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn time_to_publish(&self) -> bool {
        self.time_to_publish
    }

    /// A publish round finished (or was given up) at `epoch`.
    pub fn mark_published(&mut self, epoch: u32) {
        self.last_publish = epoch;
        self.time_to_publish = false;
    }

    /// Start a new publish interval but keep publishing what is left.
    pub fn restart_publish_interval(&mut self, epoch: u32) {
        self.last_publish = epoch;
    }

    /// Nothing left to publish before the next interval.
    pub fn clear_time_to_publish(&mut self) {
        self.time_to_publish = false;
    }

    pub async fn enable<U: SensorBoard, A: SensorBoard>(
        &mut self,
        suite: &mut SensorSuite<U, A>,
        sensor: SensorType,
    ) -> Result<(), SensorError> {
        suite.start(sensor).await?;
        log::info!("Enabling {}", sensor.info().title);
        self.set_enabled(sensor, true);
        Ok(())
    }

    pub async fn disable<U: SensorBoard, A: SensorBoard>(
        &mut self,
        suite: &mut SensorSuite<U, A>,
        sensor: SensorType,
    ) -> Result<(), SensorError> {
        suite.stop(sensor).await?;
        log::info!("Disabling {}", sensor.info().title);
        self.set_enabled(sensor, false);
        self.pending.retain(|s| *s != sensor);
        Ok(())
    }

    /// Run the read cycle for wall-clock second `epoch`.
    pub async fn update<U: SensorBoard, A: SensorBoard, const N: usize>(
        &mut self,
        epoch: u32,
        config: &Configuration,
        suite: &mut SensorSuite<U, A>,
        base: &BaseReadings,
        store: &mut ReadingStore<N>,
    ) -> CycleOutcome {
        let outcome = if epoch.saturating_sub(self.last_update) >= config.read_interval {
            self.start_cycle(epoch, config, suite, base, store).await
        } else if !self.pending.is_empty() {
            self.poll_pending(suite, base, store).await
        } else {
            CycleOutcome::Idle
        };

        if epoch.saturating_sub(self.last_publish) >= config.publish_interval {
            self.time_to_publish = true;
        }
        outcome
    }

    async fn start_cycle<U: SensorBoard, A: SensorBoard, const N: usize>(
        &mut self,
        epoch: u32,
        config: &Configuration,
        suite: &mut SensorSuite<U, A>,
        base: &BaseReadings,
        store: &mut ReadingStore<N>,
    ) -> CycleOutcome {
        if !self.pending.is_empty() {
            log::warn!("{} sensors did not answer, saving null", self.pending.len());
            for sensor in self.pending.iter() {
                let _ = store.append_reading(*sensor, None);
            }
            self.pending.clear();
            store.close_group();
        }

        if store.create_group(epoch).is_err() {
            log::error!("Reading store full, can't create a new group");
            return CycleOutcome::StoreFull;
        }
        self.last_update = epoch;
        log::debug!("-----------");

        for sensor in SensorType::PRIORITY {
            let runtime = self.sensors[sensor.index()];
            if !runtime.enabled {
                continue;
            }
            let due_after = u32::from(runtime.every_n_int) * config.read_interval;
            if epoch.saturating_sub(runtime.last_reading_time) < due_after {
                continue;
            }
            let poll = suite.reading(sensor, base).await;
            if !self.record(sensor, poll, store) {
                // Capacity equals the number of sensors.
                let _ = self.pending.push(sensor);
            }
        }

        self.finish_if_done(store)
    }

    async fn poll_pending<U: SensorBoard, A: SensorBoard, const N: usize>(
        &mut self,
        suite: &mut SensorSuite<U, A>,
        base: &BaseReadings,
        store: &mut ReadingStore<N>,
    ) -> CycleOutcome {
        let waiting = core::mem::take(&mut self.pending);
        for sensor in waiting {
            let poll = suite.reading(sensor, base).await;
            if !self.record(sensor, poll, store) {
                let _ = self.pending.push(sensor);
            }
        }
        self.finish_if_done(store)
    }

    /// Store an answer. Returns `false` if the sensor is still pending.
    fn record<const N: usize>(&mut self, sensor: SensorType, poll: SensorPoll, store: &mut ReadingStore<N>) -> bool {
        let info = sensor.info();
        let value = match poll {
            SensorPoll::Pending => return false,
            SensorPoll::Ready(value) => {
                log::info!("{}: {} {}", info.title, value, info.unit);
                Some(value)
            }
            SensorPoll::Failed => {
                log::warn!("{}: reading failed", info.title);
                None
            }
        };
        if let Err(e) = store.append_reading(sensor, value) {
            log::warn!("Failed saving reading: {}", e);
        }
        self.sensors[sensor.index()].last_reading_time = self.last_update;
        true
    }

    fn finish_if_done<const N: usize>(&mut self, store: &mut ReadingStore<N>) -> CycleOutcome {
        if self.pending.is_empty() {
            store.close_group();
            log::debug!("-----------");
            CycleOutcome::Completed
        } else {
            CycleOutcome::Waiting {
                pending: self.pending.len(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::NoBoard;
    use crate::testing::MockSensors;
    use embassy_futures::block_on;

    const T0: u32 = 1_600_000_000;

    fn only(sensors: &[SensorType]) -> Configuration {
        let mut config = Configuration::default();
        for s in SensorType::ALL {
            config.sensor_mut(s).enabled = sensors.contains(&s);
        }
        config
    }

    fn base() -> BaseReadings {
        BaseReadings {
            battery_percent: Some(80),
            battery_volts: Some(3.9),
            card_present: false,
        }
    }

    #[test]
    fn test_cycle_reads_enabled_sensors() {
        let config = only(&[SensorType::Temperature, SensorType::BatteryPercent]);
        let board = MockSensors::new();
        board.set_value(SensorType::Temperature, SensorPoll::Ready(21.0));
        let mut suite = SensorSuite::new(board, NoBoard);
        let mut sampler = Sampler::new();
        sampler.load(&config);
        let mut store = ReadingStore::<4>::new();

        let outcome = block_on(sampler.update(T0, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(store.count_readings(0), 2);
        assert_eq!(store.value_of(0, SensorType::BatteryPercent), Some(Some(80.0)));
        assert!(store.is_complete(0));

        // Not due again within the interval.
        let outcome = block_on(sampler.update(T0 + 10, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::Idle);
        assert_eq!(store.count_groups(), 1);
    }

    #[test]
    fn test_pending_sensor_resolves_later() {
        let config = only(&[SensorType::Pm25]);
        let board = MockSensors::new();
        board.set_value(SensorType::Pm25, SensorPoll::Pending);
        let mut suite = SensorSuite::new(board.clone(), NoBoard);
        let mut sampler = Sampler::new();
        sampler.load(&config);
        let mut store = ReadingStore::<4>::new();

        let outcome = block_on(sampler.update(T0, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::Waiting { pending: 1 });
        assert_eq!(sampler.pending_count(), 1);
        assert!(store.has_open_group());

        board.set_value(SensorType::Pm25, SensorPoll::Ready(7.0));
        let outcome = block_on(sampler.update(T0 + 1, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(store.value_of(0, SensorType::Pm25), Some(Some(7.0)));
    }

    #[test]
    fn test_unanswered_sensor_is_null_at_next_cycle() {
        let config = only(&[SensorType::Pm1]);
        let board = MockSensors::new();
        board.set_value(SensorType::Pm1, SensorPoll::Pending);
        let mut suite = SensorSuite::new(board, NoBoard);
        let mut sampler = Sampler::new();
        sampler.load(&config);
        let mut store = ReadingStore::<4>::new();

        block_on(sampler.update(T0, &config, &mut suite, &base(), &mut store));
        block_on(sampler.update(T0 + config.read_interval, &config, &mut suite, &base(), &mut store));
        assert_eq!(store.count_groups(), 2);
        assert!(store.is_complete(0));
        assert_eq!(store.value_of(0, SensorType::Pm1), Some(None));
    }

    #[test]
    fn test_every_n_int_skips_cycles() {
        let mut config = only(&[SensorType::Light]);
        config.sensor_mut(SensorType::Light).every_n_int = 2;
        let board = MockSensors::new();
        board.set_value(SensorType::Light, SensorPoll::Ready(100.0));
        let mut suite = SensorSuite::new(board, NoBoard);
        let mut sampler = Sampler::new();
        sampler.load(&config);
        let mut store = ReadingStore::<4>::new();

        let step = config.read_interval;
        for i in 0..3 {
            block_on(sampler.update(T0 + i * step, &config, &mut suite, &base(), &mut store));
        }
        assert_eq!(store.count_readings(0), 1);
        assert_eq!(store.count_readings(1), 0);
        assert_eq!(store.count_readings(2), 1);
    }

    #[test]
    fn test_store_full_retries_cycle() {
        let config = only(&[SensorType::Light]);
        let mut suite = SensorSuite::new(MockSensors::new(), NoBoard);
        let mut sampler = Sampler::new();
        sampler.load(&config);
        let mut store = ReadingStore::<1>::new();
        store.create_group(1).unwrap();
        store.close_group();

        let outcome = block_on(sampler.update(T0, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::StoreFull);

        store.del_last_group();
        let outcome = block_on(sampler.update(T0 + 1, &config, &mut suite, &base(), &mut store));
        assert_eq!(outcome, CycleOutcome::Completed);
    }

    #[test]
    fn test_publish_becomes_due() {
        let config = only(&[]);
        let mut suite = SensorSuite::new(MockSensors::new(), NoBoard);
        let mut sampler = Sampler::new();
        let mut store = ReadingStore::<4>::new();
        sampler.mark_published(T0);

        block_on(sampler.update(T0 + 1, &config, &mut suite, &base(), &mut store));
        assert!(!sampler.time_to_publish());
        block_on(sampler.update(T0 + config.publish_interval, &config, &mut suite, &base(), &mut store));
        assert!(sampler.time_to_publish());
    }
}
