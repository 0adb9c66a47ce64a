//! In-memory reading store.
//!
//! A FIFO of timestamped reading groups with a fixed capacity. Index `0` is
//! always the oldest group; new groups are appended at the back. A group is
//! filled while it is the newest open group and is published once
//! [`close_group`](ReadingStore::close_group) marked it complete.

use heapless::{Deque, Vec};
use thiserror_no_std::Error;

use crate::sensors::{SENSOR_COUNT, SensorType};

/// Groups kept in RAM before the controller has to flush or reset.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("reading store is full")]
    Full,
    #[error("no open group to append to")]
    NoOpenGroup,
    #[error("group already holds a reading of every sensor")]
    GroupFull,
}

/// One sensor sample. `value == None` is a null reading (sensor error or
/// no answer within the cycle).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor: SensorType,
    pub value: Option<f32>,
}

/// Sink a group can be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFlag {
    Network,
    Storage,
}

#[derive(Debug, Clone)]
struct Group {
    time: u32,
    readings: Vec<Reading, SENSOR_COUNT>,
    complete: bool,
    on_network: bool,
    on_storage: bool,
}

pub struct ReadingStore<const N: usize = DEFAULT_CAPACITY> {
    groups: Deque<Group, N>,
}

impl<const N: usize> Default for ReadingStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ReadingStore<N> {
    pub const fn new() -> Self {
        Self {
            groups: Deque::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn is_full(&self) -> bool {
        self.groups.is_full()
    }

    /// Open a new group. Fails without touching the store when full.
    pub fn create_group(&mut self, time: u32) -> Result<(), StoreError> {
        self.groups
            .push_back(Group {
                time,
                readings: Vec::new(),
                complete: false,
                on_network: false,
                on_storage: false,
            })
            .map_err(|_| StoreError::Full)
    }

    /// Append to the newest group while it is open.
    pub fn append_reading(&mut self, sensor: SensorType, value: Option<f32>) -> Result<(), StoreError> {
        let group = self
            .groups
            .back_mut()
            .filter(|g| !g.complete)
            .ok_or(StoreError::NoOpenGroup)?;
        group
            .readings
            .push(Reading { sensor, value })
            .map_err(|_| StoreError::GroupFull)
    }

    /// Mark the newest group complete. No-op if there is none.
    pub fn close_group(&mut self) {
        if let Some(group) = self.groups.back_mut() {
            group.complete = true;
        }
    }

    pub fn has_open_group(&self) -> bool {
        self.groups.back().is_some_and(|g| !g.complete)
    }

    pub fn count_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn count_readings(&self, group: usize) -> usize {
        self.group(group).map_or(0, |g| g.readings.len())
    }

    pub fn read_reading(&self, group: usize, index: usize) -> Option<Reading> {
        self.group(group)?.readings.get(index).copied()
    }

    /// Value recorded for `sensor` in a group: `None` if the sensor is not in
    /// the group, `Some(None)` for a null reading.
    pub fn value_of(&self, group: usize, sensor: SensorType) -> Option<Option<f32>> {
        self.group(group)?
            .readings
            .iter()
            .find(|r| r.sensor == sensor)
            .map(|r| r.value)
    }

    pub fn time(&self, group: usize) -> Option<u32> {
        self.group(group).map(|g| g.time)
    }

    pub fn is_complete(&self, group: usize) -> bool {
        self.group(group).is_some_and(|g| g.complete)
    }

    pub fn flag(&self, group: usize, kind: PublishFlag) -> bool {
        self.group(group).is_some_and(|g| match kind {
            PublishFlag::Network => g.on_network,
            PublishFlag::Storage => g.on_storage,
        })
    }

    pub fn set_flag(&mut self, group: usize, kind: PublishFlag, value: bool) {
        let Some(g) = self.groups.iter_mut().nth(group) else {
            return;
        };
        match kind {
            PublishFlag::Network => g.on_network = value,
            PublishFlag::Storage => g.on_storage = value,
        }
    }

    /// Remove the oldest group. Returns `false` if the store was empty.
    pub fn del_last_group(&mut self) -> bool {
        self.groups.pop_front().is_some()
    }

    /// Drop every group from the oldest up to the first one without `kind`.
    /// Returns the number of groups removed.
    pub fn evict_flagged(&mut self, kind: PublishFlag) -> usize {
        let mut removed = 0;
        while self.flag(0, kind) {
            self.groups.pop_front();
            removed += 1;
        }
        removed
    }

    fn group(&self, index: usize) -> Option<&Group> {
        self.groups.iter().nth(index)
    }
}
