//! CSV and info file output to a removable card
//!
//! One CSV file per day (`YY-MM-DD.CSV`) with four header rows:
//!
//! ```text
//! TIME,<short titles...>
//! ISO 8601,<units...>
//! Time,<titles...>
//! ,<platform ids...>
//! ```
//!
//! followed by one row per reading group. Columns follow the sensor priority
//! order and only include enabled sensors. When the enabled set changes the
//! current day file is moved aside to `YY-MM-DD.NN` and a new one is begun.

use alloc::string::String;
use core::fmt::Write;

use thiserror_no_std::Error;

use super::readings::{PublishFlag, ReadingStore};
use crate::sensors::{SENSOR_COUNT, SensorType};
use crate::state::Identity;
use crate::time::{DateTime, ShortDate, epoch_to_iso};

pub const INFO_FILE: &str = "INFO.TXT";

const LINE_END: &str = "\r\n";

/// Minimal file operations on the card root directory.
pub trait CardFs {
    type Error: core::fmt::Debug;

    /// Check the card is there and mountable.
    fn probe(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn exists(&mut self, name: &str) -> Result<bool, Self::Error>;

    /// Append, creating the file if needed.
    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Length in bytes of an existing file.
    fn size(&mut self, name: &str) -> Result<u32, Self::Error>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Self::Error>;

    fn remove(&mut self, name: &str) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum StorageError<E: core::fmt::Debug> {
    #[error("card filesystem error: {0:?}")]
    Fs(E),
    #[error("no free name to rotate the data file")]
    NoFreeName,
}

/// Which sensors are currently enabled, indexed by [`SensorType::index`].
pub type EnabledSet = [bool; SENSOR_COUNT];

pub struct CardPublisher {
    write_header: bool,
    info_saved: bool,
}

impl Default for CardPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl CardPublisher {
    pub const fn new() -> Self {
        Self {
            write_header: true,
            info_saved: false,
        }
    }

    /// The enabled sensor set changed; the next publish rotates the day file.
    pub fn mark_header_dirty(&mut self) {
        self.write_header = true;
    }

    pub fn header_dirty(&self) -> bool {
        self.write_header
    }

    /// Forces the info file to be written again, e.g. after a new card.
    pub fn mark_info_stale(&mut self) {
        self.info_saved = false;
    }

    pub fn info_saved(&self) -> bool {
        self.info_saved
    }

    /// Write every complete group not yet on the card and flag it
    /// [`PublishFlag::Storage`]. Each group goes to the file of the day it
    /// was read. Returns how many groups were written.
    pub fn publish<F: CardFs, const N: usize>(
        &mut self,
        fs: &mut F,
        store: &mut ReadingStore<N>,
        enabled: &EnabledSet,
    ) -> Result<usize, StorageError<F::Error>> {
        let mut rows = String::new();
        let mut day: Option<ShortDate> = None;
        let mut day_start = 0;
        let mut written = 0;
        for group in 0..store.count_groups() {
            if !store.is_complete(group) || store.flag(group, PublishFlag::Storage) {
                continue;
            }
            let Some(time) = store.time(group) else {
                continue;
            };

            let date = DateTime::from_epoch(time).short_date();
            if let Some(previous) = day.as_ref().filter(|d| **d != date) {
                self.append_day(fs, previous, enabled, &rows)?;
                mark_stored(store, day_start..group);
                rows.clear();
                day_start = group;
            }
            if day.is_none() {
                day_start = group;
            }
            day = Some(date);

            let iso = epoch_to_iso(time);
            rows.push_str(&iso);
            for sensor in enabled_in_priority(enabled) {
                rows.push(',');
                match store.value_of(group, sensor) {
                    Some(Some(value)) => {
                        let _ = write!(rows, "{}", value);
                    }
                    _ => rows.push_str("null"),
                }
            }
            rows.push_str(LINE_END);
            written += 1;
            log::debug!("({}) Readings saved to card", iso);
        }

        if let Some(date) = day {
            self.append_day(fs, &date, enabled, &rows)?;
            mark_stored(store, day_start..store.count_groups());
        }
        Ok(written)
    }

    /// Append `rows` to the `YY-MM-DD.CSV` file of `date`, starting it with
    /// headers when new or when the sensor set changed.
    fn append_day<F: CardFs>(
        &mut self,
        fs: &mut F,
        date: &str,
        enabled: &EnabledSet,
        rows: &str,
    ) -> Result<(), StorageError<F::Error>> {
        let mut name = String::with_capacity(12);
        let _ = write!(name, "{}.CSV", date);

        if !fs.exists(&name).map_err(StorageError::Fs)? {
            self.write_header = true;
        } else if self.write_header {
            let rotated = free_rotation_name(fs, date)?;
            log::info!("Sensor set changed, moving {} to {}", name, rotated);
            fs.rename(&name, &rotated).map_err(StorageError::Fs)?;
        }

        let mut out = String::new();
        if self.write_header {
            write_header(&mut out, enabled);
        }
        out.push_str(rows);
        fs.append(&name, out.as_bytes()).map_err(StorageError::Fs)?;
        self.write_header = false;
        Ok(())
    }

    /// Write `INFO.TXT` unless it was already written for this card.
    pub fn save_info<F: CardFs>(
        &mut self,
        fs: &mut F,
        identity: &Identity,
    ) -> Result<bool, StorageError<F::Error>> {
        if self.info_saved {
            return Ok(false);
        }
        if fs.exists(INFO_FILE).map_err(StorageError::Fs)? {
            fs.remove(INFO_FILE).map_err(StorageError::Fs)?;
        }

        let mut out = String::new();
        let _ = write!(
            out,
            "Hardware Version: {}\r\nHardware ID: {}\r\nFirmware version: {}\r\nFirmware build date: {}\r\n",
            identity.hardware_version,
            identity.unique_id,
            identity.firmware_version,
            identity.build_date
        );
        let _ = write!(
            out,
            "Co-processor MAC address: {}\r\nCo-processor version: {}\r\nCo-processor build date: {}\r\n",
            identity.peer_mac, identity.peer_version, identity.peer_build_date
        );
        fs.append(INFO_FILE, out.as_bytes())
            .map_err(StorageError::Fs)?;

        self.info_saved = true;
        log::info!("Saved {} file", INFO_FILE);
        Ok(true)
    }
}

fn mark_stored<const N: usize>(store: &mut ReadingStore<N>, groups: core::ops::Range<usize>) {
    for group in groups {
        if store.is_complete(group) {
            store.set_flag(group, PublishFlag::Storage, true);
        }
    }
}

fn enabled_in_priority(enabled: &EnabledSet) -> impl Iterator<Item = SensorType> + '_ {
    SensorType::PRIORITY
        .into_iter()
        .filter(|s| enabled[s.index()])
}

fn write_header(out: &mut String, enabled: &EnabledSet) {
    out.push_str("TIME");
    for sensor in enabled_in_priority(enabled) {
        out.push(',');
        out.push_str(sensor.info().short_title);
    }
    out.push_str(LINE_END);

    out.push_str("ISO 8601");
    for sensor in enabled_in_priority(enabled) {
        out.push(',');
        out.push_str(sensor.info().unit);
    }
    out.push_str(LINE_END);

    out.push_str("Time");
    for sensor in enabled_in_priority(enabled) {
        out.push(',');
        out.push_str(sensor.info().title);
    }
    out.push_str(LINE_END);

    for sensor in enabled_in_priority(enabled) {
        let _ = write!(out, ",{}", sensor.info().id);
    }
    out.push_str(LINE_END);
}

/// First `YY-MM-DD.NN` (NN from 01) that does not exist yet.
fn free_rotation_name<F: CardFs>(
    fs: &mut F,
    date: &str,
) -> Result<String, StorageError<F::Error>> {
    for number in 1..100u8 {
        let mut candidate = String::with_capacity(11);
        let _ = write!(candidate, "{}.{:02}", date, number);
        if !fs.exists(&candidate).map_err(StorageError::Fs)? {
            return Ok(candidate);
        }
    }
    Err(StorageError::NoFreeName)
}
