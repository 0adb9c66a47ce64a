//! Copy of the log on the card
//!
//! [`CardLog`] is a [`log::Log`] sink that keeps the latest lines in memory
//! until the controller writes them to [`DEBUG_FILE`], each prefixed with
//! the time it was written (`2018-07-17T06:55:06Z-->INFO: ...`). Install the
//! [`CARD_LOG`] static with `log::set_logger`, or feed it from another
//! logger through [`CardLog::push`].
//!
//! Once an hour the file is checked against its size limit and moved to
//! [`ROTATED_DEBUG_FILE`], replacing an older one.

use core::cell::RefCell;
use core::fmt::Write;

use critical_section::Mutex;
use heapless::{Deque, String};

use super::card::{CardFs, StorageError};
use crate::time::epoch_to_iso;

pub const DEBUG_FILE: &str = "DEBUG.TXT";
pub const ROTATED_DEBUG_FILE: &str = "DEBUG01.TXT";

/// 50 MiB.
pub const MAX_DEBUG_SIZE: u32 = 52_428_800;

pub const LINE_LEN: usize = 120;
const MAX_LINES: usize = 16;

pub type LogLine = String<LINE_LEN>;

/// Lines waiting for the card, oldest first.
#[derive(Default)]
pub struct PendingLines {
    pub lines: Deque<LogLine, MAX_LINES>,
    /// Lines pushed out by newer ones before they reached the card.
    pub dropped: u32,
}

impl PendingLines {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.dropped == 0
    }
}

pub struct CardLog {
    pending: Mutex<RefCell<PendingLines>>,
}

pub static CARD_LOG: CardLog = CardLog::new();

impl Default for CardLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CardLog {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(RefCell::new(PendingLines {
                lines: Deque::new(),
                dropped: 0,
            })),
        }
    }

    /// Queue a line, dropping the oldest one when full.
    pub fn push(&self, line: LogLine) {
        critical_section::with(|cs| {
            let mut pending = self.pending.borrow_ref_mut(cs);
            if pending.lines.is_full() {
                let _ = pending.lines.pop_front();
                pending.dropped = pending.dropped.saturating_add(1);
            }
            let _ = pending.lines.push_back(line);
        });
    }

    /// Hand over everything queued so far.
    pub fn take(&self) -> PendingLines {
        critical_section::with(|cs| core::mem::take(&mut *self.pending.borrow_ref_mut(cs)))
    }
}

impl log::Log for CardLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LogLine::new();
        // Overlong messages are cut.
        let _ = write!(line, "{}: {}", record.level(), record.args());
        self.push(line);
    }

    fn flush(&self) {}
}

/// Append `pending` to [`DEBUG_FILE`], stamped with `epoch`.
pub fn write_debug<F: CardFs>(
    fs: &mut F,
    epoch: u32,
    pending: &PendingLines,
) -> Result<(), StorageError<F::Error>> {
    let iso = epoch_to_iso(epoch);
    let mut out = alloc::string::String::new();
    if pending.dropped > 0 {
        let _ = write!(out, "{}-->{} lines lost\r\n", iso, pending.dropped);
    }
    for line in pending.lines.iter() {
        let _ = write!(out, "{}-->{}\r\n", iso, line);
    }
    fs.append(DEBUG_FILE, out.as_bytes())
        .map_err(StorageError::Fs)
}

/// Move [`DEBUG_FILE`] aside once it reaches `max_size` bytes. Returns
/// `true` if it was moved.
pub fn rotate_debug<F: CardFs>(fs: &mut F, max_size: u32) -> Result<bool, StorageError<F::Error>> {
    if !fs.exists(DEBUG_FILE).map_err(StorageError::Fs)? {
        return Ok(false);
    }
    let size = fs.size(DEBUG_FILE).map_err(StorageError::Fs)?;
    if size < max_size {
        return Ok(false);
    }
    if fs.exists(ROTATED_DEBUG_FILE).map_err(StorageError::Fs)? {
        fs.remove(ROTATED_DEBUG_FILE).map_err(StorageError::Fs)?;
    }
    fs.rename(DEBUG_FILE, ROTATED_DEBUG_FILE)
        .map_err(StorageError::Fs)?;
    log::info!("Debug file reached {} bytes, moved to {}", size, ROTATED_DEBUG_FILE);
    Ok(true)
}
