//! Power control of the wireless co-processor

use embassy_time::Duration;
use embedded_hal::digital::OutputPin;

use super::ModeController;
use crate::hal::{Platform, SystemControl};
use crate::link::PeerState;
use crate::link::message::{OutboundKind, OutboundMessage};
use crate::time::Clock;

/// A booting co-processor that has not announced itself by then is rebooted.
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(3);

const REBOOT_PAUSE: Duration = Duration::from_millis(50);

pub trait CoprocessorPower {
    type Error: core::fmt::Debug;

    fn power_on(&mut self) -> Result<(), Self::Error>;
    fn power_off(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoprocessorCommand {
    On,
    Off,
    /// Off, short pause, on.
    Reboot,
    /// Turn the co-processor LED off, then power down.
    Sleep,
}

/// Co-processor power through three GPIOs: chip enable, the supply switch
/// (active low) and the boot mode strap (high for normal boot).
pub struct PinCoprocessorPower<EN, PWR, BOOT> {
    enable: EN,
    supply: PWR,
    boot: BOOT,
}

impl<EN, PWR, BOOT, E> PinCoprocessorPower<EN, PWR, BOOT>
where
    EN: OutputPin<Error = E>,
    PWR: OutputPin<Error = E>,
    BOOT: OutputPin<Error = E>,
{
    pub fn new(enable: EN, supply: PWR, boot: BOOT) -> Self {
        Self {
            enable,
            supply,
            boot,
        }
    }
}

impl<EN, PWR, BOOT, E> CoprocessorPower for PinCoprocessorPower<EN, PWR, BOOT>
where
    EN: OutputPin<Error = E>,
    PWR: OutputPin<Error = E>,
    BOOT: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn power_on(&mut self) -> Result<(), E> {
        self.enable.set_high()?;
        self.boot.set_high()?;
        self.supply.set_low()
    }

    fn power_off(&mut self) -> Result<(), E> {
        self.enable.set_low()?;
        self.supply.set_high()?;
        self.boot.set_low()
    }
}

impl<P: Platform> ModeController<P> {
    pub async fn coprocessor(&mut self, command: CoprocessorCommand) {
        match command {
            CoprocessorCommand::On => self.coprocessor_on(),
            CoprocessorCommand::Off => self.coprocessor_off(),
            CoprocessorCommand::Reboot => {
                log::debug!("Restarting co-processor...");
                self.coprocessor_off();
                self.board.delay(REBOOT_PAUSE).await;
                self.coprocessor_on();
            }
            CoprocessorCommand::Sleep => {
                log::debug!("Co-processor deep sleep...");
                if let Err(e) = self.send(OutboundMessage::bare(OutboundKind::LedOff)).await {
                    log::debug!("LED off not sent: {}", e);
                }
                self.coprocessor_off();
            }
        }
    }

    fn coprocessor_on(&mut self) {
        if self.state.peer_on() {
            return;
        }
        log::debug!("Co-processor on...");
        if let Err(e) = self.board.power_on() {
            log::warn!("Co-processor power on failed: {:?}", e);
        }
        self.state.wifi.reset();
        self.state.peer = PeerState::Booting;
        self.peer_started = Some(self.board.now());
    }

    fn coprocessor_off(&mut self) {
        log::debug!("Co-processor off...");
        if let Err(e) = self.board.power_off() {
            log::warn!("Co-processor power off failed: {:?}", e);
        }
        if let Some(started) = self.peer_started.take() {
            log::debug!(
                "Co-processor was on for {} seconds",
                self.board.now().saturating_duration_since(started).as_secs()
            );
        }
        // A powered down co-processor has lost its wifi association and
        // starts its packet ids over.
        self.state.wifi.reset();
        self.state.peer = PeerState::Off;
        self.framer.reset();
    }

    /// Reboots a co-processor that is stuck booting.
    pub(super) async fn check_boot_watchdog(&mut self) {
        if !self.state.peer_booting() {
            return;
        }
        let Some(started) = self.peer_started else {
            return;
        };
        if self.board.now().saturating_duration_since(started) > BOOT_TIMEOUT {
            log::warn!("Co-processor did not finish booting, restarting");
            self.coprocessor(CoprocessorCommand::Reboot).await;
        }
    }
}
