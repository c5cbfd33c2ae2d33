//! Night light relay on a GPIO pin
//!
//! The relay can't be read back, so [`RelayController`] keeps the last value it
//! wrote and reports that.

use std::convert::Infallible;
use std::sync::Mutex;

use embedded_hal::digital::{Error as _, ErrorKind, ErrorType, OutputPin, PinState};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[cfg(target_os = "linux")]
    #[error("gpio {pin}: {source}")]
    Open {
        pin: u8,
        source: rppal::gpio::Error,
    },
    #[error("relay pin failed: {0:?}")]
    Pin(ErrorKind),
    #[error("relay pin already released")]
    Released,
    #[error("relay lock poisoned")]
    Poisoned,
}

/// Claim BCM pin `pin` as an output, driven low. The pin is handed back to
/// the OS in its original mode when dropped.
#[cfg(target_os = "linux")]
pub fn open_bcm(pin: u8) -> Result<rppal::gpio::OutputPin, RelayError> {
    let open = |source| RelayError::Open { pin, source };
    let pin = rppal::gpio::Gpio::new()
        .map_err(open)?
        .get(pin)
        .map_err(open)?
        .into_output_low();
    tracing::info!("gpio {} claimed as output", pin.pin());
    Ok(pin)
}

/// Pin that only lives in memory, for `--simulate`
#[derive(Debug, Default)]
pub struct MemoryPin {
    pub high: bool,
}

impl ErrorType for MemoryPin {
    type Error = Infallible;
}

impl OutputPin for MemoryPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

struct Relay<P> {
    /// `None` once released
    pin: Option<P>,
    on: bool,
}

pub struct RelayController<P> {
    relay: Mutex<Relay<P>>,
}

impl<P: OutputPin + Send> RelayController<P> {
    /// Starts with the shadow state off, the pin is not touched until the
    /// first `set_light`
    pub fn new(pin: P) -> Self {
        Self {
            relay: Mutex::new(Relay {
                pin: Some(pin),
                on: false,
            }),
        }
    }

    pub fn set_light(&self, on: bool) -> Result<(), RelayError> {
        let mut relay = self.relay.lock().map_err(|_| RelayError::Poisoned)?;
        let pin = relay.pin.as_mut().ok_or(RelayError::Released)?;
        pin.set_state(PinState::from(on))
            .map_err(|e| RelayError::Pin(e.kind()))?;
        relay.on = on;
        tracing::info!("gpio light {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// Last value successfully written
    pub fn get_light(&self) -> bool {
        match self.relay.lock() {
            Ok(relay) => relay.on,
            Err(poisoned) => poisoned.into_inner().on,
        }
    }

    /// Switch the light off and give the pin back
    pub fn shutdown(&self) {
        let mut relay = match self.relay.lock() {
            Ok(relay) => relay,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut pin) = relay.pin.take()
            && let Err(e) = pin.set_low()
        {
            tracing::warn!("failed to switch relay off: {:?}", e.kind());
        }
        relay.on = false;
    }

    #[cfg(test)]
    fn with_pin<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        self.relay.lock().unwrap().pin.as_ref().map(f)
    }
}
