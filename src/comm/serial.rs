//! Serial port opening with the fixed raw-mode profile used by the I/O
//! drivers: 8 data bits, no parity, one stop bit, no flow control.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serial::prelude::*;
use serial::SystemPort;

use crate::{Error, Result};

/// The supported baud rates
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Baud {
    /// 4800 bps
    Baud4800,
    /// 9600 bps
    Baud9600,
    /// 14400 bps
    Baud14400,
    /// 19200 bps
    Baud19200,
    /// 28800 bps
    Baud28800,
    /// 38400 bps
    Baud38400,
    /// 57600 bps
    Baud57600,
    /// 115200 bps
    Baud115200,
}

impl TryFrom<u32> for Baud {
    type Error = Error;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            4_800 => Ok(Baud::Baud4800),
            9_600 => Ok(Baud::Baud9600),
            14_400 => Ok(Baud::Baud14400),
            19_200 => Ok(Baud::Baud19200),
            28_800 => Ok(Baud::Baud28800),
            38_400 => Ok(Baud::Baud38400),
            57_600 => Ok(Baud::Baud57600),
            115_200 => Ok(Baud::Baud115200),
            v => Err(Error::invalid_data(format!(
                "serial baud rate not supported: {}",
                v
            ))),
        }
    }
}

impl From<Baud> for u32 {
    fn from(value: Baud) -> Self {
        match value {
            Baud::Baud4800 => 4_800,
            Baud::Baud9600 => 9_600,
            Baud::Baud14400 => 14_400,
            Baud::Baud19200 => 19_200,
            Baud::Baud28800 => 28_800,
            Baud::Baud38400 => 38_400,
            Baud::Baud57600 => 57_600,
            Baud::Baud115200 => 115_200,
        }
    }
}

impl From<Baud> for serial::BaudRate {
    fn from(value: Baud) -> Self {
        match value {
            Baud::Baud4800 => serial::Baud4800,
            Baud::Baud9600 => serial::Baud9600,
            Baud::Baud14400 => serial::BaudOther(14_400),
            Baud::Baud19200 => serial::Baud19200,
            Baud::Baud28800 => serial::BaudOther(28_800),
            Baud::Baud38400 => serial::Baud38400,
            Baud::Baud57600 => serial::Baud57600,
            Baud::Baud115200 => serial::Baud115200,
        }
    }
}

/// Opens a serial port in raw binary mode at the given rate.
///
/// `timeout` bounds a single read poll; expired polls surface as
/// [`std::io::ErrorKind::TimedOut`] from the port reader.
pub fn open(path: &str, baud: Baud, timeout: Duration) -> Result<SystemPort> {
    let mut port = serial::open(path)?;
    port.reconfigure(&|settings| {
        settings.set_baud_rate(baud.into())?;
        settings.set_char_size(serial::Bits8);
        settings.set_parity(serial::ParityNone);
        settings.set_stop_bits(serial::Stop1);
        settings.set_flow_control(serial::FlowNone);
        Ok(())
    })?;
    port.set_timeout(timeout)?;
    Ok(port)
}

#[cfg(test)]
mod test {
    use super::Baud;

    #[test]
    fn test_baud_enumeration() {
        for rate in [4_800u32, 9_600, 14_400, 19_200, 28_800, 38_400, 57_600, 115_200] {
            let baud = Baud::try_from(rate).unwrap();
            assert_eq!(u32::from(baud), rate);
        }
        assert!(Baud::try_from(110).is_err());
        assert!(Baud::try_from(0).is_err());
    }
}
