#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", "README.md"))]
#![deny(missing_docs)]
use core::{fmt, num};
use std::io::Write;
use std::{env, process};

use colored::Colorize as _;

pub use log::LevelFilter;

/// Serial port plumbing
pub mod comm;
/// Peripheral drivers and their framing
pub mod drivers;
/// Hardware layer contract
pub mod hal;
/// Process image: typed I/O cells shared between the control program, the
/// hardware layer and the protocol server
pub mod image;
/// Modbus/TCP slave
pub mod modbus;
/// Compiled control program contract
pub mod program;
/// The runtime aggregate and the scan-cycle scheduler
#[cfg(target_os = "linux")]
pub mod runtime;
/// Task supervisor to manage runtime threads
#[cfg(target_os = "linux")]
pub mod supervisor;
/// Real-time thread functions to work with [`supervisor::Supervisor`] and standalone
#[cfg(target_os = "linux")]
pub mod thread_rt;
/// Monotonic interval helpers
pub mod time;

mod semaphore;

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Standard I/O errors
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    /// I/O errors with no [`std::io::Error`] behind them
    #[error("communication error: {0}")]
    Comm(String),
    /// Invalid data received or invalid parameters provided
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Configuration errors, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),
    /// An image slot is already bound to a cell
    #[error("image slot already bound: {0}")]
    SlotOccupied(String),
    /// Timeouts
    #[error("timed out")]
    Timeout,
    /// Real-time engine error: unable to get the system thread id
    #[error("RT SYS_gettid {0}")]
    RTGetTId(libc::c_int),
    /// Real-time engine error: unable to set the thread CPU affinity
    #[error("RT sched_setaffinity {0}")]
    RTSchedSetAffinity(libc::c_int),
    /// Real-time engine error: unable to set the thread scheduling policy
    #[error("RT sched_setscheduler {0}")]
    RTSchedSetScheduler(libc::c_int),
    /// Real-time engine error: unable to lock the process memory resident
    #[error("RT mlockall {0}")]
    RTMemLock(libc::c_int),
    /// A task is spawned through a supervisor without a name
    #[error("a supervised task must have a name")]
    SupervisorNameNotSpecified,
    /// A task with the given name is already registered
    #[error("task already registered: `{0}`")]
    SupervisorDuplicateTask(String),
    /// No task with the given name is registered
    #[error("task not found")]
    SupervisorTaskNotFound,
    /// [binrw](https://crates.io/crates/binrw) crate errors
    #[error("binrw {0}")]
    BinRw(String),
    /// All other errors
    #[error("operation failed: {0}")]
    Failed(String),
    /// This error never happens and is used as a compiler hint only
    #[error("never happens")]
    Infallible(#[from] std::convert::Infallible),
}

macro_rules! impl_error {
    ($t: ty, $key: ident) => {
        impl From<$t> for Error {
            fn from(err: $t) -> Self {
                Error::$key(err.to_string())
            }
        }
    };
}

impl_error!(serial::Error, Comm);
impl_error!(oneshot::RecvError, Comm);
impl_error!(num::ParseIntError, InvalidData);
impl_error!(binrw::Error, BinRw);

impl Error {
    /// Shortcut for [`Error::InvalidData`]
    pub fn invalid_data<S: fmt::Display>(msg: S) -> Self {
        Error::InvalidData(msg.to_string())
    }
    /// Shortcut for [`Error::Comm`]
    pub fn io<S: fmt::Display>(msg: S) -> Self {
        Error::Comm(msg.to_string())
    }
    /// Shortcut for [`Error::Config`]
    pub fn config<S: fmt::Display>(msg: S) -> Self {
        Error::Config(msg.to_string())
    }
    /// Shortcut for [`Error::Failed`]
    pub fn failed<S: fmt::Display>(msg: S) -> Self {
        Error::Failed(msg.to_string())
    }
}

/// Immediately terminates the current process with a message to stderr.
/// Reserved for unrecoverable startup failures (configuration, hardware
/// initialization).
pub fn critical(msg: &str) -> ! {
    eprintln!("{}", msg.red().bold());
    process::exit(1);
}

/// Returns true if started in production mode (as a systemd unit)
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in production
/// mode, does not log timestamps
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Prelude module
pub mod prelude {
    pub use crate::hal::{Blank, HardwareLayer};
    pub use crate::image::{Family, IoCell, ProcessImage, SharedImage};
    pub use crate::modbus::server::ModbusServer;
    pub use crate::program::Program;
    #[cfg(target_os = "linux")]
    pub use crate::runtime::{Config, Runtime};
    #[cfg(target_os = "linux")]
    pub use crate::supervisor::prelude::*;
    pub use crate::time::Interval;
    pub use crate::{configure_logger, critical};
    pub use bma_ts::Monotonic;
    pub use std::time::Duration;
}
