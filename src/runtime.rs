use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bma_ts::Monotonic;
use serde::{Deserialize, Serialize};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{error, info, warn};

use crate::hal::HardwareLayer;
use crate::image::{ProcessImage, SharedImage};
use crate::modbus::server::{ModbusServer, ServerStats, DEFAULT_MAX_CONNECTIONS};
use crate::program::Program;
use crate::supervisor::Supervisor;
use crate::thread_rt::{self, Builder, RTParams, Scheduling};
use crate::time::Interval;
use crate::{Error, Result};

/// The default scan cycle period, 50 ms
pub const DEFAULT_CYCLE_NS: u64 = 50_000_000;

fn default_cycle_ns() -> u64 {
    DEFAULT_CYCLE_NS
}

fn default_listen() -> String {
    "0.0.0.0:502".to_owned()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_rt() -> RTParams {
    RTParams::new()
        .set_scheduling(Scheduling::FIFO)
        .set_priority(30)
}

fn default_lock_memory() -> bool {
    true
}

/// Runtime configuration. The structure arrives already parsed; the crate
/// does not define a file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scan cycle period in nanoseconds
    #[serde(default = "default_cycle_ns")]
    pub cycle_ns: u64,
    /// Modbus/TCP listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrently served Modbus connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Real-time parameters applied to the scan thread
    #[serde(default = "default_rt")]
    pub rt: RTParams,
    /// Lock the process memory resident at startup
    #[serde(default = "default_lock_memory")]
    pub lock_memory: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_ns: default_cycle_ns(),
            listen: default_listen(),
            max_connections: default_max_connections(),
            rt: default_rt(),
            lock_memory: default_lock_memory(),
        }
    }
}

impl Config {
    /// The default configuration with the `OPLC_CYCLE` environment variable
    /// (cycle period in nanoseconds) applied when present
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("OPLC_CYCLE") {
            config.cycle_ns = v.parse()?;
        }
        config.validate()?;
        Ok(config)
    }
    /// The scan cycle period
    pub fn cycle(&self) -> Duration {
        Duration::from_nanos(self.cycle_ns)
    }
    fn validate(&self) -> Result<()> {
        if self.cycle_ns == 0 {
            return Err(Error::config("scan cycle period must be non-zero"));
        }
        Ok(())
    }
}

/// Runtime state beacon. Can be cloned and shared with no limitations.
#[derive(Clone)]
pub struct State {
    state: Arc<AtomicI8>,
}

impl State {
    fn new() -> Self {
        Self {
            state: AtomicI8::new(StateKind::Starting as i8).into(),
        }
    }
    /// Set runtime state
    pub fn set(&self, state: StateKind) {
        self.state.store(state as i8, Ordering::SeqCst);
    }
    /// Get runtime state
    pub fn get(&self) -> StateKind {
        StateKind::from(self.state.load(Ordering::SeqCst))
    }
    /// Is the runtime online (starting or running)
    pub fn is_online(&self) -> bool {
        self.get() >= StateKind::Starting
    }
    /// Sets runtime state to Stopping
    pub fn terminate(&self) {
        self.set(StateKind::Stopping);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime state kind
#[derive(Default, Eq, PartialEq, Clone, Copy, Ord, PartialOrd, Debug)]
#[repr(i8)]
pub enum StateKind {
    #[default]
    /// The runtime is starting
    Starting = 0,
    /// The scan loop is running
    Running = 2,
    /// The runtime is stopping
    Stopping = -1,
    /// The runtime is stopped
    Stopped = -100,
    /// The runtime state is unknown
    Unknown = -128,
}

impl From<i8> for StateKind {
    fn from(v: i8) -> Self {
        match v {
            0 => StateKind::Starting,
            2 => StateKind::Running,
            -1 => StateKind::Stopping,
            -100 => StateKind::Stopped,
            _ => StateKind::Unknown,
        }
    }
}

/// The runtime aggregate: owns the process image, the compiled program, the
/// hardware layer and the auxiliary tasks, and drives the scan cycle.
///
/// Per-tick sequence, with the image lock held: execute the scan function
/// with the incremented tick counter, sync the hardware staging buffers,
/// refresh the clock image. The lock is then released and the thread sleeps
/// until the next absolute deadline on the monotonic clock; a missed deadline
/// starts the next cycle immediately and lost cycles are not replayed.
pub struct Runtime {
    config: Config,
    image: SharedImage,
    program: Box<dyn Program>,
    hardware: Box<dyn HardwareLayer>,
    supervisor: Supervisor<()>,
    state: State,
    modbus_stats: Option<Arc<ServerStats>>,
}

impl Runtime {
    /// Creates the runtime: validates the configuration and runs the
    /// program's init step, which populates the image slots.
    pub fn new<P, H>(config: Config, mut program: P, hardware: H) -> Result<Self>
    where
        P: Program + 'static,
        H: HardwareLayer + 'static,
    {
        config.validate()?;
        let mut image = ProcessImage::new();
        program.init(&mut image)?;
        Ok(Self {
            config,
            image: SharedImage::new(image),
            program: Box::new(program),
            hardware: Box::new(hardware),
            supervisor: Supervisor::new(),
            state: State::new(),
            modbus_stats: None,
        })
    }
    /// The shared image handle
    pub fn image(&self) -> SharedImage {
        self.image.clone()
    }
    /// The state beacon
    pub fn state(&self) -> State {
        self.state.clone()
    }
    /// Modbus request counters, available once [`Runtime::run()`] has
    /// started the server
    pub fn modbus_stats(&self) -> Option<Arc<ServerStats>> {
        self.modbus_stats.clone()
    }
    /// Registers SIGINT and SIGTERM to terminate the runtime gracefully
    pub fn register_signals(&mut self) -> Result<()> {
        let state = self.state.clone();
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        self.supervisor
            .spawn(Builder::new().name("signals").blocking(true), move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "termination signal received");
                    state.terminate();
                }
            })?;
        Ok(())
    }
    /// Initializes the hardware, starts the Modbus server and runs the scan
    /// loop until the state beacon goes offline. Blocks the current thread.
    ///
    /// Hardware and server startup errors are returned as-is and are fatal;
    /// failures to enter real-time scheduling or to lock memory are logged
    /// and ignored.
    pub fn run(&mut self) -> Result<()> {
        self.hardware.initialize()?;
        {
            let img = self.image.lock();
            self.hardware.update_buffers(&img);
        }
        let server = ModbusServer::bind(self.config.listen.as_str(), self.image.clone())?
            .with_max_connections(self.config.max_connections);
        info!(listen = %self.config.listen, "Modbus server starting");
        self.modbus_stats = Some(server.stats());
        let state = self.state.clone();
        self.supervisor
            .spawn(Builder::new().name("modbusd").blocking(true), move || {
                if let Err(error) = server.serve() {
                    error!(%error, "Modbus server terminated");
                    state.terminate();
                }
            })?;
        if let Err(error) = thread_rt::enter_realtime(&self.config.rt) {
            warn!(%error, "failed to enter real-time scheduling");
        }
        if self.config.lock_memory {
            if let Err(error) = thread_rt::lock_memory() {
                warn!(%error, "failed to lock memory");
            }
        }
        self.state.set(StateKind::Running);
        info!(cycle_ns = self.config.cycle_ns, "scan loop started");
        let mut interval = Interval::new(self.config.cycle());
        let mut tick: u64 = 0;
        let mut last_miss_warn: Option<Monotonic> = None;
        while self.state.is_online() {
            {
                let img = self.image.lock();
                tick = tick.wrapping_add(1);
                self.program.scan(tick);
                self.hardware.update_buffers(&img);
                img.clock().update_now();
            }
            if !interval.tick()
                && last_miss_warn.map_or(true, |t| t.elapsed() >= Duration::from_secs(1))
            {
                warn!(tick, "scan cycle deadline missed");
                last_miss_warn = Some(Monotonic::now());
            }
        }
        info!("scan loop stopped");
        self.hardware.shutdown();
        self.state.set(StateKind::Stopped);
        self.supervisor.join_all();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Config, Runtime};
    use crate::hal::Blank;
    use crate::image::{Family, IoCell, ProcessImage};
    use crate::program::Program;
    use crate::thread_rt::set_simulated;
    use crate::Result;

    struct TickRecorder {
        ticks: Arc<IoCell<u64>>,
    }

    impl Program for TickRecorder {
        fn init(&mut self, image: &mut ProcessImage) -> Result<()> {
            image.bind(Family::Input, 0, 0, self.ticks.clone())
        }
        fn scan(&mut self, tick: u64) {
            self.ticks.set(tick);
        }
    }

    #[test]
    fn test_scan_loop_ticks() {
        set_simulated();
        let config = Config {
            cycle_ns: 5_000_000,
            listen: "127.0.0.1:0".to_owned(),
            ..Config::default()
        };
        let ticks = Arc::new(IoCell::new(0u64));
        let program = TickRecorder {
            ticks: ticks.clone(),
        };
        let mut runtime = Runtime::new(config, program, Blank).unwrap();
        let state = runtime.state();
        let image = runtime.image();
        let handle = thread::spawn(move || runtime.run());
        thread::sleep(Duration::from_millis(100));
        state.terminate();
        handle.join().unwrap().unwrap();
        let seen = ticks.get();
        assert!(seen >= 5, "only {} scans in 100 ms", seen);
        // the tick counter is also visible through the image slot
        image.with_lock(|img| {
            assert_eq!(img.cell::<u64>(Family::Input, 0, 0).unwrap().get(), seen);
        });
        // the clock image was refreshed under the lock
        image.with_lock(|img| {
            assert!(img.clock().year().get() >= 2024);
        });
    }

    #[test]
    fn test_zero_cycle_rejected() {
        let config = Config {
            cycle_ns: 0,
            ..Config::default()
        };
        let ticks = Arc::new(IoCell::new(0u64));
        assert!(Runtime::new(config, TickRecorder { ticks }, Blank).is_err());
    }
}
