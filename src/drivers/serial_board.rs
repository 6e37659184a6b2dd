//!
//! Reference driver for I/O boards attached over a serial line.
//!
//! The board exchanges fixed-size binary blocks framed with the byte-stuffed
//! codec from [`crate::drivers::framing`]: every cycle the driver thread
//! pushes the outbound block and collects whatever inbound frames arrived.
//! The scan thread only ever touches the staging buffers, so hardware sync
//! never waits on the wire.
use std::io::{Cursor, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use binrw::{binrw, BinRead, BinWrite};
use parking_lot::Mutex;
use serial::SystemPort;
use tracing::{error, warn};

use crate::comm::serial::{open, Baud};
use crate::drivers::framing::{encode, Decoder};
use crate::hal::HardwareLayer;
use crate::image::{Family, ProcessImage};
use crate::Result;

/// Outbound block size on the wire: 4 digital bytes + 12 analog words
pub const OUTPUT_BLOCK_LEN: usize = 28;
/// Inbound block size on the wire: 4 digital bytes + 16 analog words
pub const INPUT_BLOCK_LEN: usize = 36;

/// Delay between pushing the outbound frame and draining the reply
const EXCHANGE_SETTLE: Duration = Duration::from_millis(1);
/// Poll cadence of the exchange thread
const EXCHANGE_PERIOD: Duration = Duration::from_millis(30);

/// Digital and analog outputs as the board expects them
#[binrw]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutputBlock {
    /// Packed digital outputs, one bit per point
    pub digital: [u8; 4],
    /// Analog outputs
    pub analog: [u16; 12],
}

/// Digital and analog inputs as the board reports them
#[binrw]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InputBlock {
    /// Packed digital inputs, one bit per point
    pub digital: [u8; 4],
    /// Analog inputs
    pub analog: [u16; 16],
}

#[derive(Default)]
struct Staging {
    outputs: OutputBlock,
    inputs: InputBlock,
}

/// The driver. Owns one exchange thread; implements
/// [`HardwareLayer`] by copying between the staging buffers and the image
/// under the driver lock, which always nests inside the image lock.
pub struct SerialBoard {
    path: String,
    baud: Baud,
    staging: Arc<Mutex<Staging>>,
    shutdown: Arc<AtomicBool>,
    io_task: Option<JoinHandle<()>>,
}

impl SerialBoard {
    /// Creates the driver for a board at `path` (e.g. `/dev/ttyACM0`)
    pub fn new<P: Into<String>>(path: P, baud: Baud) -> Self {
        Self {
            path: path.into(),
            baud,
            staging: <_>::default(),
            shutdown: <_>::default(),
            io_task: None,
        }
    }
}

impl HardwareLayer for SerialBoard {
    fn initialize(&mut self) -> Result<()> {
        let port = open(&self.path, self.baud, EXCHANGE_SETTLE)?;
        let staging = self.staging.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("serialio".to_owned())
            .spawn(move || exchange_loop(port, &staging, &shutdown))?;
        self.io_task = Some(handle);
        Ok(())
    }
    fn update_buffers(&mut self, image: &ProcessImage) {
        let mut staging = self.staging.lock();
        apply_inputs(image, &staging.inputs);
        collect_outputs(image, &mut staging.outputs);
    }
    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(task) = self.io_task.take() {
            let _ = task.join();
        }
    }
}

fn apply_inputs(image: &ProcessImage, inputs: &InputBlock) {
    for i in 0..inputs.digital.len() * 8 {
        if let Some(cell) = image.cell::<bool>(Family::Input, i / 8, i % 8) {
            cell.set(inputs.digital[i / 8] >> (i % 8) & 1 == 1);
        }
    }
    for (i, &value) in inputs.analog.iter().enumerate() {
        if let Some(cell) = image.cell::<i16>(Family::Input, 0, i) {
            cell.set(value as i16);
        }
    }
}

fn collect_outputs(image: &ProcessImage, outputs: &mut OutputBlock) {
    for i in 0..outputs.digital.len() * 8 {
        if let Some(cell) = image.cell::<bool>(Family::Output, i / 8, i % 8) {
            let byte = &mut outputs.digital[i / 8];
            if cell.get() {
                *byte |= 1 << (i % 8);
            } else {
                *byte &= !(1 << (i % 8));
            }
        }
    }
    for (i, word) in outputs.analog.iter_mut().enumerate() {
        if let Some(cell) = image.cell::<i16>(Family::Output, 0, i) {
            *word = cell.get() as u16;
        }
    }
}

/// Send outbound, settle, drain inbound, sleep, repeat
fn exchange_loop(mut port: SystemPort, staging: &Mutex<Staging>, shutdown: &AtomicBool) {
    let mut decoder = Decoder::new(INPUT_BLOCK_LEN);
    let mut raw = Vec::with_capacity(OUTPUT_BLOCK_LEN);
    let mut frame = Vec::with_capacity(OUTPUT_BLOCK_LEN * 2 + 2);
    let mut read_buf = [0u8; 128];
    while !shutdown.load(Ordering::Relaxed) {
        let outputs = staging.lock().outputs;
        raw.clear();
        let mut cursor = Cursor::new(&mut raw);
        if let Err(e) = outputs.write_le(&mut cursor) {
            error!(error = %e, "outbound block encoding failed");
            return;
        }
        encode(&raw, &mut frame);
        if let Err(e) = port.write_all(&frame) {
            warn!(error = %e, "serial write failed");
        }
        thread::sleep(EXCHANGE_SETTLE);
        match port.read(&mut read_buf) {
            Ok(n) => {
                for &byte in &read_buf[..n] {
                    if let Some(payload) = decoder.push(byte) {
                        if payload.len() == INPUT_BLOCK_LEN {
                            let mut reader = Cursor::new(payload);
                            match InputBlock::read_le(&mut reader) {
                                Ok(block) => staging.lock().inputs = block,
                                Err(e) => warn!(error = %e, "inbound block decoding failed"),
                            }
                        }
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) => warn!(error = %e, "serial read failed"),
        }
        thread::sleep(EXCHANGE_PERIOD);
    }
}
