//!
//! Peripheral drivers coupling external I/O boards to the process image
//! through the [`crate::hal::HardwareLayer`] contract.
pub mod framing;
pub mod serial_board;
