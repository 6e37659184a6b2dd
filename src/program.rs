use crate::image::ProcessImage;
use crate::Result;

/// The contract between the runtime and the compiled control program.
///
/// The compiler emits two entry points: an init step which creates the
/// program's variables and binds them into the process image, and the scan
/// function executed once per cycle. The runtime treats the scan as opaque:
/// it is called with the image lock held and the current tick number, and the
/// program operates on the cell handles it kept from [`Program::init()`].
pub trait Program: Send {
    /// Called once, before the scheduler starts. Populates the image slots.
    fn init(&mut self, image: &mut ProcessImage) -> Result<()>;
    /// Executes one scan. `tick` starts at 1 and increments every cycle.
    fn scan(&mut self, tick: u64);
}
