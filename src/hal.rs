use crate::image::ProcessImage;
use crate::Result;

/// The contract between the runtime and platform I/O drivers.
///
/// Drivers perform their slow I/O on their own threads against private
/// staging buffers; [`HardwareLayer::update_buffers()`] only moves data
/// between those buffers and the image cells, so the scan cycle never waits
/// on a wire.
pub trait HardwareLayer: Send {
    /// Called once at startup. May launch driver threads; must return within
    /// bounded time. Errors here are fatal.
    fn initialize(&mut self) -> Result<()>;
    /// Called once per scan with the image lock already held. Copies output
    /// cells into driver-local outbound state and inbound driver state into
    /// input cells. Must not block on network or serial I/O; any driver lock
    /// taken here nests inside the image lock.
    fn update_buffers(&mut self, image: &ProcessImage);
    /// Called on graceful termination
    fn shutdown(&mut self) {}
}

/// A hardware layer with no physical I/O
pub struct Blank;

impl HardwareLayer for Blank {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }
    fn update_buffers(&mut self, _image: &ProcessImage) {}
}
