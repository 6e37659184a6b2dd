use std::sync::Arc;

use plcrt::prelude::*;
use plcrt::Result;

// A tiny stand-in for compiler-generated code: blinks an output bit and
// mirrors an input bit to a relay output.
struct Blink {
    led: Arc<IoCell<bool>>,
    button: Arc<IoCell<bool>>,
    relay: Arc<IoCell<bool>>,
}

impl Program for Blink {
    fn init(&mut self, image: &mut ProcessImage) -> Result<()> {
        image.bind(Family::Output, 0, 0, self.led.clone())?;
        image.bind(Family::Input, 0, 0, self.button.clone())?;
        image.bind(Family::Output, 0, 1, self.relay.clone())?;
        Ok(())
    }
    fn scan(&mut self, tick: u64) {
        if tick % 10 == 0 {
            self.led.set(!self.led.get());
        }
        self.relay.set(self.button.get());
    }
}

fn main() {
    configure_logger(plcrt::LevelFilter::Info);
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => critical(&e.to_string()),
    };
    let program = Blink {
        led: <_>::default(),
        button: <_>::default(),
        relay: <_>::default(),
    };
    // swap `Blank` for e.g. `plcrt::drivers::serial_board::SerialBoard` to
    // couple a physical I/O board
    let mut runtime = match Runtime::new(config, program, Blank) {
        Ok(runtime) => runtime,
        Err(e) => critical(&e.to_string()),
    };
    if let Err(e) = runtime.register_signals() {
        critical(&e.to_string());
    }
    if let Err(e) = runtime.run() {
        critical(&e.to_string());
    }
}
