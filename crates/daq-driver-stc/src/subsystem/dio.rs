//! Static digital I/O on the eight DIO lines.

use std::sync::Arc;

use tracing::debug;

use crate::registers::{Register, RegisterFile};

/// DIO subsystem of one board.
#[derive(Debug)]
pub struct Dio {
    regs: Arc<RegisterFile>,
}

impl Dio {
    /// Create the subsystem with every line as an input.
    pub fn new(regs: Arc<RegisterFile>) -> Self {
        Self { regs }
    }

    /// Set line directions; a set bit makes the line an output.
    pub fn configure(&self, output_mask: u8) {
        self.regs
            .write(Register::DioControl, u32::from(output_mask));
        debug!(output_mask = format_args!("{output_mask:#04x}"), "DIO directions set");
    }

    /// Latch `value`; only lines configured as outputs are driven.
    pub fn write(&self, value: u8) {
        self.regs.write(Register::DioOutput, u32::from(value));
    }

    /// Live state of all eight lines.
    pub fn read(&self) -> u8 {
        (self.regs.read(Register::DioParallelInput) & 0xFF) as u8
    }

    /// Output mask currently programmed.
    pub fn output_mask(&self) -> u8 {
        (self.regs.mirrored(Register::DioControl) & 0xFF) as u8
    }

    /// Every line an input, output latch cleared.
    pub fn reset_all(&self) {
        self.regs.write(Register::DioControl, 0);
        self.regs.write(Register::DioOutput, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    #[test]
    fn test_configure_write_read() {
        let bus = Arc::new(SimulatedBus::new());
        let regs = Arc::new(RegisterFile::new(bus.clone()));
        let dio = Dio::new(regs.clone());

        dio.configure(0x0F);
        dio.write(0xA5);
        assert_eq!(dio.output_mask(), 0x0F);
        assert_eq!(bus.last_write(Register::DioOutput), Some(0xA5));

        bus.set_dio_input(0x3C);
        assert_eq!(dio.read(), 0x3C);

        dio.reset_all();
        assert_eq!(dio.output_mask(), 0);
        assert_eq!(regs.mirrored(Register::DioOutput), 0);
    }
}
