//! Driver instance: the set of boards, indexed by minor number.
//!
//! Created once at load time; every board is reset when the driver is
//! created and again when it is dropped.

use std::sync::Arc;

use tracing::info;

use crate::board::Board;
use crate::config::DriverConfig;
use crate::error::{Result, StcError};
use crate::fops::{DeviceFile, OpenFlags};
use crate::registers::RegisterBus;
use crate::sim::SimulatedBus;
use crate::wait::SignalToken;

/// All boards handled by this driver.
#[derive(Debug)]
pub struct Driver {
    config: DriverConfig,
    boards: Vec<Arc<Board>>,
}

impl Driver {
    /// Bring up one board per configured entry, each on the matching bus.
    pub fn new(config: DriverConfig, buses: Vec<Arc<dyn RegisterBus>>) -> Result<Self> {
        config.validate()?;
        if buses.len() != config.boards.len() {
            return Err(StcError::invalid(format!(
                "{} boards configured but {} buses supplied",
                config.boards.len(),
                buses.len()
            )));
        }

        let boards = config
            .boards
            .iter()
            .zip(buses)
            .enumerate()
            .map(|(minor, (settings, bus))| {
                Arc::new(Board::new(minor as u32, settings, &config, bus))
            })
            .collect::<Vec<_>>();

        info!(boards = boards.len(), "DAQ-STC driver loaded");
        Ok(Self { config, boards })
    }

    /// Driver whose boards all sit on [`SimulatedBus`]es.
    pub fn simulated(config: DriverConfig) -> Result<(Self, Vec<Arc<SimulatedBus>>)> {
        let sims: Vec<Arc<SimulatedBus>> = config
            .boards
            .iter()
            .map(|_| Arc::new(SimulatedBus::new()))
            .collect();
        let buses = sims
            .iter()
            .map(|bus| bus.clone() as Arc<dyn RegisterBus>)
            .collect();
        let driver = Self::new(config, buses)?;
        Ok((driver, sims))
    }

    /// Open board `minor`.
    pub fn open(&self, minor: u32, flags: OpenFlags, signal: &SignalToken) -> Result<DeviceFile> {
        let board = self.board(minor)?;
        board.claim(flags.nonblocking, signal)?;
        Ok(DeviceFile::new(board.clone(), flags, signal.clone()))
    }

    /// Board with minor number `minor`.
    pub fn board(&self, minor: u32) -> Result<&Arc<Board>> {
        self.boards
            .get(minor as usize)
            .ok_or(StcError::NoDevice { minor })
    }

    /// Number of boards.
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    /// Configuration the driver was loaded with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        for board in &self.boards {
            board.reset_all();
        }
        info!("DAQ-STC driver unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardSettings;

    #[test]
    fn test_bad_minor_is_enodev() {
        let (driver, _buses) = Driver::simulated(DriverConfig::default()).unwrap();
        let err = driver
            .open(3, OpenFlags::nonblocking(), &SignalToken::new())
            .unwrap_err();
        assert_eq!(err.errno(), -crate::error::ENODEV);
    }

    #[test]
    fn test_one_board_per_entry() {
        let config = DriverConfig {
            boards: vec![BoardSettings::named("a"), BoardSettings::named("b")],
            ..Default::default()
        };
        let (driver, buses) = Driver::simulated(config).unwrap();
        assert_eq!(driver.board_count(), 2);
        assert_eq!(buses.len(), 2);
        assert_eq!(driver.board(1).unwrap().name(), "b");
    }

    #[test]
    fn test_bus_count_must_match() {
        let result = Driver::new(DriverConfig::default(), vec![]);
        assert!(result.is_err());
    }
}
