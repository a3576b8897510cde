//! Synthetic board for offline operation and tests.

use std::collections::HashMap;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use crate::client::{BoardClient, BoardError};
use hipsr_types::ACC_COUNT_REGISTER;

/// Seconds between accumulator advances on a dummy board.
const DUMMY_ACC_PERIOD: f64 = 2.0;

/// A fake board that synthesises a plausible bandpass: low power at the band
/// edges, high power across the centre, additive noise and the occasional
/// narrow spike. Selected at runtime with `--dummy`.
pub struct DummyBoard {
    host: String,
    registers: HashMap<String, u32>,
    devices: Vec<String>,
    started: Instant,
    failing: bool,
}

impl DummyBoard {
    pub fn new(host: &str) -> Self {
        let mut devices: Vec<String> = vec![
            ACC_COUNT_REGISTER,
            "o_fft_of",
            "o_adc_clip",
            "acc_len",
            "fft_shift",
            "quant_xx_gain",
            "quant_yy_gain",
            "quant_xy_gain",
            "mux_sel",
            "sys_clk",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        for pol in ["xx", "yy", "re", "im"] {
            for i in 0..2 {
                devices.push(format!("snap_{}{}_bram", pol, i));
            }
        }
        Self {
            host: host.to_string(),
            registers: HashMap::new(),
            devices,
            started: Instant::now(),
            failing: false,
        }
    }

    /// A dummy board whose every operation reports the board unavailable.
    pub fn failing(host: &str) -> Self {
        let mut board = Self::new(host);
        board.failing = true;
        board
    }

    fn check(&self) -> Result<(), BoardError> {
        if self.failing {
            Err(BoardError::unavailable(&self.host, "dummy board marked down"))
        } else {
            Ok(())
        }
    }

    /// Fake bandpass: two low-power edges, a high-power centre, noise and a
    /// random spike.
    fn random_bandpass(&self, nchans: usize) -> Vec<u32> {
        let mut rng = rand::thread_rng();
        let edge = nchans / 8;
        let mut bp: Vec<u32> = (0..nchans)
            .map(|c| {
                let floor = if c < edge || c >= nchans - edge {
                    100
                } else {
                    100_000
                };
                floor + rng.gen_range(0..100)
            })
            .collect();
        let spike: u32 = rng.gen_range(0..1_000_000);
        let spike_bin = rng.gen_range(edge..nchans - edge);
        for bin in spike_bin.saturating_sub(2)..(spike_bin + 2).min(nchans) {
            bp[bin] += spike;
        }
        bp
    }
}

impl BoardClient for DummyBoard {
    fn host(&self) -> &str {
        &self.host
    }

    fn probe(&mut self) -> bool {
        !self.failing
    }

    fn read_int(&mut self, name: &str) -> Result<u32, BoardError> {
        self.check()?;
        if name == ACC_COUNT_REGISTER {
            let acc = (self.started.elapsed().as_secs_f64() / DUMMY_ACC_PERIOD) as u32;
            return Ok(acc);
        }
        Ok(self.registers.get(name).copied().unwrap_or(0))
    }

    fn read_block(&mut self, _name: &str, nbytes: usize) -> Result<Vec<u8>, BoardError> {
        self.check()?;
        let bandpass = self.random_bandpass(nbytes / 4);
        let mut out = vec![0u8; bandpass.len() * 4];
        for (i, w) in bandpass.iter().enumerate() {
            BigEndian::write_u32(&mut out[i * 4..i * 4 + 4], *w);
        }
        Ok(out)
    }

    fn write_int(&mut self, name: &str, value: u32) -> Result<(), BoardError> {
        self.check()?;
        self.registers.insert(name.to_string(), value);
        Ok(())
    }

    fn list_devices(&mut self) -> Result<Vec<String>, BoardError> {
        self.check()?;
        Ok(self.devices.clone())
    }

    fn program(&mut self, _firmware: &str) -> Result<(), BoardError> {
        self.check()?;
        Ok(())
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandpass_has_edges_and_centre() {
        let board = DummyBoard::new("dummy1");
        let bp = board.random_bandpass(1024);
        assert_eq!(bp.len(), 1024);
        assert!(bp[0] < 1000);
        assert!(bp[1023] < 1000);
        assert!(bp[512] >= 100_000);
    }

    #[test]
    fn registers_read_back_after_write() {
        let mut board = DummyBoard::new("dummy1");
        board.write_int("fft_shift", 0xffff).unwrap();
        assert_eq!(board.read_int("fft_shift").unwrap(), 0xffff);
        assert_eq!(board.read_int("never_written").unwrap(), 0);
    }

    #[test]
    fn failing_board_reports_unavailable() {
        let mut board = DummyBoard::failing("dummy2");
        assert!(!board.probe());
        assert!(matches!(
            board.read_int(ACC_COUNT_REGISTER),
            Err(BoardError::Unavailable { .. })
        ));
        assert!(matches!(
            board.read_block("snap_xx0_bram", 64),
            Err(BoardError::Unavailable { .. })
        ));
    }
}
