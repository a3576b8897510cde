//! Static configuration for the HIPSR server.
//!
//! The configuration is captured once at startup and read-only afterwards.
//! With no config file the [`Default`] impl describes the stock 13-beam
//! Parkes installation, so `hipsr-server --dummy` runs out of the box.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hipsr_types::{BeamId, BoardId, FirmwareConfigRow, FlavourDescriptor};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("unknown flavour {0:?}")]
    UnknownFlavour(String),
    #[error("no boards configured")]
    NoBoards,
}

type Result<T> = std::result::Result<T, ConfigError>;

fn default_tcs_server() -> String {
    "130.155.182.73".to_string()
}

fn default_tcs_port() -> u16 {
    1420
}

fn default_plotter_host() -> String {
    "127.0.0.1".to_string()
}

fn default_plotter_port() -> u16 {
    59012
}

fn default_katcp_port() -> u16 {
    7147
}

fn default_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/data/hipsr")
}

fn default_tcs_terminator() -> String {
    "\n".to_string()
}

/// Per-flavour FPGA configuration: firmware image, register layout and the
/// quantisation settings programmed at configure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FpgaConfig {
    /// Firmware image name, e.g. `hipsr_400_8192_v1.bof`.
    pub firmware: String,
    pub num_channels: usize,
    pub acc_len: u32,
    pub fft_shift: u32,
    pub quant_xx_gain: u32,
    pub quant_yy_gain: u32,
    pub quant_xy_gain: u32,
    pub mux_sel: u32,
    pub xx_brams: Vec<String>,
    pub yy_brams: Vec<String>,
    pub re_xy_brams: Vec<String>,
    pub im_xy_brams: Vec<String>,
    #[serde(default = "default_fft_of_register")]
    pub fft_of_register: String,
    #[serde(default = "default_adc_clip_register")]
    pub adc_clip_register: String,
}

fn default_fft_of_register() -> String {
    "o_fft_of".to_string()
}

fn default_adc_clip_register() -> String {
    "o_adc_clip".to_string()
}

impl FpgaConfig {
    /// Registers written when configuring a board for this flavour, in
    /// write order.
    pub fn register_writes(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("acc_len", self.acc_len),
            ("fft_shift", self.fft_shift),
            ("quant_xx_gain", self.quant_xx_gain),
            ("quant_yy_gain", self.quant_yy_gain),
            ("quant_xy_gain", self.quant_xy_gain),
            ("mux_sel", self.mux_sel),
        ]
    }

    pub fn firmware_row(&self) -> FirmwareConfigRow {
        FirmwareConfigRow {
            firmware: self.firmware.clone(),
            acc_len: self.acc_len,
            fft_shift: self.fft_shift,
            quant_xx_gain: self.quant_xx_gain,
            quant_yy_gain: self.quant_yy_gain,
            quant_xy_gain: self.quant_xy_gain,
            mux_sel: self.mux_sel,
        }
    }

    pub fn descriptor(&self, name: &str) -> FlavourDescriptor {
        FlavourDescriptor {
            name: name.to_string(),
            firmware: self.firmware.clone(),
            num_channels: self.num_channels,
            xx_brams: self.xx_brams.clone(),
            yy_brams: self.yy_brams.clone(),
            re_xy_brams: self.re_xy_brams.clone(),
            im_xy_brams: self.im_xy_brams.clone(),
            fft_of_register: self.fft_of_register.clone(),
            adc_clip_register: self.adc_clip_register.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory where archive data and logs are written. May contain shell
    /// variables such as `~`, `$A` or `${B}`.
    #[serde(default = "default_data_dir")]
    pub data_dir: std::path::PathBuf,
    #[serde(default = "default_tcs_server")]
    pub tcs_server: String,
    #[serde(default = "default_tcs_port")]
    pub tcs_port: u16,
    #[serde(default = "default_plotter_host")]
    pub plotter_host: String,
    #[serde(default = "default_plotter_port")]
    pub plotter_port: u16,
    #[serde(default = "default_katcp_port")]
    pub katcp_port: u16,
    /// Literal suffix terminating each TCS command, e.g. `"\n"` or `"\r\n"`.
    #[serde(default = "default_tcs_terminator")]
    pub tcs_terminator: String,
    /// Open a fresh archive file on every `start` instead of spanning one
    /// file over multiple observations.
    #[serde(default)]
    pub new_file_each_obs: bool,
    /// Ordered board-host to beam table. The first entry is the reference
    /// board used for integration-tick detection.
    #[serde(default = "stock_boards")]
    pub boards: Vec<BoardEntry>,
    /// Known firmware flavours by name.
    #[serde(default = "stock_flavours")]
    pub flavours: BTreeMap<String, FpgaConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardEntry {
    pub host: String,
    pub beam: String,
}

impl BoardEntry {
    pub fn board_id(&self) -> BoardId {
        BoardId::new(self.host.clone())
    }

    pub fn beam_id(&self) -> BeamId {
        BeamId::new(self.beam.clone())
    }
}

fn split_brams(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("snap_{}{}_bram", prefix, i)).collect()
}

fn stock_flavours() -> BTreeMap<String, FpgaConfig> {
    let mut flavours = BTreeMap::new();
    flavours.insert(
        "hipsr_400_8192".to_string(),
        FpgaConfig {
            firmware: "hipsr_400_8192_v1.bof".to_string(),
            num_channels: 8192,
            acc_len: 2 * 8192,
            fft_shift: 0xffff_ffff,
            quant_xx_gain: 0x4000_0000,
            quant_yy_gain: 0x4000_0000,
            quant_xy_gain: 0x4000_0000,
            mux_sel: 0,
            xx_brams: split_brams("xx", 2),
            yy_brams: split_brams("yy", 2),
            re_xy_brams: split_brams("re", 2),
            im_xy_brams: split_brams("im", 2),
            fft_of_register: default_fft_of_register(),
            adc_clip_register: default_adc_clip_register(),
        },
    );
    flavours.insert(
        "hipsr_200_16384".to_string(),
        FpgaConfig {
            firmware: "hipsr_200_16384_v1.bof".to_string(),
            num_channels: 16384,
            acc_len: 8192,
            fft_shift: 0xffff_ffff,
            quant_xx_gain: 0x2000_0000,
            quant_yy_gain: 0x2000_0000,
            quant_xy_gain: 0x2000_0000,
            mux_sel: 0,
            xx_brams: split_brams("xx", 2),
            yy_brams: split_brams("yy", 2),
            re_xy_brams: split_brams("re", 2),
            im_xy_brams: split_brams("im", 2),
            fft_of_register: default_fft_of_register(),
            adc_clip_register: default_adc_clip_register(),
        },
    );
    flavours
}

fn stock_boards() -> Vec<BoardEntry> {
    (1..=hipsr_types::NUM_BEAMS)
        .map(|n| BoardEntry {
            host: format!("hipsr{}", n),
            beam: format!("beam_{:02}", n),
        })
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tcs_server: default_tcs_server(),
            tcs_port: default_tcs_port(),
            plotter_host: default_plotter_host(),
            plotter_port: default_plotter_port(),
            katcp_port: default_katcp_port(),
            tcs_terminator: default_tcs_terminator(),
            new_file_each_obs: false,
            boards: stock_boards(),
            flavours: stock_flavours(),
        }
    }
}

impl ServerConfig {
    pub fn flavour(&self, name: &str) -> Result<&FpgaConfig> {
        self.flavours
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFlavour(name.to_string()))
    }

    /// Host of the reference board used for tick detection.
    pub fn reference_board(&self) -> Result<&BoardEntry> {
        self.boards.first().ok_or(ConfigError::NoBoards)
    }

    fn fixup_paths(&mut self) -> Result<()> {
        let pathstr = self.data_dir.to_string_lossy().to_string();
        let expanded = shellexpand::full(&pathstr)?;
        self.data_dir = std::path::PathBuf::from(expanded.to_string());
        Ok(())
    }
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: ServerConfig = toml::from_str(&contents)?;
    cfg.fixup_paths()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_complete() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.boards.len(), hipsr_types::NUM_BEAMS);
        assert_eq!(cfg.reference_board().unwrap().beam, "beam_01");
        let flavour = cfg.flavour("hipsr_400_8192").unwrap();
        assert_eq!(flavour.num_channels, 8192);
        assert_eq!(cfg.flavour("hipsr_200_16384").unwrap().num_channels, 16384);
        assert!(cfg.flavour("hipsr_800_4096").is_err());
    }

    #[test]
    fn default_config_toml_roundtrip() {
        let cfg = ServerConfig::default();
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn descriptor_matches_fpga_config() {
        let cfg = ServerConfig::default();
        let fpga = cfg.flavour("hipsr_400_8192").unwrap();
        let desc = fpga.descriptor("hipsr_400_8192");
        assert_eq!(desc.name, "hipsr_400_8192");
        assert_eq!(desc.num_channels, 8192);
        assert_eq!(desc.xx_brams, vec!["snap_xx0_bram", "snap_xx1_bram"]);
        assert_eq!(fpga.firmware_row().firmware, "hipsr_400_8192_v1.bof");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = toml::from_str::<ServerConfig>("unknown_key = 1");
        assert!(err.is_err());
    }
}
