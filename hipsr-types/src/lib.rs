//! Data carriers shared between the HIPSR server components.
//!
//! Everything here is a plain value type: construction, copy-snapshot and
//! serde serialisation only. Mutation happens in the components that own the
//! state; everyone else works on snapshots.

use serde::{Deserialize, Serialize};

pub mod coords;
pub mod timestamp;

/// Number of feeds on the Parkes multibeam receiver.
pub const NUM_BEAMS: usize = 13;

/// Length of the down-sampled preview spectra sent to the GUI.
pub const PREVIEW_BINS: usize = 256;

/// Register holding the monotonic accumulation counter on every board.
pub const ACC_COUNT_REGISTER: &str = "o_acc_cnt";

/// Identifier of one beam, e.g. `beam_01`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeamId(String);

impl BeamId {
    pub fn new(s: String) -> Self {
        BeamId(s)
    }

    /// Beam id from a 1-based feed number (`1` -> `beam_01`).
    pub fn from_feed_number(n: usize) -> Self {
        BeamId(format!("beam_{:02}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one signal-processing board: its hostname.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoardId(String);

impl BoardId {
    pub fn new(s: String) -> Self {
        BoardId(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BoardId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// One accumulated spectrum read from one board.
///
/// All four arrays share the flavour-dependent channel count. `timestamp` is
/// the capture-tick time, not the time the individual board read finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSpectrum {
    /// Accumulator count at the capture tick.
    pub id: u64,
    pub timestamp: f64,
    pub xx: Vec<u32>,
    pub yy: Vec<u32>,
    pub re_xy: Vec<u32>,
    pub im_xy: Vec<u32>,
    pub fft_of: u32,
    pub adc_clip: u32,
}

impl BeamSpectrum {
    /// Channel count of this spectrum.
    pub fn num_channels(&self) -> usize {
        self.xx.len()
    }
}

/// Down-sampled spectrum for the GUI. Lossy with respect to [`BeamSpectrum`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewFrame {
    pub xx: Vec<u32>,
    pub yy: Vec<u32>,
    pub timestamp: f64,
}

/// Command to read all boards once for a new integration.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureTick {
    /// Time the supervisor observed the accumulator advance.
    pub timestamp: f64,
    /// Accumulator count that triggered this tick.
    pub acc_count: u64,
    pub flavour: FlavourDescriptor,
}

/// Observation metadata, latched into the archive at `start`.
///
/// TCS-supplied values are kept verbatim as strings; only `date` is a
/// timestamp assigned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSetup {
    pub telescope: String,
    pub receiver: String,
    pub frequency: String,
    pub bandwidth: String,
    pub project_id: String,
    pub num_beams: String,
    pub ref_beam: String,
    pub feed_rotation: String,
    pub feed_angle: String,
    pub acc_len: String,
    pub dwell_time: String,
    pub observer: String,
    pub obs_mode: String,
    pub scan_rate: String,
    pub date: f64,
}

impl Default for ObservationSetup {
    fn default() -> Self {
        Self {
            telescope: "Parkes 64m".to_string(),
            receiver: "Parkes multibeam".to_string(),
            frequency: String::new(),
            bandwidth: String::new(),
            project_id: "P".to_string(),
            num_beams: String::new(),
            ref_beam: String::new(),
            feed_rotation: String::new(),
            feed_angle: String::new(),
            acc_len: String::new(),
            dwell_time: String::new(),
            observer: "D Fault".to_string(),
            obs_mode: String::new(),
            scan_rate: String::new(),
            date: 0.0,
        }
    }
}

/// Source position fix, one per observation start.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointingFix {
    pub timestamp: f64,
    pub source: String,
    /// Right ascension in decimal degrees.
    pub ra: f64,
    /// Declination in decimal degrees.
    pub dec: f64,
}

/// Telescope drive state, updated continuously by TCS during a scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanPointing {
    pub timestamp: f64,
    pub azimuth: f64,
    pub elevation: f64,
    pub par_angle: f64,
    pub focus_tan: f64,
    pub focus_axi: f64,
    pub focus_rot: f64,
    pub mb_raj: [f64; NUM_BEAMS],
    pub mb_dcj: [f64; NUM_BEAMS],
}

/// Firmware settings row, written exactly once per archive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareConfigRow {
    pub firmware: String,
    pub acc_len: u32,
    pub fft_shift: u32,
    pub quant_xx_gain: u32,
    pub quant_yy_gain: u32,
    pub quant_xy_gain: u32,
    pub mux_sel: u32,
}

/// Register and memory layout of one firmware flavour.
///
/// Polarisations stored across two BRAMs hold even channels in the first and
/// odd channels in the second; the codec interleaves them back into frequency
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlavourDescriptor {
    /// Flavour name, e.g. `hipsr_400_8192`.
    pub name: String,
    /// Firmware image programmed onto the boards.
    pub firmware: String,
    /// Channel count of every spectrum array.
    pub num_channels: usize,
    pub xx_brams: Vec<String>,
    pub yy_brams: Vec<String>,
    pub re_xy_brams: Vec<String>,
    pub im_xy_brams: Vec<String>,
    pub fft_of_register: String,
    pub adc_clip_register: String,
}

impl FlavourDescriptor {
    /// Bytes to read from each BRAM of a polarisation split over `n` BRAMs.
    pub fn bram_nbytes(&self, n: usize) -> usize {
        self.num_channels / n * 4
    }

    /// Registers and BRAMs that must exist on a board running this flavour.
    pub fn required_devices(&self) -> Vec<&str> {
        let mut devs: Vec<&str> = vec![
            ACC_COUNT_REGISTER,
            &self.fft_of_register,
            &self.adc_clip_register,
        ];
        for brams in [
            &self.xx_brams,
            &self.yy_brams,
            &self.re_xy_brams,
            &self.im_xy_brams,
        ] {
            devs.extend(brams.iter().map(|b| b.as_str()));
        }
        devs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beam_id_from_feed_number() {
        assert_eq!(BeamId::from_feed_number(1).as_str(), "beam_01");
        assert_eq!(BeamId::from_feed_number(13).as_str(), "beam_13");
    }

    #[test]
    fn observation_defaults_name_the_telescope() {
        let obs = ObservationSetup::default();
        assert_eq!(obs.telescope, "Parkes 64m");
        assert_eq!(obs.receiver, "Parkes multibeam");
    }

    #[test]
    fn required_devices_cover_all_brams() {
        let desc = FlavourDescriptor {
            name: "test".into(),
            firmware: "test.bof".into(),
            num_channels: 8192,
            xx_brams: vec!["snap_xx0_bram".into(), "snap_xx1_bram".into()],
            yy_brams: vec!["snap_yy0_bram".into(), "snap_yy1_bram".into()],
            re_xy_brams: vec!["snap_re_bram".into()],
            im_xy_brams: vec!["snap_im_bram".into()],
            fft_of_register: "o_fft_of".into(),
            adc_clip_register: "o_adc_clip".into(),
        };
        let devs = desc.required_devices();
        assert!(devs.contains(&ACC_COUNT_REGISTER));
        assert!(devs.contains(&"snap_xx1_bram"));
        assert!(devs.contains(&"snap_im_bram"));
        assert_eq!(desc.bram_nbytes(2), 8192 / 2 * 4);
    }
}
