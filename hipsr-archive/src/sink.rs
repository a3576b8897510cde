//! On-disk form of the archive: a directory of typed tables.
//!
//! Scalar tables (`observation`, `pointing`, `scan_pointing`,
//! `firmware_config`, `weather`) carry an explicit header row. Raw beam
//! tables live under `raw_data/` with one table per beam and no header; the
//! four spectrum arrays are flattened into columns.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::info;

use hipsr_types::{BeamId, FirmwareConfigRow, FlavourDescriptor, NUM_BEAMS};

use crate::{Record, SinkError};

/// Table names within one archive directory.
pub mod table {
    pub const OBSERVATION: &str = "observation";
    pub const POINTING: &str = "pointing";
    pub const SCAN_POINTING: &str = "scan_pointing";
    pub const FIRMWARE_CONFIG: &str = "firmware_config";
    pub const WEATHER: &str = "weather";
    pub const RAW_DATA: &str = "raw_data";
}

/// Storage behind the archive writer. Implementations own the open store
/// exclusively; appends are strict row appends.
pub trait RecordSink: Send {
    /// Create a fresh store and write the single firmware row. Closes any
    /// store that is still open.
    fn open_new(
        &mut self,
        dir: &Path,
        name: &str,
        flavour: &FlavourDescriptor,
        firmware: &FirmwareConfigRow,
    ) -> Result<(), SinkError>;

    /// Append one row, durably at the table level before returning.
    fn append(&mut self, record: &Record) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;

    /// Flush and release. Subsequent appends fail with [`SinkError::Closed`].
    fn close(&mut self) -> Result<(), SinkError>;

    fn is_open(&self) -> bool;
}

type TableWriter = csv::Writer<File>;

struct OpenTables {
    dir: PathBuf,
    observation: TableWriter,
    pointing: TableWriter,
    scan_pointing: TableWriter,
    firmware_config: TableWriter,
    // reserved table; no producer writes weather rows
    weather: TableWriter,
    raw: BTreeMap<BeamId, TableWriter>,
}

/// CSV-table implementation of [`RecordSink`].
#[derive(Default)]
pub struct CsvTableSink {
    open: Option<OpenTables>,
}

impl CsvTableSink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn observation_header() -> Vec<&'static str> {
    vec![
        "telescope",
        "receiver",
        "frequency",
        "bandwidth",
        "project_id",
        "num_beams",
        "ref_beam",
        "feed_rotation",
        "feed_angle",
        "acc_len",
        "dwell_time",
        "observer",
        "obs_mode",
        "scan_rate",
        "date",
    ]
}

fn pointing_header() -> Vec<&'static str> {
    vec!["timestamp", "source", "ra", "dec"]
}

fn scan_pointing_header() -> Vec<String> {
    let mut cols: Vec<String> = [
        "timestamp",
        "azimuth",
        "elevation",
        "par_angle",
        "focus_tan",
        "focus_axi",
        "focus_rot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for n in 1..=NUM_BEAMS {
        cols.push(format!("mb{:02}_raj", n));
    }
    for n in 1..=NUM_BEAMS {
        cols.push(format!("mb{:02}_dcj", n));
    }
    cols
}

fn firmware_header() -> Vec<&'static str> {
    vec![
        "firmware",
        "acc_len",
        "fft_shift",
        "quant_xx_gain",
        "quant_yy_gain",
        "quant_xy_gain",
        "mux_sel",
    ]
}

fn weather_header() -> Vec<&'static str> {
    vec![
        "timestamp",
        "temperature",
        "pressure",
        "humidity",
        "wind_speed",
        "wind_direction",
    ]
}

fn new_table<I, S>(path: PathBuf, header: I) -> Result<TableWriter, SinkError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let fd = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(fd);
    wtr.write_record(header)?;
    wtr.flush()?;
    Ok(wtr)
}

/// Headerless table; the row width is flavour dependent.
fn new_raw_table(path: PathBuf) -> Result<TableWriter, SinkError> {
    let fd = File::create(path)?;
    Ok(csv::WriterBuilder::new().has_headers(false).from_writer(fd))
}

impl RecordSink for CsvTableSink {
    fn open_new(
        &mut self,
        dir: &Path,
        name: &str,
        _flavour: &FlavourDescriptor,
        firmware: &FirmwareConfigRow,
    ) -> Result<(), SinkError> {
        self.close()?;

        let root = dir.join(name);
        std::fs::create_dir_all(root.join(table::RAW_DATA))?;
        info!("created archive {}", root.display());

        let mut firmware_config = new_table(
            root.join(format!("{}.csv", table::FIRMWARE_CONFIG)),
            firmware_header(),
        )?;
        firmware_config.serialize(firmware)?;
        firmware_config.flush()?;

        self.open = Some(OpenTables {
            observation: new_table(
                root.join(format!("{}.csv", table::OBSERVATION)),
                observation_header(),
            )?,
            pointing: new_table(
                root.join(format!("{}.csv", table::POINTING)),
                pointing_header(),
            )?,
            scan_pointing: new_table(
                root.join(format!("{}.csv", table::SCAN_POINTING)),
                scan_pointing_header(),
            )?,
            firmware_config,
            weather: new_table(root.join(format!("{}.csv", table::WEATHER)), weather_header())?,
            raw: BTreeMap::new(),
            dir: root,
        });
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<(), SinkError> {
        let tables = self.open.as_mut().ok_or(SinkError::Closed)?;
        match record {
            Record::Observation(row) => {
                tables.observation.serialize(row)?;
                tables.observation.flush()?;
            }
            Record::Pointing(row) => {
                tables.pointing.serialize(row)?;
                tables.pointing.flush()?;
            }
            Record::ScanPointing(row) => {
                tables.scan_pointing.serialize(row)?;
                tables.scan_pointing.flush()?;
            }
            Record::RawBeam { beam, spectrum } => {
                use std::collections::btree_map::Entry;
                let wtr = match tables.raw.entry(beam.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let path = tables
                            .dir
                            .join(table::RAW_DATA)
                            .join(format!("{}.csv", beam));
                        entry.insert(new_raw_table(path)?)
                    }
                };
                wtr.serialize(spectrum)?;
                wtr.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(tables) = self.open.as_mut() {
            tables.observation.flush()?;
            tables.pointing.flush()?;
            tables.scan_pointing.flush()?;
            tables.firmware_config.flush()?;
            tables.weather.flush()?;
            for wtr in tables.raw.values_mut() {
                wtr.flush()?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        if let Some(tables) = self.open.take() {
            // dropping the writers closes the files
            info!("closed archive {}", tables.dir.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}
