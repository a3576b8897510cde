//! The observation archive: typed row records, the [`RecordSink`] storage
//! abstraction and the single-consumer writer that serialises every append.
//!
//! Producers never touch the store directly; all operations go through the
//! writer's queue. Raw spectra are sacrificed under backpressure, everything
//! else blocks the producer until enqueued.

use hipsr_types::{
    BeamId, BeamSpectrum, FirmwareConfigRow, FlavourDescriptor, ObservationSetup, PointingFix,
    ScanPointing,
};

mod sink;
mod writer;

pub use sink::{table, CsvTableSink, RecordSink};
pub use writer::{spawn_writer, ArchiveHandle, ArchiveWriterConfig};

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("archive is closed")]
    Closed,
    #[error("archive writer is gone")]
    Disconnected,
}

/// One appendable archive row. Everything here is gated by the write-enable
/// flag; the firmware row is written at file creation and bypasses the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Observation(ObservationSetup),
    Pointing(PointingFix),
    ScanPointing(ScanPointing),
    RawBeam {
        beam: BeamId,
        spectrum: BeamSpectrum,
    },
}

/// Commands consumed by the writer.
#[derive(Debug)]
pub enum ArchiveCmd {
    /// Close the current store (if any) and create a fresh one.
    OpenNew {
        /// Basename requested by TCS `new_file`, else derived from project
        /// id and time.
        basename: Option<String>,
        project_id: String,
    },
    Append(Record),
    SetWriteEnabled(bool),
    /// Roll to a new store for a different firmware flavour.
    ChangeFlavour {
        descriptor: FlavourDescriptor,
        firmware: FirmwareConfigRow,
    },
    /// Flush, close and stop the writer. Safe to send more than once.
    SafeExit,
}
