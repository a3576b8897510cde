//! Single-consumer archive writer.
//!
//! One thread owns the [`RecordSink`]; everyone else holds an
//! [`ArchiveHandle`]. Priority rows (observation, pointing, scan pointing)
//! block the producer until enqueued; raw beam rows are dropped with a
//! counted warning when the queue is full so acquisition never stalls on
//! disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{error, info, warn};

use hipsr_types::timestamp;
use hipsr_types::{BeamId, BeamSpectrum, FirmwareConfigRow, FlavourDescriptor};

use crate::{ArchiveCmd, Record, RecordSink, SinkError};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct ArchiveWriterConfig {
    /// Directory that holds the dated archive directories.
    pub data_dir: PathBuf,
    pub flavour: FlavourDescriptor,
    pub firmware: FirmwareConfigRow,
    /// Queue capacity; raw rows beyond this are dropped.
    pub queue_size: usize,
}

/// Producer-side handle onto the writer. Cheap to clone.
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: Sender<ArchiveCmd>,
    is_open: Arc<AtomicBool>,
    write_enabled: Arc<AtomicBool>,
    dropped_raw: Arc<AtomicU64>,
    crashed: Arc<AtomicBool>,
}

impl ArchiveHandle {
    /// Append a raw beam row without ever blocking. On overflow the row is
    /// dropped and counted.
    pub fn append_raw(&self, beam: BeamId, spectrum: BeamSpectrum) {
        let cmd = ArchiveCmd::Append(Record::RawBeam { beam, spectrum });
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_raw.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("archive queue full; dropped raw row ({} total)", dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped_raw.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Append a priority row, blocking until enqueued.
    pub fn append(&self, record: Record) -> Result<(), SinkError> {
        self.tx
            .send(ArchiveCmd::Append(record))
            .map_err(|_| SinkError::Disconnected)
    }

    pub fn open_new(
        &self,
        basename: Option<String>,
        project_id: String,
    ) -> Result<(), SinkError> {
        self.tx
            .send(ArchiveCmd::OpenNew {
                basename,
                project_id,
            })
            .map_err(|_| SinkError::Disconnected)
    }

    pub fn set_write_enabled(&self, enabled: bool) -> Result<(), SinkError> {
        self.tx
            .send(ArchiveCmd::SetWriteEnabled(enabled))
            .map_err(|_| SinkError::Disconnected)
    }

    pub fn change_flavour(
        &self,
        descriptor: FlavourDescriptor,
        firmware: FirmwareConfigRow,
    ) -> Result<(), SinkError> {
        self.tx
            .send(ArchiveCmd::ChangeFlavour {
                descriptor,
                firmware,
            })
            .map_err(|_| SinkError::Disconnected)
    }

    /// Request flush-and-close. Never fails; callable any number of times,
    /// including after the writer has already exited.
    pub fn safe_exit(&self) {
        let _ = self.tx.send(ArchiveCmd::SafeExit);
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::SeqCst)
    }

    /// Raw rows sacrificed to backpressure so far.
    pub fn dropped_raw(&self) -> u64 {
        self.dropped_raw.load(Ordering::SeqCst)
    }

    /// True when the writer died on a storage error.
    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }
}

/// Spawn the writer thread over the given sink.
pub fn spawn_writer(
    cfg: ArchiveWriterConfig,
    sink: Box<dyn RecordSink>,
) -> (ArchiveHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(cfg.queue_size);
    let handle = ArchiveHandle {
        tx,
        is_open: Arc::new(AtomicBool::new(false)),
        write_enabled: Arc::new(AtomicBool::new(false)),
        dropped_raw: Arc::new(AtomicU64::new(0)),
        crashed: Arc::new(AtomicBool::new(false)),
    };
    let shared = handle.clone();
    let join = std::thread::Builder::new()
        .name("archive-writer".to_string())
        .spawn(move || writer_main(rx, sink, cfg, shared))
        .expect("spawn archive writer");
    (handle, join)
}

struct WriterState {
    cfg: ArchiveWriterConfig,
    sink: Box<dyn RecordSink>,
    shared: ArchiveHandle,
    /// Project id of the most recent open; reused when a flavour change
    /// rolls the store.
    project_id: String,
}

fn writer_main(
    rx: Receiver<ArchiveCmd>,
    sink: Box<dyn RecordSink>,
    cfg: ArchiveWriterConfig,
    shared: ArchiveHandle,
) {
    info!("archive writer: writing below {}", cfg.data_dir.display());
    let mut state = WriterState {
        cfg,
        sink,
        shared,
        project_id: "P".to_string(),
    };

    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(ArchiveCmd::SafeExit) => break,
            Ok(cmd) => {
                if let Err(e) = state.handle(cmd) {
                    error!("archive writer crashed: {}", e);
                    state.shared.crashed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = state.sink.flush() {
                    error!("archive writer crashed in flush: {}", e);
                    state.shared.crashed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    state.safe_close();
}

impl WriterState {
    fn handle(&mut self, cmd: ArchiveCmd) -> Result<(), SinkError> {
        match cmd {
            ArchiveCmd::OpenNew {
                basename,
                project_id,
            } => {
                self.project_id = project_id;
                self.open_new(basename)
            }
            ArchiveCmd::Append(record) => {
                if self.shared.write_enabled.load(Ordering::SeqCst) {
                    match self.sink.append(&record) {
                        Ok(()) => Ok(()),
                        // rows arriving with no open store are dropped, as is
                        // anything racing a close
                        Err(SinkError::Closed) => Ok(()),
                        Err(e) => Err(e),
                    }
                } else {
                    // write gate: silently dropped
                    Ok(())
                }
            }
            ArchiveCmd::SetWriteEnabled(enabled) => {
                self.shared.write_enabled.store(enabled, Ordering::SeqCst);
                if enabled {
                    info!("archive writer: write enabled");
                } else {
                    info!("archive writer: write disabled");
                }
                Ok(())
            }
            ArchiveCmd::ChangeFlavour {
                descriptor,
                firmware,
            } => {
                self.cfg.flavour = descriptor;
                self.cfg.firmware = firmware;
                if self.sink.is_open() {
                    // one flavour per store: roll to a fresh one
                    self.open_new(None)
                } else {
                    Ok(())
                }
            }
            ArchiveCmd::SafeExit => unreachable!("handled by the writer loop"),
        }
    }

    fn open_new(&mut self, basename: Option<String>) -> Result<(), SinkError> {
        // closing disables the gate until the next start, matching the
        // lifecycle Closed -> Open[WriteDisabled]
        self.shared.write_enabled.store(false, Ordering::SeqCst);
        self.shared.is_open.store(false, Ordering::SeqCst);
        self.sink.close()?;

        let now = chrono::Utc::now();
        let dir = self
            .cfg
            .data_dir
            .join(timestamp::format_date_dir(&now));
        std::fs::create_dir_all(&dir)?;
        let stem = basename.unwrap_or_else(|| {
            format!("{}_{}", self.project_id, timestamp::format_start_utc(&now))
        });
        // never truncate an archive that is already on disk
        let mut name = stem.clone();
        let mut n = 1;
        while dir.join(&name).exists() {
            name = format!("{}_{}", stem, n);
            n += 1;
        }

        self.sink
            .open_new(&dir, &name, &self.cfg.flavour, &self.cfg.firmware)?;
        self.shared.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn safe_close(&mut self) {
        self.shared.write_enabled.store(false, Ordering::SeqCst);
        if self.sink.is_open() {
            if let Err(e) = self.sink.close() {
                error!("archive writer: close failed: {}", e);
            }
        }
        self.shared.is_open.store(false, Ordering::SeqCst);
        info!("archive writer: exiting");
    }
}
