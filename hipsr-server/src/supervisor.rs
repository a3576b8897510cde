//! The supervisor: wires every component together, watches the reference
//! accumulator for new integrations, fans captures out to the board pool and
//! drains its results into the archive and the preview publisher. It is the
//! only place where subsystem health is evaluated and shutdown is
//! orchestrated; the archive is flushed and closed on every exit path.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use hipsr_archive::{spawn_writer, ArchiveWriterConfig, CsvTableSink};
use hipsr_boards::{codec, BoardPool, ConfigureCmd, DummyBoard, PoolEvent, PoolMember};
use hipsr_config::{FpgaConfig, ServerConfig};
use hipsr_types::{timestamp, CaptureTick};

use crate::preview::PreviewPublisher;
use crate::tcs::ControlServer;
use crate::Cli;

/// Events from the control server (and signal handler) to the supervisor.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    WriteEnable(bool),
    Kill,
    FlavourChange(String),
    RaUpdate(f64),
    DecUpdate(f64),
    Crash { component: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Crashed,
}

const POLL_PERIOD: Duration = Duration::from_millis(500);
const ARCHIVE_QUEUE_SIZE: usize = 256;

/// Components get this long to wind down before the process is forced out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Strictly-increasing transition detection on the reference accumulator.
///
/// The first observation only latches the baseline. `advanced` does not move
/// the baseline; the caller commits once the capture was actually dispatched,
/// so a refused (late) tick re-fires on the next poll.
struct TickDetector {
    prev: Option<u64>,
}

impl TickDetector {
    fn new() -> Self {
        Self { prev: None }
    }

    fn advanced(&mut self, count: u64) -> bool {
        match self.prev {
            None => {
                self.prev = Some(count);
                false
            }
            Some(prev) => count > prev,
        }
    }

    fn commit(&mut self, count: u64) {
        self.prev = Some(count);
    }

    fn last(&self) -> u64 {
        self.prev.unwrap_or(0)
    }
}

fn make_members(cfg: &ServerConfig, dummy: bool) -> anyhow::Result<Vec<PoolMember>> {
    if !dummy {
        anyhow::bail!(
            "no board transport backend is available in this build; \
             run with --dummy for synthetic boards"
        );
    }
    warn!("DUMMY MODE: synthetic boards, no real data will be taken");
    Ok(cfg
        .boards
        .iter()
        .map(|entry| PoolMember {
            board: entry.board_id(),
            beam: entry.beam_id(),
            client: Box::new(DummyBoard::new(&entry.host)),
        })
        .collect())
}

fn owned_register_writes(fpga: &FpgaConfig) -> Vec<(String, u32)> {
    fpga.register_writes()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

pub async fn run(cfg: ServerConfig, args: Cli) -> anyhow::Result<ExitKind> {
    let fpga = cfg.flavour(&args.flavour)?.clone();
    let mut descriptor = fpga.descriptor(&args.flavour);
    let mut current_flavour = args.flavour.clone();

    info!("TCS host:     {}:{}", cfg.tcs_server, cfg.tcs_port);
    info!("Plotter host: {}:{}", cfg.plotter_host, cfg.plotter_port);
    info!("FPGA firmware: {}", descriptor.firmware);

    let (events_tx, events_rx) = crossbeam_channel::unbounded();

    let (archive, archive_join) = spawn_writer(
        ArchiveWriterConfig {
            data_dir: cfg.data_dir.join("data"),
            flavour: descriptor.clone(),
            firmware: fpga.firmware_row(),
            queue_size: ARCHIVE_QUEUE_SIZE,
        },
        Box::new(CsvTableSink::new()),
    );

    let (preview, preview_publisher) =
        PreviewPublisher::spawn(&cfg.plotter_host, cfg.plotter_port)
            .context("starting preview publisher")?;

    let members = make_members(&cfg, args.dummy)?;
    let pool = BoardPool::new(members);

    if args.skip {
        info!("skipping reprogramming and reconfiguration");
    } else {
        pool.configure(ConfigureCmd {
            descriptor: descriptor.clone(),
            register_writes: owned_register_writes(&fpga),
            program: true,
        });
    }

    let listener = tokio::net::TcpListener::bind((cfg.tcs_server.as_str(), cfg.tcs_port))
        .await
        .with_context(|| {
            format!(
                "binding TCS listener on {}:{} (is the port already in use?)",
                cfg.tcs_server, cfg.tcs_port
            )
        })?;
    let control = ControlServer::new(
        archive.clone(),
        preview.clone(),
        events_tx.clone(),
        cfg.flavours.keys().cloned().collect(),
        cfg.tcs_terminator.clone(),
        cfg.new_file_each_obs,
    );
    let control_join = tokio::spawn(control.serve(listener));

    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt caught, shutting down");
                let _ = events_tx.send(ControlEvent::Kill);
            }
        });
    }

    info!("starting data capture");

    let mut ticks = TickDetector::new();
    let mut acc_poll_pending = false;
    let mut missed_polls: u64 = 0;
    let mut current_ra = 0.0_f64;
    let mut current_dec = 0.0_f64;
    let mut pending_flavour: Option<String> = None;

    let exit = 'main: loop {
        // lifecycle events from the control server
        while let Ok(event) = events_rx.try_recv() {
            match event {
                ControlEvent::WriteEnable(enabled) => {
                    debug!("write enable: {}", enabled);
                }
                ControlEvent::Kill => {
                    info!("kill command received, shutting down");
                    break 'main ExitKind::Clean;
                }
                ControlEvent::Crash { component } => {
                    error!("ERROR: {} has crashed", component);
                    break 'main ExitKind::Crashed;
                }
                ControlEvent::FlavourChange(name) => {
                    if name != current_flavour {
                        pending_flavour = Some(name);
                    }
                }
                ControlEvent::RaUpdate(ra) => current_ra = ra,
                ControlEvent::DecUpdate(dec) => current_dec = dec,
            }
        }
        if archive.crashed() {
            error!("ERROR: archive has crashed");
            break ExitKind::Crashed;
        }
        if control_join.is_finished() {
            error!("ERROR: control server has stopped");
            break ExitKind::Crashed;
        }

        // capture results and accumulator replies
        while let Ok(event) = pool.events().try_recv() {
            match event {
                PoolEvent::Spectrum { beam, spectrum } => {
                    let frame = codec::preview(&spectrum);
                    preview.publish_frame(&beam, &frame);
                    archive.append_raw(beam, spectrum);
                }
                PoolEvent::BoardFailed { beam, board, error } => {
                    warn!("warning: {} ({}): {}", board, beam, error);
                }
                PoolEvent::Configured { beam } => {
                    debug!("{} configured for {}", beam, current_flavour);
                }
                PoolEvent::Accumulator { count } => {
                    acc_poll_pending = false;
                    if ticks.advanced(count) {
                        let now = Utc::now();
                        let tick = CaptureTick {
                            timestamp: timestamp::datetime_to_f64(&now),
                            acc_count: count,
                            flavour: descriptor.clone(),
                        };
                        match pool.capture(tick) {
                            Ok(()) => {
                                let gate = if archive.write_enabled() { "WE" } else { "WD" };
                                info!(
                                    "[{}] UTC: {}, RA: {:.2}, DEC: {:.2}, Acc: {}",
                                    gate,
                                    timestamp::format_status_utc(&now),
                                    current_ra,
                                    current_dec,
                                    count
                                );
                                ticks.commit(count);
                            }
                            Err(busy) => {
                                // keep the old count so this tick re-fires
                                warn!("late tick at accumulation {}: {}", count, busy);
                            }
                        }
                    }
                }
                PoolEvent::ReferenceUnavailable => {
                    acc_poll_pending = false;
                    missed_polls += 1;
                    warn!(
                        "reference board unavailable ({} missed polls); \
                         reusing accumulator {}",
                        missed_polls,
                        ticks.last()
                    );
                }
            }
        }

        // a flavour change waits for the in-flight capture to drain so no
        // capture mixes array lengths
        if pending_flavour.is_some() && !pool.busy() {
            let name = pending_flavour.take().unwrap();
            match cfg.flavour(&name) {
                Ok(new_fpga) => {
                    info!("changing flavour from {} to {}", current_flavour, name);
                    descriptor = new_fpga.descriptor(&name);
                    pool.configure(ConfigureCmd {
                        descriptor: descriptor.clone(),
                        register_writes: owned_register_writes(new_fpga),
                        program: !args.skip,
                    });
                    if archive
                        .change_flavour(descriptor.clone(), new_fpga.firmware_row())
                        .is_err()
                    {
                        error!("ERROR: archive has crashed");
                        break ExitKind::Crashed;
                    }
                    current_flavour = name;
                }
                Err(e) => warn!("flavour change rejected: {}", e),
            }
        }

        if !acc_poll_pending && pool.poll_reference() {
            acc_poll_pending = true;
        }

        tokio::time::sleep(POLL_PERIOD).await;
    };

    // Shutdown. A watchdog forces the process out if a component wedges.
    let code = match exit {
        ExitKind::Clean => 0,
        ExitKind::Crashed => 1,
    };
    std::thread::spawn(move || {
        std::thread::sleep(SHUTDOWN_GRACE);
        eprintln!("shutdown grace expired; terminating");
        std::process::exit(code);
    });

    control_join.abort();
    pool.shutdown();
    archive.safe_exit();
    if archive_join.join().is_err() {
        warn!("archive writer panicked during shutdown");
    }
    preview_publisher.shutdown();
    if archive.dropped_raw() > 0 {
        warn!("{} raw rows were dropped under backpressure", archive.dropped_raw());
    }
    info!("shutdown complete");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_fires_once_per_increasing_transition() {
        let mut det = TickDetector::new();
        let seq = [3u64, 3, 4, 4, 7, 7, 7, 9];
        let mut captures = 0;
        for count in seq {
            if det.advanced(count) {
                captures += 1;
                det.commit(count);
            }
        }
        assert_eq!(captures, 3);
        assert_eq!(det.last(), 9);
    }

    #[test]
    fn refused_tick_refires_until_committed() {
        let mut det = TickDetector::new();
        assert!(!det.advanced(5)); // baseline
        assert!(det.advanced(6));
        // not committed (pool was busy): the same count fires again
        assert!(det.advanced(6));
        det.commit(6);
        assert!(!det.advanced(6));
        assert!(det.advanced(7));
    }

    #[test]
    fn non_monotonic_counts_do_not_fire() {
        let mut det = TickDetector::new();
        det.advanced(10);
        assert!(!det.advanced(9));
        assert!(!det.advanced(10));
        assert!(det.advanced(11));
    }

    #[test]
    fn members_require_dummy_mode_without_transport() {
        let cfg = ServerConfig::default();
        assert!(make_members(&cfg, false).is_err());
        let members = make_members(&cfg, true).unwrap();
        assert_eq!(members.len(), hipsr_types::NUM_BEAMS);
        assert_eq!(members[0].beam.as_str(), "beam_01");
    }
}
