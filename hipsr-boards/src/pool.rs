//! Fan one capture per integration out across the board fleet.
//!
//! Each board is owned by exactly one worker thread. Workers receive
//! commands over a per-board channel and report everything on a shared
//! event channel; a failure on one board never touches its siblings.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use hipsr_types::{BeamId, BeamSpectrum, BoardId, CaptureTick, FlavourDescriptor};

use crate::client::{BoardClient, BoardError};
use crate::codec;

/// Divisor of the per-board read stagger: worker `i` waits `i / JITTER_DIVISOR`
/// seconds before touching its board, spreading the fleet over roughly one
/// accumulator period instead of bursting all transports at once.
const JITTER_DIVISOR: f64 = 8.0;

/// A previous capture has not drained yet; the tick was not queued.
#[derive(thiserror::Error, Debug)]
#[error("capture already in flight on {outstanding} board(s)")]
pub struct CaptureBusy {
    pub outstanding: usize,
}

/// Everything the pool reports back to its owner.
#[derive(Debug)]
pub enum PoolEvent {
    Spectrum {
        beam: BeamId,
        spectrum: BeamSpectrum,
    },
    BoardFailed {
        beam: BeamId,
        board: BoardId,
        error: BoardError,
    },
    Configured {
        beam: BeamId,
    },
    /// Reply to [`BoardPool::poll_reference`].
    Accumulator {
        count: u64,
    },
    /// The reference board could not service an accumulator poll.
    ReferenceUnavailable,
}

/// Flavour (re)configuration applied by every worker.
#[derive(Debug, Clone)]
pub struct ConfigureCmd {
    pub descriptor: FlavourDescriptor,
    /// Register writes in order, precomputed from the flavour config.
    pub register_writes: Vec<(String, u32)>,
    /// Whether to program the firmware image before configuring.
    pub program: bool,
}

enum WorkerMsg {
    Capture(CaptureTick),
    Configure(Box<ConfigureCmd>),
    ReadAccumulator,
}

pub struct PoolMember {
    pub board: BoardId,
    pub beam: BeamId,
    pub client: Box<dyn BoardClient>,
}

struct Worker {
    beam: BeamId,
    tx: Sender<WorkerMsg>,
    handle: std::thread::JoinHandle<()>,
}

pub struct BoardPool {
    workers: Vec<Worker>,
    events_rx: Receiver<PoolEvent>,
    outstanding: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl BoardPool {
    /// Spawn one worker thread per member. The first member is the reference
    /// board answering [`poll_reference`](Self::poll_reference).
    pub fn new(members: Vec<PoolMember>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = members
            .into_iter()
            .enumerate()
            .map(|(index, member)| {
                let (tx, rx) = crossbeam_channel::unbounded();
                let ctx = WorkerContext {
                    beam: member.beam.clone(),
                    board: member.board,
                    index,
                    events: events_tx.clone(),
                    outstanding: outstanding.clone(),
                    shutdown: shutdown.clone(),
                };
                let client = member.client;
                let handle = std::thread::Builder::new()
                    .name(format!("board-{}", member.beam))
                    .spawn(move || worker_main(client, rx, ctx))
                    .expect("spawn board worker");
                Worker {
                    beam: member.beam,
                    tx,
                    handle,
                }
            })
            .collect();

        Self {
            workers,
            events_rx,
            outstanding,
            shutdown,
        }
    }

    pub fn beams(&self) -> Vec<BeamId> {
        self.workers.iter().map(|w| w.beam.clone()).collect()
    }

    /// Results and accumulator replies, drained by the owner.
    pub fn events(&self) -> &Receiver<PoolEvent> {
        &self.events_rx
    }

    /// True while any board from the previous capture has not reported.
    pub fn busy(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }

    /// Submit one capture tick to every board. Non-blocking; results arrive
    /// on [`events`](Self::events). Refused while the previous capture is
    /// still in flight.
    pub fn capture(&self, tick: CaptureTick) -> Result<(), CaptureBusy> {
        let outstanding = self.outstanding.load(Ordering::SeqCst);
        if outstanding > 0 {
            return Err(CaptureBusy { outstanding });
        }
        for worker in &self.workers {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            if worker.tx.send(WorkerMsg::Capture(tick.clone())).is_err() {
                // worker gone; its results will never arrive
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Ask the reference board for its accumulator count. The reply arrives
    /// as [`PoolEvent::Accumulator`] or [`PoolEvent::ReferenceUnavailable`].
    pub fn poll_reference(&self) -> bool {
        match self.workers.first() {
            Some(w) => w.tx.send(WorkerMsg::ReadAccumulator).is_ok(),
            None => false,
        }
    }

    /// Apply a flavour to every board. Per-board completion is reported as
    /// [`PoolEvent::Configured`] or [`PoolEvent::BoardFailed`].
    pub fn configure(&self, cmd: ConfigureCmd) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMsg::Configure(Box::new(cmd.clone())));
        }
    }

    /// Abort pending reads and join all workers.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            // dropping the sender wakes the worker out of recv()
            drop(worker.tx);
            handles.push(worker.handle);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("board worker panicked during shutdown");
            }
        }
        info!("board pool stopped");
    }
}

struct WorkerContext {
    beam: BeamId,
    board: BoardId,
    index: usize,
    events: Sender<PoolEvent>,
    outstanding: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    fn aborted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep the deterministic per-board stagger, waking early on shutdown.
    fn stagger(&self) {
        let mut remaining = self.index as f64 / JITTER_DIVISOR;
        while remaining > 0.0 && !self.aborted() {
            let slice = remaining.min(0.1);
            std::thread::sleep(Duration::from_secs_f64(slice));
            remaining -= slice;
        }
    }
}

fn worker_main(mut client: Box<dyn BoardClient>, rx: Receiver<WorkerMsg>, ctx: WorkerContext) {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => break, // pool dropped; shut down
        };
        match msg {
            WorkerMsg::Capture(tick) => {
                let result = capture_one(&mut *client, &tick, &ctx);
                // decrement before reporting so a drained event channel
                // implies the pool is idle again
                ctx.outstanding.fetch_sub(1, Ordering::SeqCst);
                let event = match result {
                    Ok(spectrum) => PoolEvent::Spectrum {
                        beam: ctx.beam.clone(),
                        spectrum,
                    },
                    Err(error) => PoolEvent::BoardFailed {
                        beam: ctx.beam.clone(),
                        board: ctx.board.clone(),
                        error,
                    },
                };
                if ctx.events.send(event).is_err() {
                    break;
                }
            }
            WorkerMsg::Configure(cmd) => {
                let event = match configure_one(&mut *client, &cmd) {
                    Ok(()) => PoolEvent::Configured {
                        beam: ctx.beam.clone(),
                    },
                    Err(error) => PoolEvent::BoardFailed {
                        beam: ctx.beam.clone(),
                        board: ctx.board.clone(),
                        error,
                    },
                };
                if ctx.events.send(event).is_err() {
                    break;
                }
            }
            WorkerMsg::ReadAccumulator => {
                let event = if client.probe() {
                    match client.accumulator_count() {
                        Ok(count) => PoolEvent::Accumulator { count },
                        Err(e) => {
                            debug!("reference accumulator read failed: {}", e);
                            PoolEvent::ReferenceUnavailable
                        }
                    }
                } else {
                    PoolEvent::ReferenceUnavailable
                };
                if ctx.events.send(event).is_err() {
                    break;
                }
            }
        }
        if ctx.aborted() {
            break;
        }
    }
    client.stop();
}

fn capture_one(
    client: &mut dyn BoardClient,
    tick: &CaptureTick,
    ctx: &WorkerContext,
) -> Result<BeamSpectrum, BoardError> {
    ctx.stagger();
    if ctx.aborted() {
        return Err(BoardError::Aborted {
            host: client.host().to_string(),
        });
    }
    if !client.probe() {
        return Err(BoardError::unavailable(client.host(), "probe failed"));
    }

    let desc = &tick.flavour;
    let fft_of = client.read_int(&desc.fft_of_register)?;
    let adc_clip = client.read_int(&desc.adc_clip_register)?;

    let mut read_pol = |brams: &[String]| -> Result<Vec<Vec<u8>>, BoardError> {
        let nbytes = desc.bram_nbytes(brams.len());
        brams
            .iter()
            .map(|bram| {
                if ctx.aborted() {
                    return Err(BoardError::Aborted {
                        host: client.host().to_string(),
                    });
                }
                client.read_block(bram, nbytes)
            })
            .collect()
    };

    let raw = codec::RawCapture {
        xx: read_pol(&desc.xx_brams)?,
        yy: read_pol(&desc.yy_brams)?,
        re_xy: read_pol(&desc.re_xy_brams)?,
        im_xy: read_pol(&desc.im_xy_brams)?,
        fft_of,
        adc_clip,
    };

    codec::decode(desc, raw, tick.acc_count, tick.timestamp).map_err(|source| BoardError::Codec {
        host: client.host().to_string(),
        source,
    })
}

fn configure_one(client: &mut dyn BoardClient, cmd: &ConfigureCmd) -> Result<(), BoardError> {
    let host = client.host().to_string();
    if !client.probe() {
        return Err(BoardError::unavailable(&host, "probe failed"));
    }
    if cmd.program {
        info!("programming {} with {}", host, cmd.descriptor.firmware);
        client.program(&cmd.descriptor.firmware)?;
    }
    for (name, value) in &cmd.register_writes {
        client.write_int(name, *value)?;
    }
    // post-condition: the running firmware exposes every device the flavour
    // will read
    let devices = client.list_devices()?;
    let missing: Vec<String> = cmd
        .descriptor
        .required_devices()
        .into_iter()
        .filter(|dev| !devices.iter().any(|d| d == dev))
        .map(String::from)
        .collect();
    if !missing.is_empty() {
        return Err(BoardError::MissingDevices {
            host,
            flavour: cmd.descriptor.name.clone(),
            missing,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use std::time::Instant;

    fn test_descriptor() -> FlavourDescriptor {
        FlavourDescriptor {
            name: "test_flavour".into(),
            firmware: "test.bof".into(),
            num_channels: 16,
            xx_brams: vec!["snap_xx0_bram".into(), "snap_xx1_bram".into()],
            yy_brams: vec!["snap_yy0_bram".into(), "snap_yy1_bram".into()],
            re_xy_brams: vec!["snap_re0_bram".into(), "snap_re1_bram".into()],
            im_xy_brams: vec!["snap_im0_bram".into(), "snap_im1_bram".into()],
            fft_of_register: "o_fft_of".into(),
            adc_clip_register: "o_adc_clip".into(),
        }
    }

    /// Minimal in-memory board for pool tests.
    struct MockBoard {
        host: String,
        fail: bool,
        acc: u32,
    }

    impl MockBoard {
        fn new(host: &str) -> Self {
            Self {
                host: host.to_string(),
                fail: false,
                acc: 0,
            }
        }

        fn failing(host: &str) -> Self {
            let mut b = Self::new(host);
            b.fail = true;
            b
        }
    }

    impl BoardClient for MockBoard {
        fn host(&self) -> &str {
            &self.host
        }
        fn probe(&mut self) -> bool {
            !self.fail
        }
        fn read_int(&mut self, name: &str) -> Result<u32, BoardError> {
            if self.fail {
                return Err(BoardError::unavailable(&self.host, "mock down"));
            }
            if name == hipsr_types::ACC_COUNT_REGISTER {
                self.acc += 1;
                return Ok(self.acc);
            }
            Ok(7)
        }
        fn read_block(&mut self, _name: &str, nbytes: usize) -> Result<Vec<u8>, BoardError> {
            if self.fail {
                return Err(BoardError::unavailable(&self.host, "mock down"));
            }
            let mut out = vec![0u8; nbytes];
            for w in 0..nbytes / 4 {
                BigEndian::write_u32(&mut out[w * 4..w * 4 + 4], w as u32);
            }
            Ok(out)
        }
        fn write_int(&mut self, _name: &str, _value: u32) -> Result<(), BoardError> {
            Ok(())
        }
        fn list_devices(&mut self) -> Result<Vec<String>, BoardError> {
            Ok(test_descriptor()
                .required_devices()
                .into_iter()
                .map(String::from)
                .collect())
        }
        fn program(&mut self, _firmware: &str) -> Result<(), BoardError> {
            Ok(())
        }
        fn stop(&mut self) {}
    }

    fn member(n: usize, client: Box<dyn BoardClient>) -> PoolMember {
        PoolMember {
            board: BoardId::new(format!("mock{}", n)),
            beam: BeamId::from_feed_number(n),
            client,
        }
    }

    fn tick(acc: u64) -> CaptureTick {
        CaptureTick {
            timestamp: acc as f64,
            acc_count: acc,
            flavour: test_descriptor(),
        }
    }

    fn drain_events(pool: &BoardPool, n: usize) -> Vec<PoolEvent> {
        (0..n)
            .map(|_| {
                pool.events()
                    .recv_timeout(Duration::from_secs(5))
                    .expect("capture result")
            })
            .collect()
    }

    #[test]
    fn failing_board_is_isolated() {
        let pool = BoardPool::new(vec![
            member(1, Box::new(MockBoard::new("mock1"))),
            member(2, Box::new(MockBoard::failing("mock2"))),
            member(3, Box::new(MockBoard::new("mock3"))),
        ]);

        for round in 1..=3u64 {
            pool.capture(tick(round)).unwrap();
            let events = drain_events(&pool, 3);
            let ok: Vec<&BeamId> = events
                .iter()
                .filter_map(|e| match e {
                    PoolEvent::Spectrum { beam, spectrum } => {
                        assert_eq!(spectrum.id, round);
                        assert_eq!(spectrum.num_channels(), 16);
                        Some(beam)
                    }
                    _ => None,
                })
                .collect();
            let failed: Vec<&BeamId> = events
                .iter()
                .filter_map(|e| match e {
                    PoolEvent::BoardFailed { beam, .. } => Some(beam),
                    _ => None,
                })
                .collect();
            assert_eq!(ok.len(), 2);
            assert_eq!(failed, vec![&BeamId::from_feed_number(2)]);
        }
        pool.shutdown();
    }

    #[test]
    fn capture_refused_while_in_flight() {
        let pool = BoardPool::new(vec![
            member(1, Box::new(MockBoard::new("mock1"))),
            member(2, Box::new(MockBoard::new("mock2"))),
        ]);
        pool.capture(tick(1)).unwrap();
        // the second worker staggers its read, so the pool is still busy
        assert!(matches!(pool.capture(tick(2)), Err(CaptureBusy { .. })));
        drain_events(&pool, 2);
        // all results drained; a new tick is accepted again
        pool.capture(tick(2)).unwrap();
        drain_events(&pool, 2);
        pool.shutdown();
    }

    #[test]
    fn reference_poll_reports_accumulator() {
        let pool = BoardPool::new(vec![member(1, Box::new(MockBoard::new("mock1")))]);
        assert!(pool.poll_reference());
        match pool.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            PoolEvent::Accumulator { count } => assert_eq!(count, 1),
            other => panic!("unexpected event {:?}", other),
        }
        pool.shutdown();
    }

    #[test]
    fn reference_poll_on_dead_board() {
        let pool = BoardPool::new(vec![member(1, Box::new(MockBoard::failing("mock1")))]);
        assert!(pool.poll_reference());
        match pool.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            PoolEvent::ReferenceUnavailable => {}
            other => panic!("unexpected event {:?}", other),
        }
        pool.shutdown();
    }

    #[test]
    fn configure_reports_per_board() {
        let pool = BoardPool::new(vec![
            member(1, Box::new(MockBoard::new("mock1"))),
            member(2, Box::new(MockBoard::failing("mock2"))),
        ]);
        pool.configure(ConfigureCmd {
            descriptor: test_descriptor(),
            register_writes: vec![("fft_shift".to_string(), 0xffff)],
            program: false,
        });
        let events = drain_events(&pool, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::Configured { beam } if *beam == BeamId::from_feed_number(1)
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::BoardFailed { beam, .. } if *beam == BeamId::from_feed_number(2)
        )));
        pool.shutdown();
    }

    #[test]
    fn shutdown_joins_quickly() {
        let pool = BoardPool::new(vec![
            member(1, Box::new(MockBoard::new("mock1"))),
            member(2, Box::new(MockBoard::new("mock2"))),
        ]);
        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
