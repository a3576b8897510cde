//! Best-effort UDP fan-out of preview spectra to the GUI plotter.
//!
//! Frames queue in a bounded ring that drops the oldest entry under
//! pressure; the producer never blocks. One datagram per message, UTF-8
//! JSON.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{error, info, warn};

use hipsr_types::{BeamId, PreviewFrame};

/// Ring capacity: ten integrations' worth of the full 13-beam fleet.
const RING_CAPACITY: usize = 13 * 10;

/// Pause between datagrams so a burst of 13 frames does not swamp the GUI.
const SEND_PACING: Duration = Duration::from_millis(10);

/// Back-off after a failed send before the backlog is discarded.
const SEND_FAILURE_BACKOFF: Duration = Duration::from_secs(2);

pub(crate) struct PreviewRing {
    capacity: usize,
    inner: Mutex<VecDeque<String>>,
    available: Condvar,
}

impl PreviewRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append a message, displacing the oldest one when full.
    fn push(&self, msg: String) {
        let mut queue = self.inner.lock();
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(msg);
        self.available.notify_one();
    }

    /// Pop the oldest message, waiting up to `timeout` for one to arrive.
    pub(crate) fn pop_wait(&self, timeout: Duration) -> Option<String> {
        let mut queue = self.inner.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }

    fn clear(&self) -> usize {
        let mut queue = self.inner.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[derive(Serialize)]
struct FramePayload<'a> {
    xx: &'a [u32],
    yy: &'a [u32],
    timestamp: f64,
}

fn frame_message(beam: &BeamId, frame: &PreviewFrame) -> String {
    let payload = FramePayload {
        xx: &frame.xx,
        yy: &frame.yy,
        timestamp: frame.timestamp,
    };
    let mut map = serde_json::Map::new();
    map.insert(
        beam.to_string(),
        serde_json::to_value(payload).expect("frame payload is always serialisable"),
    );
    serde_json::Value::Object(map).to_string()
}

fn cmd_message(cmd: &str, val: &str) -> String {
    let mut map = serde_json::Map::new();
    map.insert(cmd.to_string(), serde_json::Value::String(val.to_string()));
    serde_json::Value::Object(map).to_string()
}

/// Producer-side handle. Cheap to clone; never blocks.
#[derive(Clone)]
pub(crate) struct PreviewSender {
    pub(crate) ring: Arc<PreviewRing>,
}

impl PreviewSender {
    /// Queue one spectrum frame: `{"beam_NN": {"xx": [...], "yy": [...],
    /// "timestamp": t}}`.
    pub(crate) fn publish_frame(&self, beam: &BeamId, frame: &PreviewFrame) {
        self.ring.push(frame_message(beam, frame));
    }

    /// Queue a one-shot setup notification: `{"tcs-frequency": "1420"}`.
    pub(crate) fn publish_cmd(&self, cmd: &str, val: &str) {
        self.ring.push(cmd_message(cmd, val));
    }
}

pub(crate) struct PreviewPublisher {
    shutdown: Arc<AtomicBool>,
    ring: Arc<PreviewRing>,
    handle: std::thread::JoinHandle<()>,
}

impl PreviewPublisher {
    /// Spawn the publisher thread sending to `host:port`.
    pub(crate) fn spawn(host: &str, port: u16) -> std::io::Result<(PreviewSender, Self)> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;
        info!("preview: serving UDP packets to {}:{}", host, port);

        let ring = Arc::new(PreviewRing::new(RING_CAPACITY));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_ring = ring.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("preview-publisher".to_string())
            .spawn(move || publisher_main(socket, thread_ring, thread_shutdown))
            .expect("spawn preview publisher");

        let sender = PreviewSender { ring: ring.clone() };
        Ok((
            sender,
            Self {
                shutdown,
                ring,
                handle,
            },
        ))
    }

    pub(crate) fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.ring.clear();
        self.ring.available.notify_one();
        if self.handle.join().is_err() {
            warn!("preview publisher panicked during shutdown");
        }
    }
}

fn publisher_main(socket: UdpSocket, ring: Arc<PreviewRing>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        let msg = match ring.pop_wait(Duration::from_millis(100)) {
            Some(msg) => msg,
            None => continue,
        };
        match socket.send(msg.as_bytes()) {
            Ok(_) => std::thread::sleep(SEND_PACING),
            Err(err) => match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ConnectionRefused => {
                    warn!("{}: dropping preview data", err.kind());
                }
                _ => {
                    error!("preview send failed: {}; discarding backlog", err);
                    std::thread::sleep(SEND_FAILURE_BACKOFF);
                    let dropped = ring.clear();
                    if dropped > 0 {
                        warn!("preview: discarded {} queued frames", dropped);
                    }
                }
            },
        }
    }
}
