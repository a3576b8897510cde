//! Line-based TCP endpoint for telescope control system commands.
//!
//! Each connection reads `<cmd> <value><terminator>` frames; every command
//! is acknowledged with `ok\n` except `start`, which replies with the
//! formatted start timestamp. Unknown commands are logged and still
//! acknowledged so TCS keeps flowing. The server owns all mutable
//! observation state; everything else sees snapshots via the archive queue
//! and supervisor events.

use std::sync::Arc;

use bytes::BytesMut;
use chrono::Utc;
use crossbeam_channel::Sender;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

use hipsr_archive::{ArchiveHandle, Record, SinkError};
use hipsr_types::{coords, timestamp, ObservationSetup, PointingFix, ScanPointing, NUM_BEAMS};

use crate::preview::PreviewSender;
use crate::supervisor::ControlEvent;

/// Split the byte stream on a configurable literal terminator.
pub(crate) struct TerminatorCodec {
    terminator: Vec<u8>,
}

impl TerminatorCodec {
    pub(crate) fn new(terminator: &str) -> Self {
        Self {
            terminator: terminator.as_bytes().to_vec(),
        }
    }
}

fn find_terminator(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Decoder for TerminatorCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        match find_terminator(buf, &self.terminator) {
            Some(pos) => {
                let frame = buf.split_to(pos + self.terminator.len());
                let line = String::from_utf8_lossy(&frame[..pos]).trim().to_string();
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    Ok,
    StartUtc(String),
}

impl Reply {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Ok => b"ok\n".to_vec(),
            Reply::StartUtc(stamp) => format!("start_utc {}\n", stamp).into_bytes(),
        }
    }
}

struct ControlState {
    obs_setup: ObservationSetup,
    pointing: PointingFix,
    scan_pointing: ScanPointing,
    /// Config name reported by TCS. Tracked for the operator log only; it
    /// is not part of the observation table.
    #[allow(dead_code)]
    conf_name: String,
    /// Basename requested by `new_file`, consumed at the next archive open.
    new_filename: Option<String>,
    write_enabled: bool,
}

pub(crate) struct ControlServer {
    state: Mutex<ControlState>,
    archive: ArchiveHandle,
    preview: PreviewSender,
    events: Sender<ControlEvent>,
    flavour_names: Vec<String>,
    terminator: String,
    new_file_each_obs: bool,
}

impl ControlServer {
    pub(crate) fn new(
        archive: ArchiveHandle,
        preview: PreviewSender,
        events: Sender<ControlEvent>,
        flavour_names: Vec<String>,
        terminator: String,
        new_file_each_obs: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState {
                obs_setup: ObservationSetup::default(),
                pointing: PointingFix::default(),
                scan_pointing: ScanPointing::default(),
                conf_name: String::new(),
                new_filename: None,
                write_enabled: false,
            }),
            archive,
            preview,
            events,
            flavour_names,
            terminator,
            new_file_each_obs,
        })
    }

    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("TCS listener: waiting for TCS data on {}", addr),
            Err(_) => info!("TCS listener: waiting for TCS data"),
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("TCS I/O: connection from {}", peer);
                    let server = self.clone();
                    tokio::spawn(async move {
                        handle_connection(server, stream).await;
                        debug!("TCS I/O: connection {} closed", peer);
                    });
                }
                Err(e) => {
                    error!("TCS listener failed: {}", e);
                    let _ = self.events.send(ControlEvent::Crash {
                        component: "control",
                    });
                    break;
                }
            }
        }
    }

    /// Parse and apply one command line, returning the acknowledgement.
    pub(crate) fn handle_line(&self, line: &str) -> Reply {
        let line = line.trim();
        if line.is_empty() {
            return Reply::Ok;
        }
        let (cmd, val) = match line.split_once(char::is_whitespace) {
            Some((cmd, val)) => (cmd, val.trim()),
            None => (line, ""),
        };
        self.dispatch(cmd, val)
    }

    fn dispatch(&self, cmd: &str, val: &str) -> Reply {
        let mut state = self.state.lock();
        match cmd {
            "freq" => {
                info!("{:<15}: {}", "Central freq.", val);
                state.obs_setup.frequency = val.to_string();
                self.preview.publish_cmd("tcs-frequency", val);
            }
            "band" => {
                info!("{:<15}: {}", "Bandwidth", val);
                state.obs_setup.bandwidth = val.to_string();
                self.preview.publish_cmd("tcs-bandwidth", val);
            }
            "src" => {
                info!("{:<15}: {}", "Source name", val);
                state.pointing.source = val.to_string();
            }
            "ra" => match coords::ra_to_degrees(val) {
                Ok(ra) => {
                    info!("{:<15}: {}", "Source RA", val);
                    state.pointing.ra = ra;
                }
                Err(e) => warn!("bad command: {}", e),
            },
            "dec" => match coords::dec_to_degrees(val) {
                Ok(dec) => {
                    info!("{:<15}: {}", "Source DEC", val);
                    state.pointing.dec = dec;
                }
                Err(e) => warn!("bad command: {}", e),
            },
            "receiver" => {
                info!("{:<15}: {}", "Receiver", val);
                state.obs_setup.receiver = val.to_string();
            }
            "pid" => {
                info!("{:<15}: {}", "Project ID", val);
                state.obs_setup.project_id = val.to_string();
            }
            "nbeam" => {
                info!("{:<15}: {}", "No. beams", val);
                state.obs_setup.num_beams = val.to_string();
            }
            "refbeam" => {
                info!("{:<15}: {}", "Ref. beam", val);
                state.obs_setup.ref_beam = val.to_string();
            }
            "feedrotation" => {
                info!("{:<15}: {}", "Feed rotation", val);
                state.obs_setup.feed_rotation = val.to_string();
            }
            "feedangle" => {
                info!("{:<15}: {}", "Feed angle", val);
                state.obs_setup.feed_angle = val.to_string();
            }
            "taccum" => {
                info!("{:<15}: {}", "Acc. length", val);
                state.obs_setup.acc_len = val.to_string();
            }
            "dwell" => {
                info!("{:<15}: {}", "Dwell time", val);
                state.obs_setup.dwell_time = val.to_string();
            }
            "observer" => {
                info!("{:<15}: {}", "Observer", val);
                state.obs_setup.observer = val.to_string();
            }
            "obstype" => {
                info!("{:<15}: {}", "Obs. mode", val);
                state.obs_setup.obs_mode = val.to_string();
            }
            "scanrate" => {
                info!("{:<15}: {}", "Scan rate", val);
                state.obs_setup.scan_rate = val.to_string();
            }
            "confname" => {
                info!("{:<15}: {}", "Config name", val);
                state.conf_name = val.to_string();
                if self.flavour_names.iter().any(|f| f == val) {
                    let _ = self
                        .events
                        .send(ControlEvent::FlavourChange(val.to_string()));
                }
            }
            "az" | "el" | "par" | "focustan" | "focusaxi" | "focusrot" => {
                set_scan_field(&mut state.scan_pointing, cmd, val);
            }
            "utc_cycle" => match timestamp::parse_utc_cycle(val) {
                Ok(ts) => state.scan_pointing.timestamp = ts,
                Err(e) => warn!("bad command: utc_cycle {:?}: {}", val, e),
            },
            "utc_cycle_end" => {
                if state.write_enabled {
                    let snapshot = state.scan_pointing.clone();
                    drop(state);
                    if let Err(e) = self.archive.append(Record::ScanPointing(snapshot)) {
                        self.archive_gone(e);
                    }
                    return Reply::Ok;
                }
                // write disabled: no-op
            }
            "new_file" => {
                info!("TCS I/O: new file requested: {}", val);
                state.new_filename = Some(val.to_string());
            }
            "start" => return self.start_observation(&mut state),
            "stop" => {
                info!("TCS I/O: received stop. Write disabled.");
                state.write_enabled = false;
                if let Err(e) = self.archive.set_write_enabled(false) {
                    self.archive_gone(e);
                }
                let _ = self.events.send(ControlEvent::WriteEnable(false));
            }
            "kill" => {
                info!("TCS I/O: kill signal received");
                let _ = self.events.send(ControlEvent::Kill);
            }
            mb if mb.starts_with("MB") => {
                set_beam_pointing(&mut state.scan_pointing, cmd, val, &self.events);
            }
            _ => {
                warn!("TCS command not supported: {} {}", cmd, val);
            }
        }
        Reply::Ok
    }

    fn start_observation(&self, state: &mut ControlState) -> Reply {
        let now = Utc::now();
        let ts = timestamp::datetime_to_f64(&now);
        state.obs_setup.date = ts;
        state.pointing.timestamp = ts;
        let stamp = timestamp::format_start_utc(&now);
        info!("TCS I/O: received start. starting observation: start_utc {}", stamp);

        let mut enqueue = || -> Result<(), SinkError> {
            if !self.archive.is_open() || self.new_file_each_obs {
                self.archive
                    .open_new(state.new_filename.take(), state.obs_setup.project_id.clone())?;
            }
            // gate first, then the observation rows: they must land before
            // any raw row of this observation
            self.archive.set_write_enabled(true)?;
            self.archive
                .append(Record::Observation(state.obs_setup.clone()))?;
            self.archive
                .append(Record::Pointing(state.pointing.clone()))?;
            Ok(())
        };
        if let Err(e) = enqueue() {
            self.archive_gone(e);
        }

        state.write_enabled = true;
        let _ = self.events.send(ControlEvent::WriteEnable(true));
        Reply::StartUtc(stamp)
    }

    fn archive_gone(&self, err: SinkError) {
        error!("archive writer unreachable: {}", err);
        let _ = self.events.send(ControlEvent::Crash {
            component: "archive",
        });
    }
}

fn set_scan_field(scan: &mut ScanPointing, cmd: &str, val: &str) {
    let parsed: f64 = match val.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("bad command: {} {:?} is not numeric", cmd, val);
            return;
        }
    };
    match cmd {
        "az" => scan.azimuth = parsed,
        "el" => scan.elevation = parsed,
        "par" => scan.par_angle = parsed,
        "focustan" => scan.focus_tan = parsed,
        "focusaxi" => scan.focus_axi = parsed,
        "focusrot" => scan.focus_rot = parsed,
        _ => unreachable!("dispatch only routes scan fields here"),
    }
}

/// `MB<NN>_raj` / `MB<NN>_dcj` per-beam scan coordinates. Beam 01 doubles as
/// the position shown on the supervisor status line.
fn set_beam_pointing(
    scan: &mut ScanPointing,
    cmd: &str,
    val: &str,
    events: &Sender<ControlEvent>,
) {
    let parsed = cmd
        .strip_prefix("MB")
        .and_then(|rest| rest.split_once('_'))
        .and_then(|(nn, field)| {
            let beam: usize = nn.parse().ok()?;
            if (1..=NUM_BEAMS).contains(&beam) {
                Some((beam, field))
            } else {
                None
            }
        });
    let (beam, field) = match parsed {
        Some(p) => p,
        None => {
            warn!("TCS command not supported: {} {}", cmd, val);
            return;
        }
    };
    let value: f64 = match val.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("bad command: {} {:?} is not numeric", cmd, val);
            return;
        }
    };
    match field {
        "raj" => {
            scan.mb_raj[beam - 1] = value;
            if beam == 1 {
                let _ = events.send(ControlEvent::RaUpdate(value));
            }
        }
        "dcj" => {
            scan.mb_dcj[beam - 1] = value;
            if beam == 1 {
                let _ = events.send(ControlEvent::DecUpdate(value));
            }
        }
        _ => warn!("TCS command not supported: {} {}", cmd, val),
    }
}

async fn handle_connection(server: Arc<ControlServer>, stream: TcpStream) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = FramedRead::new(rd, TerminatorCodec::new(&server.terminator));
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                debug!("TCS I/O: {:?}", line);
                let reply = server.handle_line(&line);
                if wr.write_all(&reply.into_bytes()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("TCS I/O: cannot read socket: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::PreviewRing;
    use hipsr_archive::{spawn_writer, ArchiveWriterConfig, CsvTableSink};
    use hipsr_types::{FirmwareConfigRow, FlavourDescriptor};

    fn test_flavour() -> FlavourDescriptor {
        FlavourDescriptor {
            name: "test".into(),
            firmware: "test.bof".into(),
            num_channels: 8,
            xx_brams: vec!["x0".into()],
            yy_brams: vec!["y0".into()],
            re_xy_brams: vec!["re".into()],
            im_xy_brams: vec!["im".into()],
            fft_of_register: "o_fft_of".into(),
            adc_clip_register: "o_adc_clip".into(),
        }
    }

    fn test_firmware() -> FirmwareConfigRow {
        FirmwareConfigRow {
            firmware: "test.bof".into(),
            acc_len: 1024,
            fft_shift: 0xffff,
            quant_xx_gain: 1,
            quant_yy_gain: 2,
            quant_xy_gain: 3,
            mux_sel: 0,
        }
    }

    struct Fixture {
        server: Arc<ControlServer>,
        events: crossbeam_channel::Receiver<ControlEvent>,
        ring: Arc<PreviewRing>,
        archive: ArchiveHandle,
        archive_join: std::thread::JoinHandle<()>,
        root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let (archive, archive_join) = spawn_writer(
            ArchiveWriterConfig {
                data_dir: root.path().to_path_buf(),
                flavour: test_flavour(),
                firmware: test_firmware(),
                queue_size: 256,
            },
            Box::new(CsvTableSink::new()),
        );
        let ring = Arc::new(PreviewRing::new(130));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let server = ControlServer::new(
            archive.clone(),
            PreviewSender { ring: ring.clone() },
            events_tx,
            vec!["test".to_string(), "hipsr_200_16384".to_string()],
            "\n".to_string(),
            false,
        );
        Fixture {
            server,
            events: events_rx,
            ring,
            archive,
            archive_join,
            root,
        }
    }

    impl Fixture {
        /// Close the archive and list the created stores. The tempdir is
        /// handed back so it outlives the assertions.
        fn finish(self) -> (tempfile::TempDir, Vec<std::path::PathBuf>) {
            self.archive.safe_exit();
            self.archive_join.join().unwrap();
            let mut dirs = Vec::new();
            for date in std::fs::read_dir(self.root.path()).unwrap() {
                for arch in std::fs::read_dir(date.unwrap().path()).unwrap() {
                    dirs.push(arch.unwrap().path());
                }
            }
            dirs.sort();
            (self.root, dirs)
        }
    }

    #[test]
    fn codec_splits_multiple_commands_per_recv() {
        let mut codec = TerminatorCodec::new("\n");
        let mut buf = BytesMut::from(&b"freq 1420\nband 400\nsta"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "freq 1420");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "band 400");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"rt\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "start");
    }

    #[test]
    fn codec_handles_crlf_terminator() {
        let mut codec = TerminatorCodec::new("\r\n");
        let mut buf = BytesMut::from(&b"src Src1\r\nra 12:00:00\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "src Src1");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "ra 12:00:00");
    }

    #[test]
    fn unknown_command_is_acknowledged_and_harmless() {
        let fx = fixture();
        let before = fx.server.state.lock().obs_setup.clone();
        assert_eq!(fx.server.handle_line("wobble 42"), Reply::Ok);
        assert_eq!(fx.server.state.lock().obs_setup, before);
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn start_opens_archive_and_lands_setup_rows() {
        let fx = fixture();
        assert_eq!(fx.server.handle_line("pid TEST"), Reply::Ok);
        assert_eq!(fx.server.handle_line("src Src1"), Reply::Ok);
        assert_eq!(fx.server.handle_line("ra 12:34:56"), Reply::Ok);
        assert_eq!(fx.server.handle_line("dec -45:00:00"), Reply::Ok);

        let reply = fx.server.handle_line("start");
        match &reply {
            Reply::StartUtc(stamp) => assert_eq!(stamp.len(), "2013-05-04_031415".len()),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(matches!(
            fx.events.try_recv(),
            Ok(ControlEvent::WriteEnable(true))
        ));

        let (_root, dirs) = fx.finish();
        assert_eq!(dirs.len(), 1);
        let obs = std::fs::read_to_string(dirs[0].join("observation.csv")).unwrap();
        assert_eq!(obs.lines().count(), 2);
        assert!(obs.lines().nth(1).unwrap().contains("TEST"));
        let pointing = std::fs::read_to_string(dirs[0].join("pointing.csv")).unwrap();
        let row = pointing.lines().nth(1).unwrap();
        assert!(row.contains("Src1"));
        // 12:34:56 is about 188.73 degrees
        assert!(row.contains("188.7"));
    }

    #[test]
    fn second_start_reuses_open_archive() {
        let fx = fixture();
        fx.server.handle_line("start");
        fx.server.handle_line("stop");
        fx.server.handle_line("start");
        let (_root, dirs) = fx.finish();
        assert_eq!(dirs.len(), 1);
        let obs = std::fs::read_to_string(dirs[0].join("observation.csv")).unwrap();
        assert_eq!(obs.lines().count(), 3); // header + two observations
    }

    #[test]
    fn stop_disables_writes() {
        let fx = fixture();
        fx.server.handle_line("start");
        assert!(matches!(
            fx.events.try_recv(),
            Ok(ControlEvent::WriteEnable(true))
        ));
        assert_eq!(fx.server.handle_line("stop"), Reply::Ok);
        assert!(matches!(
            fx.events.try_recv(),
            Ok(ControlEvent::WriteEnable(false))
        ));
        assert!(!fx.server.state.lock().write_enabled);
    }

    #[test]
    fn utc_cycle_end_is_noop_while_disabled() {
        let fx = fixture();
        fx.server
            .handle_line("utc_cycle 2013-05-04-03:14:15.000000");
        assert_eq!(fx.server.handle_line("utc_cycle_end"), Reply::Ok);

        fx.server.handle_line("start");
        fx.server.handle_line("MB01_raj 180.5");
        fx.server.handle_line("az 123.75");
        assert_eq!(fx.server.handle_line("utc_cycle_end"), Reply::Ok);

        let (_root, dirs) = fx.finish();
        let scan = std::fs::read_to_string(dirs[0].join("scan_pointing.csv")).unwrap();
        // header plus exactly the one row appended while write-enabled
        assert_eq!(scan.lines().count(), 2);
        assert!(scan.lines().nth(1).unwrap().contains("123.75"));
    }

    #[test]
    fn beam_one_updates_feed_status_events() {
        let fx = fixture();
        fx.server.handle_line("MB01_raj 180.25");
        fx.server.handle_line("MB01_dcj -44.5");
        fx.server.handle_line("MB07_raj 181.0");
        let mut ras = Vec::new();
        let mut decs = Vec::new();
        while let Ok(ev) = fx.events.try_recv() {
            match ev {
                ControlEvent::RaUpdate(v) => ras.push(v),
                ControlEvent::DecUpdate(v) => decs.push(v),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(ras, vec![180.25]);
        assert_eq!(decs, vec![-44.5]);
        let state = fx.server.state.lock();
        assert_eq!(state.scan_pointing.mb_raj[6], 181.0);
    }

    #[test]
    fn confname_matching_a_flavour_requests_change() {
        let fx = fixture();
        fx.server.handle_line("confname hipsr_200_16384");
        assert!(matches!(
            fx.events.try_recv(),
            Ok(ControlEvent::FlavourChange(name)) if name == "hipsr_200_16384"
        ));
        // a non-flavour confname is only recorded
        fx.server.handle_line("confname some_other_setup");
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn freq_publishes_preview_notification() {
        let fx = fixture();
        fx.server.handle_line("freq 1420.405");
        let msg = fx
            .ring
            .pop_wait(std::time::Duration::from_millis(10))
            .unwrap();
        assert_eq!(msg, r#"{"tcs-frequency":"1420.405"}"#);
    }

    #[test]
    fn new_file_latches_basename_for_next_start() {
        let fx = fixture();
        fx.server.handle_line("new_file mysurvey");
        fx.server.handle_line("start");
        let (_root, dirs) = fx.finish();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].file_name().unwrap(), "mysurvey");
    }
}
