//! The NMEA bridge supervisor: TCP service, serial lifecycle, and
//! rate-limited re-emission in one cooperative loop.
//!
//! Each iteration runs the non-blocking phases (probe step, serial
//! and peer drains, upstream flush, timeout sweep, synthesized
//! emission, write flush, outbound-client bookkeeping), then makes a
//! single readiness wait on the listener, the relay channel from the
//! autopilot, the sensor-bus deltas, and a tick. Every descriptor is
//! non-blocking; losing a peer or a serial device is local cleanup,
//! losing the upstream channels ends the process with exit code 2.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::process;

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration, Instant};

use crate::bus::BusClient;
use crate::nmea::parse::{Kind, SensorReport};
use crate::nmea::sentence::{encode, LineBuffer};
use crate::serial::{SerialDevice, SerialProbe, PROBE_BAUDS};
use crate::source::Source;

const MAX_SOCKETS: usize = 10;
const LISTEN_BACKLOG: u32 = 5;
const BIND_RETRY: Duration = Duration::from_secs(1);
/// Readiness wait while any peer, device, or probe is live.
const BUSY_WAIT: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_secs(10);
/// Per-head gap for serial lines forwarded to TCP peers (4 Hz).
const FORWARD_GAP: Duration = Duration::from_millis(250);
/// Gap for the synthesized attitude trio (2 Hz).
const IMU_GAP: Duration = Duration::from_millis(500);
/// Gap for synthesized wind and rudder sentences (4 Hz).
const SYNTH_GAP: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WARN_START: Duration = Duration::from_secs(2);
const SILENCE_WARN_END: Duration = Duration::from_millis(2300);
const DEVICE_TIMEOUT: Duration = Duration::from_secs(15);
const CLIENT_RETRY: Duration = Duration::from_secs(20);
const MAX_WRITE_BUFFER: usize = 64 * 1024;
const SLOW_LOOP: Duration = Duration::from_millis(100);

/// TCP peers opt into rebroadcast by sending this sentence.
const BROADCAST_OPT_IN: &str = "$PYPBS*48";

/// Value keys only needed while peers are connected.
const OUTPUT_WATCHES: [&str; 6] = [
    "imu.pitch",
    "imu.roll",
    "imu.heading_lowpass",
    "wind.direction",
    "wind.speed",
    "rudder.angle",
];

/// Control notices sent upstream on the typed side of the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// At least one TCP peer is connected.
    Sockets,
    /// All peers are gone.
    NoSockets,
    /// The peer with this uid is gone.
    LostSocket(u64),
}

enum Wake {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Relay(Option<String>),
    Update(Option<(String, Value)>),
    Tick,
}

// ── Peers ─────────────────────────────────────────────────────────────────────

struct Peer {
    uid: u64,
    stream: TcpStream,
    addr: SocketAddr,
    framer: LineBuffer,
    broadcast: bool,
    /// Set on the outbound client socket: the `host:port` it serves.
    client_target: Option<String>,
    wbuf: Vec<u8>,
    dead: bool,
}

impl Peer {
    fn queue(&mut self, bytes: &[u8]) {
        if self.dead {
            return;
        }
        if self.wbuf.len() + bytes.len() > MAX_WRITE_BUFFER {
            warn!("nmea peer {} write buffer overflow, dropping", self.addr);
            self.dead = true;
            return;
        }
        self.wbuf.extend_from_slice(bytes);
    }

    fn flush(&mut self) {
        while !self.dead && !self.wbuf.is_empty() {
            match self.stream.try_write(&self.wbuf) {
                Ok(0) => self.dead = true,
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("nmea peer {} write failed: {e}", self.addr);
                    self.dead = true;
                }
            }
        }
    }

    /// Drain readable bytes and append complete sentences to `out`.
    fn read_into(&mut self, index: usize, out: &mut Vec<(usize, String)>) {
        if self.dead {
            return;
        }
        let mut chunk = [0u8; 512];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.dead = true;
                    break;
                }
                Ok(n) => self.framer.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("nmea peer {} read failed: {e}", self.addr);
                    self.dead = true;
                    break;
                }
            }
        }
        while let Some(line) = self.framer.next_sentence() {
            out.push((index, line));
        }
    }
}

// ── The supervisor ────────────────────────────────────────────────────────────

pub struct Bridge<P: SerialProbe> {
    listener: TcpListener,
    peers: Vec<Peer>,
    next_uid: u64,
    bus: BusClient,
    probe: P,
    relay_rx: UnboundedReceiver<String>,
    notice_tx: UnboundedSender<Notice>,
    /// Parsed readings pending upstream, last write wins per kind.
    msgs: HashMap<Kind, (SensorReport, Source)>,
    /// Mirror of the watched bus keys.
    last_values: HashMap<String, Value>,
    /// Sparse device arena indexed by probe slot.
    devices: Vec<Option<SerialDevice>>,
    probe_index: usize,
    probe_device: Option<SerialDevice>,
    probe_start: Instant,
    /// Last emission per sentence head or synthesized kind.
    nmea_times: HashMap<String, Instant>,
    last_imu_time: Option<Instant>,
    pending_connect: Option<(String, oneshot::Receiver<io::Result<TcpStream>>)>,
    last_connect_attempt: Option<Instant>,
}

impl<P: SerialProbe> Bridge<P> {
    /// Bind the NMEA server (retrying until the port is free) and set
    /// up the permanent bus watches.
    pub async fn bind(
        port: u16,
        bus: BusClient,
        probe: P,
        relay_rx: UnboundedReceiver<String>,
        notice_tx: UnboundedSender<Notice>,
    ) -> Self {
        let listener = loop {
            match Self::try_listen(port) {
                Ok(l) => break l,
                Err(e) => warn!("nmea server on port {port}: bind failed: {e}"),
            }
            sleep(BIND_RETRY).await;
        };
        info!("listening on port {port} for nmea connections");

        let mut bridge = Self {
            listener,
            peers: Vec::new(),
            next_uid: 0,
            bus,
            probe,
            relay_rx,
            notice_tx,
            msgs: HashMap::new(),
            last_values: HashMap::new(),
            devices: Vec::new(),
            probe_index: 0,
            probe_device: None,
            probe_start: Instant::now(),
            nmea_times: HashMap::new(),
            last_imu_time: None,
            pending_connect: None,
            last_connect_attempt: None,
        };
        for kind in Kind::ALL {
            bridge.watch(kind.source_key(), true);
            bridge.watch(kind.device_key(), true);
            bridge
                .last_values
                .insert(kind.source_key().to_string(), json!("none"));
        }
        bridge.watch("nmea.client", true);
        bridge
    }

    fn try_listen(port: u16) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        socket.listen(LISTEN_BACKLOG)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }

    /// One supervisor iteration: the non-blocking phases, then a
    /// single readiness wait.
    async fn step(&mut self) {
        let t0 = Instant::now();
        self.probe_serial();
        self.read_devices();
        let t1 = Instant::now();
        self.read_peers();
        let t2 = Instant::now();
        self.flush_upstream();
        for (name, value) in self.bus.receive() {
            self.apply_update(name, value);
        }
        let t3 = Instant::now();
        self.retire_devices();
        self.emit_synthesized();
        let t4 = Instant::now();
        self.flush_peers();
        self.cleanup_peers();
        self.poll_outbound();
        let t5 = Instant::now();
        if t5 - t0 > SLOW_LOOP {
            warn!(
                "nmea poll too slow: serial {:?} tcp {:?} upstream {:?} emit {:?} tail {:?}",
                t1 - t0,
                t2 - t1,
                t3 - t2,
                t4 - t3,
                t5 - t4
            );
        }

        let timeout = if self.busy() { BUSY_WAIT } else { IDLE_WAIT };
        let wake = tokio::select! {
            r = self.listener.accept() => Wake::Accept(r),
            m = self.relay_rx.recv() => Wake::Relay(m),
            u = self.bus.next_update() => Wake::Update(u),
            _ = sleep(timeout) => Wake::Tick,
        };
        match wake {
            Wake::Accept(Ok((stream, addr))) => self.accept_peer(stream, addr),
            Wake::Accept(Err(e)) => warn!("nmea server accept failed: {e}"),
            Wake::Relay(Some(line)) => {
                self.relay_line(&line);
                while let Ok(next) = self.relay_rx.try_recv() {
                    self.relay_line(&next);
                }
            }
            Wake::Relay(None) => Self::fatal("lost pipe to autopilot"),
            Wake::Update(Some((name, value))) => self.apply_update(name, value),
            Wake::Update(None) => Self::fatal("lost sensor bus"),
            Wake::Tick => {}
        }
    }

    fn busy(&self) -> bool {
        !self.peers.is_empty()
            || self.probe_device.is_some()
            || self.devices.iter().any(Option::is_some)
    }

    fn fatal(what: &str) -> ! {
        error!("nmea bridge {what}");
        process::exit(2);
    }

    fn watch(&self, name: &str, on: bool) {
        if self.bus.watch(name, on).is_err() {
            Self::fatal("lost sensor bus");
        }
    }

    fn notify(&self, notice: Notice) {
        if self.notice_tx.send(notice).is_err() {
            Self::fatal("lost pipe to autopilot");
        }
    }

    fn set_output_watches(&self, on: bool) {
        for name in OUTPUT_WATCHES {
            self.watch(name, on);
        }
    }

    // ── TCP peers ─────────────────────────────────────────────────────────────

    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.peers.len() >= MAX_SOCKETS {
            warn!("nmea server has too many connections, dropping {addr}");
            return; // stream closed on drop
        }
        self.register_peer(stream, addr, None);
    }

    fn register_peer(&mut self, stream: TcpStream, addr: SocketAddr, client_target: Option<String>) {
        if self.peers.is_empty() {
            self.set_output_watches(true);
            self.notify(Notice::Sockets);
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        debug!("nmea connection {uid} from {addr}");
        self.peers.push(Peer {
            uid,
            stream,
            addr,
            framer: LineBuffer::new(),
            broadcast: client_target.is_some(),
            client_target,
            wbuf: Vec::new(),
            dead: false,
        });
    }

    fn read_peers(&mut self) {
        let mut lines = Vec::new();
        for (i, peer) in self.peers.iter_mut().enumerate() {
            peer.read_into(i, &mut lines);
        }
        for (i, line) in lines {
            self.receive_nmea(i, &line);
        }
    }

    fn receive_nmea(&mut self, from: usize, line: &str) {
        if !self.peers[from].broadcast {
            if line == BROADCAST_OPT_IN {
                debug!("nmea peer {} enabled broadcast", self.peers[from].uid);
                self.peers[from].broadcast = true;
                return;
            }
        } else {
            // lines from a broadcast peer are relayed to everyone else
            let framed = format!("{line}\r\n");
            for j in 0..self.peers.len() {
                if j != from {
                    self.peers[j].queue(framed.as_bytes());
                }
            }
        }

        let Some(talker) = line.get(1..3) else { return };
        let uid = self.peers[from].uid;
        // only kinds a tcp source could win are worth parsing
        for kind in Kind::ALL {
            if self.current_source(kind).priority() < Source::Tcp.priority() {
                continue;
            }
            if let Some(reading) = kind.parse(line) {
                let device = format!("{talker}socket{uid}");
                self.msgs
                    .insert(kind, (SensorReport { reading, device }, Source::Tcp));
                return;
            }
        }
    }

    fn flush_peers(&mut self) {
        for peer in &mut self.peers {
            peer.flush();
        }
    }

    fn cleanup_peers(&mut self) {
        if self.peers.iter().all(|p| !p.dead) {
            return;
        }
        for peer in self.peers.iter().filter(|p| p.dead) {
            debug!("nmea connection {} lost", peer.uid);
            self.notify(Notice::LostSocket(peer.uid));
        }
        self.peers.retain(|p| !p.dead);
        if self.peers.is_empty() {
            self.set_output_watches(false);
            self.notify(Notice::NoSockets);
        }
    }

    // ── Upstream ──────────────────────────────────────────────────────────────

    fn flush_upstream(&mut self) {
        if self.msgs.is_empty() {
            return;
        }
        for (_, (report, source)) in self.msgs.drain() {
            if self.bus.write(report, source).is_err() {
                Self::fatal("lost sensor bus");
            }
        }
    }

    fn apply_update(&mut self, name: String, value: Value) {
        if name == "nmea.client" {
            let target = value.as_str().unwrap_or("");
            for peer in &mut self.peers {
                if peer.client_target.as_deref().is_some_and(|t| t != target) {
                    info!("nmea client target changed, closing {}", peer.addr);
                    peer.dead = true;
                }
            }
        }
        self.last_values.insert(name, value);
    }

    fn current_source(&self, kind: Kind) -> Source {
        self.last_values
            .get(kind.source_key())
            .and_then(Value::as_str)
            .map_or(Source::None, Source::from_tag)
    }

    fn current_device(&self, kind: Kind) -> &str {
        self.last_values
            .get(kind.device_key())
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    fn value(&self, name: &str) -> Option<f64> {
        self.last_values.get(name).and_then(Value::as_f64)
    }

    // ── Serial devices ────────────────────────────────────────────────────────

    fn read_devices(&mut self) {
        for slot in 0..self.devices.len() {
            let mut lines = Vec::new();
            let mut lost = false;
            if let Some(device) = self.devices[slot].as_mut() {
                loop {
                    match device.poll_line() {
                        Ok(Some(line)) => {
                            device.last_msg = Instant::now();
                            lines.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("serial read error on {}: {e}", device.path().0);
                            lost = true;
                            break;
                        }
                    }
                }
            }
            for line in lines {
                self.handle_serial_line(slot, &line);
            }
            if lost {
                self.remove_serial_device(slot);
            }
        }
    }

    fn handle_serial_line(&mut self, slot: usize, line: &str) {
        let path = match self.devices[slot].as_ref() {
            Some(device) => device.path().0.clone(),
            None => return,
        };
        let Some(talker) = line.get(1..3) else { return };

        // forward serial traffic to tcp peers at 4 Hz per head, except
        // the sentences the bridge synthesizes from arbitrated state
        if !self.peers.is_empty() {
            if let Some(head) = line.get(..6) {
                let head_type = head.get(3..).unwrap_or("");
                if !matches!(head_type, "MWV" | "RSA" | "APB")
                    && self.allow_rate(head, FORWARD_GAP)
                {
                    let framed = format!("{line}\r\n");
                    for peer in &mut self.peers {
                        peer.queue(framed.as_bytes());
                    }
                }
            }
        }

        // run a parser only if its channel could still be won by (or
        // is already pinned to) this device
        for kind in Kind::ALL {
            let recorded = self.current_device(kind);
            let eligible = self.current_source(kind).priority() > Source::Serial.priority()
                || recorded.is_empty()
                || recorded.get(2..) == Some(path.as_str());
            if !eligible {
                continue;
            }
            if let Some(reading) = kind.parse(line) {
                let device = format!("{talker}{path}");
                self.msgs
                    .insert(kind, (SensorReport { reading, device }, Source::Serial));
                break;
            }
        }
    }

    fn remove_serial_device(&mut self, slot: usize) {
        if let Some(device) = self.devices[slot].take() {
            info!("lost serial nmea{slot} ({})", device.path().0);
            if self.bus.lostdevice(&device.path().0).is_err() {
                Self::fatal("lost sensor bus");
            }
        }
    }

    fn retire_devices(&mut self) {
        for slot in 0..self.devices.len() {
            let Some(device) = self.devices[slot].as_ref() else {
                continue;
            };
            let quiet = device.last_msg.elapsed();
            if quiet > DEVICE_TIMEOUT {
                warn!("serial device {} timed out", device.path().0);
                self.remove_serial_device(slot);
            } else if quiet > SILENCE_WARN_START && quiet < SILENCE_WARN_END {
                warn!(
                    "serial device {} quiet for {quiet:?}, is another process accessing it?",
                    device.path().0
                );
            }
        }
    }

    fn probe_serial(&mut self) {
        // resolve a probe in flight first
        if let Some(mut device) = self.probe_device.take() {
            match device.poll_line() {
                Ok(Some(_)) => self.promote_probe(device),
                Ok(None) if self.probe_start.elapsed() <= PROBE_TIMEOUT => {
                    self.probe_device = Some(device);
                }
                Ok(None) => debug!("nmea probe timed out on {}", device.path().0),
                Err(e) => debug!("nmea probe read failed on {}: {e}", device.path().0),
            }
            return;
        }

        let index = self
            .devices
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.devices.len());
        if self.probe_index != index
            && self.devices.get(self.probe_index).map_or(true, Option::is_none)
        {
            self.probe.relinquish(&slot_name(self.probe_index));
        }
        self.probe_index = index;

        let Some(path) = self.probe.probe(&slot_name(index), &PROBE_BAUDS, 8) else {
            return;
        };
        info!("nmea probe {} @ {}", path.0, path.1);
        match SerialDevice::open(&path) {
            Ok(device) => {
                self.probe_device = Some(device);
                self.probe_start = Instant::now();
            }
            Err(e) => warn!("failed to open {} for nmea data: {e}", path.0),
        }
    }

    fn promote_probe(&mut self, mut device: SerialDevice) {
        let slot = self.probe_index;
        info!("nmea device {} on nmea{slot}", device.path().0);
        self.probe.success(&slot_name(slot), device.path());
        device.last_msg = Instant::now();
        if slot < self.devices.len() {
            self.devices[slot] = Some(device);
        } else {
            self.devices.push(Some(device));
        }
    }

    // ── Outbound emission ─────────────────────────────────────────────────────

    fn rate_due(&self, key: &str, gap: Duration) -> bool {
        self.nmea_times.get(key).map_or(true, |t| t.elapsed() > gap)
    }

    fn mark_rate(&mut self, key: &str) {
        self.nmea_times.insert(key.to_string(), Instant::now());
    }

    fn allow_rate(&mut self, key: &str, gap: Duration) -> bool {
        if self.rate_due(key, gap) {
            self.mark_rate(key);
            true
        } else {
            false
        }
    }

    /// Checksum a payload and queue it on every peer.
    fn send_nmea(&mut self, payload: &str) {
        let framed = encode(payload);
        for peer in &mut self.peers {
            peer.queue(framed.as_bytes());
        }
    }

    /// A relayed line from the autopilot: checksum if bare, fan out.
    fn relay_line(&mut self, line: &str) {
        let framed = if line.starts_with('$') {
            format!("{line}\r\n")
        } else {
            encode(line)
        };
        for peer in &mut self.peers {
            peer.queue(framed.as_bytes());
        }
    }

    /// Attitude at 2 Hz; wind and rudder at 4 Hz when a source better
    /// than tcp owns them (the bridge never echoes tcp's own data).
    fn emit_synthesized(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let imu_due = self.last_imu_time.map_or(true, |t| t.elapsed() > IMU_GAP);
        if imu_due {
            if let (Some(pitch), Some(roll), Some(heading)) = (
                self.value("imu.pitch"),
                self.value("imu.roll"),
                self.value("imu.heading_lowpass"),
            ) {
                self.send_nmea(&format!("APXDR,A,{pitch:.3},D,PTCH"));
                self.send_nmea(&format!("APXDR,A,{roll:.3},D,ROLL"));
                self.send_nmea(&format!("APHDM,{heading:.3},M"));
                self.last_imu_time = Some(Instant::now());
            }
        }

        for kind in [Kind::Wind, Kind::Rudder] {
            if self.current_source(kind).priority() >= Source::Tcp.priority() {
                continue;
            }
            if !self.rate_due(kind.name(), SYNTH_GAP) {
                continue;
            }
            let payload = match kind {
                Kind::Wind => {
                    match (self.value("wind.direction"), self.value("wind.speed")) {
                        (Some(direction), Some(speed)) => {
                            format!("APMWV,{direction:.3},R,{speed:.3},N,A")
                        }
                        _ => continue,
                    }
                }
                Kind::Rudder => match self.value("rudder.angle") {
                    Some(angle) => format!("APRSA,{angle:.3},A,,"),
                    None => continue,
                },
                Kind::Gps | Kind::Apb => continue,
            };
            self.send_nmea(&payload);
            self.mark_rate(kind.name());
        }
    }

    // ── Outbound client ───────────────────────────────────────────────────────

    fn target(&self) -> String {
        self.last_values
            .get("nmea.client")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    fn poll_outbound(&mut self) {
        // resolve a connect attempt in flight
        if let Some((target, mut rx)) = self.pending_connect.take() {
            match rx.try_recv() {
                Ok(Ok(stream)) => {
                    if self.peers.len() >= MAX_SOCKETS {
                        warn!("nmea client {target} connected but peer cap reached");
                    } else if self.target() != target {
                        debug!("nmea client target changed while connecting to {target}");
                    } else {
                        match stream.peer_addr() {
                            Ok(addr) => {
                                info!("connected to nmea client {target}");
                                self.register_peer(stream, addr, Some(target));
                            }
                            Err(e) => warn!("nmea client {target} unusable: {e}"),
                        }
                    }
                }
                Ok(Err(e)) => warn!("nmea client failed to connect to {target}: {e}"),
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.pending_connect = Some((target, rx));
                }
                Err(oneshot::error::TryRecvError::Closed) => {}
            }
        }
        if self.pending_connect.is_some() {
            return;
        }

        let target = self.target();
        if !target.contains(':') {
            return;
        }
        if self.peers.iter().any(|p| p.client_target.is_some()) {
            return;
        }
        if self
            .last_connect_attempt
            .is_some_and(|t| t.elapsed() <= CLIENT_RETRY)
        {
            return;
        }
        self.last_connect_attempt = Some(Instant::now());
        let (tx, rx) = oneshot::channel();
        let addr = target.clone();
        tokio::spawn(async move {
            tx.send(TcpStream::connect(&addr).await).ok();
        });
        self.pending_connect = Some((target, rx));
    }
}

fn slot_name(index: usize) -> String {
    format!("nmea{index}")
}
