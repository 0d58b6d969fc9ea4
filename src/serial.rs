//! Serial NMEA devices: exclusive non-blocking port opens and the
//! probe protocol for discovering which ports carry instrument
//! traffic.
//!
//! The bridge owns every port it promotes. Ports are opened raw 8N1
//! with `O_NONBLOCK` and marked `TIOCEXCL` so no other process can
//! grab them while the autopilot is steering off their data.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use tokio::time::Instant;

use crate::error::Result;
use crate::nmea::sentence::LineBuffer;

nix::ioctl_none_bad!(tiocexcl, libc::TIOCEXCL);

/// Bauds handed to the probe, preferred first.
pub const PROBE_BAUDS: [u32; 2] = [38_400, 4_800];

/// An open NMEA serial port owned by the bridge.
pub struct SerialDevice {
    file: File,
    path: (String, u32),
    framer: LineBuffer,
    pub last_msg: Instant,
}

impl SerialDevice {
    /// Open `(device, baud)` exclusively for non-blocking reads.
    pub fn open(path: &(String, u32)) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(&path.0)?;
        configure_serial(&file, path.1)?;
        unsafe { tiocexcl(file.as_raw_fd()) }?;
        Ok(Self {
            file,
            path: path.clone(),
            framer: LineBuffer::new(),
            last_msg: Instant::now(),
        })
    }

    pub fn path(&self) -> &(String, u32) {
        &self.path
    }

    /// Drain available bytes and return the next framed sentence.
    /// `Ok(None)` means no complete sentence yet; an error means the
    /// device is gone.
    pub fn poll_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.framer.next_sentence() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 256];
        loop {
            match (&self.file).read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.framer.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.framer.next_sentence())
    }

    /// A device over a pipe that never produces data, for timeout
    /// tests. The returned write end keeps the pipe open.
    #[cfg(test)]
    pub(crate) fn fake(path: &str) -> (Self, std::os::fd::OwnedFd) {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
        let device = Self {
            file: File::from(r),
            path: (path.to_string(), 4800),
            framer: LineBuffer::new(),
            last_msg: Instant::now(),
        };
        (device, w)
    }
}

/// Configure the port for raw NMEA reading (8N1, no echo, no signals).
fn configure_serial(file: &fs::File, baud: u32) -> Result<()> {
    let mut t = termios::tcgetattr(file)?;

    // Raw input: no canonical mode, no echo, no signals
    t.local_flags &= !(
        LocalFlags::ICANON |
        LocalFlags::ECHO   |
        LocalFlags::ECHOE  |
        LocalFlags::ISIG
    );
    // No output processing
    t.output_flags &= !OutputFlags::OPOST;
    // Disable software flow control and strip/parity
    t.input_flags &= !(
        InputFlags::IXON   |
        InputFlags::IXOFF  |
        InputFlags::IXANY  |
        InputFlags::ISTRIP |
        InputFlags::INPCK
    );
    // 8 data bits, no parity, 1 stop bit, enable receiver, ignore modem ctrl
    t.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    t.control_flags &= !(ControlFlags::CSIZE | ControlFlags::CSTOPB | ControlFlags::PARENB);

    // VMIN=1, VTIME=0; with O_NONBLOCK set, empty reads return EAGAIN
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    let baud_rate = match baud {
        1200   => BaudRate::B1200,
        2400   => BaudRate::B2400,
        4800   => BaudRate::B4800,
        9600   => BaudRate::B9600,
        19200  => BaudRate::B19200,
        38400  => BaudRate::B38400,
        57600  => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _      => BaudRate::B4800,
    };

    termios::cfsetospeed(&mut t, baud_rate)?;
    termios::cfsetispeed(&mut t, baud_rate)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &t)?;

    Ok(())
}

// ── Probe protocol ────────────────────────────────────────────────────────────

/// Discovery collaborator: hands out candidate ports per probe slot
/// and is told which slots claimed or released them.
pub trait SerialProbe {
    /// Next candidate `(device, baud)` for `slot`, if any.
    fn probe(&mut self, slot: &str, bauds: &[u32], data_bits: u8) -> Option<(String, u32)>;
    /// `slot` produced valid NMEA data on `path`.
    fn success(&mut self, slot: &str, path: &(String, u32));
    /// `slot` no longer exists; its claim is released.
    fn relinquish(&mut self, slot: &str);
}

/// Probe over a fixed candidate list (the `serial_ports` config key).
///
/// Candidates are cycled one `(path, baud)` combination per call,
/// skipping paths already claimed by other slots. A slot that probes
/// again is first re-offered the path it last succeeded on.
pub struct ScanProbe {
    candidates: Vec<String>,
    next: usize,
    claimed: HashMap<String, (String, u32)>,
}

impl ScanProbe {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates,
            next: 0,
            claimed: HashMap::new(),
        }
    }
}

impl SerialProbe for ScanProbe {
    fn probe(&mut self, slot: &str, bauds: &[u32], _data_bits: u8) -> Option<(String, u32)> {
        // a slot probing again gave up its device; offer it back first
        if let Some(previous) = self.claimed.remove(slot) {
            return Some(previous);
        }
        if self.candidates.is_empty() || bauds.is_empty() {
            return None;
        }
        let combos = self.candidates.len() * bauds.len();
        for _ in 0..combos {
            let i = self.next;
            self.next = (self.next + 1) % combos;
            let path = &self.candidates[i / bauds.len()];
            if self.claimed.values().any(|(p, _)| p == path) {
                continue;
            }
            return Some((path.clone(), bauds[i % bauds.len()]));
        }
        None
    }

    fn success(&mut self, slot: &str, path: &(String, u32)) {
        self.claimed.insert(slot.to_string(), path.clone());
    }

    fn relinquish(&mut self, slot: &str) {
        self.claimed.remove(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_path_baud_combinations() {
        let mut probe = ScanProbe::new(vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()]);
        let bauds = [38_400, 4_800];
        let first = probe.probe("nmea0", &bauds, 8).unwrap();
        let second = probe.probe("nmea0", &bauds, 8).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, ("/dev/ttyUSB0".into(), 38_400));
        assert_eq!(second, ("/dev/ttyUSB0".into(), 4_800));
        assert_eq!(probe.probe("nmea0", &bauds, 8).unwrap().0, "/dev/ttyUSB1");
    }

    #[test]
    fn claimed_paths_skipped_for_other_slots() {
        let mut probe = ScanProbe::new(vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()]);
        let bauds = [4_800];
        let path = probe.probe("nmea0", &bauds, 8).unwrap();
        probe.success("nmea0", &path);
        // the other slot only ever sees the remaining candidate
        for _ in 0..4 {
            assert_eq!(probe.probe("nmea1", &bauds, 8).unwrap().0, "/dev/ttyUSB1");
        }
        probe.relinquish("nmea0");
        let offered: Vec<String> = (0..2)
            .filter_map(|_| probe.probe("nmea1", &bauds, 8))
            .map(|(p, _)| p)
            .collect();
        assert!(offered.contains(&"/dev/ttyUSB0".to_string()));
    }

    #[test]
    fn reprobe_offers_last_success_first() {
        let mut probe = ScanProbe::new(vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()]);
        let bauds = [4_800];
        probe.success("nmea0", &("/dev/ttyUSB1".into(), 4_800));
        assert_eq!(
            probe.probe("nmea0", &bauds, 8),
            Some(("/dev/ttyUSB1".into(), 4_800))
        );
    }

    #[test]
    fn empty_candidate_list_yields_nothing() {
        let mut probe = ScanProbe::new(Vec::new());
        assert_eq!(probe.probe("nmea0", &PROBE_BAUDS, 8), None);
    }
}
