//! Driver for the oven's ESP32 control board over USB serial or TCP

pub mod protocol;
pub mod supervisor;

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Mutex,
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

use shared::{CONNECT_TIMEOUT_MS, SERIAL_SETTLE_MS};

/// Read timeout applied to both transports in ms
const READ_TIMEOUT_MS: u64 = 1_000;
/// Largest chunk read back from the board in one go
const RECV_BUF_LEN: usize = 1_024;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no connection open")]
    NotConnected,
    #[error("unresolvable address {0}")]
    BadAddress(String),
}

/// Which physical link is currently open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    None,
    Serial,
    Wifi,
}

enum Handle {
    None,
    Serial(Box<dyn SerialPort>),
    Wifi(TcpStream),
}

impl Handle {
    #[inline]
    fn mode(&self) -> LinkMode {
        match self {
            Handle::None => LinkMode::None,
            Handle::Serial(_) => LinkMode::Serial,
            Handle::Wifi(_) => LinkMode::Wifi,
        }
    }
}

struct LinkInner {
    handle: Handle,
    auto_reconnect: bool,
    last_known: Option<(String, u16)>,
}

impl LinkInner {
    /// Drop whatever handle is open. Transitioning to `None` always
    /// releases the handle, even mid-error.
    fn close(&mut self) {
        if let Handle::Wifi(stream) = &self.handle {
            stream.shutdown(Shutdown::Both).unwrap_or_default();
        }

        self.handle = Handle::None;
    }

    fn write_line(&mut self, cmd: &str) -> Result<(), LinkError> {
        let mut payload = String::with_capacity(cmd.len() + 1);
        payload.push_str(cmd);
        payload.push('\n');

        match &mut self.handle {
            Handle::None => Err(LinkError::NotConnected),
            Handle::Serial(port) => Ok(port.write_all(payload.as_bytes())?),
            Handle::Wifi(stream) => Ok(stream.write_all(payload.as_bytes())?),
        }
    }

    /// Read whatever the board has queued, up to `max` bytes. A quiet
    /// line yields an empty string; only real I/O faults error out.
    fn read_chunk(&mut self, max: usize) -> Result<String, LinkError> {
        let mut buf = vec![0_u8; max.min(RECV_BUF_LEN)];

        let read = match &mut self.handle {
            Handle::None => return Err(LinkError::NotConnected),
            Handle::Serial(port) => {
                if port.bytes_to_read()? == 0 {
                    return Ok(String::new());
                }
                port.read(&mut buf)?
            }
            Handle::Wifi(stream) => match stream.read(&mut buf) {
                Ok(0) => {
                    return Err(LinkError::Io(std::io::ErrorKind::ConnectionAborted.into()));
                }
                Ok(read) => read,
                Err(e) if quiet_read(&e) => return Ok(String::new()),
                Err(e) => return Err(LinkError::Io(e)),
            },
        };

        Ok(String::from_utf8_lossy(&buf[..read]).trim().to_string())
    }
}

/// A read timeout only means the board had nothing to say
#[inline]
fn quiet_read(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub(crate) fn resolve(ip: &str, port: u16) -> Result<SocketAddr, LinkError> {
    let endpoint = format!("{}:{}", ip, port);

    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or(LinkError::BadAddress(endpoint))
}

/// Exclusive owner of the single physical link to the control board.
///
/// At most one handle is ever open; opening a new connection force-closes
/// the previous one. Connect, disconnect, send and receive all go through
/// the same mutex, so a command write can never interleave with a telemetry
/// round trip and a disconnect can never race a send. Any I/O fault on the
/// wire drops the connection on the spot; retrying is the supervisor's job,
/// never this layer's.
pub struct Link {
    inner: Mutex<LinkInner>,
}

impl Link {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LinkInner {
                handle: Handle::None,
                auto_reconnect: false,
                last_known: None,
            }),
        }
    }

    /// Open the USB serial link. The board resets when the host asserts
    /// DTR, so the port settles for a moment and stale input is flushed
    /// before first use. USB sessions are not resumed automatically.
    pub fn connect_serial(&self, path: &str, baud: u32) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.close();

        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()?;

        sleep(Duration::from_millis(SERIAL_SETTLE_MS));
        port.clear(ClearBuffer::Input)?;

        inner.handle = Handle::Serial(port);
        inner.auto_reconnect = false;

        info!("serial link open on {} @ {} baud", path, baud);
        Ok(())
    }

    /// Open the TCP link and remember the endpoint for reconnection.
    pub fn connect_wifi(&self, ip: &str, port: u16) -> Result<(), LinkError> {
        let addr = resolve(ip, port)?;

        let mut inner = self.inner.lock().unwrap();
        inner.close();

        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_millis(CONNECT_TIMEOUT_MS))?;
        stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)))?;
        stream.set_nodelay(true)?;

        inner.handle = Handle::Wifi(stream);
        inner.last_known = Some((ip.to_string(), port));
        inner.auto_reconnect = true;

        info!("wifi link open to {}", addr);
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();

        if inner.handle.mode() != LinkMode::None {
            info!("link closed");
        }

        inner.close();
    }

    /// Send one newline-terminated command frame
    pub fn send_line(&self, cmd: &str) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().unwrap();

        inner.write_line(cmd).map_err(|e| {
            if !matches!(e, LinkError::NotConnected) {
                warn!("send failed, dropping link: {}", e);
                inner.close();
            }
            e
        })
    }

    /// Read whatever response is pending, up to `max` bytes
    pub fn receive(&self, max: usize) -> Result<String, LinkError> {
        let mut inner = self.inner.lock().unwrap();

        inner.read_chunk(max).map_err(|e| {
            if !matches!(e, LinkError::NotConnected) {
                warn!("receive failed, dropping link: {}", e);
                inner.close();
            }
            e
        })
    }

    /// One full request/response round trip under a single lock hold, so
    /// no other frame can slip onto the wire between the two halves.
    pub fn request_line(&self, cmd: &str) -> Result<String, LinkError> {
        let mut inner = self.inner.lock().unwrap();

        let round_trip = inner
            .write_line(cmd)
            .and_then(|_| inner.read_chunk(RECV_BUF_LEN));

        match round_trip {
            Ok(line) => {
                debug!("{} -> {:?}", cmd, line);
                Ok(line)
            }
            Err(e) => {
                if !matches!(e, LinkError::NotConnected) {
                    warn!("round trip failed, dropping link: {}", e);
                    inner.close();
                }
                Err(e)
            }
        }
    }

    #[inline]
    pub fn mode(&self) -> LinkMode {
        self.inner.lock().unwrap().handle.mode()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.mode() != LinkMode::None
    }

    #[inline]
    pub fn auto_reconnect(&self) -> bool {
        self.inner.lock().unwrap().auto_reconnect
    }

    #[inline]
    pub fn last_known(&self) -> Option<(String, u16)> {
        self.inner.lock().unwrap().last_known.clone()
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write as IoWrite},
        net::TcpListener,
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;
    use crate::{protocol, supervisor::Supervisor};

    /// Minimal stand-in for the board: answers every GET_ESTADO with a
    /// canned status line and records every other frame it receives.
    fn spawn_board(status: &'static str) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let frames_srv = frames.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let frames = frames_srv.clone();

                        thread::spawn(move || {
                            let mut reader = BufReader::new(stream.try_clone().unwrap());
                            let mut stream = stream;
                            let mut line = String::new();

                            loop {
                                line.clear();

                                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                                    break;
                                }

                                match line.trim() {
                                    "GET_ESTADO" => {
                                        let frame = format!("{}\n", status);
                                        stream.write_all(frame.as_bytes()).unwrap_or_default();
                                    }
                                    frame => frames.lock().unwrap().push(frame.to_string()),
                                }
                            }
                        });
                    }
                    Err(_) => {}
                }
            }
        });

        (port, frames)
    }

    #[test]
    fn wifi_round_trip() {
        let (port, frames) = spawn_board("ESTADO: temp=42.5,setpoint=50.0,dimmer=128");

        let link = Link::new();
        link.connect_wifi("127.0.0.1", port).unwrap();

        assert_eq!(link.mode(), LinkMode::Wifi);
        assert!(link.auto_reconnect());
        assert_eq!(link.last_known(), Some(("127.0.0.1".to_string(), port)));

        let t = protocol::poll_status(&link).unwrap().unwrap();
        assert_eq!(t.temp_c, 42.5);
        assert_eq!(t.setpoint_c, 50.0);
        assert_eq!(t.output_pct, 50);

        link.send_line("B1").unwrap();

        // A round trip behind the send guarantees the board consumed it
        protocol::poll_status(&link).unwrap();
        assert_eq!(frames.lock().unwrap().as_slice(), &["B1".to_string()]);

        link.disconnect();
        assert_eq!(link.mode(), LinkMode::None);
        assert!(matches!(
            link.send_line("B0"),
            Err(LinkError::NotConnected)
        ));
    }

    #[test]
    fn reopening_closes_previous_handle() {
        let (port_a, _) = spawn_board("ESTADO: temp=20,setpoint=0,dimmer=0");
        let (port_b, _) = spawn_board("ESTADO: temp=20,setpoint=0,dimmer=255");

        let link = Link::new();
        link.connect_wifi("127.0.0.1", port_a).unwrap();
        link.connect_wifi("127.0.0.1", port_b).unwrap();

        // Only the second handle is alive; telemetry comes from board B
        let t = protocol::poll_status(&link).unwrap().unwrap();
        assert_eq!(t.output_pct, 100);
        assert_eq!(link.last_known(), Some(("127.0.0.1".to_string(), port_b)));
    }

    #[test]
    fn gain_upload_is_sequenced() {
        let (port, frames) = spawn_board("ESTADO: temp=20,setpoint=0,dimmer=0");

        let link = Link::new();
        link.connect_wifi("127.0.0.1", port).unwrap();

        protocol::send_gains(&link, 1.5, 0.25, 8.0).unwrap();

        protocol::poll_status(&link).unwrap();
        assert_eq!(
            frames.lock().unwrap().as_slice(),
            &["P1.5".to_string(), "I0.25".to_string(), "D8".to_string()]
        );
    }

    #[test]
    fn gain_upload_aborts_on_dead_link() {
        let link = Link::new();

        assert!(protocol::send_gains(&link, 1.0, 2.0, 3.0).is_err());
    }

    #[test]
    fn peer_close_drops_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            // Accept and hang up immediately
            drop(listener.accept().unwrap());
        });

        let link = Link::new();
        link.connect_wifi("127.0.0.1", port).unwrap();
        server.join().unwrap();

        assert!(link.request_line("GET_ESTADO").is_err());
        assert!(!link.is_connected());
    }

    #[test]
    fn supervisor_reconnects_after_probe() {
        let (port, _) = spawn_board("ESTADO: temp=20,setpoint=0,dimmer=0");

        let link = Link::new();
        link.connect_wifi("127.0.0.1", port).unwrap();

        let mut supervisor = Supervisor::with_period(Duration::ZERO);

        // Never probes while the link is up
        assert!(!supervisor.tick(&link));
        assert_eq!(link.mode(), LinkMode::Wifi);

        link.disconnect();
        assert!(supervisor.tick(&link));
        assert_eq!(link.mode(), LinkMode::Wifi);
    }

    #[test]
    fn supervisor_needs_a_known_endpoint() {
        let link = Link::new();
        let mut supervisor = Supervisor::with_period(Duration::ZERO);

        // Fresh link: auto_reconnect off, no endpoint recorded
        assert!(!supervisor.tick(&link));
    }

    #[test]
    fn supervisor_respects_duty_cycle() {
        let link = Link::new();
        let (port, _) = spawn_board("ESTADO: temp=20,setpoint=0,dimmer=0");

        link.connect_wifi("127.0.0.1", port).unwrap();
        link.disconnect();

        let mut supervisor = Supervisor::with_period(Duration::from_secs(3600));

        // First probe of the window reconnects
        assert!(supervisor.tick(&link));

        // Dropped again inside the same window: nothing happens
        link.disconnect();
        assert!(!supervisor.tick(&link));
        assert_eq!(link.mode(), LinkMode::None);
    }
}
