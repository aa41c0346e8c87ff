//! Readiness rendezvous between the harness and the servers it launches.
//!
//! Every server is configured with the address of a [`ReadinessChannel`] and a
//! token. Once its listeners are open the server connects back and writes a
//! line-oriented status stream:
//!
//! ```text
//! PID <pid> <token>
//! LISTENERS
//! URI=<url> <name>
//! LISTENERS END
//! SLAPD READY
//! ```
//!
//! [`ReadinessChannel::await_start`] blocks until the `PID` line for a given
//! token arrives and hands the rest of the stream to the caller as a
//! [`ReadinessConnection`].

use crate::error::{HarnessError, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Lower bound on the wait for the `PID` line once a server has connected.
const HANDSHAKE_READ_MIN: Duration = Duration::from_millis(500);

/// A listener address reported by a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub url: String,
    pub name: String,
}

/// One line of the status stream that follows the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    ListenersBegin,
    Listener(Listener),
    ListenersEnd,
    Ready,
    Shutdown,
    Other(String),
}

impl StatusLine {
    pub fn parse(line: &str) -> StatusLine {
        let line = line.trim();
        match line {
            "READY" | "SLAPD READY" => StatusLine::Ready,
            "SLAPD SHUTDOWN" | "MODULE STOPPED" => StatusLine::Shutdown,
            "LISTENERS" => StatusLine::ListenersBegin,
            "LISTENERS END" => StatusLine::ListenersEnd,
            _ => match line.strip_prefix("URI=") {
                Some(rest) => {
                    let (url, name) = rest.split_once(' ').unwrap_or((rest, ""));
                    StatusLine::Listener(Listener {
                        url: url.to_string(),
                        name: name.trim().to_string(),
                    })
                }
                None => StatusLine::Other(line.to_string()),
            },
        }
    }
}

/// Parse the first line of the stream: `PID <pid> <token>`.
pub fn parse_handshake(line: &str) -> Result<(u32, String)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        ["PID", pid, token] => {
            let pid = pid.parse::<u32>().map_err(|e| HarnessError::Protocol {
                context: "readiness handshake".to_string(),
                reason: format!("invalid pid '{pid}': {e}"),
            })?;
            Ok((pid, token.to_string()))
        }
        _ => Err(HarnessError::Protocol {
            context: "readiness handshake".to_string(),
            reason: format!("unexpected response '{}'", line.trim()),
        }),
    }
}

/// The status stream of one server, owned by the instance it belongs to.
#[derive(Debug)]
pub struct ReadinessConnection {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl ReadinessConnection {
    /// Read the next status line; `None` once the server closed the stream.
    pub fn read_status(&mut self) -> Result<Option<StatusLine>> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(StatusLine::parse(&line))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(HarnessError::Timeout {
                    context: format!("reading status from {}", self.peer),
                    waited: self
                        .reader
                        .get_ref()
                        .read_timeout()
                        .ok()
                        .flatten()
                        .unwrap_or_default(),
                })
            }
            Err(e) => Err(HarnessError::from_io_error(e, "readiness stream")),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|e| HarnessError::from_io_error(e, "readiness stream timeout"))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn close(self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }
}

/// Process-wide listening socket that launched servers report back to.
pub struct ReadinessChannel {
    listener: TcpListener,
    address: SocketAddr,
    pending: Mutex<HashSet<String>>,
}

/// Releases a pending token registration on every exit path.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    token: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.token);
    }
}

impl ReadinessChannel {
    /// Bind the channel; port 0 lets the OS choose.
    pub fn open(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| HarnessError::from_io_error(e, "binding readiness channel"))?;
        let address = listener
            .local_addr()
            .map_err(|e| HarnessError::from_io_error(e, "readiness channel address"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| HarnessError::from_io_error(e, "readiness channel setup"))?;

        debug!("Readiness channel listening on {address}");
        Ok(Self {
            listener,
            address,
            pending: Mutex::new(HashSet::new()),
        })
    }

    /// Host advertised to servers.
    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    /// Port advertised to servers.
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether a handshake for `token` is currently being awaited.
    pub fn is_pending(&self, token: &str) -> bool {
        self.pending.lock().contains(token)
    }

    fn register(&self, token: &str) -> Result<PendingGuard<'_>> {
        let mut pending = self.pending.lock();
        if !pending.insert(token.to_string()) {
            return Err(HarnessError::ConcurrencyUnsupported {
                token: token.to_string(),
            });
        }
        Ok(PendingGuard {
            pending: &self.pending,
            token: token.to_string(),
        })
    }

    /// Block until a server announces itself with `token`.
    ///
    /// Returns the status stream positioned after the handshake line together
    /// with the pid the server reported. A connection announcing any other
    /// token, or sending anything but a `PID` line, is a protocol error; the
    /// connection is closed and the start attempt fails.
    #[tracing::instrument(level = "debug", skip(self), fields(channel = %self.address))]
    pub fn await_start(
        &self,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<(ReadinessConnection, u32)> {
        let _guard = self.register(token)?;
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let (stream, peer) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(HarnessError::Timeout {
                                context: format!("waiting for server '{token}' to connect"),
                                waited: started.elapsed(),
                            });
                        }
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HarnessError::from_io_error(e, "readiness accept")),
            }
        };

        stream
            .set_nonblocking(false)
            .map_err(|e| HarnessError::from_io_error(e, "readiness connection setup"))?;
        let remaining = deadline.map(|d| {
            d.saturating_duration_since(Instant::now())
                .max(HANDSHAKE_READ_MIN)
        });
        stream
            .set_read_timeout(remaining)
            .map_err(|e| HarnessError::from_io_error(e, "readiness connection setup"))?;

        let mut connection = ReadinessConnection {
            reader: BufReader::new(stream),
            peer,
        };

        let mut line = String::new();
        let read = connection.reader.read_line(&mut line);
        let (pid, announced) = match read {
            Ok(0) => Err(HarnessError::Protocol {
                context: "readiness handshake".to_string(),
                reason: format!("{peer} closed the connection before identifying itself"),
            }),
            Ok(_) => parse_handshake(&line),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(HarnessError::Timeout {
                    context: format!("waiting for handshake from {peer}"),
                    waited: started.elapsed(),
                })
            }
            Err(e) => Err(HarnessError::from_io_error(e, "readiness handshake")),
        }
        .inspect_err(|_| warn!("Rejected readiness connection from {peer}"))?;

        if announced != token {
            connection.close();
            return Err(HarnessError::Protocol {
                context: "readiness handshake".to_string(),
                reason: format!(
                    "expected token '{token}', server {pid} announced '{announced}'"
                ),
            });
        }

        connection.set_read_timeout(None)?;
        debug!("Server {pid} completed handshake for token {token}");
        Ok((connection, pid))
    }
}
