//! # UDP Packet Receiver
//!
//! Receives spectral packets on a dedicated thread and hands each decoded
//! [`Spectrum`] to a channel without ever blocking the caller.
//!
//! The receive thread waits in `poll(2)` on two descriptors: the UDP
//! socket and the read end of a socket pair. `stop` writes a byte into the
//! pair, so the loop wakes and exits immediately whatever the packet rate.
//!
//! ## Wire format
//! A datagram is read as big-endian `u16` samples from its first byte.
//! At most `spectrum_len` samples are kept; an odd trailing byte and
//! anything past the last kept sample are ignored. Datagrams shorter than
//! one sample are dropped.
//!
//! Every successful `start` opens a new session id, and packets carry the id
//! of the session that read them.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use filedescriptor::{AsRawSocketDescriptor, FileDescriptor, POLLIN, pollfd};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::log_context::LogContext;
use crate::spectrum::Spectrum;
use crate::worker::Worker;

const SOURCE: &str = "receiver";

/// Datagrams read per readiness wakeup before the stop flag is checked again.
const MAX_DATAGRAMS_PER_WAKE: usize = 64;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// What the receive thread reports.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    Packet { session: u64, spectrum: Spectrum },
    Status(String),
    Error(String),
}

/// Decodes one datagram into a spectrum of at most `max_samples` values.
pub fn decode_datagram(datagram: &[u8], max_samples: usize) -> Option<Spectrum> {
    let count = (datagram.len() / 2).min(max_samples);
    if count == 0 {
        return None;
    }
    let samples = datagram
        .chunks_exact(2)
        .take(count)
        .map(|pair| f64::from(u16::from_be_bytes([pair[0], pair[1]])))
        .collect();
    Some(Spectrum::new(samples))
}

/// Resolves a textual bind address; empty means every IPv4 interface.
pub fn resolve_bind_address(bind_address: &str, port: u16) -> Result<SocketAddr> {
    let trimmed = bind_address.trim();
    let ip: IpAddr = if trimmed.is_empty() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        trimmed
            .parse()
            .map_err(|_| Error::InvalidBindAddress(trimmed.to_string()))?
    };
    Ok(SocketAddr::new(ip, port))
}

pub struct PacketReceiver {
    max_samples: usize,
    datagram_capacity: usize,
    recv_buffer_bytes: usize,
    join_timeout: Duration,
    log: LogContext,
    active: Option<ActiveLoop>,
}

struct ActiveLoop {
    session: u64,
    running: Arc<AtomicBool>,
    wake: FileDescriptor,
    local_addr: SocketAddr,
    worker: Worker,
}

impl PacketReceiver {
    pub fn new(config: &PipelineConfig, log: LogContext) -> Self {
        Self {
            max_samples: config.spectrum_len,
            datagram_capacity: config.datagram_capacity(),
            recv_buffer_bytes: config.recv_buffer_bytes,
            join_timeout: config.join_timeout(),
            log,
            active: None,
        }
    }

    /// Binds the socket and starts the receive thread.
    ///
    /// Returns the bound address (useful with port 0). On failure nothing is
    /// left running and the error is also sent as [`ReceiverEvent::Error`].
    pub fn start<M>(&mut self, port: u16, bind_address: &str, events: Sender<M>) -> Result<SocketAddr>
    where
        M: From<ReceiverEvent> + Send + 'static,
    {
        if self.is_running() {
            let _ = events.send(ReceiverEvent::Status("UDP receiving is already running".into()).into());
            return Err(Error::AlreadyRunning);
        }
        // A loop that ended on its own still holds its wakeup pair.
        self.stop();

        match self.spawn_loop(port, bind_address, events.clone()) {
            Ok(addr) => {
                let message = format!("UDP receiving started on {addr}");
                self.log.info(SOURCE, message.clone());
                let _ = events.send(ReceiverEvent::Status(message).into());
                Ok(addr)
            }
            Err(err) => {
                let message = error_chain(&err);
                self.log.error(SOURCE, message.clone());
                let _ = events.send(ReceiverEvent::Error(message).into());
                Err(err)
            }
        }
    }

    fn spawn_loop<M>(&mut self, port: u16, bind_address: &str, events: Sender<M>) -> Result<SocketAddr>
    where
        M: From<ReceiverEvent> + Send + 'static,
    {
        let addr = resolve_bind_address(bind_address, port)?;
        let socket = bind_socket(addr, self.recv_buffer_bytes, &self.log)?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        let (wake, mut wake_rx) = filedescriptor::socketpair().map_err(Error::Wakeup)?;
        wake_rx.set_non_blocking(true).map_err(Error::Wakeup)?;

        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let running = Arc::new(AtomicBool::new(true));
        let receive_loop = ReceiveLoop {
            session,
            socket,
            wake_rx,
            running: running.clone(),
            max_samples: self.max_samples,
            buffer: vec![0u8; self.datagram_capacity],
            log: self.log.clone(),
        };
        let worker = Worker::spawn("udp-receiver", move || receive_loop.run(events))?;

        self.active = Some(ActiveLoop {
            session,
            running,
            wake,
            local_addr,
            worker,
        });
        Ok(local_addr)
    }

    /// Stops the receive thread and releases the socket. Safe to call twice.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.running.store(false, Ordering::Release);
        if let Err(e) = active.wake.write_all(&[1]) {
            // The loop already exited and closed its end.
            self.log.debug(SOURCE, format!("wakeup write failed: {e}"));
        }
        active.worker.join(self.join_timeout, &self.log);
    }

    /// Whether the receive thread is alive.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.running.load(Ordering::Acquire) && !a.worker.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.local_addr)
    }

    /// Id stamped on the packets of the current session.
    pub fn session(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.session)
    }
}

impl Drop for PacketReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(addr: SocketAddr, recv_buffer_bytes: usize, log: &LogContext) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(|source| Error::SocketOption {
            option: "SO_REUSEADDR",
            source,
        })?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
        log.warn(SOURCE, format!("could not enlarge receive buffer: {e}"));
    }
    socket
        .set_nonblocking(true)
        .map_err(|source| Error::SocketOption {
            option: "O_NONBLOCK",
            source,
        })?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::Bind { addr, source })?;
    Ok(socket.into())
}

fn error_chain(err: &Error) -> String {
    match std::error::Error::source(err) {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    }
}

fn is_interrupted(err: &filedescriptor::Error) -> bool {
    match err {
        filedescriptor::Error::Poll(e) | filedescriptor::Error::Io(e) => {
            e.kind() == io::ErrorKind::Interrupted
        }
        _ => false,
    }
}

/// State owned by the receive thread. Dropping it closes the socket and
/// the wakeup read end, whichever way the loop exits.
struct ReceiveLoop {
    session: u64,
    socket: UdpSocket,
    wake_rx: FileDescriptor,
    running: Arc<AtomicBool>,
    max_samples: usize,
    buffer: Vec<u8>,
    log: LogContext,
}

impl ReceiveLoop {
    fn run<M: From<ReceiverEvent>>(mut self, events: Sender<M>) {
        while self.running.load(Ordering::Acquire) {
            let mut fds = [
                pollfd {
                    fd: self.socket.as_socket_descriptor(),
                    events: POLLIN,
                    revents: 0,
                },
                pollfd {
                    fd: self.wake_rx.as_socket_descriptor(),
                    events: POLLIN,
                    revents: 0,
                },
            ];

            match filedescriptor::poll(&mut fds, None) {
                Ok(_) => {}
                Err(err) if is_interrupted(&err) => continue,
                Err(err) => {
                    let message = format!("poll failed: {err}");
                    self.running.store(false, Ordering::Release);
                    self.log.error(SOURCE, message.clone());
                    let _ = events.send(ReceiverEvent::Error(message).into());
                    break;
                }
            }

            if fds[1].revents != 0 {
                self.drain_wakeup();
                break;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if fds[0].revents == 0 {
                continue;
            }
            if !self.read_datagrams(&events) {
                self.log.debug(SOURCE, "packet consumer went away");
                break;
            }
        }

        self.running.store(false, Ordering::Release);
        self.log.info(SOURCE, "UDP receiving stopped");
        let _ = events.send(ReceiverEvent::Status("UDP receiving stopped".into()).into());
    }

    /// Reads what is queued on the socket. Returns `false` once the
    /// consumer side of the channel is gone.
    fn read_datagrams<M: From<ReceiverEvent>>(&mut self, events: &Sender<M>) -> bool {
        for _ in 0..MAX_DATAGRAMS_PER_WAKE {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, _peer)) => {
                    let Some(spectrum) = decode_datagram(&self.buffer[..len], self.max_samples) else {
                        continue;
                    };
                    let packet = ReceiverEvent::Packet {
                        session: self.session,
                        spectrum,
                    };
                    if events.send(packet.into()).is_err() {
                        return false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.log.warn(SOURCE, format!("recv failed: {e}"));
                    break;
                }
            }
        }
        true
    }

    fn drain_wakeup(&mut self) {
        let mut scratch = [0u8; 16];
        while let Ok(n) = self.wake_rx.read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}
