//! Frame reader and packet dispatcher.
//!
//! A dedicated pump thread drains the compiler's stdout into a byte channel.
//! The [`FrameReader`] polls that channel with a short timeout so the stop
//! flag is observed with bounded latency, and assembles bytes into
//! [`Packet`]s using the escape-marker framing rules. The [`PacketListener`]
//! runs the dispatch loop on its own background thread: consume the startup
//! handshake once, then read packets and deliver each response to the
//! handlers registered for its request id, exactly once.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::protocol::{Packet, Token, ESC};

/// How long a read waits for a byte before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A response callback, invoked on the dispatcher thread with its own copy of
/// the packet. Must decode and return quickly; long work stalls every pending
/// request.
pub type Handler = Box<dyn FnOnce(Packet) -> Result<(), Error> + Send + 'static>;

/// Internal read outcome: the listener was asked to stop or hit end of
/// stream. Never surfaced to callers; blocked synchronous waiters simply time
/// out.
#[derive(Debug)]
pub(crate) enum ReadError {
    Killed,
    Protocol(Error),
}

/// Pending-request registry shared between the dispatcher and caller threads.
///
/// Handlers are always stored as an ordered list under their request id, and
/// [`take`](HandlerRegistry::take) removes the whole list atomically, so a
/// response is delivered at most once no matter how threads interleave.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<u64, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `id`, appending to any already present.
    pub fn register(&self, id: u64, handler: Handler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.entry(id).or_default().push(handler);
    }

    /// Remove and return all handlers for `id`.
    pub fn take(&self, id: u64) -> Option<Vec<Handler>> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&id)
    }

    /// Whether any handler is registered under `id`.
    pub fn contains(&self, id: u64) -> bool {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(&id)
    }
}

/// Assembles a byte stream into packets.
///
/// Bytes arrive over a channel fed by the pump thread; `stop` aborts any
/// blocked read within one poll interval.
pub struct FrameReader {
    rx: Receiver<u8>,
    stop: Arc<AtomicBool>,
}

impl FrameReader {
    pub fn new(rx: Receiver<u8>, stop: Arc<AtomicBool>) -> Self {
        Self { rx, stop }
    }

    /// Read one byte, polling so the stop flag is honored promptly.
    fn read1(&mut self) -> Result<u8, ReadError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(ReadError::Killed);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(b) => return Ok(b),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // EOF: the pump thread exited.
                    self.stop.store(true, Ordering::SeqCst);
                    return Err(ReadError::Killed);
                }
            }
        }
    }

    /// Discard non-protocol output up to and including the next escape byte.
    pub(crate) fn read_until_esc(&mut self) -> Result<(), ReadError> {
        while self.read1()? != ESC {}
        Ok(())
    }

    /// Read one complete packet.
    ///
    /// With `expect_esc`, the stream must begin with the escape byte; without
    /// it, the escape has already been consumed and the next byte is the
    /// opening code. The packet closes when the lowercase of its opening code
    /// is seen. Plain bytes accumulate into text tokens; every escape flushes
    /// the pending text (possibly empty) before pushing the code token, so
    /// codes and text strictly alternate.
    pub(crate) fn read_packet(&mut self, expect_esc: bool) -> Result<Packet, ReadError> {
        let mut packet = Packet::new();

        let code = if expect_esc {
            let c = self.read1()?;
            if c != ESC {
                return Err(ReadError::Protocol(Error::protocol(format!(
                    "expected escape byte, got: 0x{:02x}",
                    c
                ))));
            }
            self.read1()?
        } else {
            self.read1()?
        };
        let closing = (code as char).to_ascii_lowercase();
        packet.push(Token::Code(code as char));

        let mut buf: Vec<u8> = Vec::new();
        loop {
            let b = self.read1()?;
            if b == ESC {
                let c = self.read1()? as char;
                packet.push(Token::Text(String::from_utf8_lossy(&buf).into_owned()));
                buf.clear();
                packet.push(Token::Code(c));
                if c == closing {
                    return Ok(packet);
                }
            } else {
                buf.push(b);
            }
        }
    }
}

/// Deliver a response packet to the handlers registered for its request id.
///
/// Non-response packets are ignored. An id with no registered handlers is
/// logged and dropped. Each handler receives an independent copy of the
/// packet, and a failure inside one handler is caught and logged so a bad
/// packet cannot stop delivery of subsequent ones.
pub(crate) fn dispatch(registry: &HandlerRegistry, packet: Packet) -> Result<(), Error> {
    if !packet.is_response()? {
        debug!("ignoring non-response packet '{}'", packet.opening_code()?);
        return Ok(());
    }
    let rid = packet.response_id()?;
    match registry.take(rid) {
        Some(handlers) => {
            debug!("dispatching response for request {}", rid);
            for handler in handlers {
                if let Err(e) = handler(packet.clone()) {
                    warn!("response handler for request {} failed: {}", rid, e);
                }
            }
        }
        None => {
            warn!("dropping response for unregistered request id {}", rid);
        }
    }
    Ok(())
}

/// Background dispatch loop for one subprocess connection.
///
/// Owns the stop flag; [`kill`](PacketListener::kill) stops the loop within
/// one poll interval. Dropping the listener kills and joins it.
pub struct PacketListener {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PacketListener {
    /// Spawn the pump and dispatch threads over the compiler's output stream.
    ///
    /// The protocol version from the startup handshake is stored into
    /// `version` once consumed.
    pub fn spawn<R>(
        output: R,
        registry: Arc<HandlerRegistry>,
        version: Arc<Mutex<Option<String>>>,
    ) -> Self
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<u8>();

        // Pump thread: blocking reads from the pipe into the byte channel.
        // It exits on EOF or when the reader side goes away; it is detached
        // because a blocking read can only be unwound by closing the pipe.
        thread::spawn(move || {
            let mut output = output;
            let mut buf = [0u8; 4096];
            loop {
                match output.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for &b in &buf[..n] {
                            if tx.send(b).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("compiler output read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let reader = FrameReader::new(rx, Arc::clone(&stop));
        let loop_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            listen_loop(reader, loop_stop, registry, version);
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Request the dispatch loop to stop. Observed within one poll interval.
    pub fn kill(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for PacketListener {
    fn drop(&mut self) {
        self.kill();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn listen_loop(
    mut reader: FrameReader,
    stop: Arc<AtomicBool>,
    registry: Arc<HandlerRegistry>,
    version: Arc<Mutex<Option<String>>>,
) {
    // The handshake packet must be consumed once before any request traffic.
    match read_handshake(&mut reader) {
        Ok(v) => {
            info!("poly ide protocol version: {}", v);
            *version.lock().unwrap_or_else(|e| e.into_inner()) = Some(v);
        }
        Err(ReadError::Killed) => {
            debug!("listener killed before handshake");
            return;
        }
        Err(ReadError::Protocol(e)) => {
            error!("bad handshake from compiler: {}", e);
            return;
        }
    }

    while !stop.load(Ordering::SeqCst) {
        // Skip any non-protocol output the compiler interleaves.
        if reader.read_until_esc().is_err() {
            break;
        }
        let packet = match reader.read_packet(false) {
            Ok(p) => p,
            Err(ReadError::Killed) => break,
            Err(ReadError::Protocol(e)) => {
                // Localized: resynchronize at the next escape byte.
                warn!("malformed packet: {}", e);
                continue;
            }
        };
        if let Err(e) = dispatch(&registry, packet) {
            warn!("failed to dispatch packet: {}", e);
        }
    }
    debug!("listener stopped");
}

fn read_handshake(reader: &mut FrameReader) -> Result<String, ReadError> {
    let mut packet = reader.read_packet(true)?;
    let decode = |p: &mut Packet| -> Result<String, Error> {
        p.pop_code('H')?;
        let version = p.pop_str()?;
        p.pop_code('h')?;
        Ok(version)
    };
    decode(&mut packet).map_err(ReadError::Protocol)
}
