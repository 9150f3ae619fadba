//! Request façade over one subprocess connection.
//!
//! Allocates monotonically increasing request ids, encodes request frames,
//! and pairs each outgoing request with the handler that will receive its
//! response. The handler is registered *before* the frame is written, so a
//! response cannot arrive faster than the registration that would catch it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Error;
use crate::listener::{Handler, HandlerRegistry};
use crate::process::Transport;
use crate::protocol::{encode_request, Arg, Packet};

/// Default deadline for the blocking calling convention.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Encodes and sends requests over one connection, correlating responses by
/// request id.
///
/// Two calling conventions are offered: [`send`](Connection::send) registers
/// a callback and returns immediately, and [`call`](Connection::call) blocks
/// until the response arrives or the timeout elapses.
pub struct Connection {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    next_id: AtomicU64,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            transport,
            registry,
            next_id: AtomicU64::new(0),
        }
    }

    /// Send a request, optionally registering a handler for its response.
    ///
    /// Allocates the next request id (monotonic, never reused for the life of
    /// the connection) and returns it. If the write fails, the handler is
    /// withdrawn before the error propagates.
    pub fn send(&self, code: char, args: &[Arg], handler: Option<Handler>) -> Result<u64, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_request(code, id, args)?;

        // Register before writing: a response can never outrun its handler.
        let registered = handler.is_some();
        if let Some(h) = handler {
            self.registry.register(id, h);
        }

        debug!("sending request '{}' id {}", code.to_ascii_uppercase(), id);
        if let Err(e) = self.transport.write(&frame) {
            if registered {
                self.registry.take(id);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Send a request and block until its response arrives.
    ///
    /// Returns the request id together with the response packet. On timeout
    /// the registered handler stays in place, delivering any late response
    /// into a discarded channel; that response is ignored.
    pub fn call(&self, code: char, args: &[Arg], timeout: Duration) -> Result<(u64, Packet), Error> {
        let (tx, rx) = mpsc::channel();
        let id = self.send(
            code,
            args,
            Some(Box::new(move |packet| {
                // A late response lands on a dropped receiver; ignore it.
                let _ = tx.send(packet);
                Ok(())
            })),
        )?;

        match rx.recv_timeout(timeout) {
            Ok(packet) => Ok((id, packet)),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::dispatch;
    use crate::protocol::Token;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    /// Transport that records written frames and never responds.
    #[derive(Default)]
    struct SinkTransport {
        written: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl Transport for SinkTransport {
        fn write(&self, bytes: &[u8]) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Process("pipe closed".into()));
            }
            self.written.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
        fn is_alive(&self) -> bool {
            !self.fail
        }
        fn terminate(&self) {}
    }

    fn response_packet(rid: u64) -> Packet {
        let mut p = Packet::new();
        p.push(Token::Code('T'));
        p.push(Token::Text(rid.to_string()));
        p.push(Token::Code('t'));
        p
    }

    #[test]
    fn test_ids_monotonic_and_frames_written() {
        let transport = Arc::new(SinkTransport::default());
        let registry = Arc::new(HandlerRegistry::new());
        let conn = Connection::new(transport.clone(), registry);

        assert_eq!(conn.send('T', &[Arg::Int(1)], None).unwrap(), 0);
        assert_eq!(conn.send('T', &[Arg::Int(2)], None).unwrap(), 1);
        assert_eq!(conn.send('O', &[], None).unwrap(), 2);

        let written = transport.written.lock().unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0], b"\x1bT0\x1b,1\x1bt".to_vec());
        assert_eq!(written[2], b"\x1bO2\x1bo".to_vec());
    }

    /// Transport that delivers the response during the write itself, the
    /// fastest a subprocess could possibly answer.
    struct EchoTransport {
        registry: Arc<HandlerRegistry>,
        next_rid: AtomicU64,
    }

    impl Transport for EchoTransport {
        fn write(&self, _bytes: &[u8]) -> Result<(), Error> {
            let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
            dispatch(&self.registry, response_packet(rid)).unwrap();
            Ok(())
        }
        fn is_alive(&self) -> bool {
            true
        }
        fn terminate(&self) {}
    }

    #[test]
    fn test_handler_registered_before_write() {
        // If registration happened after the write, this instant response
        // would be dropped and the call would time out.
        let registry = Arc::new(HandlerRegistry::new());
        let transport = Arc::new(EchoTransport {
            registry: Arc::clone(&registry),
            next_rid: AtomicU64::new(0),
        });
        let conn = Connection::new(transport, registry);

        let (id, packet) = conn
            .call('T', &[Arg::Int(5)], Duration::from_secs(2))
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(packet.opening_code().unwrap(), 'T');
    }

    #[test]
    fn test_call_timeout_is_bounded() {
        let transport = Arc::new(SinkTransport::default());
        let registry = Arc::new(HandlerRegistry::new());
        let conn = Connection::new(transport, registry);

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let result = conn.call('T', &[], timeout);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(elapsed >= timeout, "returned before the deadline");
        assert!(elapsed < timeout + Duration::from_secs(1), "blocked too long");
    }

    #[test]
    fn test_call_receives_response_from_another_thread() {
        let transport = Arc::new(SinkTransport::default());
        let registry = Arc::new(HandlerRegistry::new());
        let conn = Connection::new(transport, Arc::clone(&registry));

        let responder = Arc::clone(&registry);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            dispatch(&responder, response_packet(0)).unwrap();
        });

        let (id, packet) = conn.call('T', &[], Duration::from_secs(5)).unwrap();
        assert_eq!(id, 0);
        assert_eq!(packet.response_id().unwrap(), 0);
    }

    #[test]
    fn test_failed_write_withdraws_handler() {
        let transport = Arc::new(SinkTransport {
            written: Mutex::new(Vec::new()),
            fail: true,
        });
        let registry = Arc::new(HandlerRegistry::new());
        let conn = Connection::new(transport, Arc::clone(&registry));

        let result = conn.send('T', &[], Some(Box::new(|_| Ok(()))));
        assert!(matches!(result, Err(Error::Process(_))));
        assert!(!registry.contains(0));
    }
}
