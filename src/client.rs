//! High-level compiler client.
//!
//! [`Poly`] owns the subprocess session (process, listener, connection) and
//! exposes the operations an editor integration needs: compile a file with a
//! prelude, cancel a compile, and query the parse tree of the last successful
//! compile for the node at a position, its type, and its declaration site.
//!
//! The subprocess is started lazily on first use and respawned on the next
//! call after it dies; respawning discards every tracked parse-tree handle,
//! since handles reference process-local state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::compile::{
    decode_compile_response, normalize_whitespace, CompileResult, Location, ResultCode,
};
use crate::connection::{Connection, DEFAULT_TIMEOUT};
use crate::error::Error;
use crate::listener::{Handler, HandlerRegistry, PacketListener};
use crate::process::{PolyProcess, Transport};
use crate::protocol::{Arg, Packet, Token};

/// A parse-tree node returned by [`Poly::node_at_position`].
///
/// Valid only until the owning file's next successful compile. The capability
/// letters name the follow-up queries the compiler supports for this node;
/// each node owns its own capability collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub file: PathBuf,
    pub parse_tree: String,
    pub start: u64,
    pub end: u64,
    commands: Vec<char>,
}

impl Node {
    /// Whether the compiler advertised the given query letter for this node.
    pub fn supports(&self, command: char) -> bool {
        self.commands.contains(&command)
    }
}

/// Where a declaration was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// The declaration lies in a file with a tracked parse tree; further
    /// queries can chain off the node.
    Local(Node),
    /// The declaration lies outside any tracked file.
    External(Location),
}

/// One live subprocess connection.
struct Session {
    process: Arc<PolyProcess>,
    connection: Arc<Connection>,
    version: Arc<Mutex<Option<String>>>,
    listener: PacketListener,
}

/// Client for one Poly/ML compiler in IDE-protocol mode.
///
/// Cloned `Arc`s of the internal state let compile callbacks outlive the
/// calling frame; the client itself is meant to be constructed once by the
/// host application and shared by reference.
///
/// # Example
/// ```no_run
/// use polyml_ide::client::Poly;
/// use std::path::Path;
///
/// let poly = Poly::new("/usr/local/bin/poly");
/// let result = poly.compile_sync(
///     Path::new("-scratch-"),
///     "",
///     "fun p x y = x + y\n",
///     std::time::Duration::from_secs(5),
/// )?;
/// println!("{}", result.code);
/// # Ok::<(), polyml_ide::Error>(())
/// ```
pub struct Poly {
    poly_bin: PathBuf,
    timeout: Duration,
    session: Mutex<Option<Session>>,
    compiling: Arc<AtomicBool>,
    parse_trees: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl Poly {
    pub fn new(poly_bin: impl Into<PathBuf>) -> Self {
        Self {
            poly_bin: poly_bin.into(),
            timeout: DEFAULT_TIMEOUT,
            session: Mutex::new(None),
            compiling: Arc::new(AtomicBool::new(false)),
            parse_trees: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the deadline used by the synchronous node queries.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Protocol version from the startup handshake, once consumed.
    pub fn protocol_version(&self) -> Option<String> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().and_then(|s| {
            s.version
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    /// Whether a compile is currently outstanding.
    ///
    /// Callers should check this before retrying after
    /// [`Error::CompileInProgress`].
    pub fn compile_in_progress(&self) -> bool {
        self.compiling.load(Ordering::SeqCst)
    }

    /// Whether the compiler subprocess is currently running.
    fn process_alive(&self) -> bool {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map_or(false, |s| s.process.is_alive())
    }

    /// Whether `file` has a successful compile on record.
    pub fn has_built(&self, file: &Path) -> bool {
        self.parse_trees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(file)
    }

    /// Return the live connection, spawning or respawning the compiler as
    /// needed. A respawn drops every tracked parse-tree handle.
    fn ensure_running(&self) -> Result<Arc<Connection>, Error> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(s) = session.as_ref() {
            if s.process.is_alive() {
                return Ok(Arc::clone(&s.connection));
            }
            info!("compiler died; respawning");
        }

        if session.take().is_some() {
            // Handles reference state inside the dead process.
            self.parse_trees
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }

        let (process, stdout) = PolyProcess::spawn(&self.poly_bin)?;
        let process = Arc::new(process);
        let registry = Arc::new(HandlerRegistry::new());
        let version = Arc::new(Mutex::new(None));
        let listener =
            PacketListener::spawn(stdout, Arc::clone(&registry), Arc::clone(&version));
        let connection = Arc::new(Connection::new(
            Arc::clone(&process) as Arc<dyn Transport>,
            registry,
        ));

        let conn = Arc::clone(&connection);
        *session = Some(Session {
            process,
            connection,
            version,
            listener,
        });
        Ok(conn)
    }

    /// Compile `source` with `prelude` run first, delivering the outcome to
    /// `callback` when the response arrives.
    ///
    /// Returns the request id. At most one compile may be outstanding; a
    /// second request while one is in flight fails immediately with
    /// [`Error::CompileInProgress`] and leaves the first undisturbed.
    pub fn compile<F>(
        &self,
        file: &Path,
        prelude: &str,
        source: &str,
        callback: F,
    ) -> Result<u64, Error>
    where
        F: FnOnce(Result<CompileResult, Error>) + Send + 'static,
    {
        if self
            .compiling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.process_alive() {
                return Err(Error::CompileInProgress);
            }
            // The compiler died with a compile outstanding; its response
            // will never arrive to clear the flag. Reclaim it and respawn,
            // abandoning the orphaned compile.
            info!("compiler died mid-compile; reclaiming in-flight state");
            self.compiling.store(true, Ordering::SeqCst);
        }

        let connection = match self.ensure_running() {
            Ok(c) => c,
            Err(e) => {
                self.compiling.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let file_name = file.to_string_lossy().into_owned();
        let args = [
            Arg::text(file_name.clone()),
            Arg::Int(0),
            Arg::Int(prelude.len() as u64),
            Arg::Int(source.len() as u64),
            Arg::text(prelude),
            Arg::text(source),
        ];

        debug!("compiling {} ({} bytes)", file_name, source.len());

        let compiling = Arc::clone(&self.compiling);
        let parse_trees = Arc::clone(&self.parse_trees);
        let key = file.to_path_buf();

        let handler: Handler = Box::new(move |packet: Packet| {
            // Clear the in-flight flag first so the callback may compile again.
            compiling.store(false, Ordering::SeqCst);

            // Dispatch already correlated this packet by id.
            let id = packet.response_id()?;
            let outcome = decode_compile_response(packet, id);
            match outcome {
                Ok((handle, result)) => {
                    // Only a successful compile produces a handle worth
                    // querying against.
                    if result.code == ResultCode::Success {
                        parse_trees
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(key, handle);
                    }
                    callback(Ok(result));
                    Ok(())
                }
                Err(e) => {
                    let msg = e.to_string();
                    callback(Err(e));
                    Err(Error::Protocol(msg))
                }
            }
        });

        match connection.send('R', &args, Some(handler)) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.compiling.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Compile and block until the outcome arrives or `timeout` elapses.
    pub fn compile_sync(
        &self,
        file: &Path,
        prelude: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<CompileResult, Error> {
        let (tx, rx) = mpsc::channel();
        self.compile(file, prelude, source, move |outcome| {
            // A late outcome lands on a dropped receiver; ignore it.
            let _ = tx.send(outcome);
        })?;
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Ask the compiler to cancel the compile with request id `rid`.
    ///
    /// Fire-and-forget; the cancelled compile still completes its response
    /// (result code Cancelled) through the normal path.
    pub fn cancel_compile(&self, rid: u64) -> Result<(), Error> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match session.as_ref() {
            Some(s) => s.connection.send('K', &[Arg::Int(rid)], None).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Find the parse-tree node covering `offset` in `file`.
    ///
    /// Fails with [`Error::NoParseTree`] if the file has no successful
    /// compile on record.
    pub fn node_at_position(&self, file: &Path, offset: u64) -> Result<Node, Error> {
        let handle = self
            .parse_trees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file)
            .cloned()
            .ok_or_else(|| Error::NoParseTree(file.to_path_buf()))?;

        let connection = self.ensure_running()?;
        let (id, packet) = connection.call(
            'O',
            &[Arg::text(handle), Arg::Int(offset), Arg::Int(offset)],
            self.timeout,
        )?;
        decode_node_response(packet, id, file)
    }

    /// The inferred type of `node`, or `None` when the compiler did not
    /// advertise type queries for it.
    pub fn type_of_node(&self, node: &Node) -> Result<Option<String>, Error> {
        if !node.supports('T') {
            return Ok(None);
        }
        let connection = self.ensure_running()?;
        let (id, packet) = connection.call(
            'T',
            &[
                Arg::text(node.parse_tree.clone()),
                Arg::Int(node.start),
                Arg::Int(node.end),
            ],
            self.timeout,
        )?;
        decode_type_response(packet, id)
    }

    /// The declaration site of `node`, or `None` when the compiler did not
    /// advertise declaration queries for it.
    ///
    /// When the declaration lies in a file whose parse tree is tracked, the
    /// location is upgraded to a full node via a chained position query.
    pub fn declaration_of_node(&self, node: &Node) -> Result<Option<Declaration>, Error> {
        if !node.supports('I') {
            return Ok(None);
        }
        let connection = self.ensure_running()?;
        let (id, packet) = connection.call(
            'I',
            &[
                Arg::text(node.parse_tree.clone()),
                Arg::Int(node.start),
                Arg::Int(node.end),
            ],
            self.timeout,
        )?;
        let location = decode_declaration_response(packet, id)?;

        let decl_file = PathBuf::from(&location.file);
        if self.has_built(&decl_file) {
            let node = self.node_at_position(&decl_file, location.start)?;
            Ok(Some(Declaration::Local(node)))
        } else {
            Ok(Some(Declaration::External(location)))
        }
    }

    /// Stop the listener and terminate the compiler, if running.
    pub fn shutdown(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = session.take() {
            debug!("shutting down compiler session");
            s.listener.kill();
            s.process.terminate();
        }
    }
}

impl Drop for Poly {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode an 'O' response into a node for `file`.
fn decode_node_response(mut packet: Packet, expected_id: u64, file: &Path) -> Result<Node, Error> {
    packet.pop_code('O')?;
    let rid = packet.pop_int()?;
    if rid != expected_id {
        return Err(Error::protocol(format!(
            "node response id {} does not match request {}",
            rid, expected_id
        )));
    }
    packet.pop_code(',')?;
    let parse_tree = packet.pop_str()?;
    packet.pop_code(',')?;
    let start = packet.pop_int()?;
    packet.pop_code(',')?;
    let end = packet.pop_int()?;

    // The capability letters follow as bare codes up to the closing 'o';
    // the empty text tokens between them are protocol artifacts.
    let mut commands = Vec::new();
    loop {
        match packet.pop()? {
            Token::Code('o') => break,
            Token::Code(c) => commands.push(c),
            Token::Text(_) => {}
        }
    }

    Ok(Node {
        file: file.to_path_buf(),
        parse_tree,
        start,
        end,
        commands,
    })
}

/// Decode a 'T' response; an empty type string means the compiler had no
/// answer.
fn decode_type_response(mut packet: Packet, expected_id: u64) -> Result<Option<String>, Error> {
    packet.pop_code('T')?;
    let rid = packet.pop_int()?;
    if rid != expected_id {
        return Err(Error::protocol(format!(
            "type response id {} does not match request {}",
            rid, expected_id
        )));
    }
    packet.pop_code(',')?;
    let text = normalize_whitespace(&packet.pop_str()?);
    packet.pop_code('t')?;
    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Decode an 'I' response into the declaration's source location.
fn decode_declaration_response(mut packet: Packet, expected_id: u64) -> Result<Location, Error> {
    packet.pop_code('I')?;
    let rid = packet.pop_int()?;
    if rid != expected_id {
        return Err(Error::protocol(format!(
            "declaration response id {} does not match request {}",
            rid, expected_id
        )));
    }
    packet.pop_code(',')?;
    let file = packet.pop_str()?;
    packet.pop_code(',')?;
    let line = packet.pop_int()?;
    packet.pop_code(',')?;
    let start = packet.pop_int()?;
    packet.pop_code(',')?;
    let end = packet.pop_int()?;
    packet.pop_code('i')?;

    Ok(Location {
        file,
        line: if line == 0 { None } else { Some(line as u32) },
        start,
        end,
    })
}
