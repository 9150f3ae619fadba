//! Compiler subprocess lifecycle.
//!
//! The protocol client only needs three things from the process side: a way
//! to write request bytes, a liveness check, and termination. [`Transport`]
//! captures that seam so the connection layer can be tested without spawning
//! a real compiler, and [`PolyProcess`] is the real implementation: a
//! `poly --ideprotocol` child with piped stdio.
//!
//! # Process Cleanup Safety
//! `PolyProcess` owns the child and ensures cleanup via RAII: dropping it
//! kills and reaps the process, preventing orphans.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;

/// Seam between the protocol client and the subprocess.
pub trait Transport: Send + Sync {
    /// Write raw request bytes to the compiler's stdin.
    fn write(&self, bytes: &[u8]) -> Result<(), Error>;

    /// Whether the compiler process is still running.
    fn is_alive(&self) -> bool;

    /// Terminate the compiler process and reap it.
    fn terminate(&self);
}

/// A running Poly/ML compiler in IDE-protocol mode.
pub struct PolyProcess {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
}

impl PolyProcess {
    /// Spawn `<poly_bin> --ideprotocol` with piped stdin/stdout.
    ///
    /// Returns the process handle together with the child's stdout for the
    /// listener to consume. Stderr is discarded; the IDE protocol runs
    /// entirely over stdout.
    pub fn spawn(poly_bin: &Path) -> Result<(Self, ChildStdout), Error> {
        info!("starting compiler: {} --ideprotocol", poly_bin.display());
        let mut child = Command::new(poly_bin)
            .arg("--ideprotocol")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Process(format!("could not run {}: {}", poly_bin.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("no stdin handle for compiler".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("no stdout handle for compiler".into()))?;

        Ok((
            Self {
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
            },
            stdout,
        ))
    }
}

impl Transport for PolyProcess {
    fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut stdin = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        stdin
            .write_all(bytes)
            .and_then(|_| stdin.flush())
            .map_err(|e| Error::Process(format!("write to compiler failed: {}", e)))
    }

    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        matches!(child.try_wait(), Ok(None))
    }

    fn terminate(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("compiler already exited: {}", status);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("error checking compiler status: {}", e);
                return;
            }
        }

        if let Err(e) = child.kill() {
            warn!("failed to kill compiler: {}", e);
            return;
        }

        // Reap with a short grace period so we never block indefinitely.
        for _ in 0..10 {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("compiler terminated: {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("error waiting for compiler: {}", e);
                    return;
                }
            }
        }
        warn!("compiler did not exit after kill");
    }
}

impl Drop for PolyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Write an executable shell script standing in for the compiler binary.
    fn mock_compiler_script(body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!(
            "mock_poly_{}_{}.sh",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::write(&path, body).expect("failed to write mock script");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_spawn_missing_binary_is_process_error() {
        let result = PolyProcess::spawn(Path::new("/nonexistent/poly-binary"));
        assert!(matches!(result, Err(Error::Process(_))));
    }

    #[test]
    fn test_spawn_write_terminate() {
        let script = mock_compiler_script("#!/bin/bash\nexec cat\n");
        let (process, _stdout) = PolyProcess::spawn(&script).expect("spawn failed");

        assert!(process.is_alive());
        process.write(b"\x1bK0\x1b,1\x1bk").expect("write failed");

        process.terminate();
        assert!(!process.is_alive());

        let _ = fs::remove_file(&script);
    }

    #[test]
    fn test_is_alive_false_after_exit() {
        let script = mock_compiler_script("#!/bin/bash\nexit 0\n");
        let (process, _stdout) = PolyProcess::spawn(&script).expect("spawn failed");

        // Give the script a moment to run to completion.
        for _ in 0..50 {
            if !process.is_alive() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!process.is_alive());

        let _ = fs::remove_file(&script);
    }
}
