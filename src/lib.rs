//! Client library for the Poly/ML compiler's IDE protocol.
//!
//! Talks to a `poly --ideprotocol` subprocess over its standard input and
//! output, using the compiler's escape-marker wire framing:
//!
//! - `protocol` - tokens, packets, and the request encoder
//! - `listener` - frame reader, handler registry, and the dispatch thread
//! - `process` - subprocess lifecycle behind the `Transport` seam
//! - `connection` - request ids and the async/sync calling conventions
//! - `compile` - compile response decoding into structured diagnostics
//! - `client` - the high-level `Poly` client an editor integration uses
//!
//! # Quick Start
//!
//! ```ignore
//! use polyml_ide::client::Poly;
//! use std::path::Path;
//!
//! let poly = Poly::new("/usr/local/bin/poly");
//! let result = poly.compile_sync(
//!     Path::new("main.ML"),
//!     "",
//!     "fun double x = 2 * x\n",
//!     std::time::Duration::from_secs(10),
//! )?;
//! for message in &result.messages {
//!     println!("{}", message.text());
//! }
//! ```

pub mod client;
pub mod compile;
pub mod connection;
pub mod error;
pub mod listener;
pub mod process;
pub mod protocol;

pub use client::{Declaration, Node, Poly};
pub use compile::{CompileResult, Location, Message, ResultCode};
pub use error::Error;
