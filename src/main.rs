//! `polyc` - compile an ML file through the Poly/ML IDE protocol and print
//! its diagnostics.
//!
//! Builds a prelude that changes into the file's directory and restores a
//! `.polysave/<name>.save` heap image when one exists, then compiles the file
//! and reports each message as `file:line:(start-end): text`.

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyml_ide::client::Poly;
use polyml_ide::compile::{CompileResult, Message};

const DEFAULT_POLY_BIN: &str = "/usr/local/bin/poly";

struct Options {
    file: PathBuf,
    poly_bin: PathBuf,
    timeout: Duration,
}

fn usage() -> ! {
    eprintln!("usage: polyc [--poly <path>] [--timeout <seconds>] <file.ML>");
    eprintln!();
    eprintln!("The compiler binary defaults to $POLY_BIN, then {}.", DEFAULT_POLY_BIN);
    std::process::exit(2);
}

fn parse_args() -> Result<Options> {
    let mut file = None;
    let mut poly_bin = env::var_os("POLY_BIN").map(PathBuf::from);
    let mut timeout = Duration::from_secs(30);

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--poly" => {
                let value = args.next().unwrap_or_else(|| usage());
                poly_bin = Some(PathBuf::from(value));
            }
            "--timeout" => {
                let value = args.next().unwrap_or_else(|| usage());
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("bad --timeout value: {}", value))?;
                timeout = Duration::from_secs(secs);
            }
            "--help" | "-h" => usage(),
            other if other.starts_with('-') => usage(),
            other => {
                if file.replace(PathBuf::from(other)).is_some() {
                    usage();
                }
            }
        }
    }

    let file = match file {
        Some(f) => f,
        None => usage(),
    };
    Ok(Options {
        file,
        poly_bin: poly_bin.unwrap_or_else(|| PathBuf::from(DEFAULT_POLY_BIN)),
        timeout,
    })
}

/// Prelude run before the compilation unit: move into the file's directory
/// and restore its saved heap state when present.
fn build_prelude(file: &Path) -> Result<String> {
    let absolute = file
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", file.display()))?;
    let dir = absolute
        .parent()
        .with_context(|| format!("{} has no parent directory", absolute.display()))?;
    let name = absolute
        .file_name()
        .with_context(|| format!("{} has no file name", absolute.display()))?
        .to_string_lossy()
        .into_owned();

    let mut prelude = format!("OS.FileSys.chDir \"{}\";\n", dir.display());
    let polysave = dir.join(".polysave").join(format!("{}.save", name));
    if polysave.exists() {
        info!("restoring saved state from {}", polysave.display());
        prelude.push_str(&format!(
            "PolyML.SaveState.loadState(\"{}\");\n",
            polysave.display()
        ));
        prelude.push_str("PolyML.fullGC ();\n");
    }
    Ok(prelude)
}

fn format_message(message: &Message) -> String {
    match message.location() {
        Some(loc) => {
            let line = loc
                .line
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".into());
            format!(
                "{}:{}:({}-{}): {}",
                loc.file,
                line,
                loc.start,
                loc.end,
                message.text()
            )
        }
        None => message.text().to_string(),
    }
}

fn report(result: &CompileResult) {
    println!("[{}]", result.code);
    for message in &result.messages {
        println!("{}", format_message(message));
    }
}

fn run() -> Result<CompileResult> {
    let options = parse_args()?;

    let source = std::fs::read_to_string(&options.file)
        .with_context(|| format!("cannot read {}", options.file.display()))?;
    let prelude = build_prelude(&options.file)?;

    if !options.poly_bin.exists() {
        bail!(
            "compiler binary not found: {} (set $POLY_BIN or pass --poly)",
            options.poly_bin.display()
        );
    }

    let poly = Poly::new(&options.poly_bin);
    poly.compile_sync(&options.file, &prelude, &source, options.timeout)
        .with_context(|| format!("compiling {}", options.file.display()))
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "polyml_ide=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run() {
        Ok(result) => {
            report(&result);
            if result.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("polyc: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
