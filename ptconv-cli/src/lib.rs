//! Command-line front end for converting a PyTorch checkpoint into a
//! `.safetensors` file next to it.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use ptconv::{convert_file, ConversionReport, ConvertOptions};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DESCRIPTION: &str = "Convert PyTorch weights to the safetensors format. \
The output is written next to the input with a .safetensors extension.";

#[derive(Parser, Debug)]
#[command(name = "bin-to-safetensors", version, about = DESCRIPTION)]
pub struct Args {
    /// Weights file
    pub file: PathBuf,
}

/// The input path with its final extension replaced by `safetensors`.
pub fn output_path_for(input: &Path) -> PathBuf {
    input.with_extension("safetensors")
}

/// Result of a [`ConvertApp::run`] that did not fail.
#[derive(Debug)]
pub enum Outcome {
    Converted(ConversionReport),
    AlreadyExists(PathBuf),
}

/// Application converting one checkpoint.
pub struct ConvertApp {
    input: PathBuf,
    output: PathBuf,
    options: ConvertOptions,
}

impl ConvertApp {
    /// Create a new conversion application for `input`.
    pub fn new(input: PathBuf) -> Self {
        let output = output_path_for(&input);
        Self {
            input,
            output,
            options: ConvertOptions::default(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Print the output path, then convert unless the output already exists.
    pub fn run<W: Write>(&self, out: &mut W) -> anyhow::Result<Outcome> {
        writeln!(out, "{}", self.output.display())?;
        if self.output.exists() {
            writeln!(out, "Error: {} already exists", self.output.display())?;
            return Ok(Outcome::AlreadyExists(self.output.clone()));
        }

        let report = convert_file(&self.input, &self.output, &self.options)
            .with_context(|| format!("failed to convert {}", self.input.display()))?;
        writeln!(out, "Success")?;
        Ok(Outcome::Converted(report))
    }
}

/// Install a stderr subscriber filtered by `RUST_LOG` (default `warn`), so
/// stdout only carries the tool's own messages.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }
}
