use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// Writes every record to stderr and to the stage log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Initializes logging for one stage run.
///
/// `RUST_LOG` still takes precedence over the `--verbose` default. The log
/// file is recreated on every run.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = default_level(verbose).to_string().to_lowercase();
    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    builder.format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()));

    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }

    // A second initialization (tests, or a stage that re-enters) keeps the first logger
    let _ = builder.try_init();
    Ok(())
}
