//! Logger setup.

use crate::error::Error;
use env_logger::{Env, Target};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

const LOG_FILE_NAME: &str = "anyslk.log";

/// Initialises the global logger.
///
/// Records always go to stderr. With a `log_dir` they are appended to
/// `anyslk.log` in that directory as well.
pub fn init(log_dir: Option<&Path>) -> Result<(), Error> {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    let mut builder = env_logger::Builder::from_env(env);

    match log_dir {
        Some(dir) => {
            let file = open_log_file(dir)?;
            builder.target(Target::Pipe(Box::new(Tee { file })));
        }
        None => {
            // disable timestamps - automatically added by systemd
            builder.format_timestamp(None);
        }
    }

    builder.try_init()?;
    Ok(())
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

/// Writes every record to stderr and to the log file.
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
