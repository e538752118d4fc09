use chrono::NaiveDate;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

/// Installs the global subscriber. `RUST_LOG` wins over `level`. With a log
/// directory every line also goes to a file named for today's date.
pub fn init(level: &str, log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match log_dir.map(open_dated_file).transpose() {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let writer = match file {
        Some(file) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        None => BoxMakeWriter::new(io::stdout),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn open_dated_file(dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    let path = dated_path(dir, chrono::Local::now().date_naive());
    OpenOptions::new().create(true).append(true).open(path)
}

fn dated_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("devdeck-{}.log", date.format("%Y-%m-%d")))
}

pub fn default_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}
