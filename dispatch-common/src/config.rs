//! CLI surface and INI settings shared by all three daemons.
//!
//! The source's three entry points (`npsgd.py`, `npsgd_queue.py`,
//! `npsgd_worker.py`) each build an `optparse.OptionParser` with the same
//! `-c/-p/-l` flags and read the same `ConfigParser`-based file
//! (`original_source/npsgd/config.py`). Here that becomes one shared
//! `clap::Parser` struct and one `config`-crate-backed settings loader.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the INI configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Overrides the bind port read from the configuration file.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Log destination; '-' means stderr.
    #[arg(short = 'l', long = "log", default_value = "-")]
    pub log: String,
}

impl CommonArgs {
    /// Sets up the global `tracing` subscriber per the `-l` flag: `-`
    /// writes to stderr, anything else is a file path opened for append.
    pub fn init_logging(&self) -> std::io::Result<()> {
        let writer = if self.log == "-" {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log)?;
            BoxMakeWriter::new(file)
        };

        tracing_subscriber::fmt()
            .with_writer(writer)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub bind_port: u16,
    pub state_file: String,
    pub keep_alive_interval: u64,
    pub keep_alive_timeout: u64,
    pub max_job_failures: u32,
    pub confirm_timeout_minutes: u64,
    pub model_scan_interval: u64,
    pub request_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    pub smtp_server: String,
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub use_auth: bool,
    pub from_address: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderingSettings {
    pub latex_path: String,
    #[serde(default = "default_latex_num_runs")]
    pub latex_num_runs: u32,
    pub model_directory: String,
    pub template_directory: String,
}

fn default_latex_num_runs() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_working_directory_root")]
    pub working_directory_root: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            bind_port: default_worker_bind_port(),
            poll_interval_seconds: default_poll_interval_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            working_directory_root: default_working_directory_root(),
        }
    }
}

fn default_worker_bind_port() -> u16 {
    3301
}

fn default_poll_interval_seconds() -> u64 {
    10
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_working_directory_root() -> String {
    "/var/tmp/dispatch-worker".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSettings {
    #[serde(default = "default_web_bind_port")]
    pub bind_port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        WebSettings {
            bind_port: default_web_bind_port(),
        }
    }
}

fn default_web_bind_port() -> u16 {
    3300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub queue_server_address: String,
    pub queue: QueueSettings,
    pub email: EmailSettings,
    pub rendering: RenderingSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub web: WebSettings,
}

/// Loads settings from an INI file at `path`. `port_override`, when
/// present (the `-p` flag), takes precedence over `bind_port` from the
/// file.
pub fn load_settings(
    path: &std::path::Path,
    port_override: Option<u16>,
) -> Result<Settings, config::ConfigError> {
    let builder = config::Config::builder().add_source(
        config::File::from(path).format(config::FileFormat::Ini),
    );

    let mut settings: Settings = builder.build()?.try_deserialize()?;
    if let Some(port) = port_override {
        settings.queue.bind_port = port;
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_INI: &str = r#"
queue_server_address = "127.0.0.1"

[queue]
bind_port = 9090
state_file = "/tmp/npsgd-state.json"
keep_alive_interval = 30
keep_alive_timeout = 90
max_job_failures = 3
confirm_timeout_minutes = 60
model_scan_interval = 15
request_secret = "sekrit"

[email]
smtp_server = "localhost"
smtp_port = 25
from_address = "noreply@example.com"

[rendering]
latex_path = "/usr/bin/pdflatex"
model_directory = "/opt/models"
template_directory = "/opt/templates"
"#;

    #[test]
    fn loads_settings_and_applies_port_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("npsgd.ini");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE_INI.as_bytes()).unwrap();

        let settings = load_settings(&path, Some(1234)).unwrap();
        assert_eq!(settings.queue.bind_port, 1234);
        assert_eq!(settings.queue.max_job_failures, 3);
        assert_eq!(settings.rendering.latex_num_runs, 2);
    }

    #[test]
    fn port_override_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("npsgd.ini");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE_INI.as_bytes()).unwrap();

        let settings = load_settings(&path, None).unwrap();
        assert_eq!(settings.queue.bind_port, 9090);
    }
}
