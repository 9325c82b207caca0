use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// File-backed subscriber. `RUST_LOG` overrides the default `info` level.
pub fn build_subscriber(log_file: File) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file));
    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}

/// Installs the global subscriber, appending to `path`. Later calls are no-ops.
pub fn init(path: &Path) -> anyhow::Result<()> {
    INSTALLED
        .get_or_try_init(|| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing::subscriber::set_global_default(build_subscriber(file))
                .context("installing tracing subscriber")
        })
        .map(|_| ())
}
