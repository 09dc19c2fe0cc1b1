use indicatif::MultiProgress;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod app;
pub mod cli;

pub use app::App;
pub use cli::Cli;

/// Plain log lines on stderr, keeping stdout free for lease payloads.
pub fn initialize_stderr_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter())
        .init();
}

/// Log lines printed above the progress spinners.
pub fn initialize_ui_logging(multi_progress: MultiProgress) {
    let writer = ProgressWriter::new(multi_progress);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_level(true)
                .with_target(true)
                .with_writer(move || writer.clone()),
        )
        .with(env_filter())
        .init();
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::new("leasehold=debug,leasehold_core=debug")
    }
}

#[derive(Clone)]
struct ProgressWriter {
    multi_progress: MultiProgress,
}

impl ProgressWriter {
    fn new(multi_progress: MultiProgress) -> Self {
        ProgressWriter { multi_progress }
    }
}

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(msg) = std::str::from_utf8(buf) {
            let _ = self.multi_progress.println(msg.trim_end());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
