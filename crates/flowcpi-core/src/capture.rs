//! Per-command log capture
//!
//! Every command runs under its own subscriber: one layer formats events into
//! an in-memory buffer that becomes the response `log`, the other mirrors them
//! to stderr under `RUST_LOG`.

use std::backtrace::Backtrace;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Shared byte buffer the capture layer writes into
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // a poisoned buffer still holds valid log bytes
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Log sink for a single command
#[derive(Debug, Clone)]
pub struct LogCapture {
    buffer: LogBuffer,
    level: LevelFilter,
}

impl LogCapture {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            buffer: LogBuffer::default(),
            level,
        }
    }

    /// Subscriber to install for the duration of the command
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        let capture = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(self.buffer.clone())
            .with_filter(self.level);

        let stderr = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_filter(EnvFilter::from_default_env());

        tracing_subscriber::registry().with(capture).with(stderr)
    }

    /// Everything captured so far
    pub fn contents(&self) -> String {
        self.buffer.contents()
    }
}

/// Parse a configured level name, falling back to `debug`
pub fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or_else(|_| {
        tracing::warn!("Unknown log level '{}', using debug", level);
        LevelFilter::DEBUG
    })
}

/// Route panics through tracing so they land in the active command's log
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!(panic = %info, "Panic in CPI operation\n{}", backtrace);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::instrument::WithSubscriber;

    #[tokio::test]
    async fn test_capture_collects_events_at_level() {
        let capture = LogCapture::new(LevelFilter::INFO);

        async {
            tracing::info!(vm_id = "vm-1", "Created vm");
            tracing::debug!("filtered out");
        }
        .with_subscriber(capture.subscriber())
        .await;

        let log = capture.contents();
        assert!(log.contains("Created vm"));
        assert!(log.contains("vm_id=\"vm-1\""));
        assert!(!log.contains("filtered out"));
    }

    #[tokio::test]
    async fn test_captures_are_isolated() {
        let first = LogCapture::new(LevelFilter::DEBUG);
        let second = LogCapture::new(LevelFilter::DEBUG);

        async { tracing::info!("first command") }
            .with_subscriber(first.subscriber())
            .await;
        async { tracing::info!("second command") }
            .with_subscriber(second.subscriber())
            .await;

        assert!(first.contents().contains("first command"));
        assert!(!first.contents().contains("second command"));
        assert!(second.contents().contains("second command"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info"), LevelFilter::INFO);
        assert_eq!(parse_level("WARN"), LevelFilter::WARN);
        assert_eq!(parse_level("chatty"), LevelFilter::DEBUG);
    }
}
