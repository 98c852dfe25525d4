use crate::config::LoggingConfig;
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

struct RedactingWriter<W> {
    inner: W,
    patterns: Vec<(Regex, String)>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let mut redacted = s.to_string();
        for (re, replacement) in &self.patterns {
            redacted = re.replace_all(&redacted, replacement.as_str()).to_string();
        }
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter {
    patterns: Vec<(Regex, String)>,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

/// Compile the configured redaction patterns, returning the names of any that
/// fail to compile alongside the usable ones.
fn compile_patterns(config: &LoggingConfig) -> (Vec<(Regex, String)>, Vec<String>) {
    let mut patterns = Vec::new();
    let mut rejected = Vec::new();
    if config.redaction.enabled {
        for p in &config.redaction.patterns {
            match Regex::new(&p.regex) {
                Ok(re) => patterns.push((re, p.placeholder.clone())),
                Err(_) => rejected.push(p.name.clone()),
            }
        }
    }
    (patterns, rejected)
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let (patterns, rejected) = compile_patterns(config);
    let make_writer = RedactingMakeWriter { patterns };

    // Use Layer::boxed() to unify the types of the if/else branches
    let fmt_layer = if !config.show_time {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(config.show_target)
            .with_thread_ids(false)
            .without_time()
            .boxed()
    } else {
        fmt::layer()
            .with_writer(make_writer)
            .with_target(config.show_target)
            .with_thread_ids(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    for name in rejected {
        tracing::warn!(pattern = %name, "ignoring redaction pattern with invalid regex");
    }
}
