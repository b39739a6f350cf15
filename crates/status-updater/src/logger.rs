// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the status updater.
//!
//! Every line is prefixed so the relay's output is easy to pick out of a
//! shared log stream:
//!
//! ```text
//! STATUS_UPDATER | LEVEL | [target: ][span_name{span_fields}: ]message {event_fields}
//! ```
//!
//! The target is only printed for events coming from dependencies:
//!
//! ```text
//! STATUS_UPDATER | WARN | key-updater: failed to write /status (attempt 3), retrying in 1s: ...
//! STATUS_UPDATER | WARN | rustls::client: handshake failed
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "STATUS_UPDATER_LOG_LEVEL";

/// Target prefix shared by the library and the daemon.
const OWN_TARGET_PREFIX: &str = "status_updater";

/// Dependencies that are too chatty at debug level.
const QUIET_TARGETS: &str = "h2=off,hyper=off,hyper_util=off,rustls=off,reqwest=off";

/// Event formatter producing `STATUS_UPDATER | LEVEL | ...` lines.
///
/// Spans are printed from the root down, each with its recorded fields.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "STATUS_UPDATER | {} | ", metadata.level())?;
        if !metadata.target().starts_with(OWN_TARGET_PREFIX) {
            write!(writer, "{}: ", metadata.target())?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter for `level`, e.g. `info` or `status_updater=debug`.
pub fn env_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!("{QUIET_TARGETS},{}", level.to_lowercase()))
}

/// Installs the global subscriber. Fails if `level` cannot be parsed or a
/// subscriber is already installed.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level)?)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_format_prefix_span_and_fields() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("supervisor", key = "/status");
            let _guard = span.enter();
            tracing::warn!(attempt = 3, "write failed");
        });

        let output = String::from_utf8(buffer.0.lock().expect("lock poisoned").clone())
            .expect("utf8 output");
        assert_eq!(
            output,
            "STATUS_UPDATER | WARN | supervisor{key=\"/status\"}: write failed attempt=3\n"
        );
    }

    #[test]
    fn test_dependency_events_carry_their_target() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "rustls::client", "handshake failed");
            tracing::warn!(target: "status_updater::store", "request failed");
        });

        let output = String::from_utf8(buffer.0.lock().expect("lock poisoned").clone())
            .expect("utf8 output");
        assert_eq!(
            output,
            "STATUS_UPDATER | WARN | rustls::client: handshake failed\n\
             STATUS_UPDATER | WARN | request failed\n"
        );
    }

    #[test]
    fn test_env_filter_rejects_garbage() {
        assert!(env_filter("info").is_ok());
        assert!(env_filter("status_updater=debug").is_ok());
        assert!(env_filter("status_updater=loud").is_err());
    }
}
