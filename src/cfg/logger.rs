// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Router logging.
//!
//! Records go through a non-blocking writer to stdout, stderr, or a
//! rolling file, formatted either as compact text or as one JSON object
//! per line.  Every JSON record carries the local node id, so logs from a
//! multi-node testbed can be interleaved and still attributed.

use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use fastrace::collector::{Config, ConsoleReporter};
use serde::Deserialize;
use serde_json::json;
use tracing::{Event, Subscriber};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::{JsonFields, Writer},
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerFile {
    logger: LoggerSettings,
}

#[derive(Debug, Deserialize, Clone)]
struct LoggerSettings {
    /// EnvFilter directive, e.g. `info` or `dtn_router_rs::ltp=debug`.
    level: String,
    #[serde(default)]
    format: RecordFormat,
    #[serde(default)]
    sink: Sink,
    /// Include the event's target module in each record.
    #[serde(default)]
    show_target: bool,
    file: Option<FileSink>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum RecordFormat {
    Text,
    #[default]
    Json,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum Sink {
    #[default]
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
struct FileSink {
    path: String,
    #[serde(default)]
    rotation: FileRotation,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum FileRotation {
    Minutely,
    Hourly,
    Daily,
    #[default]
    Never,
}

/// JSON record formatter: `{"ts", "node", "level", "target"?, "message",
/// ...fields}` with event fields flattened to the top level.
struct NodeStampedJson {
    node_id: u64,
    show_target: bool,
}

impl<S, N> FormatEvent<S, N> for NodeStampedJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = serde_json::Map::with_capacity(visitor.fields.len() + 5);
        record.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        record.insert("node".to_string(), json!(self.node_id));
        record.insert(
            "level".to_string(),
            json!(event.metadata().level().as_str()),
        );
        if self.show_target {
            record.insert("target".to_string(), json!(event.metadata().target()));
        }
        record.insert(
            "message".to_string(),
            json!(visitor.message.unwrap_or_default()),
        );
        for (name, value) in visitor.fields {
            record.entry(name).or_insert(value);
        }

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&serde_json::Value::Object(record))
                .map_err(|_| std::fmt::Error)?
        )
    }
}

/// Splits the free-form `message` field from the structured rest.
#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fields: Vec<(String, serde_json::Value)>,
}

impl RecordVisitor {
    fn record_value(&mut self, field: &tracing::field::Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl tracing::field::Visit for RecordVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        self.record_value(field, json!(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.record_value(field, json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.record_value(field, json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.record_value(field, json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_value(field, json!(value));
    }
}

/// Reads the logger YAML and installs the global subscriber.  The returned
/// guard must stay alive for the non-blocking writer to flush.
pub fn init_logger(config_path: &str, node_id: u64) -> Result<WorkerGuard> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("cannot read logger config {config_path}"))?;
    let settings: LoggerFile = serde_yaml::from_str(&content)
        .with_context(|| format!("cannot parse logger config {config_path}"))?;
    let settings = settings.logger;

    let (writer, guard) = make_writer(&settings)?;

    fastrace::set_reporter(ConsoleReporter, Config::default());
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let env_filter = EnvFilter::try_new(&settings.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("cannot parse log level from config or env")?;

    let format_layer = match settings.format {
        RecordFormat::Json => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .event_format(NodeStampedJson {
                node_id,
                show_target: settings.show_target,
            })
            .fmt_fields(JsonFields::default())
            .boxed(),
        RecordFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(settings.show_target)
            .compact()
            .boxed(),
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(compat_layer)
        .with(format_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("cannot install global subscriber")?;

    Ok(guard)
}

fn make_writer(settings: &LoggerSettings) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match settings.sink {
        Sink::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        Sink::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        Sink::File => {
            let file = settings
                .file
                .clone()
                .context("logger.file is required for sink=file")?;
            let path = PathBuf::from(&file.path);
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            let rotation = match file.rotation {
                FileRotation::Minutely => Rotation::MINUTELY,
                FileRotation::Hourly => Rotation::HOURLY,
                FileRotation::Daily => Rotation::DAILY,
                FileRotation::Never => Rotation::NEVER,
            };
            let appender = RollingFileAppender::new(
                rotation,
                dir,
                path.file_name().unwrap_or_default(),
            );
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
