//! Tracing setup for the provisioning daemon.
//!
//! Settings come from `PROVISIOND_LOG_*` environment variables. `RUST_LOG`
//! still wins over the configured level when set.

use std::{
    collections::HashMap,
    env, fmt,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

pub const LEVEL_VAR: &str = "PROVISIOND_LOG_LEVEL";
pub const OUTPUT_VAR: &str = "PROVISIOND_LOG_OUTPUT";
pub const FORMAT_VAR: &str = "PROVISIOND_LOG_FORMAT";
pub const FILE_VAR: &str = "PROVISIOND_LOG_FILE";
pub const TAGS_VAR: &str = "PROVISIOND_LOG_TAGS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl FromStr for LogOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" | "stderr" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            "none" | "off" => Ok(LogOutput::None),
            other => Err(format!("unknown log output '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// A `key:value` span-field filter. A value of `*` matches any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Parse `request_id:abc,stage:*` into tags, skipping malformed entries.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file: PathBuf,
    pub tags: Vec<Tag>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file: env::temp_dir().join("provisiond.log"),
            tags: Vec::new(),
        }
    }
}

impl LogSettings {
    /// Read settings from the environment. Unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var(LEVEL_VAR)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.level),
            output: env::var(OUTPUT_VAR)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.output),
            format: env::var(FORMAT_VAR)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.format),
            file: env::var_os(FILE_VAR)
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
            tags: env::var(TAGS_VAR)
                .map(|v| parse_tags(&v))
                .unwrap_or_default(),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        for quiet in ["sqlx=warn", "tokio=warn"] {
            if let Ok(directive) = quiet.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

// --- Custom "Tee" Writer ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

// --- Tag-Based Filtering Logic ---
struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        // Tag matches depend on the current span, so they are decided per event.
        if self.filters.is_empty() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        // Spans always pass so their fields are available to the events inside.
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        let scope = match ctx.current_span().id().and_then(|id| ctx.span_scope(id)) {
            Some(scope) => scope,
            None => return false, // If tags are specified, events outside a span are filtered.
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Initializes the global tracing subscriber from `PROVISIOND_LOG_*` variables.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

/// Initializes the global tracing subscriber. Keep the returned guard alive
/// for as long as file output should be flushed.
pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let tag_filter_layer = TagFilterLayer {
        filters: settings.tags.clone(),
    };
    let is_json = settings.format == LogFormat::Json;

    let mut guard: Option<WorkerGuard> = None;

    let subscriber = registry()
        .with(settings.env_filter())
        .with(tag_filter_layer);

    let log_dir = settings
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let log_filename = settings
        .file
        .file_name()
        .unwrap_or_else(|| "provisiond.log".as_ref());

    let result = match settings.output {
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let tee_writer = MakeTee {
                make_a: std::io::stderr,
                make_b: non_blocking,
            };

            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        LogOutput::Console => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        LogOutput::None => subscriber.try_init(),
    };

    // A subscriber installed earlier (tests, embedding) stays in place.
    if result.is_err() {
        return None;
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::{Arc, Mutex};

    const ALL_VARS: [&str; 5] = [LEVEL_VAR, OUTPUT_VAR, FORMAT_VAR, FILE_VAR, TAGS_VAR];

    fn clear_env() {
        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_settings_default_without_env() {
        clear_env();
        let settings = LogSettings::from_env();
        assert_eq!(settings.level, "info");
        assert_eq!(settings.output, LogOutput::Console);
        assert_eq!(settings.format, LogFormat::Human);
        assert!(settings.tags.is_empty());
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        clear_env();
        env::set_var(LEVEL_VAR, "debug");
        env::set_var(OUTPUT_VAR, "both");
        env::set_var(FORMAT_VAR, "JSON");
        env::set_var(FILE_VAR, "/var/log/provisiond/daemon.log");
        env::set_var(TAGS_VAR, "request_id:abc");

        let settings = LogSettings::from_env();
        clear_env();

        assert_eq!(settings.level, "debug");
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file, PathBuf::from("/var/log/provisiond/daemon.log"));
        assert_eq!(
            settings.tags,
            vec![Tag {
                key: "request_id".to_string(),
                value: "abc".to_string()
            }]
        );
    }

    #[test]
    #[serial]
    fn test_unknown_values_fall_back() {
        clear_env();
        env::set_var(OUTPUT_VAR, "syslog");
        env::set_var(FORMAT_VAR, "xml");

        let settings = LogSettings::from_env();
        clear_env();

        assert_eq!(settings.output, LogOutput::Console);
        assert_eq!(settings.format, LogFormat::Human);
    }

    #[test]
    fn test_parse_tags_skips_malformed() {
        let tags = parse_tags("request_id:abc, stage : *,broken,:empty,key:");
        let rendered: Vec<String> = tags.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["request_id:abc", "stage:*"]);
    }

    #[test]
    fn test_tee_writes_both() {
        let mut tee = Tee {
            a: Vec::new(),
            b: Vec::new(),
        };
        tee.write_all(b"line\n").unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.a, b"line\n");
        assert_eq!(tee.b, b"line\n");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut inner) = self.0.lock() {
                inner.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tag_filter_keeps_matching_spans_only() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = registry()
            .with(TagFilterLayer {
                filters: parse_tags("request_id:req-1"),
            })
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(move || writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any span");
            tracing::info_span!("provision", request_id = %"req-1").in_scope(|| {
                tracing::info!("kept event");
            });
            tracing::info_span!("provision", request_id = %"req-2").in_scope(|| {
                tracing::info!("dropped event");
            });
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("kept event"));
        assert!(!output.contains("dropped event"));
        assert!(!output.contains("outside any span"));
    }
}
