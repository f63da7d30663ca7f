//! Logging plan shared by the CLI and the server: filter precedence, the
//! rolling file sink and a writer that scrubs credentials from log lines.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,hyper_util=warn,reqwest=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "upscaler";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "<redacted>";

const SENSITIVE_KEY_MARKERS: [&str; 5] = ["token", "secret", "password", "api_key", "apikey"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_ref(),
        }
    }
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
/// the default. The noise filter is prepended only when the user did not ask
/// for anything explicitly.
pub fn compose_log_filter(options: &LoggingInitOptions) -> String {
    let explicit = options.cli_log_filter.is_some() || options.verbose > 0;

    let user_filter = match (&options.cli_log_filter, options.verbose) {
        (Some(filter), _) => filter.clone(),
        (None, v) if v >= 2 => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, _) => options
            .rust_log_env
            .clone()
            .unwrap_or_else(|| options.default_log_filter.clone()),
    };

    if explicit || options.noise_filter.trim().is_empty() {
        user_filter
    } else {
        format!("{},{user_filter}", options.noise_filter)
    }
}

/// Daily-rotated `<data_dir>/logs/upscaler.*.log`, or the reason it is unavailable.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Wraps a [`MakeWriter`] so every complete line is passed through
/// [`redact_sensitive_text`] before it reaches the inner writer.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.pending.drain(..upto).collect();
        let redacted = redact_sensitive_text(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            self.emit(last_newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.emit(self.pending.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Mask URL credentials, URL query strings and `secret=value` style pairs.
pub fn redact_sensitive_text(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for piece in input.split_inclusive(char::is_whitespace) {
        let word = piece.trim_end_matches(char::is_whitespace);
        let trailing = &piece[word.len()..];
        output.push_str(&redact_word(word));
        output.push_str(trailing);
    }
    output
}

fn redact_word(word: &str) -> String {
    if word.contains("://") {
        return redact_url_word(word);
    }

    if let Some((key, _value)) = word.split_once('=') {
        let normalized = key.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
        if is_sensitive_key(normalized) {
            return format!("{key}={REDACTION_PLACEHOLDER}");
        }
    }

    word.to_string()
}

fn redact_url_word(word: &str) -> String {
    let Some(scheme_sep) = word.find("://") else {
        return word.to_string();
    };
    let authority_start = scheme_sep + 3;

    // Quotes and closing brackets that wrap the URL are kept as-is.
    let body_end = word
        .char_indices()
        .rev()
        .find(|(_, c)| !matches!(c, '"' | '\'' | ')' | ']' | '}' | ',' | '>'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(word.len())
        .max(authority_start);
    let (body, suffix) = word.split_at(body_end);

    let authority_end = body[authority_start..]
        .find(['/', '?', '#'])
        .map(|offset| authority_start + offset)
        .unwrap_or(body.len());

    let mut out = String::with_capacity(word.len());
    out.push_str(&body[..authority_start]);

    let authority = &body[authority_start..authority_end];
    match authority.rfind('@') {
        Some(at) => {
            out.push_str(REDACTION_PLACEHOLDER);
            out.push_str(&authority[at..]);
        }
        None => out.push_str(authority),
    }

    let rest = &body[authority_end..];
    match rest.find('?') {
        Some(q) => {
            let fragment_start = rest[q..].find('#').map(|f| q + f).unwrap_or(rest.len());
            out.push_str(&rest[..=q]);
            out.push_str(REDACTION_PLACEHOLDER);
            out.push_str(&rest[fragment_start..]);
        }
        None => out.push_str(rest),
    }

    out.push_str(suffix);
    out
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "key"
        || key == "authorization"
        || key.ends_with("_key")
        || SENSITIVE_KEY_MARKERS
            .iter()
            .any(|marker| key.contains(marker))
}
