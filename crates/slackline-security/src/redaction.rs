use std::sync::LazyLock;

use tracing_subscriber::fmt::MakeWriter;

/// A writer that masks Slack credentials before they reach log output.
///
/// Session tokens end up in socket URLs and error bodies, so everything the
/// subscriber formats goes through [`redact_secrets`].
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: std::io::Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

static SECRET_PATTERNS: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?x)
          xox[cdbpa]-[A-Za-z0-9%\-]{6,}   # Slack session, cookie, bot and user tokens
        | xapp-[A-Za-z0-9\-]{6,}          # Slack app tokens
        | sk-[A-Za-z0-9_\-]{20,}          # OpenAI-style keys clients may forward
        ",
    )
    .expect("redaction regex should compile")
});

static TOKEN_QUERY: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"([?&]token=)[^&\s]+").expect("token query regex should compile")
});

/// Replace known credential patterns with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    let masked = SECRET_PATTERNS.replace_all(input, "[REDACTED]");
    TOKEN_QUERY
        .replace_all(&masked, "${1}[REDACTED]")
        .into_owned()
}
