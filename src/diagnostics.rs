//! Diagnostic reporting
//!
//! Errors surface at the binary boundary as miette reports; config parse
//! errors carry the offending source with a labeled span.

use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::gpu::{GpuError, PtxError};

/// Source file for error reporting
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content: Arc<str>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Arc::from(content.into()),
        }
    }

    pub fn to_named_source(&self) -> NamedSource<String> {
        NamedSource::new(self.name.clone(), self.content.to_string())
    }

    /// Span for `range`, clamped to the file contents
    pub fn span(&self, range: Range<usize>) -> SourceSpan {
        let start = range.start.min(self.content.len());
        let end = range.end.clamp(start, self.content.len());
        SourceSpan::new(start.into(), end - start)
    }
}

/// Smoke test error
#[derive(Error, Debug, Diagnostic)]
pub enum SmokeError {
    #[error("Failed to read IR file `{}`", .path.display())]
    #[diagnostic(
        code(smoke::read_input),
        help("run from the directory holding test.ptx, or pass --ptx <FILE>")
    )]
    ReadInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("GPU step failed")]
    #[diagnostic(code(smoke::gpu))]
    Gpu(#[from] GpuError),

    #[error("Failed to write output")]
    #[diagnostic(code(smoke::output))]
    Output(#[source] io::Error),

    #[error("Failed to write `{}`", .path.display())]
    #[diagnostic(code(smoke::write_file))]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // === Config Errors ===
    #[error("Failed to read config file `{}`", .path.display())]
    #[diagnostic(code(config::read))]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config: {message}")]
    #[diagnostic(code(config::parse))]
    ConfigParse {
        message: String,
        #[label("{message}")]
        span: Option<SourceSpan>,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Invalid compute capability `{0}`")]
    #[diagnostic(
        code(config::compute_capability),
        help("use `major.minor` or the two-digit sm form, e.g. `7.5` or `86`")
    )]
    ComputeCapability(String),

    #[error("PTX generation failed")]
    #[diagnostic(code(smoke::ptx))]
    Ptx(#[from] PtxError),
}

impl SmokeError {
    /// Parse error at `range` in `source`
    pub fn config_parse(
        source: &SourceFile,
        message: impl Into<String>,
        range: Option<Range<usize>>,
    ) -> Self {
        SmokeError::ConfigParse {
            message: message.into(),
            span: range.map(|r| source.span(r)),
            src: source.to_named_source(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_is_clamped() {
        let source = SourceFile::new("smoke.toml", "device = 1\n");
        let span = source.span(9..100);
        assert_eq!(span.offset(), 9);
        assert_eq!(span.len(), 2);
    }

    #[test]
    fn test_config_parse_carries_source() {
        let source = SourceFile::new("smoke.toml", "devise = 1\n");
        let err = SmokeError::config_parse(&source, "unknown field `devise`", Some(0..6));
        match &err {
            SmokeError::ConfigParse { span, .. } => {
                assert_eq!(*span, Some(SourceSpan::new(0.into(), 6)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Invalid config: unknown field `devise`");
    }

    #[test]
    fn test_gpu_error_source() {
        let err = SmokeError::from(GpuError::DeviceNotFound(2));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("GPU device 2 not found"));
    }
}
