//! Smoke test configuration
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! TOML file, command-line flags. With neither file nor flags the smoke test
//! reads `test.ptx` from the working directory and picks a backend on its own.
//!
//! ```toml
//! ptx = "kernels/test.ptx"
//! backend = "simulated"   # auto | cuda | simulated
//! device = 0
//! compute_capability = "8.6"
//! strict = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::diagnostics::{SmokeError, SourceFile};
use crate::gpu::BackendChoice;
use crate::input::DEFAULT_PTX_PATH;

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// IR file printed before the launch
    pub ptx_path: PathBuf,
    pub backend: BackendChoice,
    /// Device ordinal
    pub device: u32,
    /// Target for emitted PTX
    pub compute_capability: (u32, u32),
    /// Turn skipped steps into errors
    pub strict: bool,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            ptx_path: PathBuf::from(DEFAULT_PTX_PATH),
            backend: BackendChoice::Auto,
            device: 0,
            compute_capability: (7, 5),
            strict: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    ptx: Option<PathBuf>,
    backend: Option<BackendChoice>,
    device: Option<u32>,
    compute_capability: Option<toml::Spanned<String>>,
    strict: Option<bool>,
}

impl SmokeConfig {
    /// Defaults overlaid with the TOML file at `path`
    pub fn load(path: &Path) -> Result<Self, SmokeError> {
        let content = std::fs::read_to_string(path).map_err(|source| SmokeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&path.display().to_string(), &content)?;
        tracing::debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    /// Defaults overlaid with TOML `content`; `name` labels diagnostics
    pub fn parse(name: &str, content: &str) -> Result<Self, SmokeError> {
        let source = SourceFile::new(name, content);
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| SmokeError::config_parse(&source, e.message(), e.span()))?;

        let mut config = Self::default();
        if let Some(ptx) = file.ptx {
            config.ptx_path = ptx;
        }
        if let Some(backend) = file.backend {
            config.backend = backend;
        }
        if let Some(device) = file.device {
            config.device = device;
        }
        if let Some(cc) = file.compute_capability {
            let span = cc.span();
            config.compute_capability = parse_compute_capability(cc.get_ref()).ok_or_else(|| {
                SmokeError::config_parse(
                    &source,
                    format!("invalid compute capability `{}`", cc.get_ref()),
                    Some(span),
                )
            })?;
        }
        if let Some(strict) = file.strict {
            config.strict = strict;
        }
        Ok(config)
    }
}

/// Parse `7.5`, `75`, `sm_75` or `120` into `(major, minor)`
pub fn parse_compute_capability(text: &str) -> Option<(u32, u32)> {
    let text = text.trim();
    let text = text.strip_prefix("sm_").unwrap_or(text);

    if let Some((major, minor)) = text.split_once('.') {
        return Some((major.parse().ok()?, minor.parse().ok()?));
    }

    if text.len() < 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (major, minor) = text.split_at(text.len() - 1);
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = SmokeConfig::default();
        assert_eq!(config.ptx_path, PathBuf::from("test.ptx"));
        assert_eq!(config.backend, BackendChoice::Auto);
        assert_eq!(config.device, 0);
        assert_eq!(config.compute_capability, (7, 5));
        assert!(!config.strict);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        assert_eq!(
            SmokeConfig::parse("smoke.toml", "").unwrap(),
            SmokeConfig::default()
        );
    }

    #[test]
    fn test_parse_all_keys() {
        let config = SmokeConfig::parse(
            "smoke.toml",
            r#"
ptx = "kernels/add.ptx"
backend = "simulated"
device = 0
compute_capability = "8.6"
strict = true
"#,
        )
        .unwrap();

        assert_eq!(
            config,
            SmokeConfig {
                ptx_path: PathBuf::from("kernels/add.ptx"),
                backend: BackendChoice::Simulated,
                device: 0,
                compute_capability: (8, 6),
                strict: true,
            }
        );
    }

    #[test]
    fn test_unknown_key_is_labeled() {
        let err = SmokeConfig::parse("smoke.toml", "devise = 1\n").unwrap_err();
        match err {
            SmokeError::ConfigParse { message, span, .. } => {
                assert!(message.contains("devise"), "{message}");
                assert!(span.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_bad_backend() {
        let err = SmokeConfig::parse("smoke.toml", "backend = \"opencl\"\n").unwrap_err();
        assert!(matches!(err, SmokeError::ConfigParse { .. }));
    }

    #[test]
    fn test_bad_compute_capability_span() {
        let content = "compute_capability = \"seven\"\n";
        let err = SmokeConfig::parse("smoke.toml", content).unwrap_err();
        match err {
            SmokeError::ConfigParse { span: Some(span), .. } => {
                let labeled = &content[span.offset()..span.offset() + span.len()];
                assert!(labeled.contains("seven"), "{labeled}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SmokeConfig::load(&dir.path().join("smoke.toml")).unwrap_err();
        assert!(matches!(err, SmokeError::ConfigRead { .. }));
    }

    #[test]
    fn test_compute_capability_forms() {
        assert_eq!(parse_compute_capability("7.5"), Some((7, 5)));
        assert_eq!(parse_compute_capability("86"), Some((8, 6)));
        assert_eq!(parse_compute_capability("sm_90"), Some((9, 0)));
        assert_eq!(parse_compute_capability("120"), Some((12, 0)));
        assert_eq!(parse_compute_capability("7"), None);
        assert_eq!(parse_compute_capability("x.5"), None);
        assert_eq!(parse_compute_capability(""), None);
    }
}
