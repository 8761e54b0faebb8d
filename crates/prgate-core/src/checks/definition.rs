//! Check configuration: loading, validation and fingerprinting.
//!
//! The configuration is a versioned list of `{name, kind, params}` entries
//! read from JSON or TOML. [`CheckConfig::compile`] validates every entry
//! once, producing an immutable [`CheckSet`] whose [`ConfigFingerprint`]
//! identifies the active configuration in published statuses.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Supported check kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// params: `["LICENSE", ...]` or `{"files": [...]}`
    RequiredFiles,
    /// params: `{"file": "VERSION", "pattern": "^\\d+$"}`
    ContentPattern,
    /// params: `{"file": "...", "sha256": "<64 hex>"}`
    ContentHash,
    /// params: `{"files": [...], "reference": "master"}`
    MatchesReference,
    /// params: `{"file": "...", "format": "json"|"toml", "required_keys": [...]}`
    StructuredDocument,
    /// params: `{"reference": "master", "exclude_workflows": ["scheduler"]}`
    PipelineConfig,
    /// params: `{"path": "scheduler", "reference": "master"}`
    SubmoduleRevision,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::RequiredFiles => "required_files",
            CheckKind::ContentPattern => "content_pattern",
            CheckKind::ContentHash => "content_hash",
            CheckKind::MatchesReference => "matches_reference",
            CheckKind::StructuredDocument => "structured_document",
            CheckKind::PipelineConfig => "pipeline_config",
            CheckKind::SubmoduleRevision => "submodule_revision",
        }
    }
}

/// One configured check, as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckDefinition {
    pub name: String,
    pub kind: CheckKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CheckDefinition {
    pub fn new(name: impl Into<String>, kind: CheckKind, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
        }
    }
}

/// The check configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    /// Configuration schema/content version; part of the fingerprint.
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl CheckConfig {
    pub fn new(checks: Vec<CheckDefinition>) -> Self {
        Self {
            version: default_version(),
            checks,
        }
    }

    /// Load from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&raw)?),
            Some("toml") => Ok(toml::from_str(&raw)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Validate every definition and build the immutable check set.
    pub fn compile(&self) -> Result<CheckSet, ConfigError> {
        let mut seen = HashSet::new();
        let mut checks = Vec::with_capacity(self.checks.len());

        for definition in &self.checks {
            if !seen.insert(definition.name.as_str()) {
                return Err(ConfigError::DuplicateName(definition.name.clone()));
            }
            checks.push(CompiledCheck {
                name: definition.name.clone(),
                check: Check::compile(definition)?,
            });
        }

        Ok(CheckSet {
            checks,
            fingerprint: ConfigFingerprint::compute(self),
        })
    }
}

/// Structured document formats understood by `structured_document`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Json,
    Toml,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Json => "json",
            DocumentFormat::Toml => "toml",
        }
    }
}

/// A validated check ready to run.
#[derive(Debug, Clone)]
pub enum Check {
    RequiredFiles {
        files: Vec<String>,
    },
    ContentPattern {
        file: String,
        pattern: Regex,
    },
    ContentHash {
        file: String,
        sha256: String,
    },
    MatchesReference {
        files: Vec<String>,
        reference: String,
    },
    StructuredDocument {
        file: String,
        format: DocumentFormat,
        required_keys: Vec<String>,
    },
    /// Compiled CI configuration of the execution under test against the
    /// newest `reference` execution that ran none of `exclude_workflows`.
    PipelineConfig {
        reference: String,
        exclude_workflows: Vec<String>,
        max_pages: usize,
    },
    SubmoduleRevision {
        path: String,
        reference: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileListParams {
    List(Vec<String>),
    Object { files: Vec<String> },
}

#[derive(Deserialize)]
struct PatternParams {
    file: String,
    pattern: String,
}

#[derive(Deserialize)]
struct HashParams {
    file: String,
    sha256: String,
}

#[derive(Deserialize)]
struct ReferenceParams {
    files: Vec<String>,
    reference: String,
}

#[derive(Deserialize)]
struct DocumentParams {
    file: String,
    format: DocumentFormat,
    #[serde(default)]
    required_keys: Vec<String>,
}

#[derive(Deserialize)]
struct PipelineConfigParams {
    reference: String,
    #[serde(default)]
    exclude_workflows: Vec<String>,
    #[serde(default = "default_reference_pages")]
    max_pages: usize,
}

fn default_reference_pages() -> usize {
    5
}

#[derive(Deserialize)]
struct SubmoduleParams {
    path: String,
    reference: String,
}

fn params<T: DeserializeOwned>(definition: &CheckDefinition) -> Result<T, ConfigError> {
    serde_json::from_value(definition.params.clone()).map_err(|e| ConfigError::InvalidParams {
        check: definition.name.clone(),
        reason: e.to_string(),
    })
}

fn non_empty_files(
    definition: &CheckDefinition,
    files: Vec<String>,
) -> Result<Vec<String>, ConfigError> {
    if files.is_empty() || files.iter().any(|f| f.trim().is_empty()) {
        return Err(ConfigError::InvalidParams {
            check: definition.name.clone(),
            reason: "file list must be non-empty and contain no blank paths".to_string(),
        });
    }
    Ok(files)
}

fn non_empty_reference(
    definition: &CheckDefinition,
    reference: String,
) -> Result<String, ConfigError> {
    if reference.trim().is_empty() {
        return Err(ConfigError::InvalidParams {
            check: definition.name.clone(),
            reason: "reference must not be empty".to_string(),
        });
    }
    Ok(reference)
}

impl Check {
    fn compile(definition: &CheckDefinition) -> Result<Self, ConfigError> {
        match definition.kind {
            CheckKind::RequiredFiles => {
                let files = match params::<FileListParams>(definition)? {
                    FileListParams::List(files) | FileListParams::Object { files } => files,
                };
                Ok(Check::RequiredFiles {
                    files: non_empty_files(definition, files)?,
                })
            }
            CheckKind::ContentPattern => {
                let p: PatternParams = params(definition)?;
                let pattern =
                    Regex::new(&p.pattern).map_err(|source| ConfigError::InvalidPattern {
                        check: definition.name.clone(),
                        source,
                    })?;
                Ok(Check::ContentPattern {
                    file: p.file,
                    pattern,
                })
            }
            CheckKind::ContentHash => {
                let p: HashParams = params(definition)?;
                if p.sha256.len() != 64 || !p.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConfigError::InvalidDigest {
                        check: definition.name.clone(),
                        digest: p.sha256,
                    });
                }
                Ok(Check::ContentHash {
                    file: p.file,
                    sha256: p.sha256.to_ascii_lowercase(),
                })
            }
            CheckKind::MatchesReference => {
                let p: ReferenceParams = params(definition)?;
                Ok(Check::MatchesReference {
                    files: non_empty_files(definition, p.files)?,
                    reference: non_empty_reference(definition, p.reference)?,
                })
            }
            CheckKind::StructuredDocument => {
                let p: DocumentParams = params(definition)?;
                Ok(Check::StructuredDocument {
                    file: p.file,
                    format: p.format,
                    required_keys: p.required_keys,
                })
            }
            CheckKind::PipelineConfig => {
                let p: PipelineConfigParams = params(definition)?;
                Ok(Check::PipelineConfig {
                    reference: non_empty_reference(definition, p.reference)?,
                    exclude_workflows: p.exclude_workflows,
                    max_pages: p.max_pages.max(1),
                })
            }
            CheckKind::SubmoduleRevision => {
                let p: SubmoduleParams = params(definition)?;
                let path = p.path.trim_matches('/').to_string();
                if path.is_empty() {
                    return Err(ConfigError::InvalidParams {
                        check: definition.name.clone(),
                        reason: "submodule path must not be empty".to_string(),
                    });
                }
                Ok(Check::SubmoduleRevision {
                    path,
                    reference: non_empty_reference(definition, p.reference)?,
                })
            }
        }
    }
}

/// A named, validated check.
#[derive(Debug, Clone)]
pub struct CompiledCheck {
    pub name: String,
    pub check: Check,
}

/// The immutable set of checks for a run, in configuration order.
#[derive(Debug, Clone)]
pub struct CheckSet {
    checks: Vec<CompiledCheck>,
    fingerprint: ConfigFingerprint,
}

impl CheckSet {
    pub fn iter(&self) -> impl Iterator<Item = &CompiledCheck> {
        self.checks.iter()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn fingerprint(&self) -> &ConfigFingerprint {
        &self.fingerprint
    }
}

/// SHA-256 digest of the active check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// Number of hex characters embedded in status descriptions.
    pub const SHORT_LEN: usize = 12;

    /// Digest of the version and the ordered definitions.
    ///
    /// `params` objects serialize with sorted keys, so the digest does not
    /// depend on key order in the source file.
    pub fn compute(config: &CheckConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.version.as_bytes());
        hasher.update(b"\0");
        for definition in &config.checks {
            hasher.update(definition.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(definition.kind.as_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(definition.params.to_string().as_bytes());
            hasher.update(b"\0");
        }
        ConfigFingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LEN.min(self.0.len())]
    }

    /// Whether a fingerprint read back from a status refers to this one.
    pub fn matches(&self, embedded: &str) -> bool {
        !embedded.is_empty() && self.0.starts_with(&embedded.to_ascii_lowercase())
    }

    /// Marker appended to status descriptions: `[cfg:<short>]`.
    pub fn tag(&self) -> String {
        format!("[cfg:{}]", self.short())
    }

    /// Extract the fingerprint from a description carrying a [`tag`](Self::tag).
    pub fn extract(description: &str) -> Option<&str> {
        let start = description.rfind("[cfg:")? + "[cfg:".len();
        let len = description[start..].find(']')?;
        Some(&description[start..start + len]).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn scenario_config() -> CheckConfig {
        CheckConfig::new(vec![
            CheckDefinition::new(
                "required files exist",
                CheckKind::RequiredFiles,
                json!(["LICENSE", "AUTHORS"]),
            ),
            CheckDefinition::new(
                "content pattern",
                CheckKind::ContentPattern,
                json!({"file": "VERSION", "pattern": "^\\d+\\.\\d+\\.\\d+$"}),
            ),
        ])
    }

    #[test]
    fn test_compile_scenario_config() {
        let set = scenario_config().compile().expect("compile failed");
        assert_eq!(set.len(), 2);
        let names: Vec<&str> = set.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["required files exist", "content pattern"]);
        assert_eq!(set.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_required_files_accepts_object_form() {
        let config = CheckConfig::new(vec![CheckDefinition::new(
            "files",
            CheckKind::RequiredFiles,
            json!({"files": ["README.md"]}),
        )]);
        let set = config.compile().unwrap();
        match &set.iter().next().unwrap().check {
            Check::RequiredFiles { files } => assert_eq!(files, &vec!["README.md".to_string()]),
            other => panic!("unexpected check: {:?}", other),
        };
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = CheckConfig::new(vec![
            CheckDefinition::new("x", CheckKind::RequiredFiles, json!(["a"])),
            CheckDefinition::new("x", CheckKind::RequiredFiles, json!(["b"])),
        ]);
        assert!(matches!(config.compile(), Err(ConfigError::DuplicateName(_))));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = CheckConfig::new(vec![CheckDefinition::new(
            "bad",
            CheckKind::ContentPattern,
            json!({"file": "VERSION", "pattern": "(unclosed"}),
        )]);
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_invalid_digest_rejected() {
        let config = CheckConfig::new(vec![CheckDefinition::new(
            "hash",
            CheckKind::ContentHash,
            json!({"file": "LICENSE", "sha256": "abc"}),
        )]);
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_pipeline_and_submodule_checks_compile() {
        let config = CheckConfig::new(vec![
            CheckDefinition::new(
                "ci config",
                CheckKind::PipelineConfig,
                json!({"reference": "master", "exclude_workflows": ["scheduler"]}),
            ),
            CheckDefinition::new(
                "scheduler revision",
                CheckKind::SubmoduleRevision,
                json!({"path": "scheduler/", "reference": "master"}),
            ),
        ]);
        let set = config.compile().unwrap();
        let checks: Vec<&Check> = set.iter().map(|c| &c.check).collect();
        match checks[0] {
            Check::PipelineConfig {
                exclude_workflows,
                max_pages,
                ..
            } => {
                assert_eq!(exclude_workflows, &vec!["scheduler".to_string()]);
                assert_eq!(*max_pages, 5);
            }
            other => panic!("unexpected check: {:?}", other),
        }
        match checks[1] {
            Check::SubmoduleRevision { path, .. } => assert_eq!(path, "scheduler"),
            other => panic!("unexpected check: {:?}", other),
        }
    }

    #[test]
    fn test_submodule_check_requires_path() {
        let config = CheckConfig::new(vec![CheckDefinition::new(
            "scheduler revision",
            CheckKind::SubmoduleRevision,
            json!({"path": "/", "reference": "master"}),
        )]);
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_missing_params_rejected() {
        let config = CheckConfig::new(vec![CheckDefinition::new(
            "files",
            CheckKind::RequiredFiles,
            serde_json::Value::Null,
        )]);
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = ConfigFingerprint::compute(&scenario_config());
        let b = ConfigFingerprint::compute(&scenario_config());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_params() {
        let original = ConfigFingerprint::compute(&scenario_config());
        let mut changed = scenario_config();
        changed.checks[0].params = json!(["LICENSE", "AUTHORS", "CONTRIBUTING.md"]);
        assert_ne!(original, ConfigFingerprint::compute(&changed));
    }

    #[test]
    fn test_fingerprint_changes_with_version() {
        let original = ConfigFingerprint::compute(&scenario_config());
        let mut changed = scenario_config();
        changed.version = "2".to_string();
        assert_ne!(original, ConfigFingerprint::compute(&changed));
    }

    #[test]
    fn test_fingerprint_ignores_param_key_order() {
        let a: CheckConfig = serde_json::from_str(
            r#"{"checks":[
                {"name":"p","kind":"content_pattern","params":{"file":"V","pattern":"x"}}
            ]}"#,
        )
        .unwrap();
        let b: CheckConfig = serde_json::from_str(
            r#"{"checks":[
                {"name":"p","kind":"content_pattern","params":{"pattern":"x","file":"V"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(ConfigFingerprint::compute(&a), ConfigFingerprint::compute(&b));
    }

    #[test]
    fn test_fingerprint_short_and_matches() {
        let fp = ConfigFingerprint::compute(&scenario_config());
        assert_eq!(fp.short().len(), ConfigFingerprint::SHORT_LEN);
        assert!(fp.matches(fp.short()));
        assert!(!fp.matches("000000000000"));
        assert!(!fp.matches(""));
    }

    #[test]
    fn test_fingerprint_tag_round_trip() {
        let fp = ConfigFingerprint::compute(&scenario_config());
        let description = format!("2 checks: 1 failed (content pattern) {}", fp.tag());
        let embedded = ConfigFingerprint::extract(&description).unwrap();
        assert!(fp.matches(embedded));

        assert_eq!(ConfigFingerprint::extract("all checks passed"), None);
        assert_eq!(ConfigFingerprint::extract("broken [cfg:"), None);
        assert_eq!(ConfigFingerprint::extract("empty [cfg:]"), None);
    }

    #[test]
    fn test_load_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"version": "3", "checks": [
                {{"name": "license", "kind": "required_files", "params": ["LICENSE"]}}
            ]}}"#
        )
        .unwrap();

        let config = CheckConfig::load(file.path()).expect("load failed");
        assert_eq!(config.version, "3");
        assert_eq!(config.checks.len(), 1);
        assert_eq!(config.checks[0].kind, CheckKind::RequiredFiles);
    }

    #[test]
    fn test_load_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
version = "1"

[[checks]]
name = "version format"
kind = "content_pattern"
params = {{ file = "VERSION", pattern = '^\d+\.\d+\.\d+$' }}

[[checks]]
name = "manifest"
kind = "structured_document"
params = {{ file = "package.json", format = "json", required_keys = ["name", "scripts.test"] }}
"#
        )
        .unwrap();

        let config = CheckConfig::load(file.path()).expect("load failed");
        let set = config.compile().expect("compile failed");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            CheckConfig::load(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CheckConfig::load(Path::new("/nonexistent/prgate.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
