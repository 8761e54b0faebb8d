//! Check execution against repository contents at one commit.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::definition::{Check, CheckSet, CompiledCheck, DocumentFormat};
use super::result::{CheckResult, RunVerdict};
use crate::error::{CheckError, ProviderResult};
use crate::model::RepositorySlug;
use crate::provider::{CiProvider, CodeHost, ExecutionFilter};
use crate::retry::RetryPolicy;

/// Read-only view of a repository at a head commit.
///
/// Every provider read goes through the retry policy. Successful file reads
/// are cached per `(ref, path)` for the lifetime of the snapshot, so checks
/// sharing a file fetch it once.
pub struct RepoSnapshot<'a> {
    host: &'a dyn CodeHost,
    repository: &'a RepositorySlug,
    head: String,
    retry: &'a RetryPolicy,
    pipeline: Option<PipelineSource<'a>>,
    cache: HashMap<(String, String), Option<Vec<u8>>>,
}

/// The CI execution that built the head commit.
struct PipelineSource<'a> {
    ci: &'a dyn CiProvider,
    execution_id: String,
}

impl<'a> RepoSnapshot<'a> {
    pub fn new(
        host: &'a dyn CodeHost,
        repository: &'a RepositorySlug,
        head: impl Into<String>,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            host,
            repository,
            head: head.into(),
            retry,
            pipeline: None,
            cache: HashMap::new(),
        }
    }

    /// Attach the CI execution that built the head, for pipeline checks.
    pub fn with_pipeline(
        mut self,
        ci: &'a dyn CiProvider,
        execution_id: impl Into<String>,
    ) -> Self {
        self.pipeline = Some(PipelineSource {
            ci,
            execution_id: execution_id.into(),
        });
        self
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn repository(&self) -> &RepositorySlug {
        self.repository
    }

    /// File content at the head commit.
    pub async fn file(&mut self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        let head = self.head.clone();
        self.file_at(&head, path).await
    }

    /// File content at an arbitrary ref.
    pub async fn file_at(
        &mut self,
        git_ref: &str,
        path: &str,
    ) -> ProviderResult<Option<Vec<u8>>> {
        let key = (git_ref.to_string(), path.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let host = self.host;
        let repository = self.repository;
        let content = self
            .retry
            .run("fetch_file", || host.fetch_file(repository, git_ref, path))
            .await?;

        self.cache.insert(key, content.clone());
        Ok(content)
    }

    /// Submodule commit at `git_ref`, `None` when `path` is not a submodule.
    pub async fn submodule_at(&self, git_ref: &str, path: &str) -> ProviderResult<Option<String>> {
        let host = self.host;
        let repository = self.repository;
        self.retry
            .run("submodule_revision", || {
                host.submodule_revision(repository, git_ref, path)
            })
            .await
    }

    /// Compiled CI configurations of the attached execution and of the
    /// newest execution matching `reference`, in that order.
    async fn pipeline_configs(
        &self,
        reference: &ExecutionFilter,
    ) -> Result<(String, String), CheckError> {
        let Some(pipeline) = &self.pipeline else {
            return Err(CheckError::Unavailable(
                "no pipeline execution attached to this commit".to_string(),
            ));
        };
        let ci = pipeline.ci;
        let repository = self.repository;

        let reference_id = self
            .retry
            .run("find_execution", || ci.find_execution(repository, reference))
            .await?
            .ok_or_else(|| {
                CheckError::Unavailable(format!("no reference pipeline on {}", reference.branch))
            })?;
        let current = self
            .retry
            .run("compiled_config", || ci.compiled_config(&pipeline.execution_id))
            .await?
            .ok_or_else(|| {
                CheckError::Unavailable(format!(
                    "pipeline {} has no compiled configuration",
                    pipeline.execution_id
                ))
            })?;
        let base = self
            .retry
            .run("compiled_config", || ci.compiled_config(&reference_id))
            .await?
            .ok_or_else(|| {
                CheckError::Unavailable(format!(
                    "reference pipeline {reference_id} has no compiled configuration"
                ))
            })?;
        Ok((current, base))
    }

    async fn text(&mut self, path: &str) -> Result<Option<String>, CheckError> {
        match self.file(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CheckError::Content {
                    path: path.to_string(),
                }),
            None => Ok(None),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn missing(file: &str) -> CheckResult {
    CheckResult::fail("", format!("{file} not found"))
}

impl CompiledCheck {
    /// Evaluate this check. `Err` means the check could not be evaluated.
    pub async fn evaluate(
        &self,
        snapshot: &mut RepoSnapshot<'_>,
    ) -> Result<CheckResult, CheckError> {
        let mut result = match &self.check {
            Check::RequiredFiles { files } => {
                let mut absent = Vec::new();
                for file in files {
                    if snapshot.file(file).await?.is_none() {
                        absent.push(file.as_str());
                    }
                }
                if absent.is_empty() {
                    CheckResult::pass("", format!("all {} files present", files.len()))
                } else {
                    CheckResult::fail("", format!("missing: {}", absent.join(", ")))
                }
            }

            Check::ContentPattern { file, pattern } => match snapshot.text(file).await? {
                None => missing(file),
                Some(content) => {
                    if pattern.is_match(content.trim_end_matches(['\r', '\n'])) {
                        CheckResult::pass("", format!("{file} matches pattern"))
                    } else {
                        CheckResult::fail("", format!("{file} did not match pattern"))
                    }
                }
            },

            Check::ContentHash { file, sha256 } => match snapshot.file(file).await? {
                None => missing(file),
                Some(bytes) => {
                    let actual = sha256_hex(&bytes);
                    if &actual == sha256 {
                        CheckResult::pass("", format!("{file} has the expected digest"))
                    } else {
                        CheckResult::fail("", format!("{file} digest is {actual}"))
                    }
                }
            },

            Check::MatchesReference { files, reference } => {
                let mut changes: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
                for file in files {
                    let head = snapshot.file(file).await?;
                    let base = snapshot.file_at(reference, file).await?;
                    let change = match (head, base) {
                        (Some(_), None) => Some("added"),
                        (None, Some(_)) => Some("deleted"),
                        (Some(h), Some(b)) if sha256_hex(&h) != sha256_hex(&b) => Some("modified"),
                        _ => None,
                    };
                    if let Some(kind) = change {
                        changes.entry(kind).or_default().push(file.as_str());
                    }
                }
                if changes.is_empty() {
                    CheckResult::pass("", format!("{} files match {reference}", files.len()))
                } else {
                    let summary: Vec<String> = changes
                        .iter()
                        .map(|(kind, files)| format!("{kind}: {}", files.join(", ")))
                        .collect();
                    CheckResult::fail("", summary.join("; "))
                }
            }

            Check::StructuredDocument {
                file,
                format,
                required_keys,
            } => match snapshot.text(file).await? {
                None => missing(file),
                Some(content) => {
                    let document = parse_document(file, *format, &content)?;
                    let absent: Vec<&str> = required_keys
                        .iter()
                        .filter(|key| lookup(&document, key).is_none())
                        .map(String::as_str)
                        .collect();
                    if absent.is_empty() {
                        let message = format!("{file} is a valid {} document", format.as_str());
                        CheckResult::pass("", message)
                    } else {
                        let message = format!("{file} is missing keys: {}", absent.join(", "));
                        CheckResult::fail("", message)
                    }
                }
            },

            Check::PipelineConfig {
                reference,
                exclude_workflows,
                max_pages,
            } => {
                let filter = ExecutionFilter {
                    excluding_workflows: exclude_workflows.clone(),
                    max_pages: *max_pages,
                    ..ExecutionFilter::on_branch(reference.clone())
                };
                let (current, base) = snapshot.pipeline_configs(&filter).await?;
                if sha256_hex(current.as_bytes()) == sha256_hex(base.as_bytes()) {
                    let message = format!("compiled CI configuration matches {reference}");
                    CheckResult::pass("", message)
                } else {
                    let message = format!("compiled CI configuration differs from {reference}");
                    CheckResult::fail("", message)
                }
            }

            Check::SubmoduleRevision { path, reference } => {
                let head = snapshot.head().to_string();
                let current = snapshot.submodule_at(&head, path).await?;
                let base = snapshot.submodule_at(reference, path).await?;
                if current == base {
                    CheckResult::pass("", format!("{path} revision matches {reference}"))
                } else {
                    let describe = |rev: &Option<String>| match rev {
                        Some(rev) => rev.clone(),
                        None => "no submodule".to_string(),
                    };
                    CheckResult::fail(
                        "",
                        format!(
                            "{path} revision changed: {} on {reference}, {} here",
                            describe(&base),
                            describe(&current)
                        ),
                    )
                }
            }
        };

        result.name = self.name.clone();
        Ok(result)
    }
}

fn parse_document(
    path: &str,
    format: DocumentFormat,
    content: &str,
) -> Result<serde_json::Value, CheckError> {
    let parsed: Result<serde_json::Value, String> = match format {
        DocumentFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        DocumentFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| CheckError::Parse {
        path: path.to_string(),
        format: format.as_str(),
        reason,
    })
}

/// Resolve a dotted path (`scripts.test`, `authors.0`) in a document.
fn lookup<'v>(document: &'v serde_json::Value, key: &str) -> Option<&'v serde_json::Value> {
    key.split('.').try_fold(document, |node, segment| match node {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Run every check in configuration order.
///
/// Never short-circuits: a failing or erroring check does not prevent the
/// following ones from running. Only a fatal provider error is returned.
pub async fn run_checks(
    checks: &CheckSet,
    snapshot: &mut RepoSnapshot<'_>,
) -> ProviderResult<Vec<CheckResult>> {
    let mut results = Vec::with_capacity(checks.len());

    for check in checks.iter() {
        let result = match check.evaluate(snapshot).await {
            Ok(result) => result,
            Err(CheckError::Provider(err)) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(
                    repository = %snapshot.repository(),
                    sha = %snapshot.head(),
                    check = %check.name,
                    error = %err,
                    "Check could not be evaluated"
                );
                CheckResult::error(check.name.clone(), err.to_string())
            }
        };

        debug!(
            repository = %snapshot.repository(),
            sha = %snapshot.head(),
            check = %result.name,
            outcome = %result.outcome,
            "Check evaluated"
        );
        results.push(result);
    }

    Ok(results)
}

/// Run every check and aggregate the verdict.
pub async fn evaluate_commit(
    checks: &CheckSet,
    snapshot: &mut RepoSnapshot<'_>,
) -> ProviderResult<RunVerdict> {
    Ok(RunVerdict::from_results(run_checks(checks, snapshot).await?))
}
