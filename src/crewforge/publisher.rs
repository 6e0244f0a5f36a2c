//! Uploads a completed project to a remote code-hosting service.
//!
//! Publication is explicit and client-triggered — the engine never publishes
//! during turn execution.  The narrow [`RepositoryPublisher`] trait keeps the
//! remote pluggable: production wires a [`GitHubPublisher`], tests inject a
//! mock.  Absence of a publisher is reported when a workflow that intends to
//! publish is submitted, not at publish time.
//!
//! # Credential hygiene
//!
//! Tokens and usernames are whitespace-trimmed and validated at ingestion
//! (a trailing space on a stored username once corrupted repository URLs;
//! trimming at use sites is too late).  Credentials never appear in logs —
//! diagnostics carry only a short fingerprint hash.

use crate::crewforge::clients::common::get_shared_http_client;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// How long to poll a freshly created repository before giving up.
const ADDRESSABLE_DEADLINE: Duration = Duration::from_secs(10);
/// Delay between metadata polls.
const ADDRESSABLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Requested repository visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Errors raised during credential ingestion.
#[derive(Debug, Clone)]
pub enum CredentialError {
    /// Value was empty after trimming.
    Empty(&'static str),
    /// Value contained control characters or interior whitespace.
    Malformed(&'static str),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Empty(field) => write!(f, "credential field '{}' is empty", field),
            CredentialError::Malformed(field) => write!(
                f,
                "credential field '{}' contains whitespace or control characters",
                field
            ),
        }
    }
}

impl Error for CredentialError {}

/// Opaque token + username pair for the remote host.
///
/// Construction trims surrounding whitespace and rejects values with
/// embedded whitespace or control characters outright.
#[derive(Clone)]
pub struct RepoCredentials {
    token: String,
    username: String,
}

impl RepoCredentials {
    /// Ingest raw credential values, trimming and validating both.
    pub fn new(token: &str, username: &str) -> Result<Self, CredentialError> {
        Ok(RepoCredentials {
            token: ingest_field(token, "token")?,
            username: ingest_field(username, "username")?,
        })
    }

    /// The account name the repository will be created under.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// Short stable hash of the token, safe for diagnostics.
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for RepoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCredentials")
            .field("username", &self.username)
            .field("token", &format!("sha256:{}…", self.token_fingerprint()))
            .finish()
    }
}

fn ingest_field(raw: &str, field: &'static str) -> Result<String, CredentialError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CredentialError::Empty(field));
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() || c.is_whitespace())
    {
        return Err(CredentialError::Malformed(field));
    }
    Ok(trimmed.to_string())
}

/// One file to upload.
#[derive(Debug, Clone)]
pub struct PublishFile {
    /// Path relative to the repository root.
    pub relative_path: String,
    /// UTF-8 file contents.
    pub contents: String,
}

/// Everything the publisher needs for one upload.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Project name the repository name is derived from.
    pub project_name: String,
    /// Commit message for the single upload commit.
    pub commit_message: String,
    /// Files to push, README included.
    pub files: Vec<PublishFile>,
    /// Requested visibility.
    pub visibility: Visibility,
}

/// Result of a successful publication.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    /// Browser URL of the created repository.
    pub repository_url: String,
    /// SHA of the upload commit.
    pub commit_id: String,
    /// Number of files in the commit.
    pub files_pushed: usize,
}

/// Failures surfaced by [`RepositoryPublisher::publish`].
#[derive(Debug, Clone)]
pub enum PublishError {
    /// Both the candidate name and its suffixed retry collided.
    NameConflict(String),
    /// The remote rejected our credentials.
    Auth(String),
    /// The remote never became addressable, or the network failed.
    RemoteUnavailable(String),
    /// Repository was created but the upload did not complete.  The created
    /// repository is left as-is.
    Upload(String),
}

impl PublishError {
    /// Stable string code for structured errors.
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::NameConflict(_) => "publish_name_conflict",
            PublishError::Auth(_) => "publish_auth_failed",
            PublishError::RemoteUnavailable(_) => "publish_remote_unavailable",
            PublishError::Upload(_) => "publish_failed",
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NameConflict(name) => {
                write!(f, "repository name conflict for '{}'", name)
            }
            PublishError::Auth(msg) => write!(f, "remote rejected credentials: {}", msg),
            PublishError::RemoteUnavailable(msg) => write!(f, "remote unavailable: {}", msg),
            PublishError::Upload(msg) => write!(f, "upload failed: {}", msg),
        }
    }
}

impl Error for PublishError {}

/// Pluggable interface to the remote code host.
#[async_trait]
pub trait RepositoryPublisher: Send + Sync {
    /// Create a repository and push every file in a single commit.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishError>;

    /// Cheap credential probe, used at submission time for workflows that
    /// intend to publish.
    async fn validate_credentials(&self) -> Result<(), PublishError>;
}

/// Derive a remote-safe repository name from a project name: lowercased,
/// non-alphanumeric runs collapsed to `-`, surrounding `-` trimmed, bounded
/// to 80 characters.
pub fn sanitize_repo_name(project_name: &str) -> String {
    let mut name = String::new();
    let mut last_was_dash = true;
    for c in project_name.chars() {
        if name.len() >= 80 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            name.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = name.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "workflow-project".to_string()
    } else {
        trimmed
    }
}

/// [`RepositoryPublisher`] backed by the GitHub REST API.
///
/// The upload uses the Git data API so all files land in one commit: create
/// a blob per file, a tree on top of the auto-init commit, a commit, then
/// fast-forward the default branch.
pub struct GitHubPublisher {
    http: reqwest::Client,
    api_base: String,
    credentials: RepoCredentials,
}

impl GitHubPublisher {
    /// Publisher against the public GitHub API.
    pub fn new(credentials: RepoCredentials) -> Self {
        Self::new_with_api_base(credentials, "https://api.github.com")
    }

    /// Publisher against a GitHub-compatible API root (enterprise installs,
    /// test doubles).
    pub fn new_with_api_base(credentials: RepoCredentials, api_base: &str) -> Self {
        GitHubPublisher {
            http: get_shared_http_client().clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.credentials.token()))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "crewforge")
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value), PublishError> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| PublishError::RemoteUnavailable(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PublishError::Auth(format!(
                "HTTP {} (token sha256:{}…)",
                status.as_u16(),
                self.credentials.token_fingerprint()
            )));
        }
        let value = resp
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok((status, value))
    }

    /// Create the repository, handling the one-shot conflict retry.  Returns
    /// the canonical `full_name`, browser URL, and default branch as reported
    /// by the remote — the client-derived candidate is not reused afterwards.
    async fn create_repository(
        &self,
        candidate: &str,
        visibility: Visibility,
    ) -> Result<(String, String, String), PublishError> {
        let mut name = candidate.to_string();
        for attempt in 0..2 {
            let body = serde_json::json!({
                "name": name,
                "private": visibility == Visibility::Private,
                "auto_init": true,
                "description": "Generated by a multi-agent workflow",
            });
            let (status, value) = self
                .send_json(reqwest::Method::POST, "/user/repos", Some(&body))
                .await?;

            if status.is_success() {
                let full_name = value
                    .get("full_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        PublishError::Upload("create response missing full_name".to_string())
                    })?
                    .to_string();
                let html_url = value
                    .get("html_url")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let default_branch = value
                    .get("default_branch")
                    .and_then(|v| v.as_str())
                    .unwrap_or("main")
                    .to_string();
                return Ok((full_name, html_url, default_branch));
            }

            let conflict = status.as_u16() == 409
                || (status.as_u16() == 422
                    && value.to_string().contains("already exists"));
            if conflict && attempt == 0 {
                name = format!(
                    "{}-{}",
                    name,
                    chrono::Utc::now().format("%m%d%H%M%S")
                );
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "crewforge::publisher: name conflict, retrying as '{}'",
                        name
                    );
                }
                continue;
            }
            if conflict {
                return Err(PublishError::NameConflict(name));
            }
            return Err(PublishError::Upload(format!(
                "create returned HTTP {}: {}",
                status.as_u16(),
                value
            )));
        }
        Err(PublishError::NameConflict(name))
    }

    /// Poll repository metadata until the remote can serve it, and return
    /// the SHA of the auto-init commit plus its tree.
    async fn wait_addressable(
        &self,
        full_name: &str,
        default_branch: &str,
    ) -> Result<(String, String), PublishError> {
        let deadline = Instant::now() + ADDRESSABLE_DEADLINE;
        loop {
            let (status, _) = self
                .send_json(
                    reqwest::Method::GET,
                    &format!("/repos/{}", full_name),
                    None,
                )
                .await?;
            if status.is_success() {
                let (ref_status, ref_value) = self
                    .send_json(
                        reqwest::Method::GET,
                        &format!("/repos/{}/git/ref/heads/{}", full_name, default_branch),
                        None,
                    )
                    .await?;
                if ref_status.is_success() {
                    if let Some(commit_sha) = ref_value
                        .get("object")
                        .and_then(|o| o.get("sha"))
                        .and_then(|s| s.as_str())
                    {
                        let (commit_status, commit_value) = self
                            .send_json(
                                reqwest::Method::GET,
                                &format!("/repos/{}/git/commits/{}", full_name, commit_sha),
                                None,
                            )
                            .await?;
                        if commit_status.is_success() {
                            if let Some(tree_sha) = commit_value
                                .get("tree")
                                .and_then(|t| t.get("sha"))
                                .and_then(|s| s.as_str())
                            {
                                return Ok((commit_sha.to_string(), tree_sha.to_string()));
                            }
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(PublishError::RemoteUnavailable(format!(
                    "repository {} not addressable within {:?}",
                    full_name, ADDRESSABLE_DEADLINE
                )));
            }
            tokio::time::sleep(ADDRESSABLE_POLL_INTERVAL).await;
        }
    }

    async fn upload_single_commit(
        &self,
        full_name: &str,
        default_branch: &str,
        base_commit: &str,
        base_tree: &str,
        request: &PublishRequest,
    ) -> Result<String, PublishError> {
        let mut tree_entries = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let body = serde_json::json!({
                "content": file.contents,
                "encoding": "utf-8",
            });
            let (status, value) = self
                .send_json(
                    reqwest::Method::POST,
                    &format!("/repos/{}/git/blobs", full_name),
                    Some(&body),
                )
                .await?;
            let sha = value.get("sha").and_then(|s| s.as_str()).filter(|_| status.is_success());
            let sha = sha.ok_or_else(|| {
                PublishError::Upload(format!(
                    "blob upload for '{}' returned HTTP {}",
                    file.relative_path,
                    status.as_u16()
                ))
            })?;
            tree_entries.push(serde_json::json!({
                "path": file.relative_path,
                "mode": "100644",
                "type": "blob",
                "sha": sha,
            }));
        }

        let tree_body = serde_json::json!({
            "base_tree": base_tree,
            "tree": tree_entries,
        });
        let (status, tree_value) = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{}/git/trees", full_name),
                Some(&tree_body),
            )
            .await?;
        let tree_sha = tree_value
            .get("sha")
            .and_then(|s| s.as_str())
            .filter(|_| status.is_success())
            .ok_or_else(|| {
                PublishError::Upload(format!("tree creation returned HTTP {}", status.as_u16()))
            })?
            .to_string();

        let commit_body = serde_json::json!({
            "message": request.commit_message,
            "tree": tree_sha,
            "parents": [base_commit],
        });
        let (status, commit_value) = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{}/git/commits", full_name),
                Some(&commit_body),
            )
            .await?;
        let commit_sha = commit_value
            .get("sha")
            .and_then(|s| s.as_str())
            .filter(|_| status.is_success())
            .ok_or_else(|| {
                PublishError::Upload(format!("commit creation returned HTTP {}", status.as_u16()))
            })?
            .to_string();

        let ref_body = serde_json::json!({ "sha": commit_sha, "force": false });
        let (status, _) = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/repos/{}/git/refs/heads/{}", full_name, default_branch),
                Some(&ref_body),
            )
            .await?;
        if !status.is_success() {
            return Err(PublishError::Upload(format!(
                "branch update returned HTTP {}",
                status.as_u16()
            )));
        }
        Ok(commit_sha)
    }
}

#[async_trait]
impl RepositoryPublisher for GitHubPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishError> {
        let candidate = sanitize_repo_name(&request.project_name);
        let (full_name, html_url, default_branch) =
            self.create_repository(&candidate, request.visibility).await?;

        let (base_commit, base_tree) =
            self.wait_addressable(&full_name, &default_branch).await?;

        let commit_id = self
            .upload_single_commit(&full_name, &default_branch, &base_commit, &base_tree, request)
            .await?;

        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "crewforge::publisher: pushed {} files to {} ({})",
                request.files.len(),
                full_name,
                commit_id
            );
        }
        Ok(PublishOutcome {
            repository_url: html_url,
            commit_id,
            files_pushed: request.files.len(),
        })
    }

    async fn validate_credentials(&self) -> Result<(), PublishError> {
        let (status, _) = self.send_json(reqwest::Method::GET, "/user", None).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(PublishError::Auth(format!("HTTP {}", status.as_u16())))
        }
    }
}
