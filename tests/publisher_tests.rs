//! Exercises the GitHub publisher against an in-process fake of the remote
//! API: repository creation with a name conflict, the addressability poll,
//! and the single-commit upload through the Git data endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use crewforge::publisher::{
    GitHubPublisher, PublishFile, PublishRequest, RepoCredentials, RepositoryPublisher,
    Visibility,
};
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeRemote {
    /// Repository names already taken on the remote.
    taken: HashSet<String>,
    /// Number of blobs uploaded across all repositories.
    blob_count: usize,
    /// Repositories whose default branch was fast-forwarded.
    updated_repos: Vec<String>,
}

type Shared = Arc<Mutex<FakeRemote>>;

async fn create_repo(
    State(remote): State<Shared>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let name = body["name"].as_str().unwrap_or("").to_string();
    let mut remote = remote.lock().unwrap();
    if remote.taken.contains(&name) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "message": "Repository creation failed.",
                "errors": [{"message": "name already exists on this account"}],
            })),
        );
    }
    remote.taken.insert(name.clone());
    (
        StatusCode::CREATED,
        Json(json!({
            "name": name,
            "full_name": format!("octocat/{}", name),
            "html_url": format!("https://github.example/octocat/{}", name),
            "default_branch": "main",
        })),
    )
}

async fn get_repo(Path(_params): Path<(String, String)>) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn get_ref(
    Path(_params): Path<(String, String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({"object": {"sha": "base-commit-sha"}})),
    )
}

async fn get_commit(
    Path(_params): Path<(String, String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({"tree": {"sha": "base-tree-sha"}})),
    )
}

async fn create_blob(
    State(remote): State<Shared>,
    Path(_params): Path<(String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut remote = remote.lock().unwrap();
    remote.blob_count += 1;
    let sha = format!("blob-{}", remote.blob_count);
    (StatusCode::CREATED, Json(json!({"sha": sha})))
}

async fn create_tree(
    Path(_params): Path<(String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::CREATED, Json(json!({"sha": "tree-sha"})))
}

async fn create_commit(
    Path(_params): Path<(String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::CREATED, Json(json!({"sha": "new-commit-sha"})))
}

async fn update_ref(
    State(remote): State<Shared>,
    Path(params): Path<(String, String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    remote.lock().unwrap().updated_repos.push(params.1);
    (StatusCode::OK, Json(json!({})))
}

async fn get_user() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"login": "octocat"})))
}

async fn start_fake_remote(remote: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/user", get(get_user))
        .route("/user/repos", post(create_repo))
        .route("/repos/{owner}/{repo}", get(get_repo))
        .route("/repos/{owner}/{repo}/git/ref/heads/{branch}", get(get_ref))
        .route("/repos/{owner}/{repo}/git/commits/{sha}", get(get_commit))
        .route("/repos/{owner}/{repo}/git/blobs", post(create_blob))
        .route("/repos/{owner}/{repo}/git/trees", post(create_tree))
        .route("/repos/{owner}/{repo}/git/commits", post(create_commit))
        .route(
            "/repos/{owner}/{repo}/git/refs/heads/{branch}",
            patch(update_ref),
        )
        .with_state(remote);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn publisher_for(addr: SocketAddr) -> GitHubPublisher {
    let credentials = RepoCredentials::new("ghp_testtoken", "octocat").unwrap();
    GitHubPublisher::new_with_api_base(credentials, &format!("http://{}", addr))
}

fn sample_request(project_name: &str) -> PublishRequest {
    PublishRequest {
        project_name: project_name.to_string(),
        commit_message: "Add generated project".to_string(),
        files: vec![
            PublishFile {
                relative_path: "src/add.py".to_string(),
                contents: "def add(a, b): return a + b\n".to_string(),
            },
            PublishFile {
                relative_path: "tests/test_add.py".to_string(),
                contents: "import pytest\n".to_string(),
            },
            PublishFile {
                relative_path: "README.md".to_string(),
                contents: "# project\n".to_string(),
            },
        ],
        visibility: Visibility::Public,
    }
}

#[tokio::test]
async fn publishes_all_files_in_one_commit() {
    let remote: Shared = Arc::new(Mutex::new(FakeRemote::default()));
    let addr = start_fake_remote(remote.clone()).await;
    let publisher = publisher_for(addr);

    let outcome = publisher.publish(&sample_request("My Project")).await.unwrap();

    assert_eq!(outcome.repository_url, "https://github.example/octocat/my-project");
    assert_eq!(outcome.commit_id, "new-commit-sha");
    assert_eq!(outcome.files_pushed, 3);

    let remote = remote.lock().unwrap();
    assert_eq!(remote.blob_count, 3);
    assert_eq!(remote.updated_repos, vec!["my-project".to_string()]);
}

#[tokio::test]
async fn name_conflict_retries_once_with_a_timestamp_suffix() {
    let remote: Shared = Arc::new(Mutex::new(FakeRemote::default()));
    remote.lock().unwrap().taken.insert("my-project".to_string());
    let addr = start_fake_remote(remote.clone()).await;
    let publisher = publisher_for(addr);

    let outcome = publisher.publish(&sample_request("My Project")).await.unwrap();

    // The canonical name from the remote (with the suffix) is what appears
    // in the URL; the original candidate was never reused.
    assert!(outcome.repository_url.contains("my-project-"));
    assert_eq!(outcome.files_pushed, 3);
}

#[tokio::test]
async fn publishing_twice_creates_two_distinct_repositories() {
    let remote: Shared = Arc::new(Mutex::new(FakeRemote::default()));
    let addr = start_fake_remote(remote.clone()).await;
    let publisher = publisher_for(addr);

    let first = publisher.publish(&sample_request("My Project")).await.unwrap();
    let second = publisher.publish(&sample_request("My Project")).await.unwrap();

    assert_ne!(first.repository_url, second.repository_url);
    assert_eq!(remote.lock().unwrap().taken.len(), 2);
}

#[tokio::test]
async fn validate_credentials_probes_the_user_endpoint() {
    let remote: Shared = Arc::new(Mutex::new(FakeRemote::default()));
    let addr = start_fake_remote(remote).await;
    let publisher = publisher_for(addr);

    publisher.validate_credentials().await.unwrap();
}
