use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bunsen_core::{DispatchContext, ServiceType, ThreadId, CORRELATION_ID_HEADER};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::GitHubAuth;
use crate::dispatcher::{JobTrigger, TriggerError};
use crate::recording::{create_http_client, RecordingLogger};

/// Posts comments on issues.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Returns the new comment's id.
    async fn post_comment(
        &self,
        thread: &ThreadId,
        installation_id: Option<u64>,
        body: &str,
        correlation_id: Option<&str>,
    ) -> Result<u64>;
}

/// Why no access token could be obtained.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The configured credentials cannot produce a token; retrying will not help.
    #[error("{0}")]
    Misconfigured(String),
    #[error("installation token request failed: {status} - {body}")]
    Rejected { status: u16, body: String },
    #[error("{0}")]
    Unavailable(String),
}

impl From<AuthError> for TriggerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Misconfigured(message) => TriggerError::Permanent(message),
            AuthError::Rejected { status, body } => TriggerError::from_status(status, &body),
            AuthError::Unavailable(message) => TriggerError::Transient(message),
        }
    }
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_base: String,
    auth: GitHubAuth,
    token_cache: Arc<RwLock<HashMap<u64, CachedToken>>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

/// Inputs declared by the dispatched workflow. All values are strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowInputs {
    pub repo_name: String,
    pub repo_branch: String,
    pub issue_id: String,
    pub installation_id: String,
}

#[derive(Debug, Serialize)]
struct WorkflowDispatchRequest<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: &'a WorkflowInputs,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

impl GitHubClient {
    pub fn new(auth: GitHubAuth, api_base: impl Into<String>) -> Result<Self> {
        Self::new_with_recording(auth, api_base, None)
    }

    pub fn new_with_recording(
        auth: GitHubAuth,
        api_base: impl Into<String>,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        Ok(Self {
            client: create_http_client(recording_logger, ServiceType::GitHub)?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            auth,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn generate_jwt(app_id: u64, private_key: &str) -> Result<String, AuthError> {
        let now = u64::try_from(Utc::now().timestamp())
            .map_err(|_| AuthError::Misconfigured("System clock is before 1970".to_string()))?;
        let claims = GitHubAppClaims {
            iss: app_id,
            // GitHub allows ten minutes at most; backdate for clock drift.
            iat: now - 60,
            exp: now + 600,
        };

        let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
            AuthError::Misconfigured(format!("Failed to parse GitHub App private key: {}", e))
        })?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| AuthError::Misconfigured(format!("Failed to encode JWT: {}", e)))
    }

    async fn get_installation_token(
        &self,
        app_id: u64,
        private_key: &str,
        installation_id: u64,
    ) -> Result<String, AuthError> {
        if let Some(cached) = self.token_cache.read().await.get(&installation_id) {
            // Tokens live an hour; refresh with five minutes to spare.
            if cached.expires_at - Utc::now() > Duration::minutes(5) {
                return Ok(cached.token.clone());
            }
        }

        let jwt = Self::generate_jwt(app_id, private_key)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        info!("Requesting installation token for installation {}", installation_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| {
                AuthError::Unavailable(format!("Failed to send installation token request: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Installation token request failed: {} - {}", status, error_text);
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let issued: InstallationTokenResponse = response.json().await.map_err(|e| {
            AuthError::Unavailable(format!("Failed to parse installation token response: {}", e))
        })?;
        let expires_at = DateTime::parse_from_rfc3339(&issued.expires_at)
            .map_err(|e| AuthError::Unavailable(format!("Failed to parse token expiration: {}", e)))?
            .with_timezone(&Utc);

        self.token_cache.write().await.insert(
            installation_id,
            CachedToken {
                token: issued.token.clone(),
                expires_at,
            },
        );
        Ok(issued.token)
    }

    async fn access_token(&self, installation_id: Option<u64>) -> Result<String, AuthError> {
        match &self.auth {
            GitHubAuth::Token(token) => Ok(token.clone()),
            GitHubAuth::App {
                app_id,
                private_key,
            } => {
                let installation_id = installation_id.ok_or_else(|| {
                    AuthError::Misconfigured(
                        "GitHub App auth requires an installation id".to_string(),
                    )
                })?;
                self.get_installation_token(*app_id, private_key, installation_id)
                    .await
            }
        }
    }

    fn authorized(
        &self,
        builder: RequestBuilder,
        token: &str,
        correlation_id: Option<&str>,
    ) -> RequestBuilder {
        let builder = builder
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match correlation_id {
            Some(cid) => builder.header(CORRELATION_ID_HEADER, cid),
            None => builder,
        }
    }

    pub async fn post_issue_comment(
        &self,
        correlation_id: Option<&str>,
        installation_id: Option<u64>,
        thread: &ThreadId,
        comment_body: &str,
    ) -> Result<Comment> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_base, thread.repo_owner, thread.repo_name, thread.issue_number
        );

        info!("Posting comment to {}", thread);

        let token = self.access_token(installation_id).await?;
        let response = self
            .authorized(self.client.post(&url), &token, correlation_id)
            .json(&CreateCommentRequest { body: comment_body })
            .send()
            .await
            .context("Failed to send issue comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error: {} - {}", status, error_text);
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        let comment: Comment = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Posted comment {} on {}", comment.id, thread);

        Ok(comment)
    }

    /// Fire a `workflow_dispatch` event. GitHub answers 204 with no body.
    pub async fn dispatch_workflow(
        &self,
        correlation_id: Option<&str>,
        installation_id: Option<u64>,
        thread: &ThreadId,
        workflow_file: &str,
        git_ref: &str,
        inputs: &WorkflowInputs,
    ) -> Result<(), TriggerError> {
        let url = format!(
            "{}/repos/{}/{}/actions/workflows/{}/dispatches",
            self.api_base, thread.repo_owner, thread.repo_name, workflow_file
        );

        let token = self.access_token(installation_id).await.map_err(|e| {
            error!("No GitHub token to dispatch {} for {}: {}", workflow_file, thread, e);
            TriggerError::from(e)
        })?;

        let response = self
            .authorized(self.client.post(&url), &token, correlation_id)
            .json(&WorkflowDispatchRequest { git_ref, inputs })
            .send()
            .await
            .map_err(|e| TriggerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!("Dispatched workflow {} for {}", workflow_file, thread);
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        error!(
            "Workflow dispatch for {} failed: {} - {}",
            thread, status, error_text
        );
        Err(TriggerError::from_status(status.as_u16(), &error_text))
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn post_comment(
        &self,
        thread: &ThreadId,
        installation_id: Option<u64>,
        body: &str,
        correlation_id: Option<&str>,
    ) -> Result<u64> {
        let comment = self
            .post_issue_comment(correlation_id, installation_id, thread, body)
            .await?;
        Ok(comment.id)
    }
}

/// `JobTrigger` that runs a GitHub Actions workflow in the issue's repository.
#[derive(Clone)]
pub struct WorkflowDispatchTrigger {
    github: GitHubClient,
    workflow_file: String,
    git_ref: String,
}

impl WorkflowDispatchTrigger {
    pub fn new(github: GitHubClient, workflow_file: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            github,
            workflow_file: workflow_file.into(),
            git_ref: git_ref.into(),
        }
    }

    pub fn inputs_for(&self, context: &DispatchContext) -> WorkflowInputs {
        WorkflowInputs {
            repo_name: context.thread_id.full_repo_name(),
            repo_branch: self.git_ref.clone(),
            issue_id: context.thread_id.issue_number.to_string(),
            installation_id: context
                .installation_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl JobTrigger for WorkflowDispatchTrigger {
    async fn trigger(
        &self,
        context: &DispatchContext,
        correlation_id: Option<&str>,
    ) -> Result<(), TriggerError> {
        let inputs = self.inputs_for(context);
        self.github
            .dispatch_workflow(
                correlation_id,
                context.installation_id,
                &context.thread_id,
                &self.workflow_file,
                &self.git_ref,
                &inputs,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bunsen_core::DeliveryId;
    use httpmock::prelude::*;
    use serde_json::json;

    fn token_client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(GitHubAuth::Token("ghp_test".to_string()), server.base_url()).unwrap()
    }

    fn context() -> DispatchContext {
        DispatchContext {
            thread_id: ThreadId::new("acme", "widgets", 42),
            delivery_id: DeliveryId::new("d-42"),
            installation_id: Some(777),
            title: "Add a frobnicator".to_string(),
            body: None,
            comments: vec![],
            labels: vec!["ready-for-dev".to_string()],
        }
    }

    #[tokio::test]
    async fn test_post_issue_comment() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/acme/widgets/issues/42/comments")
                .header("authorization", "Bearer ghp_test")
                .header("x-correlation-id", "cid-1")
                .json_body(json!({"body": "hello"}));
            then.status(201).json_body(json!({"id": 9001, "body": "hello"}));
        });

        let client = token_client(&server);
        let id = client
            .post_comment(&ThreadId::new("acme", "widgets", 42), None, "hello", Some("cid-1"))
            .await
            .unwrap();

        mock.assert();
        assert_eq!(id, 9001);
    }

    #[tokio::test]
    async fn test_post_issue_comment_error_is_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/repos/acme/widgets/issues/42/comments");
            then.status(403).body("Resource not accessible by integration");
        });

        let err = token_client(&server)
            .post_comment(&ThreadId::new("acme", "widgets", 42), None, "hello", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_workflow_dispatch_request_shape() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/acme/widgets/actions/workflows/coding_agent.yaml/dispatches")
                .header("authorization", "Bearer ghp_test")
                .json_body(json!({
                    "ref": "main",
                    "inputs": {
                        "repo_name": "acme/widgets",
                        "repo_branch": "main",
                        "issue_id": "42",
                        "installation_id": "777"
                    }
                }));
            then.status(204);
        });

        let trigger = WorkflowDispatchTrigger::new(token_client(&server), "coding_agent.yaml", "main");
        trigger.trigger(&context(), None).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_workflow_dispatch_failures_are_classified() {
        let server = MockServer::start();
        let mut mock = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/acme/widgets/actions/workflows/coding_agent.yaml/dispatches");
            then.status(502).body("Bad Gateway");
        });

        let trigger = WorkflowDispatchTrigger::new(token_client(&server), "coding_agent.yaml", "main");
        let err = trigger.trigger(&context(), None).await.unwrap_err();
        assert!(err.is_transient());
        mock.delete();

        server.mock(|when, then| {
            when.method(POST)
                .path("/repos/acme/widgets/actions/workflows/coding_agent.yaml/dispatches");
            then.status(422).body("Unexpected inputs provided");
        });
        let err = trigger.trigger(&context(), None).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("422"));
    }

    #[tokio::test]
    async fn test_app_auth_requires_installation() {
        let client = GitHubClient::new(
            GitHubAuth::App {
                app_id: 1,
                private_key: "not a key".to_string(),
            },
            "http://127.0.0.1:9",
        )
        .unwrap();
        let err = client.access_token(None).await.unwrap_err();
        assert!(err.to_string().contains("installation id"));
    }

    #[tokio::test]
    async fn test_credential_problems_are_permanent_dispatch_failures() {
        let client = GitHubClient::new(
            GitHubAuth::App {
                app_id: 1,
                private_key: "not a key".to_string(),
            },
            "http://127.0.0.1:9",
        )
        .unwrap();
        let trigger = WorkflowDispatchTrigger::new(client, "coding_agent.yaml", "main");

        let err = trigger.trigger(&context(), None).await.unwrap_err();
        assert!(!err.is_transient(), "unparsable key: {}", err);
        assert!(err.to_string().contains("private key"));

        let mut ctx = context();
        ctx.installation_id = None;
        let err = trigger.trigger(&ctx, None).await.unwrap_err();
        assert!(!err.is_transient(), "missing installation: {}", err);
    }

    #[test]
    fn test_token_request_failures_keep_their_retry_class() {
        let rejected = |status| AuthError::Rejected {
            status,
            body: "nope".to_string(),
        };
        assert!(TriggerError::from(rejected(502)).is_transient());
        assert!(!TriggerError::from(rejected(404)).is_transient());
        assert!(TriggerError::from(AuthError::Unavailable("reset".to_string())).is_transient());
    }

    #[tokio::test]
    async fn test_cached_installation_token_is_reused() {
        let client = GitHubClient::new(
            GitHubAuth::App {
                app_id: 1,
                private_key: "not a key".to_string(),
            },
            "http://127.0.0.1:9",
        )
        .unwrap();
        client.token_cache.write().await.insert(
            777,
            CachedToken {
                token: "ghs_cached".to_string(),
                expires_at: Utc::now() + Duration::minutes(30),
            },
        );

        assert_eq!(client.access_token(Some(777)).await.unwrap(), "ghs_cached");

        // Close to expiry: a fresh token is needed, and this key cannot sign one.
        client.token_cache.write().await.insert(
            777,
            CachedToken {
                token: "ghs_stale".to_string(),
                expires_at: Utc::now() + Duration::minutes(2),
            },
        );
        let err = client.access_token(Some(777)).await.unwrap_err();
        assert!(err.to_string().contains("private key"));
    }

    #[test]
    fn test_inputs_without_installation() {
        let server_url = "http://127.0.0.1:9";
        let trigger = WorkflowDispatchTrigger::new(
            GitHubClient::new(GitHubAuth::Token("t".to_string()), server_url).unwrap(),
            "coding_agent.yaml",
            "develop",
        );
        let mut ctx = context();
        ctx.installation_id = None;
        assert_eq!(
            trigger.inputs_for(&ctx),
            WorkflowInputs {
                repo_name: "acme/widgets".to_string(),
                repo_branch: "develop".to_string(),
                issue_id: "42".to_string(),
                installation_id: String::new(),
            }
        );
    }
}
