//! External service contracts + client implementations for starwatch.
//!
//! The metadata and summary clients are total over their inputs: every
//! per-item failure (malformed identifier, service error, transport error)
//! is logged and converted to an absent value. Only the ranking source can
//! fail the run as a whole.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use starwatch_core::{RankedRepo, RepoId, RepoMetadata};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "starwatch-adapters";

pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";
pub const DEFAULT_SUMMARY_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces the ranked (repo, trailing-window stars) handoff, already sorted
/// and limited upstream. A failure here aborts the run.
#[async_trait]
pub trait RankingSource: Send + Sync {
    async fn fetch_ranking(&self, limit: usize) -> Result<Vec<RankedRepo>, RankingError>;
}

/// One metadata lookup per repository identifier. Total: never errors, never
/// panics; failures become [`RepoMetadata::absent`].
#[async_trait]
pub trait RepoMetadataSource: Send + Sync {
    async fn fetch_metadata(&self, repo_name: &str) -> RepoMetadata;
}

/// One narrative summary per repository. Total: failures become `None`.
#[async_trait]
pub trait SummarySource: Send + Sync {
    async fn generate(&self, request: &SummaryRequest) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Ranking handoff
// ---------------------------------------------------------------------------

/// Reads the warehouse export: a JSON array of `{repo_name, star_count}`
/// records, sorted by the upstream query.
#[derive(Debug, Clone)]
pub struct JsonRankingSource {
    path: PathBuf,
}

impl JsonRankingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RankingSource for JsonRankingSource {
    async fn fetch_ranking(&self, limit: usize) -> Result<Vec<RankedRepo>, RankingError> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading ranking handoff {}", self.path.display()))?;
        let mut ranked: Vec<RankedRepo> = serde_json::from_str(&text)
            .with_context(|| format!("parsing ranking handoff {}", self.path.display()))?;
        ranked.truncate(limit);
        Ok(ranked)
    }
}

// ---------------------------------------------------------------------------
// Repository metadata (GraphQL-shaped query service)
// ---------------------------------------------------------------------------

const REPOSITORY_QUERY: &str =
    "query($owner: String!, $name: String!) { repository(owner: $owner, name: $name) { createdAt stargazerCount } }";

#[derive(Debug, Error)]
enum MetadataError {
    #[error("http status {0}")]
    Status(StatusCode),
    #[error("response missing data envelope")]
    MissingData,
    #[error("repository object is null")]
    NullRepository,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: RepositoryVariables<'a>,
}

#[derive(Debug, Serialize)]
struct RepositoryVariables<'a> {
    owner: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    data: Option<RepositoryData>,
}

#[derive(Debug, Deserialize)]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct RepositoryNode {
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
    #[serde(rename = "stargazerCount")]
    stargazer_count: Option<u64>,
}

fn metadata_from_envelope(envelope: GraphqlEnvelope) -> Result<RepoMetadata, MetadataError> {
    let data = envelope.data.ok_or(MetadataError::MissingData)?;
    let node = data.repository.ok_or(MetadataError::NullRepository)?;
    Ok(RepoMetadata {
        created_at: node.created_at,
        stargazer_count: node.stargazer_count,
    })
}

/// GitHub GraphQL metadata client. One request per lookup, bearer-token
/// authenticated, single attempt.
#[derive(Debug, Clone)]
pub struct GithubGraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl GithubGraphqlClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    async fn request(&self, id: &RepoId) -> Result<RepoMetadata, MetadataError> {
        let body = GraphqlRequest {
            query: REPOSITORY_QUERY,
            variables: RepositoryVariables {
                owner: &id.owner,
                name: &id.name,
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status));
        }
        let envelope: GraphqlEnvelope = response.json().await?;
        metadata_from_envelope(envelope)
    }
}

#[async_trait]
impl RepoMetadataSource for GithubGraphqlClient {
    async fn fetch_metadata(&self, repo_name: &str) -> RepoMetadata {
        let Some(id) = RepoId::parse(repo_name) else {
            warn!(repo = repo_name, "malformed repository identifier; lookup skipped");
            return RepoMetadata::absent();
        };
        match self.request(&id).await {
            Ok(metadata) => {
                debug!(repo = repo_name, "metadata lookup succeeded");
                metadata
            }
            Err(err) => {
                warn!(repo = repo_name, error = %err, "metadata lookup failed");
                RepoMetadata::absent()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Narrative summaries (chat-completion-shaped service)
// ---------------------------------------------------------------------------

/// Inputs for one summary prompt; only built for entries whose metadata pair
/// is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub repo_name: String,
    pub recent_stars: u64,
    pub created_at: String,
    pub current_stars: u64,
}

impl SummaryRequest {
    pub fn render_prompt(&self) -> String {
        format!(
            "The GitHub repository {} gained {} stars over the recent trending window. \
             It was created on {} and currently has {} stars in total. \
             In two sentences, describe what this repository most likely is and why it is trending.",
            self.repo_name, self.recent_stars, self.created_at, self.current_stars
        )
    }
}

#[derive(Debug, Error)]
enum SummaryError {
    #[error("http status {0}")]
    Status(StatusCode),
    #[error("response contained no completion")]
    NoCompletion,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatEnvelope {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

fn completion_from_envelope(envelope: ChatEnvelope) -> Result<String, SummaryError> {
    envelope
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or(SummaryError::NoCompletion)
}

/// Chat-completion summary client. Model selection is configuration, not a
/// runtime decision; one request per entry, single attempt.
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    model: String,
}

impl ChatCompletionClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        token: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
            model: model.into(),
        }
    }

    async fn request(&self, prompt: &str) -> Result<String, SummaryError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SummaryError::Status(status));
        }
        let envelope: ChatEnvelope = response.json().await?;
        completion_from_envelope(envelope)
    }
}

#[async_trait]
impl SummarySource for ChatCompletionClient {
    async fn generate(&self, request: &SummaryRequest) -> Option<String> {
        let prompt = request.render_prompt();
        match self.request(&prompt).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(repo = %request.repo_name, error = %err, "summary generation failed");
                None
            }
        }
    }
}
