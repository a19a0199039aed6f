//! Repair advisor: ask an external reasoning service for a corrected queue.
//!
//! Advisory: [`RepairAdvisor::propose`] never writes the store and degrades to
//! [`RepairOutcome::Unavailable`] on any service failure. A proposal is
//! persisted only through [`apply_proposal`], which refuses stale or
//! structurally invalid proposals.

use super::config::{AdvisorConfig, AdvisorEngine};
use super::error::{AdvisorError, StoreError};
use super::parser::{remap_specs, QueueFile, TaskSpec};
use super::state::{push_specs, QueueStore};
use super::types::*;
use super::validator::validate_queue;
use crate::provenance::fingerprint::fingerprint_tasks;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A service that turns a prompt into text.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Label recorded on proposals, e.g. `anthropic:claude-3-5-haiku-latest`.
    fn name(&self) -> String;

    async fn complete(&self, system: &str, user: &str) -> Result<String, AdvisorError>;
}

// ============================================================================
// HTTP service
// ============================================================================

/// Anthropic Messages API or an OpenAI-compatible chat endpoint.
pub struct HttpReasoningService {
    client: reqwest::Client,
    engine: AdvisorEngine,
    api_key: String,
    api_url: String,
    model: String,
    max_tokens: u32,
}

impl HttpReasoningService {
    /// Build from config, reading the key from the configured variable.
    pub fn from_config(cfg: &AdvisorConfig) -> Result<Self, AdvisorError> {
        let key_var = cfg.api_key_env();
        let api_key = std::env::var(key_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AdvisorError::MissingApiKey(key_var.to_string()))?;
        let client = reqwest::Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self {
            client,
            engine: cfg.engine,
            api_key,
            api_url: cfg.api_url().to_string(),
            model: cfg.model().to_string(),
            max_tokens: cfg.max_tokens,
        })
    }

    async fn complete_anthropic(&self, system: &str, user: &str) -> Result<String, AdvisorError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: user,
            }],
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: AnthropicResponse = response.json().await?;
        body.content
            .into_iter()
            .find_map(|block| block.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or(AdvisorError::EmptyReply)
    }

    async fn complete_openai(&self, system: &str, user: &str) -> Result<String, AdvisorError> {
        let request = OpenAiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: OpenAiResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or(AdvisorError::EmptyReply)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdvisorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AdvisorError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    fn name(&self) -> String {
        format!("{}:{}", self.engine, self.model)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, AdvisorError> {
        tracing::debug!(engine = %self.engine, model = %self.model, "requesting repair");
        match self.engine {
            AdvisorEngine::Anthropic => self.complete_anthropic(system, user).await,
            AdvisorEngine::Openai => self.complete_openai(system, user).await,
        }
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Proposals
// ============================================================================

/// A replacement for the non-completed part of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairProposal {
    /// Fingerprint of the queue the proposal was made against
    pub base_fingerprint: String,
    pub engine: String,
    pub rationale: String,
    pub tasks: Vec<TaskSpec>,
    /// Validation of the queue as it would look after apply
    pub validation: ValidationReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    Proposed(RepairProposal),
    Unavailable { reason: String },
}

/// What `apply_proposal` changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedRepair {
    pub retired: Vec<u32>,
    pub appended: Vec<u32>,
}

const SYSTEM_PROMPT: &str = r#"You repair task queues for a document-management automation engine.
Each task has an action, params, and optional dependsOn indices. A param value
"$N.field" is replaced at run time by field `field` of completed task N's result.

Actions and required params:
- create: name, type (markdown|txt|rtf|html|bookmark|group|formatted-note|sheet), database or group (UUID)
- delete, organize: uuid
- move, replicate, duplicate: uuid, destination (UUID or /group/path)
- modify: uuid and one of name, comment, label, rating, flag, aliases, url, unread
- convert: uuid, format (markdown|txt|rtf|html|pdf|webarchive)
- tag.add, tag.remove: uuid, tags (non-empty list)
- tag.merge: target, sources (non-empty list)
- tag.rename: from, to (different)
- tag.delete: tag
- link, unlink: source, target (different UUIDs)
- summarize: uuids (non-empty list)
- search: query

Completed tasks are kept as they are. Reply with a short explanation followed by
one JSON array of replacement tasks for everything that has not completed, each
{"index": N, "action": "...", "params": {...}, "dependsOn": [...]}.
A task may only reference lower indices. Reference completed tasks by their
existing index."#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptTask<'a> {
    index: u32,
    action: Action,
    params: &'a Params,
    #[serde(skip_serializing_if = "<[u32]>::is_empty")]
    depends_on: &'a [u32],
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletedResult<'a> {
    index: u32,
    action: Action,
    result: &'a ResultMap,
}

/// The user message: queue, issues, and results of completed tasks.
pub fn build_prompt(queue: &Queue, issues: &[Issue]) -> String {
    let tasks: Vec<PromptTask<'_>> = queue
        .tasks
        .iter()
        .map(|t| PromptTask {
            index: t.index,
            action: t.action,
            params: &t.params,
            depends_on: &t.depends_on,
            status: t.status,
            error: t.error.as_deref(),
        })
        .collect();
    let context: Vec<CompletedResult<'_>> = queue
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| {
            t.result.as_ref().map(|result| CompletedResult {
                index: t.index,
                action: t.action,
                result,
            })
        })
        .collect();

    let payload = serde_json::json!({
        "nextIndex": queue.next_index,
        "tasks": tasks,
        "issues": issues,
        "completedResults": context,
    });
    let body = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    format!(
        "Number replacement tasks starting at index {}.\n\n{}",
        queue.next_index, body
    )
}

/// Extract the first non-empty task list from a reply. Text around it is the
/// rationale.
pub fn parse_proposal(reply: &str) -> Result<(Vec<TaskSpec>, String), AdvisorError> {
    let mut saw_empty = false;
    for (start, _) in reply.match_indices(['[', '{']) {
        let mut stream =
            serde_json::Deserializer::from_str(&reply[start..]).into_iter::<QueueFile>();
        if let Some(Ok(file)) = stream.next() {
            let end = start + stream.byte_offset();
            let specs = file.into_specs();
            if specs.is_empty() {
                saw_empty = true;
                continue;
            }
            let rationale = format!("{}\n{}", &reply[..start], &reply[end..])
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty() && !l.trim_start().starts_with("```"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            return Ok((specs, rationale));
        }
    }
    if saw_empty {
        return Err(AdvisorError::Unparseable("empty task list".to_string()));
    }
    let preview: String = reply.chars().take(120).collect();
    Err(AdvisorError::Unparseable(preview))
}

/// The queue as it would look after applying `specs`: completed tasks kept,
/// everything else retired, specs appended with remapped indices.
///
/// Every spec must carry an index at or above `next_index`, so a `$N` below
/// it always names a task already in the queue.
pub fn candidate_queue(
    queue: &Queue,
    specs: Vec<TaskSpec>,
) -> Result<(Queue, Vec<u32>), String> {
    for (pos, spec) in specs.iter().enumerate() {
        match spec.index {
            Some(i) if i >= queue.next_index => {}
            Some(i) => {
                return Err(format!(
                    "replacement task index {} is below the next free index {}",
                    i, queue.next_index
                ))
            }
            None => return Err(format!("replacement task {} has no index", pos + 1)),
        }
    }
    let mut candidate = queue.clone();
    candidate.tasks.retain(|t| t.status == TaskStatus::Completed);
    let specs = remap_specs(specs, candidate.next_index)?;
    let appended = push_specs(&mut candidate, specs);
    Ok((candidate, appended))
}

/// Packages a queue for a [`ReasoningService`].
pub struct RepairAdvisor {
    service: Arc<dyn ReasoningService>,
}

impl RepairAdvisor {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self { service }
    }

    /// Ask for a repair. Never fails; problems become `Unavailable`.
    pub async fn propose(&self, queue: &Queue, issues: &[Issue]) -> RepairOutcome {
        match self.try_propose(queue, issues).await {
            Ok(proposal) => {
                tracing::info!(
                    engine = %proposal.engine,
                    tasks = proposal.tasks.len(),
                    valid = proposal.validation.valid,
                    "repair proposed"
                );
                RepairOutcome::Proposed(proposal)
            }
            Err(e) => {
                tracing::warn!(error = %e, "repair advisor unavailable");
                RepairOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_propose(
        &self,
        queue: &Queue,
        issues: &[Issue],
    ) -> Result<RepairProposal, AdvisorError> {
        let reply = self
            .service
            .complete(SYSTEM_PROMPT, &build_prompt(queue, issues))
            .await?;
        let (tasks, rationale) = parse_proposal(&reply)?;
        let (candidate, _) =
            candidate_queue(queue, tasks.clone()).map_err(AdvisorError::Unparseable)?;

        Ok(RepairProposal {
            base_fingerprint: fingerprint_tasks(&queue.tasks),
            engine: self.service.name(),
            rationale,
            tasks,
            validation: validate_queue(&candidate),
        })
    }
}

/// Persist a proposal. Holds the store lock throughout.
pub fn apply_proposal(
    store: &QueueStore,
    proposal: &RepairProposal,
) -> Result<AppliedRepair, StoreError> {
    let _lock = store.lock()?;
    let queue = store.load()?;

    let actual = fingerprint_tasks(&queue.tasks);
    if actual != proposal.base_fingerprint {
        return Err(StoreError::Stale {
            expected: proposal.base_fingerprint.clone(),
            actual,
        });
    }

    let (candidate, appended) =
        candidate_queue(&queue, proposal.tasks.clone()).map_err(StoreError::Import)?;
    let report = validate_queue(&candidate);
    if !report.valid {
        return Err(StoreError::InvalidProposal(report.errors.len()));
    }

    let retired: Vec<u32> = queue
        .tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .map(|t| t.index)
        .collect();
    store.save(&candidate)?;
    store.record(QueueEvent::RepairApplied {
        base_fingerprint: proposal.base_fingerprint.clone(),
        retired: retired.clone(),
        appended: appended.clone(),
    });
    tracing::info!(
        retired = retired.len(),
        appended = appended.len(),
        "repair applied"
    );
    Ok(AppliedRepair { retired, appended })
}
