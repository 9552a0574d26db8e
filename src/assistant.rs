//! AI orchestration.
//!
//! One persistent assistant conversation per participant. `ask` appends the
//! user turn, drives a run to a terminal state (executing any tool-calls the
//! run requests along the way) and returns the assistant's final text. The
//! provider allows a single in-flight run per conversation; the conflict
//! path waits for the active run and retries the append exactly once. When
//! the run protocol fails in any way, a stateless chat completion stands in
//! so the human always receives something.

use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::funnel::{AgentBrain, FunnelConfig};
use crate::gateway::OutboundGateway;
use crate::prompting::{render_fallback_system_prompt, FallbackPromptContext};
use crate::store::Store;
use crate::types::{env_i64, env_or, Direction, FunnelState, Kind, Participant};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// queued / in_progress / cancelling — keep polling.
    Pending,
    RequiresAction(Vec<ToolCall>),
    Completed,
    /// failed / expired / cancelled, with the provider's status label.
    Ended(String),
}

#[derive(Debug)]
pub enum ApiError {
    /// The conversation already has an in-flight run; carries its id when
    /// the provider's error message includes one.
    ActiveRun(Option<String>),
    Other(String),
}

/// Wire-level view of the assistant provider. Kept narrow so the run loop
/// can be driven by a scripted double in tests.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, String>;
    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), ApiError>;
    async fn create_run(&self, thread_id: &str) -> Result<String, ApiError>;
    async fn run_state(&self, thread_id: &str, run_id: &str) -> Result<RunState, String>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<(), String>;
    async fn latest_assistant_text(&self, thread_id: &str) -> Result<Option<String>, String>;
    async fn chat_completion(&self, system: &str, user: &str) -> Result<String, String>;
}

#[derive(Clone)]
pub struct AssistantConfig {
    pub poll_interval: StdDuration,
    pub run_poll_ceiling: u32,
    pub active_wait_ceiling: u32,
    pub crm_webhook_url: String,
    pub compliance_webhook_url: String,
}

impl AssistantConfig {
    pub fn defaults() -> AssistantConfig {
        AssistantConfig {
            poll_interval: StdDuration::from_secs(1),
            run_poll_ceiling: 60,
            active_wait_ceiling: 45,
            crm_webhook_url: String::new(),
            compliance_webhook_url: String::new(),
        }
    }

    pub fn from_env() -> AssistantConfig {
        AssistantConfig {
            poll_interval: StdDuration::from_millis(
                env_i64("ASSISTANT_POLL_INTERVAL_MS", 1000).max(0) as u64,
            ),
            run_poll_ceiling: env_i64("ASSISTANT_RUN_POLL_CEILING", 60).max(1) as u32,
            active_wait_ceiling: env_i64("ASSISTANT_ACTIVE_WAIT_CEILING", 45).max(1) as u32,
            crm_webhook_url: env_or("CRM_WEBHOOK_URL", ""),
            compliance_webhook_url: env_or("COMPLIANCE_WEBHOOK_URL", ""),
        }
    }
}

fn run_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(run_[a-zA-Z0-9]+)").unwrap())
}

fn extract_run_id(body: &str) -> Option<String> {
    run_id_regex()
        .captures(body)
        .map(|caps| caps[1].to_string())
}

// ---------------------------------------------------------------------------
// OpenAI Assistants v2 wire implementation
// ---------------------------------------------------------------------------

pub struct OpenAiApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
    model: String,
    run_instructions: String,
}

impl OpenAiApi {
    pub fn from_env(http: reqwest::Client) -> OpenAiApi {
        OpenAiApi {
            http,
            base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            api_key: env_or("OPENAI_API_KEY", ""),
            assistant_id: env_or("ASSISTANT_ID", ""),
            model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            run_instructions: env_or("ASSISTANT_RUN_INSTRUCTIONS", ""),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, String> {
        if self.api_key.is_empty() {
            return Err("OPENAI_API_KEY not configured".to_string());
        }
        Ok(self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2"))
    }

    async fn read_error(response: reqwest::Response) -> (u16, String) {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        (status, body)
    }

    fn classify_conflict(status: u16, body: &str) -> Option<ApiError> {
        if status == 400 && body.to_lowercase().contains("active run") {
            Some(ApiError::ActiveRun(extract_run_id(body)))
        } else {
            None
        }
    }
}

#[async_trait]
impl AssistantApi for OpenAiApi {
    async fn create_thread(&self) -> Result<String, String> {
        let response = self
            .request(reqwest::Method::POST, "/threads")?
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| format!("thread create request failed: {err}"))?;
        if !response.status().is_success() {
            let (status, body) = Self::read_error(response).await;
            return Err(format!("thread create returned {status}: {body}"));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|err| format!("thread create parse failed: {err}"))?;
        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "thread create response had no id".to_string())
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/threads/{thread_id}/messages"))
            .map_err(ApiError::Other)?
            .json(&json!({
                "role": "user",
                "content": [{ "type": "text", "text": text }],
            }))
            .send()
            .await
            .map_err(|err| ApiError::Other(format!("message append request failed: {err}")))?;
        if response.status().is_success() {
            return Ok(());
        }
        let (status, body) = Self::read_error(response).await;
        if let Some(conflict) = Self::classify_conflict(status, &body) {
            return Err(conflict);
        }
        Err(ApiError::Other(format!(
            "message append returned {status}: {body}"
        )))
    }

    async fn create_run(&self, thread_id: &str) -> Result<String, ApiError> {
        let mut body = json!({ "assistant_id": self.assistant_id });
        if !self.run_instructions.is_empty() {
            body["instructions"] = json!(self.run_instructions);
        }
        let response = self
            .request(reqwest::Method::POST, &format!("/threads/{thread_id}/runs"))
            .map_err(ApiError::Other)?
            .json(&body)
            .send()
            .await
            .map_err(|err| ApiError::Other(format!("run create request failed: {err}")))?;

        let response = if response.status().is_success() {
            response
        } else {
            let (status, text) = Self::read_error(response).await;
            if let Some(conflict) = Self::classify_conflict(status, &text) {
                return Err(conflict);
            }
            // Some deployments reject the assistant id; retry the run keyed
            // by model before giving up.
            debug!("run by assistant_id returned {status}, retrying by model");
            let mut body = json!({ "model": self.model });
            if !self.run_instructions.is_empty() {
                body["instructions"] = json!(self.run_instructions);
            }
            let retry = self
                .request(reqwest::Method::POST, &format!("/threads/{thread_id}/runs"))
                .map_err(ApiError::Other)?
                .json(&body)
                .send()
                .await
                .map_err(|err| ApiError::Other(format!("run create request failed: {err}")))?;
            if !retry.status().is_success() {
                let (status, text) = Self::read_error(retry).await;
                return Err(ApiError::Other(format!("run create returned {status}: {text}")));
            }
            retry
        };

        let data: Value = response
            .json()
            .await
            .map_err(|err| ApiError::Other(format!("run create parse failed: {err}")))?;
        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Other("run create response had no id".to_string()))
    }

    async fn run_state(&self, thread_id: &str, run_id: &str) -> Result<RunState, String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/runs/{run_id}"),
            )?
            .send()
            .await
            .map_err(|err| format!("run status request failed: {err}"))?;
        if !response.status().is_success() {
            let (status, body) = Self::read_error(response).await;
            return Err(format!("run status returned {status}: {body}"));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|err| format!("run status parse failed: {err}"))?;
        let status = data.get("status").and_then(Value::as_str).unwrap_or("");
        match status {
            "completed" => Ok(RunState::Completed),
            "failed" | "expired" | "cancelled" => Ok(RunState::Ended(status.to_string())),
            "requires_action" => {
                let calls = data
                    .pointer("/required_action/submit_tool_outputs/tool_calls")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                let id = item.get("id").and_then(Value::as_str)?;
                                let name = item
                                    .pointer("/function/name")
                                    .and_then(Value::as_str)?;
                                let arguments = item
                                    .pointer("/function/arguments")
                                    .and_then(Value::as_str)
                                    .and_then(|raw| serde_json::from_str(raw).ok())
                                    .unwrap_or_else(|| json!({}));
                                Some(ToolCall {
                                    id: id.to_string(),
                                    name: name.to_string(),
                                    arguments,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(RunState::RequiresAction(calls))
            }
            _ => Ok(RunState::Pending),
        }
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<(), String> {
        let payload = json!({
            "tool_outputs": outputs
                .iter()
                .map(|o| json!({ "tool_call_id": o.tool_call_id, "output": o.output }))
                .collect::<Vec<_>>(),
        });
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )?
            .json(&payload)
            .send()
            .await
            .map_err(|err| format!("tool output submit failed: {err}"))?;
        if !response.status().is_success() {
            let (status, body) = Self::read_error(response).await;
            return Err(format!("tool output submit returned {status}: {body}"));
        }
        Ok(())
    }

    async fn latest_assistant_text(&self, thread_id: &str) -> Result<Option<String>, String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/messages?limit=20"),
            )?
            .send()
            .await
            .map_err(|err| format!("message list request failed: {err}"))?;
        if !response.status().is_success() {
            let (status, body) = Self::read_error(response).await;
            return Err(format!("message list returned {status}: {body}"));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|err| format!("message list parse failed: {err}"))?;
        let messages = data.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        for message in &messages {
            if message.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let Some(contents) = message.get("content").and_then(Value::as_array) else {
                continue;
            };
            for content in contents {
                if content.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = content.pointer("/text/value").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            return Ok(Some(text.trim().to_string()));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    async fn chat_completion(&self, system: &str, user: &str) -> Result<String, String> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "temperature": 0.7,
            }))
            .send()
            .await
            .map_err(|err| format!("chat completion request failed: {err}"))?;
        if !response.status().is_success() {
            let (status, body) = Self::read_error(response).await;
            return Err(format!("chat completion returned {status}: {body}"));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|err| format!("chat completion parse failed: {err}"))?;
        let content = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            return Err("chat completion had empty content".to_string());
        }
        Ok(content.to_string())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Assistant {
    api: Arc<dyn AssistantApi>,
    store: Arc<dyn Store>,
    gateway: Arc<dyn OutboundGateway>,
    http: reqwest::Client,
    cfg: AssistantConfig,
    funnel_cfg: FunnelConfig,
}

impl Assistant {
    pub fn new(
        api: Arc<dyn AssistantApi>,
        store: Arc<dyn Store>,
        gateway: Arc<dyn OutboundGateway>,
        http: reqwest::Client,
        cfg: AssistantConfig,
        funnel_cfg: FunnelConfig,
    ) -> Assistant {
        Assistant {
            api,
            store,
            gateway,
            http,
            cfg,
            funnel_cfg,
        }
    }

    async fn ensure_thread(&self, participant: &Participant) -> Result<String, String> {
        if let Some(thread_id) = participant.thread_id.as_deref().filter(|t| !t.is_empty()) {
            return Ok(thread_id.to_string());
        }
        let thread_id = self.api.create_thread().await?;
        self.store.set_thread_id(&participant.id, &thread_id).await?;
        Ok(thread_id)
    }

    /// Wait out an active run before retrying an operation. Without a run id
    /// there is nothing to poll, so this just gives the run time to finish.
    async fn wait_active_run(&self, thread_id: &str, run_id: Option<&str>) {
        let Some(run_id) = run_id else {
            for _ in 0..self.cfg.active_wait_ceiling {
                tokio::time::sleep(self.cfg.poll_interval).await;
            }
            return;
        };
        for _ in 0..self.cfg.active_wait_ceiling {
            match self.api.run_state(thread_id, run_id).await {
                Ok(RunState::Completed) | Ok(RunState::Ended(_)) => return,
                Ok(_) => {}
                // If the run can't be queried, don't wedge the pipeline.
                Err(_) => return,
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    async fn ask(&self, participant: &Participant, thread_id: &str, text: &str) -> Option<String> {
        match self.api.add_user_message(thread_id, text).await {
            Ok(()) => {}
            Err(ApiError::ActiveRun(run_id)) => {
                debug!(%thread_id, "active run on append, waiting");
                self.wait_active_run(thread_id, run_id.as_deref()).await;
                if let Err(err) = self.api.add_user_message(thread_id, text).await {
                    warn!("message append retry failed: {}", describe(&err));
                    return self.fallback(text).await;
                }
            }
            Err(err) => {
                warn!("message append failed: {}", describe(&err));
                return self.fallback(text).await;
            }
        }

        let run_id = match self.api.create_run(thread_id).await {
            Ok(id) => id,
            Err(ApiError::ActiveRun(active)) => {
                debug!(%thread_id, "active run on run create, waiting");
                self.wait_active_run(thread_id, active.as_deref()).await;
                match self.api.create_run(thread_id).await {
                    Ok(id) => id,
                    Err(err) => {
                        warn!("run create retry failed: {}", describe(&err));
                        return self.fallback(text).await;
                    }
                }
            }
            Err(err) => {
                warn!("run create failed: {}", describe(&err));
                return self.fallback(text).await;
            }
        };

        for _ in 0..self.cfg.run_poll_ceiling {
            match self.api.run_state(thread_id, &run_id).await {
                Ok(RunState::Completed) => {
                    return match self.api.latest_assistant_text(thread_id).await {
                        Ok(Some(reply)) => Some(reply),
                        Ok(None) => {
                            warn!(%thread_id, "run completed without assistant text");
                            self.fallback(text).await
                        }
                        Err(err) => {
                            warn!("message fetch failed: {err}");
                            self.fallback(text).await
                        }
                    };
                }
                Ok(RunState::RequiresAction(calls)) => {
                    let mut outputs = Vec::with_capacity(calls.len());
                    for call in &calls {
                        let output = self.execute_tool(participant, call).await;
                        outputs.push(ToolOutput {
                            tool_call_id: call.id.clone(),
                            output,
                        });
                    }
                    if let Err(err) = self
                        .api
                        .submit_tool_outputs(thread_id, &run_id, &outputs)
                        .await
                    {
                        warn!("tool output submit failed: {err}");
                        return self.fallback(text).await;
                    }
                }
                Ok(RunState::Ended(status)) => {
                    warn!(%thread_id, %run_id, "run ended with status {status}");
                    return self.fallback(text).await;
                }
                Ok(RunState::Pending) => {}
                Err(err) => {
                    warn!("run polling failed: {err}");
                    return self.fallback(text).await;
                }
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }

        warn!(%thread_id, %run_id, "run did not finish within the polling ceiling");
        self.fallback(text).await
    }

    /// Stateless single-turn completion, no tools. Best-effort.
    async fn fallback(&self, text: &str) -> Option<String> {
        let system = render_fallback_system_prompt(&FallbackPromptContext {
            bot_name: &self.funnel_cfg.bot_name,
        });
        match self.api.chat_completion(&system, text).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!("chat fallback failed: {err}");
                None
            }
        }
    }

    // -- tool handlers -----------------------------------------------------

    async fn execute_tool(&self, participant: &Participant, call: &ToolCall) -> String {
        let result = match call.name.as_str() {
            "send_funnel_menu" => self.tool_send_menu(participant).await,
            "send_demo_video" => self.tool_send_video(participant).await,
            "request_human_handoff" => self.tool_request_handoff(participant, &call.arguments).await,
            "register_new_contact" => self.tool_register_contact(participant, &call.arguments).await,
            "erase_participant_data" => self.tool_erase_data(participant).await,
            other => {
                warn!("assistant requested unknown tool: {other}");
                return json!({ "ok": false, "reason": "unknown_tool" }).to_string();
            }
        };
        match result {
            Ok(ack) => ack,
            Err(err) => {
                warn!(tool = %call.name, "tool execution failed: {err}");
                json!({ "ok": false, "reason": "failed" }).to_string()
            }
        }
    }

    async fn tool_send_menu(&self, participant: &Participant) -> Result<String, String> {
        let mut snapshot = self.store.funnel_snapshot(&participant.id).await?;
        let now = Utc::now();
        if snapshot.was_recently_sent(Kind::Menu, self.funnel_cfg.menu_window, now) {
            return Ok(json!({ "ok": true, "note": "already_sent_recently" }).to_string());
        }
        self.gateway
            .send_menu(
                &participant.phone,
                &self.funnel_cfg.menu_prompt,
                &self.funnel_cfg.menu_choices,
                &self.funnel_cfg.bot_name,
            )
            .await?;
        let _ = self
            .store
            .append_event(
                &participant.id,
                Direction::Outbound,
                Kind::Menu,
                Some(&self.funnel_cfg.menu_prompt),
                None,
            )
            .await;
        snapshot.mark_sent(Kind::Menu, now);
        snapshot.enter(FunnelState::MenuOffered, now);
        self.store.save_funnel_snapshot(&snapshot).await?;
        Ok(json!({ "ok": true, "action": "menu" }).to_string())
    }

    async fn tool_send_video(&self, participant: &Participant) -> Result<String, String> {
        let mut snapshot = self.store.funnel_snapshot(&participant.id).await?;
        let now = Utc::now();
        if snapshot.was_recently_sent(Kind::Video, self.funnel_cfg.action_dup_window, now) {
            return Ok(json!({ "ok": true, "note": "already_sent_recently" }).to_string());
        }
        if self.funnel_cfg.demo_video_url.is_empty() {
            return Err("DEMO_VIDEO_URL not configured".to_string());
        }
        self.gateway
            .send_media(
                &participant.phone,
                &self.funnel_cfg.demo_video_url,
                &self.funnel_cfg.video_caption,
                Kind::Video,
            )
            .await?;
        let _ = self
            .store
            .append_event(
                &participant.id,
                Direction::Outbound,
                Kind::Video,
                Some(&self.funnel_cfg.video_caption),
                Some(&self.funnel_cfg.demo_video_url),
            )
            .await;
        snapshot.mark_sent(Kind::Video, now);
        snapshot.enter(FunnelState::VideoSent, now);
        self.store.save_funnel_snapshot(&snapshot).await?;
        Ok(json!({ "ok": true, "action": "video" }).to_string())
    }

    async fn tool_request_handoff(
        &self,
        participant: &Participant,
        arguments: &Value,
    ) -> Result<String, String> {
        if self.funnel_cfg.handoff_notify_phone.is_empty() {
            return Err("HANDOFF_NOTIFY_PHONE not configured".to_string());
        }
        let reason = arguments
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("pedido pelo assistente");
        let name = participant.display_name.as_deref().unwrap_or("sem nome");
        let notice = format!(
            "Novo lead aguardando contato: {} ({name}) - {reason}",
            participant.phone
        );
        self.gateway
            .send_text(&self.funnel_cfg.handoff_notify_phone, &notice)
            .await?;
        Ok(json!({ "ok": true, "action": "handoff" }).to_string())
    }

    async fn tool_register_contact(
        &self,
        participant: &Participant,
        arguments: &Value,
    ) -> Result<String, String> {
        if let Some(name) = arguments
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            self.store.set_display_name(&participant.id, name).await?;
        }
        if !self.cfg.crm_webhook_url.is_empty() {
            let payload = json!({
                "phone": participant.phone,
                "name": arguments.get("name").and_then(Value::as_str),
                "email": arguments.get("email").and_then(Value::as_str),
            });
            if let Err(err) = self
                .http
                .post(&self.cfg.crm_webhook_url)
                .json(&payload)
                .send()
                .await
            {
                warn!("crm forward failed: {err}");
            }
        }
        Ok(json!({ "ok": true, "action": "contact" }).to_string())
    }

    /// Data deletion itself is an external compliance action; this core only
    /// forwards the request and never deletes participant rows.
    async fn tool_erase_data(&self, participant: &Participant) -> Result<String, String> {
        if self.cfg.compliance_webhook_url.is_empty() {
            return Err("COMPLIANCE_WEBHOOK_URL not configured".to_string());
        }
        self.http
            .post(&self.cfg.compliance_webhook_url)
            .json(&json!({ "phone": participant.phone }))
            .send()
            .await
            .map_err(|err| format!("compliance forward failed: {err}"))?;
        Ok(json!({ "ok": true, "action": "erase" }).to_string())
    }
}

fn describe(err: &ApiError) -> String {
    match err {
        ApiError::ActiveRun(Some(run_id)) => format!("active run {run_id}"),
        ApiError::ActiveRun(None) => "active run".to_string(),
        ApiError::Other(message) => message.clone(),
    }
}

#[async_trait]
impl AgentBrain for Assistant {
    async fn reply(&self, participant: &Participant, text: &str) -> Option<String> {
        let thread_id = match self.ensure_thread(participant).await {
            Ok(id) => id,
            Err(err) => {
                warn!(phone = %participant.phone, "thread setup failed: {err}");
                return self.fallback(text).await;
            }
        };
        self.ask(participant, &thread_id, text).await
    }
}
