//! Run admission — from a raw [`RunRequest`] to a supervised run process.
//!
//! `submit` resolves everything a run needs up front (agent profile,
//! session policy, tool policy chain, cwd, resume token, engine) and then
//! spawns the run process under the bounded supervisor.  Validation
//! errors return synchronously; capacity exhaustion surfaces as
//! `run_capacity_reached` backpressure.

use std::sync::Arc;

use uuid::Uuid;

use lemon_domain::{
    Error, Job, JobMeta, QueueMode, RequestMeta, ResumeToken, Result, RunRequest, ToolPolicy,
};
use lemon_sessions::{AgentDirectory, SessionKey};

use crate::profile::{AgentProfiles, SessionPolicies};
use crate::run::{spawn_run, RunDeps};

pub struct RunOrchestrator {
    deps: RunDeps,
    profiles: Arc<AgentProfiles>,
    policies: Arc<SessionPolicies>,
    directory: Arc<AgentDirectory>,
}

impl RunOrchestrator {
    pub fn new(
        deps: RunDeps,
        profiles: Arc<AgentProfiles>,
        policies: Arc<SessionPolicies>,
        directory: Arc<AgentDirectory>,
    ) -> Self {
        Self {
            deps,
            profiles,
            policies,
            directory,
        }
    }

    pub fn deps(&self) -> &RunDeps {
        &self.deps
    }

    /// Admit a run.  Returns the fresh run id.
    pub async fn submit(&self, req: RunRequest) -> Result<String> {
        // 1. Normalize.
        let session = SessionKey::parse(&req.session_key)
            .map_err(|_| Error::InvalidSessionKey(req.session_key.clone()))?;
        let agent_id = req
            .agent_id
            .clone()
            .unwrap_or_else(|| session.agent_id().to_owned());
        let queue_mode = req.queue_mode.unwrap_or(QueueMode::Collect);

        // 2. Fresh run id.
        let run_id = Uuid::new_v4().to_string();

        // 3. Session policy and agent profile.
        let session_policy = self.policies.get(&req.session_key);
        let profile = self
            .profiles
            .resolve(&agent_id)
            .ok_or_else(|| Error::UnknownAgentId(agent_id.clone()))?;

        // 4. Tool policy: base -> profile -> operator override.
        let base = self
            .policies
            .resolve_for_run(&req.session_key, &agent_id, req.origin);
        let mut tool_policy = ToolPolicy::merge(Some(&base), profile.tool_policy.as_ref());
        if let Some(operator) = req.tool_policy.as_ref().filter(|p| !p.is_empty()) {
            tool_policy = ToolPolicy::merge(Some(&tool_policy), Some(operator));
        }

        // 5. Working directory.
        let cwd = resolve_cwd(
            req.cwd.as_deref(),
            req.meta.cwd.as_deref(),
            self.deps.gateway.default_cwd().as_deref(),
        );

        // 6. Resume token; strict resume lines leave the prompt.
        let (mut prompt, mut resume_token) = ResumeToken::strip_from(&req.prompt);
        if resume_token.is_none() {
            resume_token = self.recover_resume(&req.meta);
        }
        if prompt.is_empty() && resume_token.is_some() {
            prompt = "Continue.".to_owned();
        }
        if prompt.is_empty() {
            return Err(Error::EmptyPrompt);
        }

        // 7. Voice transcription marker.
        if req.meta.voice_transcribed {
            prompt = format!("(voice transcribed) {prompt}");
        }

        // 8. Engine: resume token > explicit > model-as-engine > profile.
        let model = session_policy.model.clone().or(profile.model.clone());
        let engine_id = resume_token
            .as_ref()
            .map(|t| t.engine.clone())
            .or_else(|| req.engine_id.clone())
            .or_else(|| {
                model
                    .as_deref()
                    .and_then(|m| self.deps.engines.engine_for_model(m))
            })
            .or_else(|| profile.default_engine.clone());

        // 9. Build the job.
        let fanout_count = req.meta.fanout_routes.len();
        let job = Job {
            run_id: run_id.clone(),
            session_key: req.session_key.clone(),
            prompt,
            engine_id,
            cwd,
            resume_token,
            queue_mode,
            lane: req.origin.lane(),
            tool_policy,
            meta: JobMeta {
                origin: Some(req.origin),
                agent_id: agent_id.clone(),
                thinking_level: session_policy.thinking_level.clone(),
                model,
                system_prompt: profile.system_prompt.clone(),
                channel_id: req.meta.channel_id.clone(),
                account_id: req.meta.account_id.clone(),
                peer: req.meta.peer.clone(),
                progress_msg_id: req.meta.progress_msg_id.clone(),
                status_msg_id: req.meta.status_msg_id.clone(),
                user_msg_id: req.meta.user_msg_id.clone(),
                fanout_routes: req.meta.fanout_routes.clone(),
                fanout_count,
                extra: req.meta.extra.clone(),
            },
        };

        // 10. Spawn under the bounded supervisor.
        spawn_run(&self.deps, job)?;

        self.directory.record_activity(
            &agent_id,
            &req.session_key,
            session.route(),
            chrono::Utc::now().timestamp_millis(),
        );
        tracing::info!(
            run_id = %run_id,
            session_key = %req.session_key,
            agent_id = %agent_id,
            origin = ?req.origin,
            "run submitted"
        );
        Ok(run_id)
    }

    /// Channel-kept resume state: the replied-to message's footer, the
    /// reply index, then the chat's selected resume.
    fn recover_resume(&self, meta: &RequestMeta) -> Option<ResumeToken> {
        let channel_id = meta.channel_id.as_deref()?;
        let adapter = self.deps.adapters.get(channel_id);
        if !adapter.supports_resume_index() {
            return None;
        }
        if let Some(token) = meta.reply_to_text.as_deref().and_then(ResumeToken::extract) {
            return Some(token);
        }
        let chat_id = meta.peer.as_ref().map(|p| p.id.as_str())?;
        if let Some(reply_id) = meta.reply_to_id.as_deref() {
            if let Some(token) = self.deps.telegram.resume_for_reply(chat_id, reply_id) {
                return Some(token);
            }
        }
        self.deps.telegram.selected_resume(chat_id)
    }
}

/// Operator override > request meta > gateway default; trimmed and
/// tilde-expanded, empty collapsing to none.
fn resolve_cwd(
    operator: Option<&str>,
    meta: Option<&str>,
    gateway_default: Option<&str>,
) -> Option<String> {
    [operator, meta, gateway_default]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(|s| shellexpand::tilde(s).into_owned())
}
