//! Bounded observe-decide-act loop over one browser page.
//!
//! Each iteration observes the current page, asks the language model for a
//! [`Decision`], executes it and appends a [`VisitTraceEntry`]. The driver
//! appends the entry, not the action branches, so every iteration leaves
//! exactly one record. The loop always ends with an answer: either
//! synthesized from what it saw, or an apology when the session broke.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::agent::browser::{click_target, BrowserError, BrowserPage, CLICK_CHAIN};
use crate::agent::decision::{self, Action, Decision, Target, TargetBy};
use crate::agent::observe::{observe, policy_items};
use crate::agent::prompts::{self, AnswerRequest, DecisionRequest};
use crate::config::AgentConfig;
use crate::llm::{LanguageModel, LlmError};
use crate::retrieval::RetrievalService;

pub const APOLOGY: &str =
    "Sorry, I could not finish exploring the console for this question. Please try again later.";

#[derive(Debug, thiserror::Error)]
enum LoopError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub observation_budget: usize,
    pub action_timeout: Duration,
    pub top_k: usize,
}

impl LoopSettings {
    pub fn from_config(agent: &AgentConfig, top_k: usize) -> Self {
        Self {
            max_steps: agent.max_steps,
            observation_budget: agent.observation_budget,
            action_timeout: Duration::from_secs(agent.action_timeout_secs),
            top_k,
        }
    }
}

/// What an Act transition did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: Action,
    pub acted: bool,
    pub detail: String,
}

impl ActionOutcome {
    fn taken(action: Action, detail: impl Into<String>) -> Self {
        Self {
            action,
            acted: true,
            detail: detail.into(),
        }
    }

    fn not_taken(action: Action, detail: impl Into<String>) -> Self {
        Self {
            action,
            acted: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitTraceEntry {
    pub step: usize,
    pub url: String,
    pub path: String,
    pub observation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_result: Option<ActionOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Answer,
    Stop,
    MaxSteps,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub start_url: String,
    pub final_url: String,
    pub steps: usize,
    pub answer: String,
    pub trace: Vec<VisitTraceEntry>,
    pub terminated_by: Termination,
}

impl LoopReport {
    /// Distinct visited paths, in visit order.
    pub fn visited_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for entry in &self.trace {
            if !paths.contains(&entry.path.as_str()) {
                paths.push(&entry.path);
            }
        }
        paths
    }
}

/// Path component of `url`, or the input itself when it does not parse.
pub fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Render the trace as a numbered step log for the answer prompt.
pub fn format_trace(trace: &[VisitTraceEntry]) -> String {
    if trace.is_empty() {
        return "(no steps taken)".to_string();
    }

    trace
        .iter()
        .map(|entry| {
            let action = match (&entry.decision, &entry.action_result) {
                (Some(d), Some(r)) => format!(
                    "{} {:?} ({}{})",
                    d.action.as_str(),
                    d.target.value,
                    if r.acted { "done" } else { "no-op" },
                    if r.detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", r.detail)
                    }
                ),
                (Some(d), None) => d.action.as_str().to_string(),
                _ => "observe".to_string(),
            };
            format!("{}. {} -> {}", entry.step, action, entry.path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct PageState {
    url: String,
    html: String,
    observation: String,
}

pub struct ReactLoop<'a> {
    llm: &'a dyn LanguageModel,
    retrieval: &'a RetrievalService,
    settings: LoopSettings,
}

impl<'a> ReactLoop<'a> {
    pub fn new(
        llm: &'a dyn LanguageModel,
        retrieval: &'a RetrievalService,
        settings: LoopSettings,
    ) -> Self {
        Self {
            llm,
            retrieval,
            settings,
        }
    }

    /// Run the loop from the page's current location. Never fails.
    pub fn run(&self, page: &mut dyn BrowserPage, question: &str) -> LoopReport {
        let start_url = page.current_url();
        let mut trace = Vec::new();

        let (terminated_by, answer) = match self.drive(page, question, &mut trace) {
            Ok((termination, state)) => match self.synthesize(question, &state, &trace) {
                Ok(answer) => (termination, answer),
                Err(err) => {
                    log::error!("answer synthesis failed: {err}");
                    (Termination::Error, APOLOGY.to_string())
                }
            },
            Err(err) => {
                log::error!("interaction loop aborted: {err}");
                (Termination::Error, APOLOGY.to_string())
            }
        };

        LoopReport {
            start_url,
            final_url: page.current_url(),
            steps: trace.len(),
            answer,
            trace,
            terminated_by,
        }
    }

    fn snapshot(&self, page: &mut dyn BrowserPage) -> Result<PageState, LoopError> {
        let url = page.current_url();
        let html = page.content()?;
        let observation = observe(&html, self.settings.observation_budget);
        Ok(PageState {
            url,
            html,
            observation,
        })
    }

    fn drive(
        &self,
        page: &mut dyn BrowserPage,
        question: &str,
        trace: &mut Vec<VisitTraceEntry>,
    ) -> Result<(Termination, PageState), LoopError> {
        let mut state = self.snapshot(page)?;

        for step in 1..=self.settings.max_steps {
            let decision = self.decide(question, &state, step)?;
            log::info!(
                "step {step}/{}: {} {:?} ({})",
                self.settings.max_steps,
                decision.action.as_str(),
                decision.target.value,
                decision.reason
            );

            let outcome = if step == 1 && decision.action == Action::Answer {
                ActionOutcome::not_taken(Action::Answer, "answering is not allowed on the first step")
            } else {
                self.act(page, &state.url, &decision)?
            };

            page.settle();
            state = self.snapshot(page)?;
            trace.push(VisitTraceEntry {
                step,
                url: state.url.clone(),
                path: path_of(&state.url),
                observation: state.observation.clone(),
                decision: Some(decision.clone()),
                action_result: Some(outcome.clone()),
            });

            match decision.action {
                Action::Stop => return Ok((Termination::Stop, state)),
                Action::Answer if step > 1 => return Ok((Termination::Answer, state)),
                _ => {}
            }
        }

        Ok((Termination::MaxSteps, state))
    }

    fn decide(&self, question: &str, state: &PageState, step: usize) -> Result<Decision, LoopError> {
        let snippets = self
            .retrieval
            .snippets(&format!("{question}\n{}", state.url), self.settings.top_k);

        let messages = prompts::decision(&DecisionRequest {
            question,
            current_url: &state.url,
            observation: &state.observation,
            snippets: &snippets,
            step,
            max_steps: self.settings.max_steps,
            allow_answer: step > 1,
        });

        let raw = self.llm.generate(&messages)?;
        let parsed = decision::parse(&raw);
        if parsed.is_failure() {
            log::warn!("could not parse decision, stopping");
        }
        Ok(parsed.into_decision())
    }

    fn act(
        &self,
        page: &mut dyn BrowserPage,
        current_url: &str,
        decision: &Decision,
    ) -> Result<ActionOutcome, BrowserError> {
        match decision.action {
            Action::Goto => self.goto(page, current_url, &decision.target),
            Action::Click => self.click(page, Action::Click, &decision.target),
            Action::Stop => Ok(ActionOutcome::not_taken(Action::Stop, decision.reason.clone())),
            Action::Answer => Ok(ActionOutcome::not_taken(Action::Answer, "ready to answer")),
        }
    }

    fn click(
        &self,
        page: &mut dyn BrowserPage,
        action: Action,
        target: &Target,
    ) -> Result<ActionOutcome, BrowserError> {
        let outcome = click_target(page, target, CLICK_CHAIN, self.settings.action_timeout)?;
        Ok(match outcome.resolver {
            Some(resolver) => ActionOutcome::taken(action, format!("clicked via {resolver:?}")),
            None => ActionOutcome::not_taken(action, format!("no element matched {:?}", target.value)),
        })
    }

    fn goto(
        &self,
        page: &mut dyn BrowserPage,
        current_url: &str,
        target: &Target,
    ) -> Result<ActionOutcome, BrowserError> {
        let value = target.value.trim();
        if value.is_empty() {
            return Ok(ActionOutcome::not_taken(Action::Goto, "empty target"));
        }

        if target.by == Some(TargetBy::Text) {
            return self.click(page, Action::Goto, target);
        }

        if value.starts_with('#') || value.to_lowercase().starts_with("javascript:") {
            let by_href = Target {
                by: Some(TargetBy::Href),
                value: value.to_string(),
            };
            return self.click(page, Action::Goto, &by_href);
        }

        let resolved = match Url::parse(value) {
            Ok(url) => url,
            Err(_) => match Url::parse(current_url).and_then(|base| base.join(value)) {
                Ok(url) => url,
                Err(err) => {
                    return Ok(ActionOutcome::not_taken(
                        Action::Goto,
                        format!("cannot resolve {value:?}: {err}"),
                    ))
                }
            },
        };

        match page.goto(resolved.as_str()) {
            Ok(()) => Ok(ActionOutcome::taken(Action::Goto, resolved.to_string())),
            Err(err @ (BrowserError::Navigation { .. } | BrowserError::ActionNotTaken(_))) => {
                log::warn!("{err}");
                Ok(ActionOutcome::not_taken(Action::Goto, format!("navigation to {resolved} failed")))
            }
            Err(err) => Err(err),
        }
    }

    fn synthesize(
        &self,
        question: &str,
        state: &PageState,
        trace: &[VisitTraceEntry],
    ) -> Result<String, LoopError> {
        let snippets = self.retrieval.snippets(question, self.settings.top_k);
        let items = policy_items(&state.html);
        let trace_log = format_trace(trace);

        let messages = prompts::answer(&AnswerRequest {
            question,
            observation: &state.observation,
            policy_items: &items,
            trace_log: &trace_log,
            snippets: &snippets,
        });
        Ok(self.llm.generate(&messages)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(step: usize, path: &str) -> VisitTraceEntry {
        VisitTraceEntry {
            step,
            url: format!("https://console.example.com{path}"),
            path: path.to_string(),
            observation: String::new(),
            decision: Some(Decision {
                action: Action::Click,
                target: Target {
                    by: Some(TargetBy::Text),
                    value: "Policies".to_string(),
                },
                reason: String::new(),
                confidence: 0.5,
            }),
            action_result: Some(ActionOutcome::taken(Action::Click, "")),
        }
    }

    #[test]
    fn test_path_of() {
        assert_eq!(path_of("https://console.example.com/gateway/policies?x=1"), "/gateway/policies");
        assert_eq!(path_of("not a url"), "not a url");
    }

    #[test]
    fn test_format_trace() {
        let log = format_trace(&[entry(1, "/gateway"), entry(2, "/gateway/policies")]);
        assert_eq!(
            log,
            "1. click \"Policies\" (done) -> /gateway\n2. click \"Policies\" (done) -> /gateway/policies"
        );
        assert_eq!(format_trace(&[]), "(no steps taken)");
    }

    #[test]
    fn test_visited_paths_are_distinct() {
        let report = LoopReport {
            start_url: String::new(),
            final_url: String::new(),
            steps: 3,
            answer: String::new(),
            trace: vec![entry(1, "/a"), entry(2, "/b"), entry(3, "/a")],
            terminated_by: Termination::MaxSteps,
        };
        assert_eq!(report.visited_paths(), vec!["/a", "/b"]);
    }

    #[test]
    fn test_termination_wire_names() {
        assert_eq!(serde_json::to_value(Termination::MaxSteps).unwrap(), "max_steps");
        assert_eq!(serde_json::to_value(Termination::Answer).unwrap(), "answer");
    }
}
