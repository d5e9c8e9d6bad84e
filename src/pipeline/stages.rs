//! The five pipeline stages. Each one reads what it needs from the
//! context, writes its own result field and appends to `messages`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::browser::{BrowserError, BrowserLauncher, BrowserPage};
use crate::agent::decision::extract_object;
use crate::agent::navigation::{
    self, is_login_url, parse_portal_choice, score_portals, Credentials, LoginOutcome,
    PortalChoice,
};
use crate::agent::prompts;
use crate::agent::react::{LoopSettings, ReactLoop, Termination};
use crate::config::Config;
use crate::llm::{LanguageModel, LlmError};
use crate::pipeline::context::{NavigationResult, QueryContext, RagResult};
use crate::retrieval::RetrievalService;
use crate::scrape::truncate_chars;

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)""#).unwrap());

const SUMMARY_CHUNKS: usize = 5;
const EVIDENCE_CHARS: usize = 200;

pub const NO_ANSWER: &str = "Sorry, I could not find an answer to this question.";

pub const CONSOLE_UNAVAILABLE: &str =
    "(The console could not be explored for this question, so this answer is based on the documentation only.)";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("language model error: {0}")]
    Llm(#[from] LlmError),

    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("portal {0:?} is not configured")]
    UnknownPortal(String),
}

/// Shared collaborators handed to every run.
#[derive(Clone)]
pub struct PipelineServices {
    pub retrieval: Arc<RetrievalService>,
    pub llm: Arc<dyn LanguageModel>,
    pub launcher: Arc<dyn BrowserLauncher>,
    pub config: Arc<Config>,
}

/// Per-run resources that outlive a single stage.
#[derive(Default)]
pub struct RunSession {
    page: Option<Box<dyn BrowserPage>>,
}

impl RunSession {
    /// The run's browser page, launching one on first use.
    pub fn page(
        &mut self,
        launcher: &dyn BrowserLauncher,
    ) -> Result<&mut dyn BrowserPage, BrowserError> {
        let page = match self.page.take() {
            Some(page) => page,
            None => launcher.launch()?,
        };
        Ok(self.page.insert(page).as_mut())
    }

    pub fn close(&mut self) {
        if self.page.take().is_some() {
            log::debug!("browser session closed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Retrieval,
    Summarization,
    Navigation,
    Interaction,
    FinalSummarization,
}

impl Stage {
    pub const PIPELINE: [Stage; 5] = [
        Stage::Retrieval,
        Stage::Summarization,
        Stage::Navigation,
        Stage::Interaction,
        Stage::FinalSummarization,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Retrieval => "retrieval",
            Stage::Summarization => "summarization",
            Stage::Navigation => "navigation",
            Stage::Interaction => "interaction",
            Stage::FinalSummarization => "final_summarization",
        }
    }

    /// Author of the messages the stage appends.
    pub fn role(&self) -> &'static str {
        match self {
            Stage::Retrieval => "rag_agent",
            Stage::Summarization => "summary_agent",
            Stage::Navigation => "navigation_agent",
            Stage::Interaction => "interactive_agent",
            Stage::FinalSummarization => "final_agent",
        }
    }

    /// User-facing text for a failed stage.
    pub fn failure_message(&self) -> String {
        let what = match self {
            Stage::Retrieval => "searching the documentation",
            Stage::Summarization => "summarizing the documentation",
            Stage::Navigation => "opening the console",
            Stage::Interaction => "exploring the console",
            Stage::FinalSummarization => "writing the final answer",
        };
        format!("Something went wrong while {what}; continuing with what was found so far.")
    }

    pub fn run(
        &self,
        services: &PipelineServices,
        session: &mut RunSession,
        ctx: QueryContext,
    ) -> Result<QueryContext, StageError> {
        match self {
            Stage::Retrieval => retrieval(services, ctx),
            Stage::Summarization => summarization(services, ctx),
            Stage::Navigation => navigation_stage(services, session, ctx),
            Stage::Interaction => interaction(services, session, ctx),
            Stage::FinalSummarization => Ok(final_summarization(ctx)),
        }
    }
}

#[derive(Deserialize)]
struct EnglishQuery {
    english_query: String,
}

/// JSON `english_query`, else the first quoted span, else the whole reply.
pub fn parse_english_query(raw: &str) -> Option<String> {
    let from_json = extract_object(raw)
        .and_then(|obj| serde_json::from_str::<EnglishQuery>(obj).ok())
        .map(|q| q.english_query);
    let from_quotes = || {
        QUOTED
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    from_json
        .or_else(from_quotes)
        .or_else(|| Some(raw.to_string()))
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
}

fn retrieval(services: &PipelineServices, mut ctx: QueryContext) -> Result<QueryContext, StageError> {
    let role = Stage::Retrieval.role();

    let query = match services.llm.generate(&prompts::query_rewrite(&ctx.question)) {
        Ok(raw) => parse_english_query(&raw).unwrap_or_else(|| ctx.question.clone()),
        Err(err) => {
            log::warn!("query rewrite failed, searching with the raw question: {err}");
            ctx.question.clone()
        }
    };

    let results = services
        .retrieval
        .search(&query, services.config.retrieval.top_k);
    log::info!("retrieved {} chunks for {query:?}", results.len());

    ctx.push(role, format!("[vector query] {query}"));
    ctx.push(
        role,
        format!("Retrieved {} chunks from the knowledge base.", results.len()),
    );
    ctx.rag_result = Some(RagResult { query, results });
    Ok(ctx)
}

fn summarization(
    services: &PipelineServices,
    mut ctx: QueryContext,
) -> Result<QueryContext, StageError> {
    let role = Stage::Summarization.role();
    let results = ctx
        .rag_result
        .as_ref()
        .map(|r| r.results.as_slice())
        .unwrap_or_default();

    if results.is_empty() {
        ctx.push(
            role,
            "No evidence was found in the knowledge base for this question.",
        );
        return Ok(ctx);
    }

    let top = &results[..results.len().min(SUMMARY_CHUNKS)];
    let context = top
        .iter()
        .map(|r| format!("[{}]\n{}", r.document.name(), r.document.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    let evidence = top
        .iter()
        .map(|r| {
            format!(
                "- {} (sim={:.2}): {}",
                r.document.name(),
                r.similarity,
                truncate_chars(&r.document.text, EVIDENCE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let summary = services
        .llm
        .generate(&prompts::summary(&ctx.question, &context, &evidence))?;

    ctx.push(role, summary.clone());
    ctx.summary = Some(summary);
    Ok(ctx)
}

fn choose_portal(services: &PipelineServices, ctx: &QueryContext) -> PortalChoice {
    let console = &services.config.console;
    let (snippets, retrieval_text) = ctx
        .rag_result
        .as_ref()
        .map(|r| (r.snippets(), r.retrieval_text()))
        .unwrap_or_default();

    let messages = prompts::portal_choice(&ctx.question, &snippets, &console.portals);
    let parsed = match services.llm.generate(&messages) {
        Ok(raw) => parse_portal_choice(&raw, console),
        Err(err) => {
            log::warn!("portal choice failed: {err}");
            None
        }
    };

    parsed.unwrap_or_else(|| PortalChoice {
        portal: score_portals(&ctx.question, &retrieval_text, console),
        path: console.default_path.clone(),
        reason: "keyword match".to_string(),
    })
}

fn navigation_stage(
    services: &PipelineServices,
    session: &mut RunSession,
    mut ctx: QueryContext,
) -> Result<QueryContext, StageError> {
    let role = Stage::Navigation.role();
    let console = &services.config.console;
    let agent = &services.config.agent;

    let choice = choose_portal(services, &ctx);
    let portal = console
        .portal(&choice.portal)
        .ok_or_else(|| StageError::UnknownPortal(choice.portal.clone()))?;
    let target_url = format!("{}{}", portal.base_url.trim_end_matches('/'), choice.path);
    log::info!("portal {} selected, opening {target_url}", portal.name);

    let page = session.page(services.launcher.as_ref())?;
    page.goto(&target_url)?;
    page.settle();

    let credentials = Credentials::from_env(console);
    let outcome = navigation::login(
        page,
        credentials.as_ref(),
        Duration::from_secs(agent.navigation_timeout_secs),
    )?;

    let status = match &outcome {
        LoginOutcome::NotRequired => "no login was required".to_string(),
        LoginOutcome::Completed => "logged in".to_string(),
        LoginOutcome::Skipped => "login skipped, no console credentials are configured".to_string(),
        LoginOutcome::Failed(reason) => {
            log::warn!("login failed: {reason}");
            "login did not complete".to_string()
        }
    };
    ctx.push(
        role,
        format!("Selected the {} portal ({target_url}); {status}.", portal.name),
    );

    ctx.navigation_result = Some(NavigationResult {
        selected_portal: portal.name.clone(),
        portal_url: portal.base_url.clone(),
        target_url,
        login_completed: outcome.is_authenticated(),
        reason: choice.reason,
    });
    Ok(ctx)
}

fn interaction(
    services: &PipelineServices,
    session: &mut RunSession,
    mut ctx: QueryContext,
) -> Result<QueryContext, StageError> {
    let role = Stage::Interaction.role();
    let config = &services.config;

    let target_url = match &ctx.navigation_result {
        Some(nav) => nav.target_url.clone(),
        None => {
            let base = config
                .console
                .portal(&config.console.default_portal)
                .map(|p| p.base_url.trim_end_matches('/').to_string())
                .ok_or_else(|| StageError::UnknownPortal(config.console.default_portal.clone()))?;
            format!("{base}{}", config.console.default_path)
        }
    };

    let page = session.page(services.launcher.as_ref())?;
    page.goto(&target_url)?;
    page.settle();

    let landed = page.current_url();
    if is_login_url(&landed) {
        log::warn!("redirected to a login page: {landed}");
        ctx.push(
            role,
            "The console asked for a login that could not be completed, so its pages were not explored.",
        );
        return Ok(ctx);
    }

    let settings = LoopSettings::from_config(&config.agent, config.retrieval.top_k);
    let report =
        ReactLoop::new(services.llm.as_ref(), &services.retrieval, settings).run(page, &ctx.question);
    log::info!(
        "interaction finished after {} steps ({:?})",
        report.steps,
        report.terminated_by
    );

    ctx.push(role, report.answer.clone());
    ctx.interactive_result = Some(report);
    Ok(ctx)
}

/// Merge answer, visited pages and sources into the response.
pub fn final_summarization(mut ctx: QueryContext) -> QueryContext {
    let mut response = match (&ctx.interactive_result, &ctx.summary) {
        // a broken exploration only has an apology to offer
        (Some(report), Some(summary)) if report.terminated_by == Termination::Error => {
            format!("{summary}\n\n{CONSOLE_UNAVAILABLE}")
        }
        (Some(report), _) => report.answer.clone(),
        (None, Some(summary)) => summary.clone(),
        (None, None) => NO_ANSWER.to_string(),
    };

    if let Some(report) = &ctx.interactive_result {
        let paths = report.visited_paths();
        if !paths.is_empty() {
            response.push_str("\n\nVisited pages:");
            for path in paths {
                response.push_str(&format!("\n- {path}"));
            }
        }
    }

    if let Some(rag) = &ctx.rag_result {
        let mut names: Vec<String> = Vec::new();
        for result in &rag.results {
            let name = result.document.name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if !names.is_empty() {
            response.push_str("\n\nSources:");
            for name in names {
                response.push_str(&format!("\n- {name}"));
            }
        }
    }

    ctx.push(Stage::FinalSummarization.role(), response.clone());
    ctx.response = Some(response);
    ctx
}
