use serde_json::Value;

use crate::pipeline::context::QueryContext;
use crate::pipeline::stages::{PipelineServices, RunSession, Stage};

/// One stage transition: the stage and what it changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: Stage,
    pub delta: Value,
}

impl StageEvent {
    /// `{"<stage name>": <delta>}`
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(self.stage.name().to_string(), self.delta.clone());
        Value::Object(map)
    }
}

/// Fixed chain of stages over a single [`QueryContext`].
///
/// A failing stage never aborts the run: its output is discarded, a
/// failure message is appended and the next stage runs on the context as
/// it was before the failure. Output that drops or rewrites earlier
/// messages is treated the same way.
pub struct StateMachine {
    stages: Vec<Stage>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            stages: Stage::PIPELINE.to_vec(),
        }
    }
}

impl StateMachine {
    pub fn with_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn run(
        &self,
        services: &PipelineServices,
        question: &str,
        mut on_event: impl FnMut(StageEvent),
    ) -> QueryContext {
        let mut session = RunSession::default();
        let mut ctx = QueryContext::new(question);

        for stage in &self.stages {
            log::info!("stage {} started", stage.name());
            let before = ctx;

            let next = match stage.run(services, &mut session, before.clone()) {
                Ok(next) if next.extends(&before) => next,
                Ok(_) => {
                    log::error!("stage {} rewrote the message log, output discarded", stage.name());
                    let mut recovered = before.clone();
                    recovered.push(stage.role(), stage.failure_message());
                    recovered
                }
                Err(err) => {
                    log::error!("stage {} failed: {err}", stage.name());
                    let mut recovered = before.clone();
                    recovered.push(stage.role(), stage.failure_message());
                    recovered
                }
            };

            on_event(StageEvent {
                stage: *stage,
                delta: next.delta(&before),
            });
            ctx = next;
        }

        session.close();
        ctx
    }
}
