//! Question pipeline: retrieval, summarization, navigation, interaction
//! and final summarization, run in that order over one [`QueryContext`].

pub mod context;
pub mod machine;
pub mod stages;

pub use context::{ChatMessage, NavigationResult, QueryContext, RagResult};
pub use machine::{StageEvent, StateMachine};
pub use stages::{PipelineServices, RunSession, Stage, StageError};
