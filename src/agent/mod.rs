//! Console agent: decision parsing, page observation, browser control and
//! the bounded interaction loop.

pub mod browser;
pub mod decision;
#[cfg(feature = "headless")]
pub mod headless;
pub mod navigation;
pub mod observe;
pub mod prompts;
pub mod react;

pub use browser::{BrowserError, BrowserLauncher, BrowserPage, Locator, NoBrowser};
pub use decision::{Action, Decision, DecisionParse, Target, TargetBy};
pub use react::{LoopReport, LoopSettings, ReactLoop, Termination, VisitTraceEntry};

/// Launcher for the compiled-in browser backend.
pub fn default_launcher(config: &crate::config::AgentConfig) -> std::sync::Arc<dyn BrowserLauncher> {
    #[cfg(feature = "headless")]
    {
        std::sync::Arc::new(headless::ChromeLauncher::from_config(config))
    }
    #[cfg(not(feature = "headless"))]
    {
        let _ = config;
        log::warn!("built without the headless feature; console navigation is disabled");
        std::sync::Arc::new(NoBrowser)
    }
}
