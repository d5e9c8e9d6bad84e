//! Portal selection and best-effort console login.

use serde::Deserialize;
use std::time::Duration;

use crate::agent::browser::{BrowserError, BrowserPage, Locator, Role};
use crate::agent::decision::extract_object;
use crate::config::ConsoleConfig;

const EMAIL_FIELDS: &[&str] = &[
    "input.form-control[type='email']",
    "input.form-control[type='text']",
    "input.form-control:not([type='password']):not([type='hidden']):not([type='submit'])",
    "input[type='email']",
    "input[name='email']",
    "input[name='username']",
];

const PASSWORD_FIELDS: &[&str] = &[
    "input[type='password']",
    "input[name='password']",
];

const SUBMIT_CSS: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "[type='submit']",
];

const SUBMIT_LABELS: &[&str] = &["로그인", "Login", "Sign in"];

const MIN_PROBE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct PortalChoice {
    pub portal: String,
    pub path: String,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawChoice {
    #[serde(default)]
    portal: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Read a `{"portal","path","reason"}` reply. Unknown portals are rejected
/// so the caller can fall back to keyword scoring.
pub fn parse_portal_choice(raw: &str, console: &ConsoleConfig) -> Option<PortalChoice> {
    let choice: RawChoice = serde_json::from_str(extract_object(raw)?).ok()?;
    let portal = choice.portal?.trim().to_lowercase();
    console.portal(&portal)?;

    let path = choice
        .path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
        .unwrap_or_else(|| console.default_path.clone());

    Some(PortalChoice {
        portal,
        path,
        reason: choice.reason.unwrap_or_default(),
    })
}

/// Keyword scorer: each keyword found in the question adds its length,
/// found in the retrieval text adds half of it. No positive score picks
/// the default portal; ties keep the earlier portal.
pub fn score_portals(question: &str, retrieval_text: &str, console: &ConsoleConfig) -> String {
    let question = question.to_lowercase();
    let retrieval_text = retrieval_text.to_lowercase();

    let mut best: Option<(&str, f32)> = None;
    for portal in &console.portals {
        let mut score = 0.0;
        for keyword in &portal.keywords {
            let keyword = keyword.to_lowercase();
            let weight = keyword.chars().count() as f32;
            if question.contains(&keyword) {
                score += weight;
            }
            if retrieval_text.contains(&keyword) {
                score += weight * 0.5;
            }
        }
        log::debug!("portal score {}: {score}", portal.name);
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((&portal.name, score));
        }
    }

    best.map(|(name, _)| name.to_string())
        .unwrap_or_else(|| console.default_portal.clone())
}

pub fn is_login_url(url: &str) -> bool {
    let url = url.to_lowercase();
    url.contains("signin") || url.contains("login")
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    /// Read the console credentials from the configured env vars.
    pub fn from_env(console: &ConsoleConfig) -> Option<Self> {
        let email = std::env::var(&console.email_env).ok().filter(|v| !v.is_empty())?;
        let password = std::env::var(&console.password_env)
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self { email, password })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The page was not a login page.
    NotRequired,
    Completed,
    /// No credentials were configured.
    Skipped,
    Failed(String),
}

impl LoginOutcome {
    /// Whether the session can be treated as authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Completed)
    }
}

/// Fill the first field any of `candidates` resolves to.
fn fill_first(
    page: &mut dyn BrowserPage,
    candidates: &[&str],
    text: &str,
    probe: Duration,
) -> Result<bool, BrowserError> {
    for css in candidates {
        match page.fill(&Locator::Css(css.to_string()), text, probe) {
            Ok(()) => {
                log::debug!("filled {css}");
                return Ok(true);
            }
            Err(BrowserError::ActionNotTaken(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

fn click_submit(page: &mut dyn BrowserPage, probe: Duration) -> Result<bool, BrowserError> {
    let candidates = SUBMIT_CSS
        .iter()
        .map(|css| Locator::Css(css.to_string()))
        .chain(SUBMIT_LABELS.iter().map(|label| Locator::Role {
            role: Role::Button,
            name: label.to_string(),
        }))
        .chain(std::iter::once(Locator::Css("form button".to_string())));

    for locator in candidates {
        match page.click(&locator, probe) {
            Ok(()) => {
                log::debug!("clicked submit via {locator}");
                return Ok(true);
            }
            Err(BrowserError::ActionNotTaken(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// Form-fill login on the current page. Success means the URL moved away
/// from a login-looking URL after submitting.
pub fn login(
    page: &mut dyn BrowserPage,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<LoginOutcome, BrowserError> {
    let start_url = page.current_url();
    if !is_login_url(&start_url) {
        log::debug!("not a login page: {start_url}");
        return Ok(LoginOutcome::NotRequired);
    }

    let Some(credentials) = credentials else {
        log::warn!("login page reached but no console credentials are configured");
        return Ok(LoginOutcome::Skipped);
    };

    let probe = (timeout / 4).max(MIN_PROBE);

    if !fill_first(page, EMAIL_FIELDS, &credentials.email, probe)? {
        return Ok(LoginOutcome::Failed("no email field found".to_string()));
    }
    if !fill_first(page, PASSWORD_FIELDS, &credentials.password, probe)? {
        return Ok(LoginOutcome::Failed("no password field found".to_string()));
    }
    if !click_submit(page, probe)? {
        return Ok(LoginOutcome::Failed("no submit button found".to_string()));
    }

    page.settle();
    let url = page.current_url();
    if url != start_url && !is_login_url(&url) {
        log::info!("logged in, now at {url}");
        Ok(LoginOutcome::Completed)
    } else {
        Ok(LoginOutcome::Failed(format!("still on {url} after submitting")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_scoring() {
        let console = ConsoleConfig::default();
        assert_eq!(
            score_portals("How do I manage tenant members?", "", &console),
            "tenant"
        );
        assert_eq!(score_portals("hello there", "", &console), console.default_portal);
    }

    #[test]
    fn test_retrieval_text_weighs_half() {
        let console = ConsoleConfig::default();
        // nothing in the question, so the retrieval text decides
        let portal = score_portals("where is it?", "developer portal application keys", &console);
        assert_eq!(portal, "developers");
    }

    #[test]
    fn test_parse_portal_choice() {
        let console = ConsoleConfig::default();
        let choice = parse_portal_choice(
            r#"Here you go {"portal":"Console","path":"gateway","reason":"policies live under gateways"}"#,
            &console,
        )
        .unwrap();
        assert_eq!(choice.portal, "console");
        assert_eq!(choice.path, "/gateway");

        assert!(parse_portal_choice(r#"{"portal":"billing"}"#, &console).is_none());
        assert!(parse_portal_choice("no idea", &console).is_none());

        let choice = parse_portal_choice(r#"{"portal":"tenant"}"#, &console).unwrap();
        assert_eq!(choice.path, console.default_path);
    }

    #[test]
    fn test_login_urls() {
        assert!(is_login_url("https://console.example.com/auth/SignIn?next=/"));
        assert!(is_login_url("https://console.example.com/login"));
        assert!(!is_login_url("https://console.example.com/gateway"));
    }
}
