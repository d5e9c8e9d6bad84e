//! Browser capability used by the navigation and interaction stages.
//!
//! A [`BrowserPage`] is one live tab. Element lookup goes through
//! [`Locator`], which every implementation turns into its own query
//! language (CSS/XPath for Chrome, DOM matching for fakes). Clicks on
//! decision targets walk [`CLICK_CHAIN`] and stop at the first resolver
//! that finds a visible element.

use std::time::Duration;

use crate::agent::decision::{Target, TargetBy};

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("no actionable element for {0}")]
    ActionNotTaken(String),

    #[error("browser session lost: {0}")]
    Session(String),

    #[error("headless browser support is not compiled in")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Link,
    Button,
}

/// How to find an element on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Innermost element whose whitespace-normalized text equals the value
    Text(String),
    /// Element of the given role whose accessible name contains the value,
    /// case-insensitively
    Role { role: Role, name: String },
    /// `tag[attr='value']`; `tag` may be empty for any element
    AttrExact {
        tag: &'static str,
        attr: &'static str,
        value: String,
    },
    /// `tag[attr*='value']`
    AttrContains {
        tag: &'static str,
        attr: &'static str,
        value: String,
    },
    /// Raw CSS selector
    Css(String),
}

/// A locator rendered for a DOM query engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn to_query(&self) -> Query {
        match self {
            Locator::Text(value) => {
                let v = xpath_literal(value.trim());
                Query::XPath(format!(
                    "//body//*[normalize-space(.)={v} and not(.//*[normalize-space(.)={v}])]"
                ))
            }
            Locator::Role { role, name } => {
                let needle = xpath_literal(&name.trim().to_lowercase());
                let name_matches = format!(
                    "contains(translate(normalize-space(concat(., ' ', @aria-label)), 'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz'), {needle})"
                );
                let candidates = match role {
                    Role::Link => "//a[@href] | //*[@role='link']",
                    Role::Button => {
                        "//button | //*[@role='button'] | //input[@type='submit' or @type='button']"
                    }
                };
                let filtered: Vec<String> = candidates
                    .split(" | ")
                    .map(|c| format!("{c}[{name_matches}]"))
                    .collect();
                Query::XPath(filtered.join(" | "))
            }
            Locator::AttrExact { tag, attr, value } => {
                Query::Css(format!("{tag}[{attr}={}]", css_string(value)))
            }
            Locator::AttrContains { tag, attr, value } => {
                Query::Css(format!("{tag}[{attr}*={}]", css_string(value)))
            }
            Locator::Css(selector) => Query::Css(selector.clone()),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_query() {
            Query::Css(s) => write!(f, "css `{s}`"),
            Query::XPath(s) => write!(f, "xpath `{s}`"),
        }
    }
}

/// Quote a string as an XPath 1.0 literal.
fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        let parts: Vec<String> = value.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Quote a string as a CSS attribute value.
fn css_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// One strategy for turning a decision target into a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    ExactText,
    RoleName,
    AttributeExact,
    AttributeSubstring,
}

/// Click resolution order.
pub const CLICK_CHAIN: &[Resolver] = &[
    Resolver::ExactText,
    Resolver::RoleName,
    Resolver::AttributeExact,
    Resolver::AttributeSubstring,
];

impl Resolver {
    /// Locator for `target`, or `None` when the strategy does not apply to
    /// this kind of target.
    pub fn locator(&self, target: &Target) -> Option<Locator> {
        let value = target.value.trim();
        if value.is_empty() {
            return None;
        }
        let value = value.to_string();
        let textual = matches!(target.by, None | Some(TargetBy::Text));

        match self {
            Resolver::ExactText if textual => Some(Locator::Text(value)),
            Resolver::RoleName if textual => Some(Locator::Role {
                role: Role::Link,
                name: value,
            }),
            Resolver::ExactText | Resolver::RoleName => None,
            Resolver::AttributeExact => Some(match target.by {
                Some(TargetBy::Href) | Some(TargetBy::Url) => Locator::AttrExact {
                    tag: "a",
                    attr: "href",
                    value,
                },
                Some(TargetBy::Id) => Locator::AttrExact {
                    tag: "",
                    attr: "id",
                    value,
                },
                None | Some(TargetBy::Text) => Locator::AttrExact {
                    tag: "",
                    attr: "aria-label",
                    value,
                },
            }),
            Resolver::AttributeSubstring => Some(match target.by {
                Some(TargetBy::Href) | Some(TargetBy::Url) => Locator::AttrContains {
                    tag: "a",
                    attr: "href",
                    value,
                },
                Some(TargetBy::Id) => Locator::AttrContains {
                    tag: "",
                    attr: "id",
                    value,
                },
                None | Some(TargetBy::Text) => Locator::AttrContains {
                    tag: "",
                    attr: "title",
                    value,
                },
            }),
        }
    }
}

/// One live browser tab.
pub trait BrowserPage: Send {
    /// Navigate and wait for the load to finish.
    fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    fn current_url(&self) -> String;

    /// Serialized DOM of the current page.
    fn content(&mut self) -> Result<String, BrowserError>;

    /// Wait for network/DOM activity to quiet down after an action.
    fn settle(&mut self);

    /// Click the first visible element matching `locator`, waiting up to
    /// `timeout` for one to appear. `ActionNotTaken` when none does.
    fn click(&mut self, locator: &Locator, timeout: Duration) -> Result<(), BrowserError>;

    /// Replace the value of the first visible input matching `locator`.
    fn fill(&mut self, locator: &Locator, text: &str, timeout: Duration)
        -> Result<(), BrowserError>;
}

/// Opens a fresh browser session per pipeline run.
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

/// Launcher used when no browser is available; every launch fails.
pub struct NoBrowser;

impl BrowserLauncher for NoBrowser {
    fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        Err(BrowserError::Unavailable)
    }
}

/// Which resolver, if any, produced the click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickOutcome {
    pub resolver: Option<Resolver>,
}

impl ClickOutcome {
    pub fn acted(&self) -> bool {
        self.resolver.is_some()
    }
}

/// Try each resolver of `chain` in order until one clicks something.
/// Resolution failures are not errors; a lost session is.
pub fn click_target(
    page: &mut dyn BrowserPage,
    target: &Target,
    chain: &[Resolver],
    timeout: Duration,
) -> Result<ClickOutcome, BrowserError> {
    for resolver in chain {
        let Some(locator) = resolver.locator(target) else {
            continue;
        };

        match page.click(&locator, timeout) {
            Ok(()) => {
                log::debug!("clicked via {resolver:?}: {locator}");
                return Ok(ClickOutcome {
                    resolver: Some(*resolver),
                });
            }
            Err(BrowserError::ActionNotTaken(_)) => {
                log::debug!("{resolver:?} found nothing for {:?}", target.value);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(ClickOutcome { resolver: None })
}
