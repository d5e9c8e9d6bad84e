use headless_chrome::{browser::tab::element::Element, Browser, LaunchOptionsBuilder, Tab};
use std::{
    path::PathBuf,
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};

use crate::agent::browser::{BrowserError, BrowserLauncher, BrowserPage, Locator, Query};
use crate::config::AgentConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

const IS_VISIBLE_JS: &str = r#"
    function is_visible() {
        const rect = this.getBoundingClientRect();
        const style = window.getComputedStyle(this);
        return rect.width > 0 && rect.height > 0
            && style.visibility !== 'hidden' && style.display !== 'none';
    }
"#;

const CLEAR_VALUE_JS: &str = r#"
    function clear_value() {
        this.value = '';
        this.dispatchEvent(new Event('input', { bubbles: true }));
    }
"#;

/// Launches a local Chromium. Honors `agent.chrome_path`, then `CHROME_PATH`.
pub struct ChromeLauncher {
    chrome_path: Option<PathBuf>,
    navigation_timeout: Duration,
    settle: Duration,
}

impl ChromeLauncher {
    pub fn from_config(config: &AgentConfig) -> Self {
        let chrome_path = config
            .chrome_path
            .clone()
            .or_else(|| std::env::var("CHROME_PATH").ok())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Self {
            chrome_path,
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
            settle: Duration::from_millis(config.settle_millis),
        }
    }
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let options = LaunchOptionsBuilder::default()
            .sandbox(false)
            .window_size(Some((1280, 900)))
            .idle_browser_timeout(self.navigation_timeout * 10)
            .path(self.chrome_path.clone())
            .build()
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let browser = Browser::new(options).map_err(|e| {
            log::error!("failed to start chrome: {e}");
            BrowserError::Launch(e.to_string())
        })?;
        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        tab.set_default_timeout(self.navigation_timeout);

        Ok(Box::new(ChromePage {
            _browser: browser,
            tab,
            settle: self.settle,
        }))
    }
}

/// A single tab; the browser process lives as long as the page.
pub struct ChromePage {
    _browser: Browser,
    tab: Arc<Tab>,
    settle: Duration,
}

impl ChromePage {
    fn query(&self, locator: &Locator) -> Vec<Element<'_>> {
        let found = match locator.to_query() {
            Query::Css(selector) => self.tab.find_elements(&selector),
            Query::XPath(xpath) => self.tab.find_elements_by_xpath(&xpath),
        };
        found.unwrap_or_default()
    }

    fn is_visible(element: &Element<'_>) -> bool {
        element
            .call_js_fn(IS_VISIBLE_JS, vec![], false)
            .ok()
            .and_then(|r| r.value)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Poll until a visible element matches or `timeout` passes.
    fn find_visible(&self, locator: &Locator, timeout: Duration) -> Result<Element<'_>, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self
                .query(locator)
                .into_iter()
                .find(|e| Self::is_visible(e))
            {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::ActionNotTaken(locator.to_string()));
            }
            sleep(POLL_INTERVAL);
        }
    }
}

impl BrowserPage for ChromePage {
    fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        let navigation = |e: anyhow::Error| BrowserError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        };
        self.tab.navigate_to(url).map_err(navigation)?;
        self.tab.wait_until_navigated().map_err(navigation)?;
        Ok(())
    }

    fn current_url(&self) -> String {
        self.tab.get_url()
    }

    fn content(&mut self) -> Result<String, BrowserError> {
        self.tab
            .get_content()
            .map_err(|e| BrowserError::Session(e.to_string()))
    }

    fn settle(&mut self) {
        // clicks that do not navigate make this return an error; that is fine
        let _ = self.tab.wait_until_navigated();
        let _ = self
            .tab
            .wait_for_element_with_custom_timeout("body", Duration::from_secs(5));
        sleep(self.settle);
    }

    fn click(&mut self, locator: &Locator, timeout: Duration) -> Result<(), BrowserError> {
        let element = self.find_visible(locator, timeout)?;
        element
            .click()
            .map_err(|e| BrowserError::ActionNotTaken(format!("{locator}: {e}")))?;
        Ok(())
    }

    fn fill(&mut self, locator: &Locator, text: &str, timeout: Duration) -> Result<(), BrowserError> {
        let element = self.find_visible(locator, timeout)?;
        let _ = element.call_js_fn(CLEAR_VALUE_JS, vec![], false);
        element
            .click()
            .and_then(|e| e.type_into(text))
            .map_err(|e| BrowserError::ActionNotTaken(format!("{locator}: {e}")))?;
        Ok(())
    }
}
