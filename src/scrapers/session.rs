use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A Chrome instance on a persistent profile, so cookies survive restarts
pub struct BrowserSession {
    // Keeps the Chrome process alive for as long as the tab is used
    _browser: Browser,
    tab: Arc<Tab>,
    headless: bool,
}

impl BrowserSession {
    /// Launch Chrome on `profile_dir`
    pub fn launch(profile_dir: &Path, headless: bool, user_agent: &str) -> Result<Self> {
        info!("Launching Chrome (headless={})...", headless);

        std::fs::create_dir_all(profile_dir).with_context(|| {
            format!("Failed to create browser profile dir {}", profile_dir.display())
        })?;

        let options = LaunchOptions::default_builder()
            .headless(headless)
            .window_size(Some((1920, 1080)))
            .user_data_dir(Some(profile_dir.to_path_buf()))
            .idle_browser_timeout(Duration::from_secs(600))
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--no-sandbox"),
            ])
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open browser tab")?;
        tab.set_user_agent(user_agent, None, None)
            .context("Failed to set user agent")?;

        Ok(Self {
            _browser: browser,
            tab,
            headless,
        })
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Navigate and give client-side rendering `settle` to finish
    pub fn goto(&self, url: &str, settle: Duration) -> Result<()> {
        debug!("Navigating to {}", url);
        self.tab.navigate_to(url)?;
        self.tab.wait_until_navigated()?;
        thread::sleep(settle);
        Ok(())
    }

    pub fn current_url(&self) -> String {
        self.tab.get_url()
    }

    /// Run a script and return its JSON result, if any
    pub fn run_script(&self, script: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.tab.evaluate(script, false)?.value)
    }

    /// Current DOM serialized as HTML
    pub fn page_html(&self) -> Result<String> {
        let html = self
            .run_script("document.documentElement.outerHTML")?
            .and_then(|value| value.as_str().map(str::to_string));

        match html {
            Some(html) => Ok(html),
            None => {
                warn!("Could not get HTML from page");
                Ok(String::new())
            }
        }
    }

    /// Shut the browser down. Chrome flushes the profile to disk on exit.
    pub fn close(self) {
        if let Err(e) = self.tab.close(true) {
            debug!("Tab already closed: {}", e);
        }
        info!("Browser closed");
    }
}

/// Facebook bounces unauthenticated sessions to a login or checkpoint page
pub fn is_login_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.contains("/login") || lower.contains("checkpoint")
}
