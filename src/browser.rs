use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page as OxidePage, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::page::{Page, PageError, PageItem, Session, SessionLauncher};
use crate::throttle;

const LOGIN_URL: &str = "https://www.instagram.com/accounts/login/";
const USERNAME_INPUT: &str = "input[name='username']";
const PASSWORD_INPUT: &str = "input[name='password']";
const LOGIN_SUBMIT: &str = "button[type='submit']";
const HOME_MARKER: &str = "svg[aria-label='Home']";

const LOGIN_FORM_TIMEOUT: Duration = Duration::from_secs(15);
const LOGIN_DONE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

// The single place where the driver's error surface is read. Everything
// downstream switches on the PageError tag, never on message text. The
// "session is gone" signatures below cover chromiumoxide's display forms
// for a dead browser: the CDP websocket dropping, the handler channel
// going away, and explicit close notifications.
fn normalize(err: CdpError) -> PageError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("closed")
        || lower.contains("websocket")
        || lower.contains("channel")
        || lower.contains("connection")
    {
        return PageError::SessionClosed;
    }
    if lower.contains("could not find node")
        || lower.contains("no node")
        || lower.contains("not found")
    {
        return PageError::ElementNotFound(msg);
    }
    if lower.contains("timeout") {
        return PageError::Timeout(msg);
    }
    PageError::Other(msg)
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

// ========================= Items =========================

#[derive(Clone)]
pub struct ChromiumItem {
    element: Arc<Element>,
    page: OxidePage,
}

impl ChromiumItem {
    fn new(element: Element, page: OxidePage) -> Self {
        Self {
            element: Arc::new(element),
            page,
        }
    }
}

#[async_trait]
impl PageItem for ChromiumItem {
    async fn attribute(&self, name: &str) -> Result<Option<String>, PageError> {
        self.element.attribute(name).await.map_err(normalize)
    }

    async fn set_attribute(&self, name: &str, value: &str) -> Result<(), PageError> {
        let js = format!(
            "function() {{ this.setAttribute({}, {}); }}",
            js_string(name),
            js_string(value)
        );
        self.element
            .call_js_fn(js, false)
            .await
            .map_err(normalize)?;
        Ok(())
    }

    async fn text(&self) -> Result<Option<String>, PageError> {
        self.element.inner_text().await.map_err(normalize)
    }

    async fn find(&self, selector: &str) -> Result<Option<Self>, PageError> {
        match self.element.find_element(selector).await {
            Ok(el) => Ok(Some(ChromiumItem::new(el, self.page.clone()))),
            Err(err) => match normalize(err) {
                PageError::SessionClosed => Err(PageError::SessionClosed),
                _ => Ok(None),
            },
        }
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Self>, PageError> {
        match self.element.find_elements(selector).await {
            Ok(els) => Ok(els
                .into_iter()
                .map(|el| ChromiumItem::new(el, self.page.clone()))
                .collect()),
            Err(err) => match normalize(err) {
                PageError::SessionClosed => Err(PageError::SessionClosed),
                _ => Ok(Vec::new()),
            },
        }
    }

    async fn click(&self) -> Result<(), PageError> {
        self.element.click().await.map_err(normalize)?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), PageError> {
        // focus, then feed the active element through CDP Input.insertText
        self.element.focus().await.map_err(normalize)?;
        self.page
            .execute(InsertTextParams {
                text: text.to_string(),
            })
            .await
            .map_err(normalize)?;
        Ok(())
    }

    async fn scroll_into_view(&self) -> Result<(), PageError> {
        // smooth behavior rather than an instant jump; paired with a settle
        // pause so the viewport is at rest before the next action
        self.element
            .call_js_fn(
                "function() { this.scrollIntoView({behavior: 'smooth', block: 'center'}); }",
                false,
            )
            .await
            .map_err(normalize)?;
        throttle::pause_between(600, 1200).await;
        Ok(())
    }
}

// ========================= Page =========================

#[derive(Clone)]
pub struct ChromiumPage {
    page: OxidePage,
}

#[async_trait]
impl Page for ChromiumPage {
    type Item = ChromiumItem;

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.page.goto(url).await.map_err(|err| match normalize(err) {
            PageError::SessionClosed => PageError::SessionClosed,
            other => PageError::Navigation(other.to_string()),
        })?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| match normalize(err) {
                PageError::SessionClosed => PageError::SessionClosed,
                other => PageError::Navigation(other.to_string()),
            })?;
        Ok(())
    }

    async fn url(&self) -> Result<String, PageError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(normalize)?
            .unwrap_or_default())
    }

    async fn find(&self, selector: &str) -> Result<Option<Self::Item>, PageError> {
        match self.page.find_element(selector).await {
            Ok(el) => Ok(Some(ChromiumItem::new(el, self.page.clone()))),
            Err(err) => match normalize(err) {
                PageError::SessionClosed => Err(PageError::SessionClosed),
                _ => Ok(None),
            },
        }
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Self::Item>, PageError> {
        match self.page.find_elements(selector).await {
            Ok(els) => Ok(els
                .into_iter()
                .map(|el| ChromiumItem::new(el, self.page.clone()))
                .collect()),
            Err(err) => match normalize(err) {
                PageError::SessionClosed => Err(PageError::SessionClosed),
                _ => Ok(Vec::new()),
            },
        }
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Self::Item, PageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.page.find_element(selector).await {
                Ok(el) => return Ok(ChromiumItem::new(el, self.page.clone())),
                Err(err) => {
                    if let PageError::SessionClosed = normalize(err) {
                        return Err(PageError::SessionClosed);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PageError::Timeout(selector.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn screenshot_b64(&self) -> Result<String, PageError> {
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParamsBuilder::default()
                        .full_page(false)
                        .omit_background(true)
                        .build(),
                )
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(err) => {
                let msg = format!("{err}");
                if msg.contains("0 width") || msg.contains("0 height") {
                    // force a viewport and retry once
                    let _ = self
                        .page
                        .execute(
                            SetDeviceMetricsOverrideParams::builder()
                                .width(1280)
                                .height(800)
                                .device_scale_factor(1.0)
                                .mobile(false)
                                .build()
                                .unwrap(),
                        )
                        .await;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await.map_err(normalize)?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(normalize(err))
            }
        }
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        let js = format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const opts = {{key: "{key}", code: "{key}", bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()
        "#
        );
        let eval = EvaluateParams::builder()
            .expression(js)
            .build()
            .map_err(PageError::Other)?;
        self.page.execute(eval).await.map_err(normalize)?;
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), PageError> {
        self.navigate(LOGIN_URL).await?;
        let user_input = self.wait_for(USERNAME_INPUT, LOGIN_FORM_TIMEOUT).await?;
        user_input.click().await?;
        user_input.type_text(username).await?;
        let pass_input = self.wait_for(PASSWORD_INPUT, LOGIN_FORM_TIMEOUT).await?;
        pass_input.click().await?;
        pass_input.type_text(password).await?;
        throttle::pause_between(400, 900).await;
        let submit = self.wait_for(LOGIN_SUBMIT, LOGIN_FORM_TIMEOUT).await?;
        submit.click().await?;
        // logged in once the home navigation renders
        self.wait_for(HOME_MARKER, LOGIN_DONE_TIMEOUT).await?;
        Ok(())
    }
}

// ========================= Session =========================

pub struct ChromiumSession {
    browser: Mutex<OxideBrowser>,
    cfg: BrowserConfig,
}

impl ChromiumSession {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, PageError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile
        // lock conflicts when the browser is restarted rapidly.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("gramhands-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(PageError::Other)?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await.map_err(normalize)?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Ok(Self {
            browser: Mutex::new(browser),
            cfg,
        })
    }
}

#[async_trait]
impl Session for ChromiumSession {
    type Page = ChromiumPage;

    async fn new_page(&self) -> Result<Self::Page, PageError> {
        let browser = self.browser.lock().await;
        let page = browser.new_page("about:blank").await.map_err(normalize)?;
        if let Some(ua) = &self.cfg.user_agent {
            page.set_user_agent(ua.clone()).await.map_err(normalize)?;
        }
        // non-zero viewport so screenshots never come back 0-width
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
        Ok(ChromiumPage { page })
    }

    async fn page_count(&self) -> usize {
        let browser = self.browser.lock().await;
        browser.pages().await.map(|p| p.len()).unwrap_or(0)
    }

    async fn close(&self) -> Result<(), PageError> {
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(normalize)?;
        Ok(())
    }
}

// ========================= Launcher =========================

pub struct ChromiumLauncher {
    cfg: BrowserConfig,
}

impl ChromiumLauncher {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<Self::Session, PageError> {
        ChromiumSession::launch(self.cfg.clone()).await
    }
}
