use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

// The automation core only ever sees this capability surface. Concrete
// drivers (chromiumoxide in browser.rs, mocks in tests) normalize their own
// error surface into PageError so everything downstream can switch on a
// stable tag instead of error message text.

#[derive(Debug, Clone, Error)]
pub enum PageError {
    #[error("browser session closed")]
    SessionClosed,
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("timed out waiting for: {0}")]
    Timeout(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PageItem: Clone + Send + Sync {
    async fn attribute(&self, name: &str) -> Result<Option<String>, PageError>;
    async fn set_attribute(&self, name: &str, value: &str) -> Result<(), PageError>;
    async fn text(&self) -> Result<Option<String>, PageError>;
    async fn find(&self, selector: &str) -> Result<Option<Self>, PageError>;
    async fn find_all(&self, selector: &str) -> Result<Vec<Self>, PageError>;
    async fn click(&self) -> Result<(), PageError>;
    async fn type_text(&self, text: &str) -> Result<(), PageError>;
    async fn scroll_into_view(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait Page: Send + Sync {
    type Item: PageItem + 'static;

    async fn navigate(&self, url: &str) -> Result<(), PageError>;
    async fn url(&self) -> Result<String, PageError>;
    async fn find(&self, selector: &str) -> Result<Option<Self::Item>, PageError>;
    async fn find_all(&self, selector: &str) -> Result<Vec<Self::Item>, PageError>;
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Self::Item, PageError>;
    async fn screenshot_b64(&self) -> Result<String, PageError>;
    async fn press_key(&self, key: &str) -> Result<(), PageError>;
    async fn login(&self, username: &str, password: &str) -> Result<(), PageError>;
}

#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Page: Page + 'static;

    async fn new_page(&self) -> Result<Self::Page, PageError>;
    async fn page_count(&self) -> usize;
    async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait SessionLauncher: Send + Sync + 'static {
    type Session: Session;

    async fn launch(&self) -> Result<Self::Session, PageError>;
}
