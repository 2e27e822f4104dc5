use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::AgentError;
use crate::generator::{CommentGenerator, Generated, GenerateRequest};
use crate::page::{Page, PageError, PageItem, Session, SessionLauncher};
use crate::scanner::ItemProcessor;

// In-memory fakes for the capability surface, shared across the module
// test suites.

// ========================= MockItem =========================

#[derive(Clone, Default)]
pub struct MockItem {
    inner: Arc<MockItemInner>,
}

#[derive(Default)]
struct MockItemInner {
    attrs: Mutex<HashMap<String, String>>,
    children: Mutex<HashMap<String, Vec<MockItem>>>,
    text: Mutex<Option<String>>,
    clicks: AtomicUsize,
    scrolls: AtomicUsize,
    typed: Mutex<Vec<String>>,
}

impl MockItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str) -> Self {
        let item = Self::new();
        *item.inner.text.lock().unwrap() = Some(text.to_string());
        item
    }

    pub fn with_attr(self, name: &str, value: &str) -> Self {
        self.inner
            .attrs
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_child(self, selector: &str, child: MockItem) -> Self {
        self.inner
            .children
            .lock()
            .unwrap()
            .entry(selector.to_string())
            .or_default()
            .push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.inner.attrs.lock().unwrap().get(name).cloned()
    }

    pub fn clicks(&self) -> usize {
        self.inner.clicks.load(Ordering::SeqCst)
    }

    pub fn scrolls(&self) -> usize {
        self.inner.scrolls.load(Ordering::SeqCst)
    }

    pub fn typed(&self) -> Vec<String> {
        self.inner.typed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageItem for MockItem {
    async fn attribute(&self, name: &str) -> Result<Option<String>, PageError> {
        Ok(self.attr(name))
    }

    async fn set_attribute(&self, name: &str, value: &str) -> Result<(), PageError> {
        self.inner
            .attrs
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn text(&self) -> Result<Option<String>, PageError> {
        Ok(self.inner.text.lock().unwrap().clone())
    }

    async fn find(&self, selector: &str) -> Result<Option<Self>, PageError> {
        Ok(self
            .inner
            .children
            .lock()
            .unwrap()
            .get(selector)
            .and_then(|v| v.first().cloned()))
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Self>, PageError> {
        Ok(self
            .inner
            .children
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn click(&self) -> Result<(), PageError> {
        self.inner.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), PageError> {
        self.inner.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn scroll_into_view(&self) -> Result<(), PageError> {
        self.inner.scrolls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========================= MockPage =========================

#[derive(Clone, Default)]
pub struct MockPage {
    inner: Arc<MockPageInner>,
}

#[derive(Default)]
struct MockPageInner {
    items: Mutex<Vec<MockItem>>,
    elements: Mutex<HashMap<String, MockItem>>,
    fail_login: Mutex<Option<PageError>>,
    fail_find_all: Mutex<Option<PageError>>,
    navigations: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
    logins: AtomicUsize,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_item(&self, item: MockItem) {
        self.inner.items.lock().unwrap().push(item);
    }

    pub fn register_element(&self, selector: &str, item: MockItem) {
        self.inner
            .elements
            .lock()
            .unwrap()
            .insert(selector.to_string(), item);
    }

    pub fn fail_login(&self, err: PageError) {
        *self.inner.fail_login.lock().unwrap() = Some(err);
    }

    pub fn fail_find_all(&self, err: PageError) {
        *self.inner.fail_find_all.lock().unwrap() = Some(err);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.keys.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.inner.navigations.lock().unwrap().clone()
    }

    pub fn logins(&self) -> usize {
        self.inner.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Page for MockPage {
    type Item = MockItem;

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.inner.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn url(&self) -> Result<String, PageError> {
        Ok(self
            .inner
            .navigations
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(|| "about:blank".into()))
    }

    async fn find(&self, selector: &str) -> Result<Option<Self::Item>, PageError> {
        Ok(self.inner.elements.lock().unwrap().get(selector).cloned())
    }

    async fn find_all(&self, _selector: &str) -> Result<Vec<Self::Item>, PageError> {
        if let Some(err) = self.inner.fail_find_all.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.inner.items.lock().unwrap().clone())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<Self::Item, PageError> {
        self.inner
            .elements
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .ok_or_else(|| PageError::Timeout(selector.to_string()))
    }

    async fn screenshot_b64(&self) -> Result<String, PageError> {
        Ok("c2NyZWVuc2hvdA==".into())
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        self.inner.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn login(&self, _username: &str, _password: &str) -> Result<(), PageError> {
        if let Some(err) = self.inner.fail_login.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========================= MockSession =========================

#[derive(Clone)]
pub struct MockSession {
    inner: Arc<MockSessionInner>,
}

struct MockSessionInner {
    page: MockPage,
    page_count: AtomicUsize,
    closed: AtomicBool,
}

impl MockSession {
    pub fn with_page(page: MockPage) -> Self {
        Self {
            inner: Arc::new(MockSessionInner {
                page,
                page_count: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn page(&self) -> MockPage {
        self.inner.page.clone()
    }

    pub fn set_page_count(&self, count: usize) {
        self.inner.page_count.store(count, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for MockSession {
    type Page = MockPage;

    async fn new_page(&self) -> Result<Self::Page, PageError> {
        if self.closed() {
            return Err(PageError::SessionClosed);
        }
        Ok(self.inner.page.clone())
    }

    async fn page_count(&self) -> usize {
        self.inner.page_count.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PageError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockLauncher {
    session: MockSession,
    fail: Option<PageError>,
}

impl MockLauncher {
    pub fn with_page(page: MockPage) -> Self {
        Self {
            session: MockSession::with_page(page),
            fail: None,
        }
    }

    pub fn failing(err: PageError) -> Self {
        Self {
            session: MockSession::with_page(MockPage::new()),
            fail: Some(err),
        }
    }

    pub fn session(&self) -> MockSession {
        self.session.clone()
    }
}

#[async_trait]
impl SessionLauncher for MockLauncher {
    type Session = MockSession;

    async fn launch(&self) -> Result<Self::Session, PageError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        Ok(self.session.clone())
    }
}

// ========================= MockGenerator =========================

#[derive(Clone, Default)]
pub struct MockGenerator {
    inner: Arc<MockGeneratorInner>,
}

#[derive(Default)]
struct MockGeneratorInner {
    script: Mutex<VecDeque<Generated>>,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, generated: Generated) {
        self.inner.script.lock().unwrap().push_back(generated);
    }

    pub fn calls(&self) -> Vec<GenerateRequest> {
        self.inner.calls.lock().unwrap().clone()
    }

    fn next(&self, req: &GenerateRequest) -> Generated {
        self.inner.calls.lock().unwrap().push(req.clone());
        self.inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Generated::Allowed {
                comment: "lovely shot!".into(),
            })
    }
}

#[async_trait]
impl CommentGenerator for MockGenerator {
    async fn comment(&self, req: &GenerateRequest) -> anyhow::Result<Generated> {
        Ok(self.next(req))
    }

    async fn reply(&self, req: &GenerateRequest) -> anyhow::Result<Generated> {
        Ok(self.next(req))
    }
}

// ========================= ScriptedProcessor =========================

#[derive(Clone, Copy, Debug)]
pub enum Outcome {
    Success,
    Skip,
    Fail(&'static str),
    FatalSession,
}

#[derive(Default)]
pub struct ScriptedProcessor {
    script: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, identity: &str, outcomes: Vec<Outcome>) {
        self.script
            .lock()
            .unwrap()
            .insert(identity.to_string(), outcomes.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl<P: Page> ItemProcessor<P> for ScriptedProcessor {
    async fn process(
        &self,
        _page: &P,
        _item: &P::Item,
        identity: &str,
    ) -> Result<bool, AgentError> {
        self.calls.lock().unwrap().push(identity.to_string());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .get_mut(identity)
            .and_then(|q| q.pop_front())
            .unwrap_or(Outcome::Success);
        match outcome {
            Outcome::Success => Ok(true),
            Outcome::Skip => Ok(false),
            Outcome::Fail(msg) => Err(AgentError::Other(msg.to_string())),
            Outcome::FatalSession => Err(PageError::SessionClosed.into()),
        }
    }
}
