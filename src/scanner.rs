use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::page::{Page, PageError, PageItem};
use crate::status::StatusHub;
use crate::throttle;

// ========================= Stable Identity =========================

pub const SCAN_ID_ATTR: &str = "data-gh-id";
const CONTENT_ID_CHARS: usize = 30;
const REGION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn content_identity(author: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author.trim().as_bytes());
    let head: String = content.chars().take(CONTENT_ID_CHARS).collect();
    hasher.update(head.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

// Ordinal fallback identities are only meaningful within one scan call;
// the ordinal counter restarts with every call, so they must never be
// compared across calls.
pub fn synthetic_identity(ordinal: usize) -> String {
    format!("article-{ordinal}")
}

/// Resolves a durable identity for a scanned node and writes it back onto
/// the node, so every later pass short-circuits on the marker lookup.
pub async fn ensure_identity<I: PageItem>(
    item: &I,
    selectors: &SelectorSet,
    fallback_ordinal: usize,
) -> Result<String, PageError> {
    if let Some(attr) = &selectors.marker_attr {
        if let Some(existing) = item.attribute(attr).await? {
            if !existing.is_empty() {
                return Ok(existing);
            }
        }
    }
    if let Some(existing) = item.attribute(SCAN_ID_ATTR).await? {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let author = child_text(item, selectors.author.as_deref()).await?;
    let content = child_text(item, selectors.content.as_deref()).await?;
    let id = match (author, content) {
        (Some(a), Some(c)) if !a.trim().is_empty() && !c.trim().is_empty() => {
            content_identity(&a, &c)
        }
        _ => synthetic_identity(fallback_ordinal),
    };
    item.set_attribute(SCAN_ID_ATTR, &id).await?;
    Ok(id)
}

async fn child_text<I: PageItem>(
    item: &I,
    selector: Option<&str>,
) -> Result<Option<String>, PageError> {
    let Some(sel) = selector else { return Ok(None) };
    match item.find(sel).await? {
        Some(child) => child.text().await,
        None => Ok(None),
    }
}

// ========================= Selector Sets =========================

// Selector strings are environment defaults; the target UI renames them
// at will, so callers may override any of these.
#[derive(Clone, Debug)]
pub struct SelectorSet {
    pub region: Option<String>,
    pub item: String,
    pub marker_attr: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
}

impl SelectorSet {
    pub fn feed() -> Self {
        Self {
            region: Some("main[role='main']".into()),
            item: "main article".into(),
            marker_attr: None,
            author: Some("header a[role='link']".into()),
            content: Some("span[dir='auto']".into()),
        }
    }

    pub fn hashtag_grid() -> Self {
        Self {
            region: Some("main[role='main']".into()),
            // thumbnails already carry a durable permalink
            item: "main a[href*='/p/']".into(),
            marker_attr: Some("href".into()),
            author: None,
            content: None,
        }
    }

    pub fn comment_threads() -> Self {
        Self {
            region: Some("div[role='dialog']".into()),
            item: "div[role='dialog'] li".into(),
            marker_attr: None,
            author: Some("a[role='link']".into()),
            content: Some("span[dir='auto']".into()),
        }
    }
}

// ========================= Scan Engine =========================

#[async_trait]
pub trait ItemProcessor<P: Page>: Send + Sync {
    /// Ok(true): durably processed, count it. Ok(false): deliberately
    /// skipped, leave it eligible for a later pass. Err: unexpected
    /// failure, also left eligible.
    async fn process(&self, page: &P, item: &P::Item, identity: &str)
        -> Result<bool, AgentError>;
}

pub struct ScanState {
    pub processed_ids: HashSet<String>,
    pub should_stop: bool,
    pub max_items: Option<usize>,
}

impl ScanState {
    pub fn new(max_items: Option<usize>) -> Self {
        Self {
            processed_ids: HashSet::new(),
            should_stop: false,
            max_items,
        }
    }

    fn ceiling_reached(&self) -> bool {
        self.max_items.is_some_and(|max| self.processed_ids.len() >= max)
    }
}

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub max_items: Option<usize>,
    pub process_delay_ms: (u64, u64),
    pub post_interval: Duration,
    pub settle_ms: u64,
    pub max_passes: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_items: None,
            process_delay_ms: (800, 2200),
            post_interval: Duration::from_secs(30),
            settle_ms: 1000,
            max_passes: 25,
        }
    }
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub processed: HashSet<String>,
    pub attempts: usize,
    pub passes: usize,
}

pub struct Scanner {
    label: String,
    selectors: SelectorSet,
    options: ScanOptions,
}

impl Scanner {
    pub fn new(label: impl Into<String>, selectors: SelectorSet, options: ScanOptions) -> Self {
        Self {
            label: label.into(),
            selectors,
            options,
        }
    }

    pub async fn scan<P: Page>(
        &self,
        page: &P,
        processor: &dyn ItemProcessor<P>,
        hub: &StatusHub,
    ) -> Result<ScanOutcome, AgentError> {
        // The scrollable region must exist before enumeration starts;
        // failing to reach it is fatal to this scan call.
        if let Some(region) = &self.selectors.region {
            page.wait_for(region, REGION_TIMEOUT).await?;
        }

        let mut state = ScanState::new(self.options.max_items);
        let mut attempts = 0usize;
        let mut passes = 0usize;
        let mut next_ordinal = 0usize;

        loop {
            if state.ceiling_reached() {
                break;
            }
            passes += 1;
            let items = page.find_all(&self.selectors.item).await?;
            if items.is_empty() {
                info!(scanner = %self.label, "no candidate items rendered");
                break;
            }

            let mut fresh_this_pass = 0usize;
            for item in &items {
                if state.should_stop {
                    break;
                }
                let ordinal = next_ordinal;
                next_ordinal += 1;
                let identity = match ensure_identity(item, &self.selectors, ordinal).await {
                    Ok(id) => id,
                    Err(PageError::SessionClosed) => return Err(PageError::SessionClosed.into()),
                    Err(err) => {
                        warn!(scanner = %self.label, error = %err, "identity resolution failed");
                        hub.log_entry("item identity failed", Some(err.to_string()), Some(false));
                        continue;
                    }
                };
                if state.processed_ids.contains(&identity) {
                    // already counted this call; no throttle spent
                    continue;
                }
                fresh_this_pass += 1;

                if let Err(err) = item.scroll_into_view().await {
                    if matches!(err, PageError::SessionClosed) {
                        return Err(err.into());
                    }
                    debug!(scanner = %self.label, error = %err, "scroll into view failed");
                }
                throttle::pause_between(
                    self.options.process_delay_ms.0,
                    self.options.process_delay_ms.1,
                )
                .await;

                match processor.process(page, item, &identity).await {
                    Ok(true) => {
                        state.processed_ids.insert(identity.clone());
                        hub.log_entry("item processed", Some(identity.clone()), Some(true));
                    }
                    Ok(false) => {
                        debug!(scanner = %self.label, identity = %identity, "item skipped");
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        // not recorded as done; a later pass may retry it
                        warn!(scanner = %self.label, identity = %identity, error = %err, "item failed");
                        hub.log_entry("item failed", Some(err.to_string()), Some(false));
                    }
                }

                attempts += 1;
                sleep(self.options.post_interval).await;
                hub.clear_waiting();
                if state.ceiling_reached() {
                    state.should_stop = true;
                }
            }

            if state.should_stop {
                break;
            }
            if fresh_this_pass == 0 {
                // every rendered candidate is already known; nothing new
                // will appear without further scrolling progress
                break;
            }
            if passes >= self.options.max_passes {
                warn!(scanner = %self.label, passes, "pass ceiling reached");
                break;
            }
            // give the lazy-loading list a beat to grow before re-querying
            throttle::pause_ms(self.options.settle_ms).await;
        }

        info!(
            scanner = %self.label,
            processed = state.processed_ids.len(),
            attempts,
            passes,
            "scan finished"
        );
        Ok(ScanOutcome {
            processed: state.processed_ids,
            attempts,
            passes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockItem, MockPage, Outcome, ScriptedProcessor};

    fn fast_options(max_items: Option<usize>) -> ScanOptions {
        ScanOptions {
            max_items,
            process_delay_ms: (0, 0),
            post_interval: Duration::from_millis(0),
            settle_ms: 0,
            max_passes: 25,
        }
    }

    fn bare_selectors() -> SelectorSet {
        SelectorSet {
            region: None,
            item: "article".into(),
            marker_attr: None,
            author: Some("a.author".into()),
            content: Some("span.body".into()),
        }
    }

    fn marked_item(id: &str) -> MockItem {
        MockItem::new().with_attr(SCAN_ID_ATTR, id)
    }

    #[tokio::test]
    async fn identity_assignment_is_idempotent() {
        let selectors = bare_selectors();
        let item = MockItem::new()
            .with_child("a.author", MockItem::with_text("alice"))
            .with_child("span.body", MockItem::with_text("a very scenic mountain trail"));
        let first = ensure_identity(&item, &selectors, 0).await.unwrap();
        let second = ensure_identity(&item, &selectors, 99).await.unwrap();
        assert_eq!(first, second);
        // the identity was persisted onto the node
        assert_eq!(item.attr(SCAN_ID_ATTR), Some(first));
    }

    #[tokio::test]
    async fn content_identity_tolerates_whitespace_and_tail_changes() {
        let base = content_identity("alice", "a very scenic mountain trail today");
        assert_eq!(base, content_identity("  alice  ", "a very scenic mountain trail today"));
        // only the first 30 characters participate
        assert_eq!(
            content_identity("alice", "a very scenic mountain trail today, wow"),
            content_identity("alice", "a very scenic mountain trail today!!!")
        );
        assert_ne!(base, content_identity("bob", "a very scenic mountain trail today"));
    }

    #[tokio::test]
    async fn missing_author_and_content_falls_back_to_ordinal() {
        let selectors = bare_selectors();
        let item = MockItem::new();
        let id = ensure_identity(&item, &selectors, 7).await.unwrap();
        assert_eq!(id, "article-7");
        assert_eq!(item.attr(SCAN_ID_ATTR), Some("article-7".into()));
    }

    #[tokio::test]
    async fn existing_marker_attribute_wins() {
        let mut selectors = bare_selectors();
        selectors.marker_attr = Some("href".into());
        let item = MockItem::new().with_attr("href", "/p/abc123/");
        let id = ensure_identity(&item, &selectors, 0).await.unwrap();
        assert_eq!(id, "/p/abc123/");
        // durable markers are not rewritten
        assert_eq!(item.attr(SCAN_ID_ATTR), None);
    }

    #[tokio::test]
    async fn empty_candidate_list_returns_immediately() {
        let page = MockPage::new();
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        let outcome = scanner.scan(&page, &processor, &hub).await.unwrap();
        assert!(outcome.processed.is_empty());
        assert_eq!(outcome.passes, 1);
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn known_items_are_never_reprocessed() {
        let page = MockPage::new();
        for i in 0..5 {
            page.push_item(marked_item(&format!("a{i}")));
        }
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        let outcome = scanner.scan(&page, &processor, &hub).await.unwrap();
        // pass 1 processes all five; pass 2 sees only known identities and
        // stops without calling the processor again
        assert_eq!(outcome.processed.len(), 5);
        assert_eq!(outcome.passes, 2);
        assert_eq!(processor.calls().len(), 5);
    }

    #[tokio::test]
    async fn max_items_ceiling_stops_the_scan() {
        let page = MockPage::new();
        for i in 0..5 {
            page.push_item(marked_item(&format!("a{i}")));
        }
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(Some(2)));
        let outcome = scanner.scan(&page, &processor, &hub).await.unwrap();
        assert_eq!(outcome.processed.len(), 2);
        assert_eq!(processor.calls().len(), 2);
        assert_eq!(outcome.passes, 1);
    }

    #[tokio::test]
    async fn failed_item_is_retried_and_counted_once() {
        let page = MockPage::new();
        page.push_item(marked_item("flaky"));
        let processor = ScriptedProcessor::new();
        processor.script("flaky", vec![Outcome::Fail("click intercepted"), Outcome::Success]);
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        let outcome = scanner.scan(&page, &processor, &hub).await.unwrap();
        assert_eq!(processor.calls(), vec!["flaky".to_string(), "flaky".to_string()]);
        assert_eq!(outcome.processed.len(), 1);
        assert!(outcome.processed.contains("flaky"));
    }

    #[tokio::test]
    async fn mixed_outcomes_count_only_confirmed_success() {
        let page = MockPage::new();
        page.push_item(marked_item("good"));
        page.push_item(marked_item("ad"));
        page.push_item(marked_item("broken"));
        let processor = ScriptedProcessor::new();
        processor.script("good", vec![Outcome::Success]);
        processor.script("ad", vec![Outcome::Skip]);
        processor.script("broken", vec![Outcome::Fail("boom")]);
        let hub = StatusHub::new();
        let mut options = fast_options(None);
        options.max_passes = 1;
        let scanner = Scanner::new("test", bare_selectors(), options);
        let outcome = scanner.scan(&page, &processor, &hub).await.unwrap();
        assert_eq!(outcome.processed.len(), 1);
        assert!(outcome.processed.contains("good"));
        // skipped and failed items stay eligible for a later pass
        assert!(!outcome.processed.contains("ad"));
        assert!(!outcome.processed.contains("broken"));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn session_closed_propagates_out_of_the_scan() {
        let page = MockPage::new();
        page.push_item(marked_item("x"));
        let processor = ScriptedProcessor::new();
        processor.script("x", vec![Outcome::FatalSession]);
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        let err = scanner.scan(&page, &processor, &hub).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn items_are_scrolled_before_processing() {
        let page = MockPage::new();
        let item = marked_item("a0");
        page.push_item(item.clone());
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        scanner.scan(&page, &processor, &hub).await.unwrap();
        assert!(item.scrolls() >= 1);
    }

    #[tokio::test]
    async fn enumeration_failure_propagates_to_the_caller() {
        let page = MockPage::new();
        page.fail_find_all(PageError::Other("frame detached".into()));
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", bare_selectors(), fast_options(None));
        let err = scanner.scan(&page, &processor, &hub).await.unwrap_err();
        // a failed enumeration ends the scan call but not the whole run
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn missing_region_is_fatal_to_the_scan_call() {
        let page = MockPage::new();
        let mut selectors = bare_selectors();
        selectors.region = Some("main[role='main']".into());
        let processor = ScriptedProcessor::new();
        let hub = StatusHub::new();
        let scanner = Scanner::new("test", selectors, fast_options(None));
        assert!(scanner.scan(&page, &processor, &hub).await.is_err());
    }
}
