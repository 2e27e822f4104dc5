use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

use crate::agent::{AgentConfig, AgentError};
use crate::generator::{CommentGenerator, Generated, GenerateRequest};
use crate::page::{Page, PageError, PageItem};
use crate::scanner::ItemProcessor;
use crate::status::StatusHub;
use crate::throttle;

// Environment defaults, same caveat as the scanner selector sets.
pub(crate) const SPONSORED_BADGE: &str = "[aria-label='Sponsored']";
pub(crate) const POST_AUTHOR: &str = "header a[role='link']";
pub(crate) const POST_CAPTION: &str = "span[dir='auto']";
pub(crate) const COMMENT_AUTHORS: &str = "ul a[role='link']";
pub(crate) const COMMENT_BUTTON: &str = "svg[aria-label='Comment']";
pub(crate) const COMMENT_BOX: &str = "textarea[aria-label^='Add a comment']";
pub(crate) const POST_MODAL: &str = "div[role='dialog'] article";
pub(crate) const REPLY_BUTTON: &str = "[role='button']";
pub(crate) const COMMENT_ROW_AUTHOR: &str = "a[role='link']";
pub(crate) const COMMENT_ROW_TEXT: &str = "span[dir='auto']";

const COMMENT_BOX_TIMEOUT: Duration = Duration::from_secs(5);
const MODAL_TIMEOUT: Duration = Duration::from_secs(8);

// ========================= Shared Helpers =========================

async fn child_text<I: PageItem>(item: &I, selector: &str) -> Result<Option<String>, PageError> {
    match item.find(selector).await? {
        Some(child) => child.text().await,
        None => Ok(None),
    }
}

async fn already_commented<I: PageItem>(item: &I, username: &str) -> Result<bool, PageError> {
    if username.is_empty() {
        return Ok(false);
    }
    for commenter in item.find_all(COMMENT_AUTHORS).await? {
        if let Some(text) = commenter.text().await? {
            if text.contains(username) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn request_for(cfg: &AgentConfig, image: Option<String>, content: String) -> GenerateRequest {
    GenerateRequest {
        image,
        content,
        min_length: cfg.min_comment_length,
        max_length: cfg.max_comment_length,
        prompt: cfg.prompt.text().to_string(),
    }
}

async fn submit_comment<P: Page>(
    page: &P,
    open_button: &P::Item,
    text: &str,
) -> Result<(), AgentError> {
    open_button.click().await?;
    let input = page.wait_for(COMMENT_BOX, COMMENT_BOX_TIMEOUT).await?;
    input.click().await?;
    input.type_text(text).await?;
    // brief look-over before submitting
    throttle::pause_between(400, 1100).await;
    page.press_key("Enter").await?;
    Ok(())
}

fn mark_pacing(hub: &StatusHub, cfg: &AgentConfig) {
    let until = Utc::now() + chrono::Duration::seconds(cfg.post_interval_secs as i64);
    hub.set_waiting("post interval", until);
}

// Policy checks + generation + submission for one post container. Used by
// the feed variant directly and by the hashtag variant inside its modal.
async fn engage_post<P: Page>(
    page: &P,
    container: &P::Item,
    identity: &str,
    generator: &dyn CommentGenerator,
    cfg: &AgentConfig,
    hub: &StatusHub,
) -> Result<bool, AgentError> {
    if container.find(SPONSORED_BADGE).await?.is_some() {
        hub.log_entry("skipped sponsored post", Some(identity.to_string()), None);
        return Ok(false);
    }
    let author = child_text(container, POST_AUTHOR).await?.unwrap_or_default();
    if !author.is_empty() && cfg.is_excluded(&author) {
        hub.log_entry("skipped excluded author", Some(author), None);
        return Ok(false);
    }
    let Some(caption) = child_text(container, POST_CAPTION)
        .await?
        .filter(|c| !c.trim().is_empty())
    else {
        hub.log_entry("skipped post without caption", Some(identity.to_string()), None);
        return Ok(false);
    };
    if already_commented(container, &cfg.username).await? {
        hub.log_entry("skipped already-commented post", Some(identity.to_string()), None);
        return Ok(false);
    }

    let shot = page.screenshot_b64().await?;
    let req = request_for(cfg, Some(shot), caption);
    let generated = generator
        .comment(&req)
        .await
        .map_err(|e| AgentError::Generation(e.to_string()))?;
    match generated {
        Generated::Declined { reason } => {
            hub.log_entry("generation declined", Some(reason), None);
            Ok(false)
        }
        Generated::Allowed { comment } => {
            let Some(button) = container.find(COMMENT_BUTTON).await? else {
                return Err(PageError::ElementNotFound(COMMENT_BUTTON.into()).into());
            };
            submit_comment(page, &button, &comment).await?;
            hub.log_entry("commented", Some(format!("@{author}: {comment}")), Some(true));
            mark_pacing(hub, cfg);
            Ok(true)
        }
    }
}

// ========================= Feed Posts =========================

pub struct FeedPostProcessor<'a> {
    generator: &'a dyn CommentGenerator,
    cfg: &'a AgentConfig,
    hub: &'a StatusHub,
}

impl<'a> FeedPostProcessor<'a> {
    pub fn new(generator: &'a dyn CommentGenerator, cfg: &'a AgentConfig, hub: &'a StatusHub) -> Self {
        Self { generator, cfg, hub }
    }
}

#[async_trait]
impl<P: Page> ItemProcessor<P> for FeedPostProcessor<'_> {
    async fn process(
        &self,
        page: &P,
        item: &P::Item,
        identity: &str,
    ) -> Result<bool, AgentError> {
        self.hub.set_action(format!("reviewing post {identity}"));
        engage_post(page, item, identity, self.generator, self.cfg, self.hub).await
    }
}

// ========================= Hashtag Posts =========================

pub struct HashtagPostProcessor<'a> {
    generator: &'a dyn CommentGenerator,
    cfg: &'a AgentConfig,
    hub: &'a StatusHub,
}

impl<'a> HashtagPostProcessor<'a> {
    pub fn new(generator: &'a dyn CommentGenerator, cfg: &'a AgentConfig, hub: &'a StatusHub) -> Self {
        Self { generator, cfg, hub }
    }
}

#[async_trait]
impl<P: Page> ItemProcessor<P> for HashtagPostProcessor<'_> {
    async fn process(
        &self,
        page: &P,
        item: &P::Item,
        identity: &str,
    ) -> Result<bool, AgentError> {
        self.hub.set_action(format!("opening post {identity}"));
        item.click().await?;
        // a modal that never opens leaves the item eligible for a later pass
        let modal = page.wait_for(POST_MODAL, MODAL_TIMEOUT).await?;
        let outcome =
            engage_post(page, &modal, identity, self.generator, self.cfg, self.hub).await;
        if let Err(err) = page.press_key("Escape").await {
            debug!(error = %err, "failed to close post modal");
        }
        outcome
    }
}

// ========================= Comment Replies =========================

pub struct CommentReplyProcessor<'a> {
    generator: &'a dyn CommentGenerator,
    cfg: &'a AgentConfig,
    hub: &'a StatusHub,
}

impl<'a> CommentReplyProcessor<'a> {
    pub fn new(generator: &'a dyn CommentGenerator, cfg: &'a AgentConfig, hub: &'a StatusHub) -> Self {
        Self { generator, cfg, hub }
    }
}

#[async_trait]
impl<P: Page> ItemProcessor<P> for CommentReplyProcessor<'_> {
    async fn process(
        &self,
        page: &P,
        item: &P::Item,
        identity: &str,
    ) -> Result<bool, AgentError> {
        self.hub.set_action(format!("reviewing comment {identity}"));
        let author = child_text(item, COMMENT_ROW_AUTHOR).await?.unwrap_or_default();
        if author.is_empty() {
            self.hub
                .log_entry("skipped comment without author", Some(identity.to_string()), None);
            return Ok(false);
        }
        if !self.cfg.username.is_empty() && author.contains(&self.cfg.username) {
            // never reply to ourselves
            return Ok(false);
        }
        if self.cfg.is_excluded(&author) {
            self.hub.log_entry("skipped excluded commenter", Some(author), None);
            return Ok(false);
        }
        let Some(text) = child_text(item, COMMENT_ROW_TEXT)
            .await?
            .filter(|t| !t.trim().is_empty())
        else {
            self.hub
                .log_entry("skipped comment without text", Some(identity.to_string()), None);
            return Ok(false);
        };

        let shot = page.screenshot_b64().await?;
        let req = request_for(self.cfg, Some(shot), text);
        let generated = self
            .generator
            .reply(&req)
            .await
            .map_err(|e| AgentError::Generation(e.to_string()))?;
        match generated {
            Generated::Declined { reason } => {
                self.hub.log_entry("generation declined", Some(reason), None);
                Ok(false)
            }
            Generated::Allowed { comment } => {
                let Some(button) = item.find(REPLY_BUTTON).await? else {
                    return Err(PageError::ElementNotFound(REPLY_BUTTON.into()).into());
                };
                submit_comment(page, &button, &comment).await?;
                self.hub
                    .log_entry("replied", Some(format!("@{author}: {comment}")), Some(true));
                mark_pacing(self.hub, self.cfg);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockGenerator, MockItem, MockPage};

    fn test_cfg() -> AgentConfig {
        AgentConfig {
            username: "gramhands_bot".into(),
            excluded_usernames: ["rival"].into_iter().map(String::from).collect(),
            ..AgentConfig::default()
        }
    }

    fn post_item(author: &str, caption: &str) -> MockItem {
        MockItem::new()
            .with_child(POST_AUTHOR, MockItem::with_text(author))
            .with_child(POST_CAPTION, MockItem::with_text(caption))
            .with_child(COMMENT_BUTTON, MockItem::new())
    }

    fn page_with_comment_box() -> (MockPage, MockItem) {
        let page = MockPage::new();
        let input = MockItem::new();
        page.register_element(COMMENT_BOX, input.clone());
        (page, input)
    }

    #[tokio::test]
    async fn sponsored_posts_are_skipped() {
        let (page, _) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = post_item("alice", "nice view").with_child(SPONSORED_BADGE, MockItem::new());
        let done = processor.process(&page, &item, "p1").await.unwrap();
        assert!(!done);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn excluded_authors_are_skipped() {
        let (page, _) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = post_item("Rival", "nice view");
        assert!(!processor.process(&page, &item, "p1").await.unwrap());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn posts_without_caption_are_skipped() {
        let (page, _) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = MockItem::new().with_child(POST_AUTHOR, MockItem::with_text("alice"));
        assert!(!processor.process(&page, &item, "p1").await.unwrap());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn posts_already_commented_by_us_are_skipped() {
        let (page, _) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = post_item("alice", "nice view")
            .with_child(COMMENT_AUTHORS, MockItem::with_text("gramhands_bot"));
        assert!(!processor.process(&page, &item, "p1").await.unwrap());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn allowed_generation_posts_a_comment() {
        let (page, input) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = post_item("alice", "sunset over the bay");
        let done = processor.process(&page, &item, "p1").await.unwrap();
        assert!(done);
        let calls = generator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, "sunset over the bay");
        assert!(calls[0].image.is_some());
        assert_eq!(input.typed(), vec!["lovely shot!".to_string()]);
        assert_eq!(page.keys(), vec!["Enter".to_string()]);
        assert!(hub.snapshot().waiting.is_some());
    }

    #[tokio::test]
    async fn declined_generation_is_a_policy_skip() {
        let (page, input) = page_with_comment_box();
        let generator = MockGenerator::new();
        generator.push(Generated::Declined {
            reason: "sensitive".into(),
        });
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = FeedPostProcessor::new(&generator, &cfg, &hub);
        let item = post_item("alice", "sunset over the bay");
        assert!(!processor.process(&page, &item, "p1").await.unwrap());
        assert!(input.typed().is_empty());
    }

    #[tokio::test]
    async fn hashtag_posts_are_engaged_through_the_modal() {
        let (page, _input) = page_with_comment_box();
        let modal = post_item("alice", "city lights");
        page.register_element(POST_MODAL, modal);
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = HashtagPostProcessor::new(&generator, &cfg, &hub);
        let thumb = MockItem::new();
        let done = processor.process(&page, &thumb, "/p/abc/").await.unwrap();
        assert!(done);
        assert_eq!(thumb.clicks(), 1);
        // the modal is closed again after the interaction
        assert!(page.keys().contains(&"Escape".to_string()));
    }

    #[tokio::test]
    async fn missing_modal_is_an_item_level_error() {
        let page = MockPage::new();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = HashtagPostProcessor::new(&generator, &cfg, &hub);
        let thumb = MockItem::new();
        let err = processor.process(&page, &thumb, "/p/abc/").await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn replies_skip_our_own_comments() {
        let (page, _) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = CommentReplyProcessor::new(&generator, &cfg, &hub);
        let row = MockItem::new()
            .with_child(COMMENT_ROW_AUTHOR, MockItem::with_text("gramhands_bot"))
            .with_child(COMMENT_ROW_TEXT, MockItem::with_text("thanks!"));
        assert!(!processor.process(&page, &row, "c1").await.unwrap());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn replies_are_posted_for_fresh_comments() {
        let (page, input) = page_with_comment_box();
        let generator = MockGenerator::new();
        let cfg = test_cfg();
        let hub = StatusHub::new();
        let processor = CommentReplyProcessor::new(&generator, &cfg, &hub);
        let row = MockItem::new()
            .with_child(COMMENT_ROW_AUTHOR, MockItem::with_text("alice"))
            .with_child(COMMENT_ROW_TEXT, MockItem::with_text("what a great trail"))
            .with_child(REPLY_BUTTON, MockItem::new());
        let done = processor.process(&page, &row, "c1").await.unwrap();
        assert!(done);
        assert_eq!(generator.calls()[0].content, "what a great trail");
        assert_eq!(input.typed(), vec!["lovely shot!".to_string()]);
    }
}
