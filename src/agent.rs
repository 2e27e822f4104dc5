use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::generator::CommentGenerator;
use crate::page::{Page, PageError, PageItem, Session, SessionLauncher};
use crate::processors::{CommentReplyProcessor, FeedPostProcessor, HashtagPostProcessor};
use crate::scanner::{ScanOptions, ScanOutcome, Scanner, SelectorSet};
use crate::status::{BotStatus, StatusHub};
use crate::throttle;

// ========================= Core Types =========================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkItemSpec {
    pub enabled: bool,
    pub count: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HashtagWorkSpec {
    pub enabled: bool,
    pub count: usize,
    pub hashtags: Vec<String>,
}

// Which work types run, and how many items each may count. Immutable for
// the duration of one run; replaced wholesale on start().
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkSpec {
    pub feed: WorkItemSpec,
    pub hashtag: HashtagWorkSpec,
    pub my_feed_interaction: WorkItemSpec,
    pub hashtag_interaction: WorkItemSpec,
}

impl WorkSpec {
    pub fn any_enabled(&self) -> bool {
        self.feed.enabled
            || self.hashtag.enabled
            || self.my_feed_interaction.enabled
            || self.hashtag_interaction.enabled
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "preset", rename_all = "snake_case")]
pub enum PromptPreset {
    Friendly,
    Enthusiast,
    Expert,
    Custom { text: String },
}

impl PromptPreset {
    pub fn text(&self) -> &str {
        match self {
            PromptPreset::Friendly => {
                "Write a short, warm, genuine-sounding comment about this post."
            }
            PromptPreset::Enthusiast => {
                "Write an upbeat, excited comment that reacts to something specific in the post."
            }
            PromptPreset::Expert => {
                "Write a knowledgeable, understated comment that adds a small insight."
            }
            PromptPreset::Custom { text } => text,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub username: String,
    pub password: String,
    pub prompt: PromptPreset,
    pub min_comment_length: usize,
    pub max_comment_length: usize,
    pub post_interval_secs: u64,
    pub work_interval_secs: u64,
    pub loop_interval_secs: u64,
    pub excluded_usernames: HashSet<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            prompt: PromptPreset::Friendly,
            min_comment_length: 10,
            max_comment_length: 80,
            post_interval_secs: 30,
            work_interval_secs: 60,
            loop_interval_secs: 300,
            excluded_usernames: HashSet::new(),
        }
    }
}

impl AgentConfig {
    pub fn is_excluded(&self, author: &str) -> bool {
        let author = author.trim();
        self.excluded_usernames
            .iter()
            .any(|u| u.eq_ignore_ascii_case(author))
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("page error: {0}")]
    Page(#[from] PageError),
    #[error("comment generation failed: {0}")]
    Generation(String),
    #[error("no work type is enabled")]
    NoWorkEnabled,
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    // Fatal errors end the whole run; everything else is a transient
    // failure of one loop iteration and gets a backoff-and-retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Page(PageError::SessionClosed) | AgentError::NoWorkEnabled
        )
    }
}

// ========================= Orchestrator =========================

const BASE_URL: &str = "https://www.instagram.com";
const NOTIFICATIONS_BUTTON: &str = "svg[aria-label='Notifications']";
const TRANSIENT_BACKOFF_SECS: u64 = 5;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

struct RunHandle<S> {
    running: Arc<AtomicBool>,
    session: Arc<S>,
    _task: JoinHandle<()>,
}

pub struct AgentManager<L: SessionLauncher> {
    launcher: L,
    generator: Arc<dyn CommentGenerator>,
    hub: Arc<StatusHub>,
    run: Mutex<Option<RunHandle<L::Session>>>,
}

impl<L: SessionLauncher> AgentManager<L> {
    pub fn new(launcher: L, generator: Arc<dyn CommentGenerator>) -> Self {
        Self {
            launcher,
            generator,
            hub: Arc::new(StatusHub::new()),
            run: Mutex::new(None),
        }
    }

    /// Begins a run. A no-op (with a logged notice) when a run is already
    /// active. The only error that ever crosses this boundary is a browser
    /// launch failure; everything after launch is absorbed into the status
    /// log stream.
    pub async fn start(&self, cfg: AgentConfig, work: WorkSpec) -> Result<(), AgentError> {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| r.running.load(Ordering::SeqCst)) {
            info!("start requested while already running");
            self.hub.log("start requested while already running");
            return Ok(());
        }

        let run_id = nanoid!();
        self.hub.reset();
        self.hub
            .log_entry("starting browser", Some(run_id.clone()), None);
        let session = match self.launcher.launch().await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!(error = %err, "browser launch failed");
                self.hub
                    .log_entry("browser launch failed", Some(err.to_string()), Some(false));
                self.hub.finish_run();
                return Err(err.into());
            }
        };
        self.hub.set_running(true);

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(work_loop(
            Arc::clone(&session),
            Arc::clone(&running),
            Arc::clone(&self.hub),
            Arc::clone(&self.generator),
            cfg,
            work,
            run_id,
        ));
        *run = Some(RunHandle {
            running,
            session,
            _task: task,
        });
        Ok(())
    }

    /// Flips the run flag and tears the session down best-effort. The unit
    /// of work in flight finishes (or fails against the closed session) on
    /// its own; the log history is preserved until the next start().
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.take() {
            handle.running.store(false, Ordering::SeqCst);
            if let Err(err) = handle.session.close().await {
                debug!(error = %err, "session close during stop");
            }
            self.hub.finish_run();
            self.hub.log("stopped");
            info!("agent stopped");
        }
    }

    pub fn status(&self) -> BotStatus {
        self.hub.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<BotStatus> {
        self.hub.subscribe()
    }
}

// ========================= Work Loop =========================

async fn work_loop<S: Session>(
    session: Arc<S>,
    running: Arc<AtomicBool>,
    hub: Arc<StatusHub>,
    generator: Arc<dyn CommentGenerator>,
    cfg: AgentConfig,
    work: WorkSpec,
    run_id: String,
) {
    let mut page: Option<S::Page> = None;
    let mut logged_in = false;

    loop {
        // once stop() flipped the flag it also owns status teardown; a
        // stopped run must not keep writing into the hub
        if !running.load(Ordering::SeqCst) {
            info!(run_id = %run_id, "agent loop ended by stop");
            return;
        }

        // liveness probe: zero open pages means someone closed the browser
        // out from under us
        if page.is_some() && session.page_count().await == 0 {
            warn!(run_id = %run_id, "browser closed externally, ending run");
            hub.log_entry("browser closed externally", None, Some(false));
            break;
        }

        let result = run_iteration(
            session.as_ref(),
            &mut page,
            &mut logged_in,
            &running,
            generator.as_ref(),
            &cfg,
            &work,
            &hub,
        )
        .await;

        if !running.load(Ordering::SeqCst) {
            info!(run_id = %run_id, "agent loop ended by stop");
            return;
        }

        match result {
            Ok(()) => {
                wait_with_status(&hub, "next work loop", cfg.loop_interval_secs).await;
            }
            Err(err) if err.is_fatal() => {
                warn!(run_id = %run_id, error = %err, "fatal error, ending run");
                hub.log_entry("run ended", Some(err.to_string()), Some(false));
                break;
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "work iteration failed, backing off");
                hub.log_entry("work iteration failed", Some(err.to_string()), Some(false));
                throttle::pause_secs(TRANSIENT_BACKOFF_SECS).await;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    if let Err(err) = session.close().await {
        debug!(error = %err, "session close at loop end");
    }
    hub.finish_run();
    info!(run_id = %run_id, "agent loop ended");
}

#[allow(clippy::too_many_arguments)]
async fn run_iteration<S: Session>(
    session: &S,
    page_slot: &mut Option<S::Page>,
    logged_in: &mut bool,
    running: &AtomicBool,
    generator: &dyn CommentGenerator,
    cfg: &AgentConfig,
    work: &WorkSpec,
    hub: &StatusHub,
) -> Result<(), AgentError> {
    if !work.any_enabled() {
        return Err(AgentError::NoWorkEnabled);
    }

    if page_slot.is_none() {
        hub.set_action("opening page");
        *page_slot = Some(session.new_page().await?);
        *logged_in = false; // a fresh page starts logged out
    }
    let page = page_slot
        .as_ref()
        .ok_or_else(|| AgentError::Other("page unavailable".into()))?;
    if !*logged_in {
        hub.set_action("logging in");
        page.login(&cfg.username, &cfg.password).await?;
        *logged_in = true;
        hub.log_entry("logged in", Some(cfg.username.clone()), Some(true));
    }

    if work.feed.enabled && running.load(Ordering::SeqCst) {
        hub.set_current_work(Some("feed".into()));
        run_feed_work(page, generator, cfg, work.feed.count, hub).await?;
        wait_with_status(hub, "next work type", cfg.work_interval_secs).await;
    }

    if work.hashtag.enabled {
        for tag in &work.hashtag.hashtags {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            hub.set_current_work(Some(format!("hashtag #{tag}")));
            run_hashtag_work(page, generator, cfg, tag, work.hashtag.count, hub).await?;
            wait_with_status(hub, "next hashtag", cfg.work_interval_secs).await;
        }
    }

    if work.my_feed_interaction.enabled && running.load(Ordering::SeqCst) {
        hub.set_current_work(Some("my feed replies".into()));
        run_reply_work(page, generator, cfg, work.my_feed_interaction.count, hub).await?;
    }

    if work.hashtag_interaction.enabled {
        hub.log("hashtag interaction work is not implemented, skipping");
    }

    hub.set_current_work(None);
    Ok(())
}

fn scan_options(cfg: &AgentConfig, count: usize) -> ScanOptions {
    ScanOptions {
        max_items: (count > 0).then_some(count),
        post_interval: Duration::from_secs(cfg.post_interval_secs),
        ..ScanOptions::default()
    }
}

fn outcome_summary(outcome: &ScanOutcome) -> String {
    format!(
        "{} processed over {} passes ({} attempts)",
        outcome.processed.len(),
        outcome.passes,
        outcome.attempts
    )
}

async fn run_feed_work<P: Page>(
    page: &P,
    generator: &dyn CommentGenerator,
    cfg: &AgentConfig,
    count: usize,
    hub: &StatusHub,
) -> Result<(), AgentError> {
    hub.log("scanning home feed");
    page.navigate(BASE_URL).await?;
    let scanner = Scanner::new("feed", SelectorSet::feed(), scan_options(cfg, count));
    let processor = FeedPostProcessor::new(generator, cfg, hub);
    let outcome = scanner.scan(page, &processor, hub).await?;
    hub.log_entry("feed work finished", Some(outcome_summary(&outcome)), Some(true));
    Ok(())
}

async fn run_hashtag_work<P: Page>(
    page: &P,
    generator: &dyn CommentGenerator,
    cfg: &AgentConfig,
    tag: &str,
    count: usize,
    hub: &StatusHub,
) -> Result<(), AgentError> {
    hub.log_entry("scanning hashtag", Some(format!("#{tag}")), None);
    page.navigate(&format!("{BASE_URL}/explore/tags/{tag}/")).await?;
    let scanner = Scanner::new(
        format!("hashtag #{tag}"),
        SelectorSet::hashtag_grid(),
        scan_options(cfg, count),
    );
    let processor = HashtagPostProcessor::new(generator, cfg, hub);
    let outcome = scanner.scan(page, &processor, hub).await?;
    hub.log_entry(
        "hashtag work finished",
        Some(format!("#{tag}: {}", outcome_summary(&outcome))),
        Some(true),
    );
    Ok(())
}

async fn run_reply_work<P: Page>(
    page: &P,
    generator: &dyn CommentGenerator,
    cfg: &AgentConfig,
    count: usize,
    hub: &StatusHub,
) -> Result<(), AgentError> {
    hub.log("scanning comments on own posts");
    page.navigate(BASE_URL).await?;
    // opening the notification panel is the one-time navigation for this
    // work type; if it never appears the whole scan call fails
    let bell = page.wait_for(NOTIFICATIONS_BUTTON, SEARCH_TIMEOUT).await?;
    bell.click().await?;
    let scanner = Scanner::new(
        "comment replies",
        SelectorSet::comment_threads(),
        scan_options(cfg, count),
    );
    let processor = CommentReplyProcessor::new(generator, cfg, hub);
    let outcome = scanner.scan(page, &processor, hub).await?;
    hub.log_entry("reply work finished", Some(outcome_summary(&outcome)), Some(true));
    Ok(())
}

async fn wait_with_status(hub: &StatusHub, what: &str, secs: u64) {
    if secs == 0 {
        return;
    }
    let until = chrono::Utc::now() + chrono::Duration::seconds(secs as i64);
    hub.set_waiting(what, until);
    throttle::pause_secs(secs).await;
    hub.clear_waiting();
}

// ========================= Tests =========================
