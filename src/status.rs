use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub const MAX_LOGS: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkLog {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Waiting {
    #[serde(rename = "for")]
    pub for_what: String,
    pub until: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BotStatus {
    pub is_running: bool,
    pub current_work: Option<String>,
    pub waiting: Option<Waiting>,
    pub logs: Vec<WorkLog>,
    pub current_action: Option<String>,
}

// Single-writer observable status. The orchestrator is the only mutator;
// any number of observers poll snapshot() or subscribe() to the watch
// channel, which notifies after every mutation.
pub struct StatusHub {
    tx: watch::Sender<BotStatus>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BotStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> BotStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BotStatus> {
        self.tx.subscribe()
    }

    fn mutate(&self, f: impl FnOnce(&mut BotStatus)) {
        self.tx.send_modify(f);
    }

    pub fn reset(&self) {
        self.mutate(|s| *s = BotStatus::default());
    }

    pub fn set_running(&self, running: bool) {
        self.mutate(|s| s.is_running = running);
    }

    pub fn set_current_work(&self, work: Option<String>) {
        self.mutate(|s| s.current_work = work);
    }

    pub fn set_action(&self, action: impl Into<String>) {
        let action = action.into();
        self.mutate(|s| s.current_action = Some(action));
    }

    pub fn set_waiting(&self, for_what: impl Into<String>, until: DateTime<Utc>) {
        let for_what = for_what.into();
        self.mutate(|s| s.waiting = Some(Waiting { for_what, until }));
    }

    pub fn clear_waiting(&self) {
        self.mutate(|s| s.waiting = None);
    }

    // Run teardown: the log history survives so operators can read what
    // happened; it is cleared only by reset() on the next start.
    pub fn finish_run(&self) {
        self.mutate(|s| {
            s.is_running = false;
            s.current_work = None;
            s.waiting = None;
            s.current_action = None;
        });
    }

    pub fn log(&self, action: impl Into<String>) {
        self.log_entry(action, None, None);
    }

    pub fn log_entry(&self, action: impl Into<String>, details: Option<String>, success: Option<bool>) {
        let entry = WorkLog {
            timestamp: Utc::now(),
            action: action.into(),
            details,
            success,
        };
        self.mutate(|s| {
            s.logs.push(entry);
            if s.logs.len() > MAX_LOGS {
                let overflow = s.logs.len() - MAX_LOGS;
                s.logs.drain(..overflow);
            }
        });
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_keeps_most_recent_hundred() {
        let hub = StatusHub::new();
        for i in 0..150 {
            hub.log(format!("entry {i}"));
        }
        let status = hub.snapshot();
        assert_eq!(status.logs.len(), MAX_LOGS);
        assert_eq!(status.logs.first().map(|l| l.action.as_str()), Some("entry 50"));
        assert_eq!(status.logs.last().map(|l| l.action.as_str()), Some("entry 149"));
        // retained entries keep their original order
        for (offset, log) in status.logs.iter().enumerate() {
            assert_eq!(log.action, format!("entry {}", 50 + offset));
        }
    }

    #[tokio::test]
    async fn subscribers_observe_every_mutation() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe();
        hub.set_running(true);
        rx.changed().await.expect("watch closed");
        assert!(rx.borrow().is_running);
        hub.log("hello");
        rx.changed().await.expect("watch closed");
        assert_eq!(rx.borrow().logs.len(), 1);
    }

    #[test]
    fn finish_run_preserves_logs_and_clears_transients() {
        let hub = StatusHub::new();
        hub.set_running(true);
        hub.set_current_work(Some("feed".into()));
        hub.set_waiting("post interval", Utc::now());
        hub.log("worked");
        hub.finish_run();
        let status = hub.snapshot();
        assert!(!status.is_running);
        assert!(status.current_work.is_none());
        assert!(status.waiting.is_none());
        assert_eq!(status.logs.len(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let hub = StatusHub::new();
        hub.log("old run");
        hub.set_running(true);
        hub.reset();
        let status = hub.snapshot();
        assert!(status.logs.is_empty());
        assert!(!status.is_running);
    }
}
