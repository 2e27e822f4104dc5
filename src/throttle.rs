use std::time::Duration;
use tokio::time::sleep;

// Uniform random pacing so repeated actions never land on a fixed cadence.

pub fn random_in(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    rand::random_range(min_ms..=max_ms)
}

pub async fn pause_between(min_ms: u64, max_ms: u64) {
    sleep(Duration::from_millis(random_in(min_ms, max_ms))).await;
}

pub async fn pause_ms(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

pub async fn pause_secs(secs: u64) {
    sleep(Duration::from_secs(secs)).await;
}
