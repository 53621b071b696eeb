//! Per-run realtime event fanout
//!
//! Each run has a set of subscriber queues. Publishing is best-effort and
//! never blocks the evolution loop: a full queue drops the newest event for
//! that subscriber, a closed queue is pruned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeScore {
    pub model: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeInfo {
    pub judges: Vec<JudgeScore>,
    pub tie_breaker_used: bool,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBreakdownEvent {
    pub outcome: f64,
    pub process: f64,
    pub cost: f64,
}

/// Events published over a run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "iter")]
    Iter {
        run_id: i64,
        i: u32,
        operator: String,
        engine: String,
        model_id: String,
        score: f64,
        total_reward: f64,
        reward_breakdown: RewardBreakdownEvent,
        judge_info: JudgeInfo,
        duration_ms: u64,
        timestamp: f64,
        variant_id: i64,
        output: String,
    },
    #[serde(rename = "done")]
    Done { run_id: i64, result: Value },
    #[serde(rename = "judge")]
    Judge { run_id: i64, judge: Value },
    #[serde(rename = "memory.update")]
    MemoryUpdate {
        run_id: i64,
        hits: usize,
        primer_tokens: usize,
        store_size: usize,
    },
    #[serde(rename = "memory.result")]
    MemoryResult {
        run_id: i64,
        reward: f64,
        reward_delta: f64,
        lift_source: String,
    },
}

/// Handle used to drop a subscription explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

pub struct RealtimeHub {
    subscribers: Mutex<HashMap<i64, Vec<(u64, mpsc::Sender<RunEvent>)>>>,
    next_token: AtomicU64,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, run_id: i64) -> (SubscriptionToken, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.entry(run_id).or_default().push((token, tx));
        }
        (SubscriptionToken(token), rx)
    }

    pub fn unsubscribe(&self, run_id: i64, token: SubscriptionToken) {
        if let Ok(mut subs) = self.subscribers.lock() {
            if let Some(list) = subs.get_mut(&run_id) {
                list.retain(|(t, _)| *t != token.0);
                if list.is_empty() {
                    subs.remove(&run_id);
                }
            }
        }
    }

    /// Non-blocking fanout. Full queues lose this event; closed queues are
    /// removed from the subscriber list.
    pub fn publish(&self, run_id: i64, event: RunEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        if let Some(list) = subs.get_mut(&run_id) {
            list.retain(|(_, tx)| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if list.is_empty() {
                subs.remove(&run_id);
            }
        }
    }

    pub fn subscriber_count(&self, run_id: i64) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(&run_id).map(|l| l.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = RealtimeHub::new();
        let (_token, mut rx) = hub.subscribe(7);
        hub.publish(
            7,
            RunEvent::Done {
                run_id: 7,
                result: serde_json::json!({"ok": true}),
            },
        );
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RunEvent::Done { run_id: 7, .. }));
    }

    #[tokio::test]
    async fn unsubscribe_removes_queue() {
        let hub = RealtimeHub::new();
        let (token, rx) = hub.subscribe(1);
        assert_eq!(hub.subscriber_count(1), 1);
        drop(rx);
        hub.unsubscribe(1, token);
        assert_eq!(hub.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_run_is_noop() {
        let hub = RealtimeHub::new();
        hub.publish(
            99,
            RunEvent::Judge {
                run_id: 99,
                judge: serde_json::json!({}),
            },
        );
    }

    #[test]
    fn event_serializes_with_dotted_type_names() {
        let event = RunEvent::MemoryUpdate {
            run_id: 3,
            hits: 2,
            primer_tokens: 50,
            store_size: 10,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "memory.update");
    }
}
