//! Webhook sender.
//!
//! On task completion an HTTP POST with `{task_id, label, status}` goes
//! to the URL in the task metadata. Fire-and-forget: a few bounded
//! attempts, then the failure is logged and never re-delivered.
//! Concurrency is capped by `webhook_reqs_limit`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

const SEND_ATTEMPTS: u32 = 3;

/// A completed task to notify about.
#[derive(Debug, Clone)]
pub struct WebhookNotice {
    pub task_id: i32,
    pub label: String,
    pub status: i16,
    pub url: String,
}

/// The POSTed JSON body.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    task_id: i32,
    label: &'a str,
    status: i16,
}

/// Producer half used by the scheduler.
#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::UnboundedSender<WebhookNotice>,
}

impl WebhookQueue {
    pub fn enqueue(&self, notice: WebhookNotice) {
        if self.tx.send(notice).is_err() {
            warn!("webhook worker is gone, notice dropped");
        }
    }
}

/// Consumer half run as its own task.
pub struct WebhookWorker {
    rx: mpsc::UnboundedReceiver<WebhookNotice>,
    http: reqwest::Client,
    limit: Arc<Semaphore>,
}

/// Build the queue/worker pair with the given concurrency limit.
pub fn webhook_channel(reqs_limit: usize) -> (WebhookQueue, WebhookWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WebhookQueue { tx },
        WebhookWorker {
            rx,
            http: reqwest::Client::new(),
            limit: Arc::new(Semaphore::new(reqs_limit)),
        },
    )
}

impl WebhookWorker {
    /// Drain notices until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                notice = self.rx.recv() => {
                    let Some(notice) = notice else { break };
                    let Ok(permit) = self.limit.clone().acquire_owned().await else {
                        break;
                    };
                    let http = self.http.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        send(http, notice).await;
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("webhook worker stopped");
    }
}

async fn send(http: reqwest::Client, notice: WebhookNotice) {
    let payload = WebhookPayload {
        task_id: notice.task_id,
        label: &notice.label,
        status: notice.status,
    };
    for attempt in 1..=SEND_ATTEMPTS {
        let result = http.post(&notice.url).json(&payload).send().await;
        match result.and_then(|r| r.error_for_status()) {
            Ok(_) => {
                debug!(task_id = notice.task_id, url = %notice.url, "webhook delivered");
                return;
            }
            Err(e) if attempt < SEND_ATTEMPTS => {
                debug!(task_id = notice.task_id, error = %e, attempt, "webhook attempt failed");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
            Err(e) => {
                // Never re-delivered.
                warn!(task_id = notice.task_id, url = %notice.url, error = %e, "webhook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape_matches_the_contract() {
        let payload = WebhookPayload {
            task_id: 42,
            label: "calc",
            status: 2,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "task_id": 42, "label": "calc", "status": 2 })
        );
    }

    #[tokio::test]
    async fn enqueue_after_worker_drop_does_not_panic() {
        let (queue, worker) = webhook_channel(2);
        drop(worker);
        queue.enqueue(WebhookNotice {
            task_id: 1,
            label: "x".to_string(),
            status: 2,
            url: "http://localhost/hook".to_string(),
        });
    }
}
