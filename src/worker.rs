// Background token refresh
// Keeps each integration's token ahead of its safety margin so callers rarely wait

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::CredentialManager;

pub struct RefreshWorker {
    manager: Arc<CredentialManager>,

    /// Wait after a failed refresh
    retry_interval: Duration,

    /// Lower bound between two iterations
    min_interval: Duration,
}

impl RefreshWorker {
    pub fn new(
        manager: Arc<CredentialManager>,
        retry_interval: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            manager,
            retry_interval,
            min_interval,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Refresh whenever the token becomes due, until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let integration = self.manager.integration().to_string();
        tracing::info!(integration = %integration, "🔄 Token refresh worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = self.tick().await;
            tracing::debug!(
                integration = %integration,
                "Next token check in {}s",
                wait.as_secs()
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(integration = %integration, "Token refresh worker stopped");
    }

    /// One iteration: refresh if due, and return how long to wait before the next one
    pub async fn tick(&self) -> Duration {
        let due_in = self.manager.next_refresh_delay().await;
        if !due_in.is_zero() {
            return due_in.max(self.min_interval);
        }

        match self.manager.get_valid_token().await {
            Ok(_) => {
                tracing::info!(
                    integration = %self.manager.integration(),
                    "✅ Token renewed by refresh worker"
                );
                self.manager.next_refresh_delay().await.max(self.min_interval)
            }
            Err(e) => {
                tracing::warn!(
                    integration = %self.manager.integration(),
                    kind = e.kind(),
                    "Refresh worker could not renew token: {}. Retrying in {}s",
                    e,
                    self.retry_interval.as_secs()
                );
                self.retry_interval.max(self.min_interval)
            }
        }
    }
}
