use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;

use orcein_common::types::JobPayload;

/// Redis list carrying job payloads from the enqueuing side to the worker.
pub const JOB_QUEUE_KEY: &str = "orcein:jobs:queue";

/// FIFO job queue over a Redis list: enqueue at the head, blocking-pop at
/// the tail. The queue carries routing payloads only; job rows in Postgres
/// are authoritative, so the list does not need to survive a Redis restart.
#[derive(Clone)]
pub struct JobQueue {
    pool: deadpool_redis::Pool,
    key: String,
}

impl JobQueue {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self {
            pool,
            key: JOB_QUEUE_KEY.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_key(pool: deadpool_redis::Pool, key: &str) -> Self {
        Self {
            pool,
            key: key.to_string(),
        }
    }

    pub async fn push(&self, payload: &JobPayload) -> Result<()> {
        let json = serde_json::to_string(payload).context("failed to serialize job payload")?;
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get redis connection")?;
        conn.lpush::<_, _, ()>(&self.key, json)
            .await
            .context("failed to push job payload")?;
        Ok(())
    }

    /// Blocking pop with a timeout. `None` means the timeout elapsed with
    /// an empty queue.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<JobPayload>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get redis connection")?;
        let reply: Option<(String, String)> = conn
            .brpop(&self.key, timeout.as_secs_f64())
            .await
            .context("failed to pop job payload")?;

        match reply {
            Some((_, json)) => {
                let payload: JobPayload = serde_json::from_str(&json)
                    .context("failed to deserialize job payload")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    #[allow(dead_code)]
    pub async fn len(&self) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get redis connection")?;
        let len: usize = conn
            .llen(&self.key)
            .await
            .context("failed to read queue length")?;
        Ok(len)
    }
}
