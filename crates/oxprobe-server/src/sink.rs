use oxprobe_common::types::Point;
use oxprobe_storage::database::Database;
use oxprobe_storage::Host;
use std::sync::Arc;
use std::time::Duration;

/// Tags points with their host and hands them to the [`Database`].
pub struct Forwarder {
    db: Arc<dyn Database>,
    max_retries: u32,
    backoff: Duration,
}

impl Forwarder {
    pub fn new(db: Arc<dyn Database>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            db,
            max_retries,
            backoff,
        }
    }

    /// Writes `points` for `host`, retrying failed writes `max_retries`
    /// times with a fixed backoff. A batch that still fails is logged,
    /// dropped and its last error returned.
    pub async fn send(&self, points: Vec<Point>, host: &Host) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Point> = points
            .into_iter()
            .map(|p| p.tag("host", host.name.as_str()).tag("host_id", host.id.as_str()))
            .collect();

        let mut attempt = 0;
        loop {
            match self.db.write_points(&points).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        host_id = %host.id,
                        attempt,
                        error = %e,
                        "Point write failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        host_id = %host.id,
                        points = points.len(),
                        error = %e,
                        "Dropping points after repeated write failures"
                    );
                    return Err(e);
                }
            }
        }
    }
}
