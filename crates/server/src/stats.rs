//! Statistics sink.
//!
//! Fire-and-forget counters: the hot path sends events over an
//! unbounded channel and a background flusher aggregates them into
//! daily per-image rows. Losses are acceptable by contract; a full or
//! closed channel never slows a request down.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often aggregated counters are written out.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// One statistics event.
#[derive(Debug, Clone)]
enum StatEvent {
    Request {
        source_id: i64,
        seconds: f64,
    },
    View {
        source_id: i64,
        bytes: u64,
        from_cache: bool,
        seconds: f64,
    },
    Download {
        source_id: i64,
        bytes: u64,
        seconds: f64,
    },
}

#[derive(Debug, Default, Clone)]
struct Counters {
    requests: i64,
    views: i64,
    cached_views: i64,
    downloads: i64,
    bytes_served: i64,
    request_seconds: f64,
}

/// Handle used by the hot path to record statistics.
#[derive(Clone)]
pub struct StatsSink {
    tx: mpsc::UnboundedSender<StatEvent>,
}

impl StatsSink {
    /// Start the sink and its background flusher.
    pub fn start(pool: PgPool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flusher(pool, rx));
        Self { tx }
    }

    /// A sink that drops everything (tests, stats-disabled setups).
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn log_request(&self, source_id: i64, seconds: f64) {
        let _ = self.tx.send(StatEvent::Request { source_id, seconds });
    }

    pub fn log_view(&self, source_id: i64, bytes: u64, from_cache: bool, seconds: f64) {
        let _ = self.tx.send(StatEvent::View {
            source_id,
            bytes,
            from_cache,
            seconds,
        });
    }

    pub fn log_download(&self, source_id: i64, bytes: u64, seconds: f64) {
        let _ = self.tx.send(StatEvent::Download {
            source_id,
            bytes,
            seconds,
        });
    }
}

async fn run_flusher(pool: PgPool, mut rx: mpsc::UnboundedReceiver<StatEvent>) {
    let mut pending: HashMap<(i64, NaiveDate), Counters> = HashMap::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => aggregate(&mut pending, event),
                    None => {
                        flush(&pool, &mut pending).await;
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                flush(&pool, &mut pending).await;
            }
        }
    }
}

fn aggregate(pending: &mut HashMap<(i64, NaiveDate), Counters>, event: StatEvent) {
    let day = Utc::now().date_naive();
    match event {
        StatEvent::Request { source_id, seconds } => {
            let c = pending.entry((source_id, day)).or_default();
            c.requests += 1;
            c.request_seconds += seconds;
        }
        StatEvent::View {
            source_id,
            bytes,
            from_cache,
            ..
        } => {
            let c = pending.entry((source_id, day)).or_default();
            c.views += 1;
            if from_cache {
                c.cached_views += 1;
            }
            c.bytes_served += bytes as i64;
        }
        StatEvent::Download {
            source_id, bytes, ..
        } => {
            let c = pending.entry((source_id, day)).or_default();
            c.downloads += 1;
            c.bytes_served += bytes as i64;
        }
    }
}

async fn flush(pool: &PgPool, pending: &mut HashMap<(i64, NaiveDate), Counters>) {
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    let count = batch.len();

    for ((image_id, day), c) in batch {
        let result = sqlx::query(
            r#"
            INSERT INTO image_stats
                (image_id, day, requests, views, cached_views, downloads, bytes_served, request_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (image_id, day) DO UPDATE SET
                requests = image_stats.requests + EXCLUDED.requests,
                views = image_stats.views + EXCLUDED.views,
                cached_views = image_stats.cached_views + EXCLUDED.cached_views,
                downloads = image_stats.downloads + EXCLUDED.downloads,
                bytes_served = image_stats.bytes_served + EXCLUDED.bytes_served,
                request_seconds = image_stats.request_seconds + EXCLUDED.request_seconds
            "#,
        )
        .bind(image_id)
        .bind(day)
        .bind(c.requests)
        .bind(c.views)
        .bind(c.cached_views)
        .bind(c.downloads)
        .bind(c.bytes_served)
        .bind(c.request_seconds)
        .execute(pool)
        .await;

        if let Err(e) = result {
            // Dropped by contract: the image may have been purged, or
            // the database may be briefly away.
            warn!(error = %e, image_id, "failed to flush stats row");
        }
    }

    debug!(rows = count, "stats flushed");
}

impl std::fmt::Debug for StatsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsSink").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_merges_events() {
        let mut pending = HashMap::new();
        aggregate(
            &mut pending,
            StatEvent::Request {
                source_id: 1,
                seconds: 0.5,
            },
        );
        aggregate(
            &mut pending,
            StatEvent::View {
                source_id: 1,
                bytes: 1000,
                from_cache: true,
                seconds: 0.5,
            },
        );
        aggregate(
            &mut pending,
            StatEvent::View {
                source_id: 1,
                bytes: 500,
                from_cache: false,
                seconds: 0.9,
            },
        );
        aggregate(
            &mut pending,
            StatEvent::Download {
                source_id: 2,
                bytes: 9999,
                seconds: 1.0,
            },
        );

        assert_eq!(pending.len(), 2);
        let day = Utc::now().date_naive();
        let c1 = &pending[&(1, day)];
        assert_eq!(c1.requests, 1);
        assert_eq!(c1.views, 2);
        assert_eq!(c1.cached_views, 1);
        assert_eq!(c1.bytes_served, 1500);

        let c2 = &pending[&(2, day)];
        assert_eq!(c2.downloads, 1);
        assert_eq!(c2.bytes_served, 9999);
    }

    #[test]
    fn disabled_sink_swallows_events() {
        let sink = StatsSink::disabled();
        sink.log_request(1, 0.1);
        sink.log_view(1, 100, false, 0.1);
        sink.log_download(1, 100, 0.1);
    }
}
