//! Background loops: the reminder pump and the WAL compactor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{local_now, Engine};

/// Periodically hand due pending reminders to the dispatcher and mark them
/// sent. Delivery failures are logged; retrying is the dispatcher's policy,
/// not ours, so the record is marked sent after the attempt either way.
pub async fn run_reminder_pump(engine: Arc<Engine>, utc_offset_minutes: i32) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = local_now(utc_offset_minutes);
        for record in engine.collect_due_reminders(now) {
            let Some(reservation) = engine.get_reservation(record.reservation_id).await else {
                continue;
            };
            if let Err(e) = engine
                .dispatcher()
                .deliver_reminder(&reservation, &record)
                .await
            {
                warn!(
                    "reminder delivery failed for {}: {e}",
                    record.reservation_id
                );
            }
            match engine
                .mark_reminder_sent(record.reservation_id, record.kind)
                .await
            {
                Ok(()) => {
                    metrics::counter!(crate::observability::REMINDERS_DISPATCHED_TOTAL)
                        .increment(1);
                    info!(
                        "dispatched {:?} reminder for {}",
                        record.kind, record.reservation_id
                    );
                }
                // May already have been settled by a racing pump or a
                // cancel — that's fine
                Err(e) => debug!("reminder skip {}: {e}", record.reservation_id),
            }
        }
    }
}

/// Rewrite the WAL from live state once enough appends have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
