use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::model::{ReminderRecord, Reservation};

pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// A committed engine operation, published after the day locks drop.
/// The engine's responsibility ends at handing this value to the dispatcher.
#[derive(Debug, Clone)]
pub enum PostCommit {
    Booked {
        reservation: Reservation,
        reminders: Vec<ReminderRecord>,
    },
    Modified {
        reservation: Reservation,
    },
    Cancelled {
        reservation: Reservation,
        reason: Option<String>,
    },
    StatusChanged {
        reservation: Reservation,
    },
}

impl PostCommit {
    pub fn reservation(&self) -> &Reservation {
        match self {
            PostCommit::Booked { reservation, .. }
            | PostCommit::Modified { reservation }
            | PostCommit::Cancelled { reservation, .. }
            | PostCommit::StatusChanged { reservation } => reservation,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PostCommit::Booked { .. } => "booked",
            PostCommit::Modified { .. } => "modified",
            PostCommit::Cancelled { .. } => "cancelled",
            PostCommit::StatusChanged { .. } => "status_changed",
        }
    }
}

/// External confirmation channels. Implementations own their timeouts and
/// retries; the engine never waits on them inside an atomic section.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn sync_calendar(&self, event: &PostCommit) -> Result<(), DispatchError>;
    async fn send_email(&self, event: &PostCommit) -> Result<(), DispatchError>;
    async fn send_sms(&self, event: &PostCommit) -> Result<(), DispatchError>;
    async fn append_log_row(&self, event: &PostCommit) -> Result<(), DispatchError>;
    async fn deliver_reminder(
        &self,
        reservation: &Reservation,
        record: &ReminderRecord,
    ) -> Result<(), DispatchError>;
}

/// Fire every channel for one committed operation. Channels are isolated
/// from each other: a failure is logged and the rest still run. Nothing
/// here can fail the already-committed reservation.
pub async fn fan_out(dispatcher: Arc<dyn NotificationDispatcher>, event: PostCommit) {
    let id = event.reservation().id;
    let results = [
        ("calendar", dispatcher.sync_calendar(&event).await),
        ("email", dispatcher.send_email(&event).await),
        ("sms", dispatcher.send_sms(&event).await),
        ("sheet", dispatcher.append_log_row(&event).await),
    ];
    for (channel, result) in results {
        if let Err(e) = result {
            warn!("{channel} notification failed for reservation {id}: {e}");
        }
    }
}

/// Default dispatcher: logs what a production integration would send.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn sync_calendar(&self, event: &PostCommit) -> Result<(), DispatchError> {
        let r = event.reservation();
        info!(
            "calendar sync ({}): reservation {} studio {} {} {}",
            event.label(),
            r.id,
            r.studio,
            r.date,
            r.slot
        );
        Ok(())
    }

    async fn send_email(&self, event: &PostCommit) -> Result<(), DispatchError> {
        let r = event.reservation();
        if let Some(email) = &r.contact.email {
            info!("email ({}) to {email} for reservation {}", event.label(), r.id);
        }
        Ok(())
    }

    async fn send_sms(&self, event: &PostCommit) -> Result<(), DispatchError> {
        let r = event.reservation();
        info!(
            "sms ({}) to {} for reservation {}",
            event.label(),
            r.contact.phone,
            r.id
        );
        Ok(())
    }

    async fn append_log_row(&self, event: &PostCommit) -> Result<(), DispatchError> {
        let r = event.reservation();
        info!("log row ({}): reservation {} status {}", event.label(), r.id, r.status);
        Ok(())
    }

    async fn deliver_reminder(
        &self,
        reservation: &Reservation,
        record: &ReminderRecord,
    ) -> Result<(), DispatchError> {
        info!(
            "reminder {:?} for reservation {} (due {})",
            record.kind, reservation.id, record.fire_at
        );
        Ok(())
    }
}
