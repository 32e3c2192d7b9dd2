use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{local_now, Engine, EngineError, ErrorCategory};
use crate::limits::MAX_LINE_LEN;
use crate::model::{
    to_minutes, BlackoutSelector, BookingStatus, Minute, ModifyRequest, Requester,
    ReservationRequest, Studio,
};
use crate::observability;
use crate::settings::BookingSettings;

/// Everything one connection needs: the engine, the live settings snapshot,
/// and the facility's fixed UTC offset.
pub struct ServiceState {
    pub engine: Arc<Engine>,
    pub settings: RwLock<BookingSettings>,
    pub utc_offset_minutes: i32,
}

/// One request per line, tagged by `op`. Times are `HH:MM`, dates ISO.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateReservation {
        studio: Studio,
        date: NaiveDate,
        start: String,
        end: String,
        phone: String,
        name: Option<String>,
        email: Option<String>,
        rate_per_hour: Option<f64>,
    },
    ModifyReservation {
        reservation_id: Ulid,
        phone: String,
        studio: Studio,
        date: NaiveDate,
        start: String,
        end: String,
        name: Option<String>,
        email: Option<String>,
        rate_per_hour: Option<f64>,
    },
    CancelReservation {
        reservation_id: Ulid,
        phone: Option<String>,
        #[serde(default)]
        staff: bool,
        reason: Option<String>,
    },
    SetReservationStatus {
        reservation_id: Ulid,
        status: BookingStatus,
    },
    ListAvailability {
        studio: Studio,
        date: NaiveDate,
    },
    ListReservations {
        studio: Studio,
        date: NaiveDate,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    CreateBlackout {
        studio: Studio,
        date: NaiveDate,
        start: String,
        end: String,
        created_by: String,
    },
    BulkCreateBlackout {
        studio: Studio,
        dates: Vec<NaiveDate>,
        start: String,
        end: String,
        created_by: String,
    },
    DeleteBlackout {
        blackout_id: Option<Ulid>,
        studio: Option<Studio>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    ListBlackouts {
        studio: Studio,
        date: NaiveDate,
    },
    ListReminders {
        reservation_id: Ulid,
    },
    GetSettings,
    UpdateSettings {
        settings: BookingSettings,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        #[serde(flatten)]
        body: serde_json::Value,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

fn engine_err(e: EngineError) -> Reply {
    // Infrastructure failures are the only ones worth a server-side log;
    // validation/conflict/state outcomes are the caller's problem.
    if e.category() == ErrorCategory::Infrastructure {
        tracing::error!("infrastructure failure: {e}");
    }
    Reply::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

fn bad_request(message: String) -> Reply {
    Reply::Error {
        kind: "bad_request",
        message,
    }
}

fn parse_time(what: &'static str, value: &str) -> Result<Minute, EngineError> {
    to_minutes(value).ok_or(EngineError::MissingFields(what))
}

pub async fn handle_request(state: &ServiceState, req: Request) -> Reply {
    let now = local_now(state.utc_offset_minutes);
    let settings = state.settings.read().await.clone();
    match dispatch(state, req, &settings, now).await {
        Ok(body) => Reply::Ok { body },
        Err(e) => engine_err(e),
    }
}

async fn dispatch(
    state: &ServiceState,
    req: Request,
    settings: &BookingSettings,
    now: NaiveDateTime,
) -> Result<serde_json::Value, EngineError> {
    match req {
        Request::CreateReservation {
            studio,
            date,
            start,
            end,
            phone,
            name,
            email,
            rate_per_hour,
        } => {
            let request = ReservationRequest {
                studio,
                date,
                start: parse_time("start is not a valid HH:MM time", &start)?,
                end: parse_time("end is not a valid HH:MM time", &end)?,
                phone,
                name,
                email,
                rate_per_hour,
            };
            let reservation = state
                .engine
                .create_reservation(request, settings, now)
                .await?;
            Ok(json!({ "reservation": reservation }))
        }
        Request::ModifyReservation {
            reservation_id,
            phone,
            studio,
            date,
            start,
            end,
            name,
            email,
            rate_per_hour,
        } => {
            let request = ModifyRequest {
                reservation_id,
                phone,
                studio,
                date,
                start: parse_time("start is not a valid HH:MM time", &start)?,
                end: parse_time("end is not a valid HH:MM time", &end)?,
                name,
                email,
                rate_per_hour,
            };
            let reservation = state
                .engine
                .modify_reservation(request, settings, now)
                .await?;
            Ok(json!({ "reservation": reservation }))
        }
        Request::CancelReservation {
            reservation_id,
            phone,
            staff,
            reason,
        } => {
            let requester = if staff {
                Requester::Staff
            } else {
                Requester::Customer {
                    phone: phone.ok_or(EngineError::MissingFields("phone"))?,
                }
            };
            let reservation = state
                .engine
                .cancel_reservation(reservation_id, requester, reason, now)
                .await?;
            Ok(json!({ "reservation": reservation }))
        }
        Request::SetReservationStatus {
            reservation_id,
            status,
        } => {
            let reservation = state
                .engine
                .set_reservation_status(reservation_id, status, now)
                .await?;
            Ok(json!({ "reservation": reservation }))
        }
        Request::ListAvailability { studio, date } => {
            let open_slots = state.engine.list_availability(studio, date, settings).await;
            Ok(json!({ "studio": studio, "date": date, "open_slots": open_slots }))
        }
        Request::ListReservations { studio, date } => {
            let reservations = state.engine.list_reservations(studio, date).await;
            Ok(json!({ "reservations": reservations }))
        }
        Request::GetReservation { reservation_id } => {
            let reservation = state
                .engine
                .get_reservation(reservation_id)
                .await
                .ok_or(EngineError::NotFound(reservation_id))?;
            Ok(json!({ "reservation": reservation }))
        }
        Request::CreateBlackout {
            studio,
            date,
            start,
            end,
            created_by,
        } => {
            let blackout = state
                .engine
                .create_blackout(
                    studio,
                    date,
                    parse_time("start is not a valid HH:MM time", &start)?,
                    parse_time("end is not a valid HH:MM time", &end)?,
                    created_by,
                )
                .await?;
            Ok(json!({ "blackout": blackout }))
        }
        Request::BulkCreateBlackout {
            studio,
            dates,
            start,
            end,
            created_by,
        } => {
            let outcome = state
                .engine
                .bulk_create_blackout(
                    studio,
                    dates,
                    parse_time("start is not a valid HH:MM time", &start)?,
                    parse_time("end is not a valid HH:MM time", &end)?,
                    created_by,
                    now,
                )
                .await?;
            Ok(json!({ "created": outcome.created, "dates": outcome.dates }))
        }
        Request::DeleteBlackout {
            blackout_id,
            studio,
            from,
            to,
        } => {
            let selector = match (blackout_id, studio, from, to) {
                (Some(id), _, _, _) => BlackoutSelector::ById(id),
                (None, Some(studio), Some(from), Some(to)) => {
                    BlackoutSelector::ByRange { studio, from, to }
                }
                _ => {
                    return Err(EngineError::MissingFields(
                        "blackout_id, or studio with from and to",
                    ))
                }
            };
            let deleted = state.engine.delete_blackout(selector).await?;
            Ok(json!({ "deleted": deleted }))
        }
        Request::ListBlackouts { studio, date } => {
            let blackouts = state.engine.list_blackouts(studio, date).await;
            Ok(json!({ "blackouts": blackouts }))
        }
        Request::ListReminders { reservation_id } => {
            let reminders = state.engine.reminders_for(reservation_id);
            Ok(json!({ "reminders": reminders }))
        }
        Request::GetSettings => Ok(json!({ "settings": settings })),
        Request::UpdateSettings { settings: new } => {
            // Whole-snapshot, last-write-wins. In-flight requests keep the
            // snapshot they already read; that staleness is tolerated.
            new.validate().map_err(EngineError::MissingFields)?;
            *state.settings.write().await = new.clone();
            Ok(json!({ "settings": new }))
        }
    }
}

/// Serve one connection: a line in, a line out, until the peer hangs up.
pub async fn process_connection(
    socket: TcpStream,
    state: Arc<ServiceState>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let op = observability::op_label(&req);
                let started = Instant::now();
                let reply = handle_request(&state, req).await;
                let status = match &reply {
                    Reply::Ok { .. } => "ok",
                    Reply::Error { .. } => "error",
                };
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status)
                    .increment(1);
                metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());
                reply
            }
            Err(e) => bad_request(format!("unparseable request: {e}")),
        };
        let out = serde_json::to_string(&reply).expect("reply serializes");
        framed.send(out).await?;
    }

    Ok(())
}
