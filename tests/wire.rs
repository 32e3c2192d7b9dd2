use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use ulid::Ulid;

use atelier::engine::Engine;
use atelier::notify::LogDispatcher;
use atelier::settings::BookingSettings;
use atelier::wire::{self, ServiceState};

const UTC_OFFSET_MINUTES: i32 = 330;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    start_test_server_with(BookingSettings {
        buffer_minutes: 0,
        ..BookingSettings::default()
    })
    .await
}

async fn start_test_server_with(settings: BookingSettings) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("atelier_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("bookings.wal"), Arc::new(LogDispatcher)).unwrap());
    let state = Arc::new(ServiceState {
        engine,
        settings: RwLock::new(settings),
        utc_offset_minutes: UTC_OFFSET_MINUTES,
    });

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, state).await;
            });
        }
    });

    addr
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();

        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }
}

/// The server's idea of "today" (UTC + fixed offset), plus an offset in days.
fn facility_day(days_ahead: i64) -> String {
    let today: NaiveDate = (Utc::now() + Duration::minutes(i64::from(UTC_OFFSET_MINUTES)))
        .naive_utc()
        .date();
    (today + Duration::days(days_ahead)).to_string()
}

fn create_request(studio: &str, date: &str, start: &str, end: &str) -> Value {
    json!({
        "op": "create_reservation",
        "studio": studio,
        "date": date,
        "start": start,
        "end": end,
        "phone": "98765 43210",
        "name": "Asha",
        "email": "asha@example.com",
        "rate_per_hour": 1500.0,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_fetch_roundtrip() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let reply = client
        .call(create_request("a", &date, "10:00", "12:00"))
        .await;
    assert_eq!(reply["status"], "ok", "unexpected reply: {reply}");
    let reservation = &reply["reservation"];
    assert_eq!(reservation["status"], "confirmed");
    assert_eq!(reservation["studio"], "a");
    assert_eq!(reservation["slot"]["start"], "10:00");
    assert_eq!(reservation["slot"]["end"], "12:00");
    assert_eq!(reservation["contact"]["phone"], "9876543210");
    assert_eq!(reservation["total"], 3000);

    let id = reservation["id"].as_str().unwrap().to_string();
    let reply = client
        .call(json!({ "op": "get_reservation", "reservation_id": id }))
        .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["reservation"]["id"].as_str().unwrap(), id);
}

#[tokio::test]
async fn conflicting_create_reports_slot_unavailable() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let first = client
        .call(create_request("a", &date, "10:00", "12:00"))
        .await;
    assert_eq!(first["status"], "ok");

    let second = client
        .call(create_request("a", &date, "11:00", "13:00"))
        .await;
    assert_eq!(second["status"], "error");
    assert_eq!(second["kind"], "slot_unavailable");

    // A different studio is unaffected
    let other = client
        .call(create_request("b", &date, "11:00", "13:00"))
        .await;
    assert_eq!(other["status"], "ok");
}

#[tokio::test]
async fn validation_failures_carry_their_kind() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let mut bad_phone = create_request("a", &date, "10:00", "12:00");
    bad_phone["phone"] = json!("12345");
    assert_eq!(client.call(bad_phone).await["kind"], "invalid_phone");

    let inverted = create_request("a", &date, "12:00", "10:00");
    assert_eq!(client.call(inverted).await["kind"], "missing_fields");

    let too_long = create_request("a", &date, "09:00", "18:00");
    assert_eq!(client.call(too_long).await["kind"], "duration_out_of_range");

    let same_day = create_request("a", &facility_day(0), "10:00", "12:00");
    assert_eq!(client.call(same_day).await["kind"], "date_out_of_window");

    let unparseable_time = create_request("a", &date, "10am", "12:00");
    assert_eq!(client.call(unparseable_time).await["kind"], "missing_fields");
}

#[tokio::test]
async fn garbage_lines_get_bad_request() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.send_raw("this is not json").await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "bad_request");

    // The connection stays usable afterwards
    let reply = client.call(json!({ "op": "get_settings" })).await;
    assert_eq!(reply["status"], "ok");
}

#[tokio::test]
async fn availability_reflects_bookings() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let reply = client
        .call(json!({ "op": "list_availability", "studio": "a", "date": date }))
        .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(
        reply["open_slots"],
        json!([{ "start": "09:00", "end": "21:00" }])
    );

    client
        .call(create_request("a", &date, "10:00", "12:00"))
        .await;
    let reply = client
        .call(json!({ "op": "list_availability", "studio": "a", "date": date }))
        .await;
    assert_eq!(
        reply["open_slots"],
        json!([
            { "start": "09:00", "end": "10:00" },
            { "start": "12:00", "end": "21:00" },
        ])
    );
}

#[tokio::test]
async fn cancellation_frees_the_slot() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let created = client
        .call(create_request("c", &date, "10:00", "12:00"))
        .await;
    let id = created["reservation"]["id"].as_str().unwrap().to_string();

    // Wrong phone cannot cancel
    let reply = client
        .call(json!({
            "op": "cancel_reservation",
            "reservation_id": id,
            "phone": "1112223333",
        }))
        .await;
    assert_eq!(reply["kind"], "not_found_or_forbidden");

    // Staff context can
    let reply = client
        .call(json!({
            "op": "cancel_reservation",
            "reservation_id": id,
            "staff": true,
            "reason": "maintenance",
        }))
        .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["reservation"]["status"], "cancelled");

    let rebook = client
        .call(create_request("c", &date, "10:00", "12:00"))
        .await;
    assert_eq!(rebook["status"], "ok");
}

#[tokio::test]
async fn settings_updates_apply_to_later_requests() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let reply = client.call(json!({ "op": "get_settings" })).await;
    assert_eq!(reply["settings"]["min_duration_hours"], 1);

    // Raise the minimum to 2h
    let mut settings = reply["settings"].clone();
    settings["min_duration_hours"] = json!(2);
    let reply = client
        .call(json!({ "op": "update_settings", "settings": settings }))
        .await;
    assert_eq!(reply["status"], "ok");

    let one_hour = client
        .call(create_request("a", &date, "10:00", "11:00"))
        .await;
    assert_eq!(one_hour["kind"], "duration_out_of_range");

    let two_hours = client
        .call(create_request("a", &date, "10:00", "12:00"))
        .await;
    assert_eq!(two_hours["status"], "ok");

    // Nonsense snapshots are rejected
    let mut broken = client.call(json!({ "op": "get_settings" })).await["settings"].clone();
    broken["min_duration_hours"] = json!(12);
    broken["max_duration_hours"] = json!(2);
    let reply = client
        .call(json!({ "op": "update_settings", "settings": broken }))
        .await;
    assert_eq!(reply["kind"], "missing_fields");
}

#[tokio::test]
async fn bulk_blackout_is_idempotent_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let dates = json!([facility_day(5), facility_day(6), facility_day(7)]);

    let request = json!({
        "op": "bulk_create_blackout",
        "studio": "b",
        "dates": dates,
        "start": "09:00",
        "end": "12:00",
        "created_by": "admin@studio",
    });
    let first = client.call(request.clone()).await;
    assert_eq!(first["status"], "ok");
    assert_eq!(first["created"], 3);

    let second = client.call(request).await;
    assert_eq!(second["status"], "ok");
    assert_eq!(second["created"], 0);
    assert_eq!(second["dates"], dates);

    // The blacked-out window disappears from availability
    let reply = client
        .call(json!({ "op": "list_availability", "studio": "b", "date": facility_day(5) }))
        .await;
    assert_eq!(
        reply["open_slots"],
        json!([{ "start": "12:00", "end": "21:00" }])
    );

    let deleted = client
        .call(json!({
            "op": "delete_blackout",
            "studio": "b",
            "from": facility_day(5),
            "to": facility_day(7),
        }))
        .await;
    assert_eq!(deleted["status"], "ok");
    assert_eq!(deleted["deleted"], 3);
}

#[tokio::test]
async fn reminders_are_listed_for_a_reservation() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let date = facility_day(7);

    let created = client
        .call(create_request("a", &date, "10:00", "12:00"))
        .await;
    let id = created["reservation"]["id"].as_str().unwrap().to_string();

    let reply = client
        .call(json!({ "op": "list_reminders", "reservation_id": id }))
        .await;
    assert_eq!(reply["status"], "ok");
    let reminders = reply["reminders"].as_array().unwrap();
    assert_eq!(reminders.len(), 3);
    assert_eq!(reminders[0]["kind"], "confirmation");
    assert_eq!(reminders[0]["status"], "sent");
    assert_eq!(reminders[1]["kind"], "day_before");
    assert_eq!(reminders[1]["status"], "pending");
    assert_eq!(reminders[2]["kind"], "hour_before");
}

#[tokio::test]
async fn concurrent_clients_race_for_one_slot() {
    let addr = start_test_server().await;
    let date = facility_day(10);
    let n = 6;

    let mut handles = Vec::new();
    for _ in 0..n {
        let date = date.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(create_request("a", &date, "14:00", "16:00"))
                .await
        }));
    }

    let mut ok = 0;
    let mut unavailable = 0;
    for h in handles {
        let reply = h.await.unwrap();
        if reply["status"] == "ok" {
            ok += 1;
        } else {
            assert_eq!(reply["kind"], "slot_unavailable");
            unavailable += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(unavailable, n - 1);
}
