use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use stayd::property::PropertyManager;
use stayd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("stayd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let pm = Arc::new(PropertyManager::new(dir, 1000, 900_000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let pm = pm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, pm, "stayd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("stayd")
        .password("stayd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    client
}

fn data_rows(msgs: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    msgs.into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Rows-affected count from the command tag.
fn affected(msgs: &[SimpleQueryMessage]) -> u64 {
    msgs.iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .expect("expected a command tag")
}

/// The worked pricing example used throughout: 100/night, 50 cleaning,
/// 20/extra-guest/night above 2, 2 tax per person-night, no tax cap.
async fn configure(client: &Client) {
    client
        .batch_execute(
            "UPDATE settings SET default_nightly_rate = 100, cleaning_fee = 50, \
             pet_cleaning_fee = 25, extra_guest_fee = 20, extra_guest_threshold = 2, \
             tourist_tax = 2, max_guests = 6",
        )
        .await
        .unwrap();
}

async fn place_hold(client: &Client, id: Ulid, check_in: &str, check_out: &str, guests: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, check_in, check_out, guests) \
             VALUES ('{id}', '{check_in}', '{check_out}', {guests})"
        ))
        .await
        .unwrap();
}

async fn booking_status(client: &Client, id: Ulid) -> String {
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{id}'"))
            .await
            .unwrap(),
    );
    rows[0].get("status").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn settings_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let rows = data_rows(client.simple_query("SELECT * FROM settings").await.unwrap());
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("default_nightly_rate"), Some("100"));
    assert_eq!(row.get("cleaning_fee"), Some("50"));
    assert_eq!(row.get("pet_cleaning_fee"), Some("25"));
    assert_eq!(row.get("extra_guest_fee"), Some("20"));
    assert_eq!(row.get("extra_guest_threshold"), Some("2"));
    assert_eq!(row.get("tourist_tax"), Some("2"));
    assert_eq!(row.get("tax_cap_nights"), None); // NULL: no cap
    assert_eq!(row.get("max_guests"), Some("6"));
}

#[tokio::test]
async fn quote_breaks_out_every_component() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    // 3 nights, 3 guests: 300 stay + 50 cleaning + 60 extra guest + 18 tax
    let rows = data_rows(
        client
            .simple_query(
                "SELECT * FROM quotes WHERE check_in = '2024-06-01' \
                 AND check_out = '2024-06-04' AND guests = 3",
            )
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("nights"), Some("3"));
    assert_eq!(row.get("accommodation_total"), Some("300"));
    assert_eq!(row.get("cleaning_fee"), Some("50"));
    assert_eq!(row.get("extra_guest_fee"), Some("60"));
    assert_eq!(row.get("tourist_tax"), Some("18"));
    assert_eq!(row.get("total"), Some("428"));
}

#[tokio::test]
async fn season_rules_shape_quotes() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO seasons (id, name, start, "end", nightly_rate) VALUES ('{sid}', 'high season', '2024-07-01', '2024-09-01', 130)"#
        ))
        .await
        .unwrap();

    // 2 July nights, 2 guests: 260 stay + 50 cleaning + 8 tax
    let quote = "SELECT * FROM quotes WHERE check_in = '2024-07-10' \
                 AND check_out = '2024-07-12' AND guests = 2";
    let rows = data_rows(client.simple_query(quote).await.unwrap());
    assert_eq!(rows[0].get("total"), Some("318"));

    // Repricing the season moves fresh quotes
    client
        .batch_execute(&format!(
            "UPDATE seasons SET nightly_rate = 150 WHERE id = '{sid}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(client.simple_query(quote).await.unwrap());
    assert_eq!(rows[0].get("total"), Some("358"));

    // Removing it falls back to the default rate
    let msgs = client
        .simple_query(&format!("DELETE FROM seasons WHERE id = '{sid}'"))
        .await
        .unwrap();
    assert_eq!(affected(&msgs), 1);
    let rows = data_rows(client.simple_query(quote).await.unwrap());
    assert_eq!(rows[0].get("total"), Some("258"));
}

#[tokio::test]
async fn hold_payment_invoice_flow() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let h = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, check_in, check_out, guests, pets, name, email) \
             VALUES ('{h}', '2024-06-01', '2024-06-04', 3, false, 'Ada', 'ada@example.com')"
        ))
        .await
        .unwrap();

    // The hold froze the full breakdown
    assert_eq!(booking_status(&client, h).await, "held");
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE id = '{h}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("total"), Some("428"));

    let holds = data_rows(client.simple_query("SELECT * FROM holds").await.unwrap());
    assert_eq!(holds.len(), 1);
    assert!(holds[0].get("expires_at").unwrap().parse::<i64>().unwrap() > 0);

    // Payment confirms; the hold row disappears
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{h}', 'confirmed')"
        ))
        .await
        .unwrap();
    assert_eq!(booking_status(&client, h).await, "confirmed");
    let holds = data_rows(client.simple_query("SELECT * FROM holds").await.unwrap());
    assert!(holds.is_empty());

    // Issue the invoice and walk it to paid
    let inv = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO invoices (id, booking_id) VALUES ('{inv}', '{h}')"
        ))
        .await
        .unwrap();
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM invoices WHERE booking_id = '{h}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("number"), Some("1"));
    assert_eq!(row.get("kind"), Some("invoice"));
    assert_eq!(row.get("status"), Some("issued"));
    assert_eq!(row.get("total"), Some("428"));
    let lines: serde_json::Value = serde_json::from_str(row.get("lines").unwrap()).unwrap();
    assert_eq!(lines.as_array().unwrap().len(), 4);

    client
        .batch_execute(&format!("UPDATE invoices SET status = 'sent' WHERE id = '{inv}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE invoices SET status = 'paid' WHERE id = '{inv}'"))
        .await
        .unwrap();

    // Stay runs its course
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'checked_in' WHERE id = '{h}'"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{h}'"
        ))
        .await
        .unwrap();
    assert_eq!(booking_status(&client, h).await, "completed");

    // Completion frees the calendar
    let entries = data_rows(
        client
            .simple_query(
                "SELECT * FROM calendar WHERE start >= '2024-06-01' AND \"end\" <= '2024-06-30'",
            )
            .await
            .unwrap(),
    );
    assert!(entries.is_empty());
}

#[tokio::test]
async fn overlapping_hold_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let first = Ulid::new();
    place_hold(&client, first, "2024-06-01", "2024-06-04", 2).await;

    let rival = Ulid::new();
    let err = client
        .batch_execute(&format!(
            "INSERT INTO holds (id, check_in, check_out, guests) \
             VALUES ('{rival}', '2024-06-03', '2024-06-05', 2)"
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected db error");
    assert_eq!(db_err.code(), &SqlState::RAISE_EXCEPTION);
    assert!(db_err.message().contains("dates unavailable"));

    // Back-to-back with the first stay is fine: checkout day is free
    place_hold(&client, Ulid::new(), "2024-06-04", "2024-06-06", 2).await;
}

#[tokio::test]
async fn failed_payment_releases_the_hold() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let h = Ulid::new();
    place_hold(&client, h, "2024-06-01", "2024-06-04", 2).await;
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{h}', 'failed')"
        ))
        .await
        .unwrap();

    assert_eq!(booking_status(&client, h).await, "cancelled");

    // Dates are bookable again
    place_hold(&client, Ulid::new(), "2024-06-01", "2024-06-04", 2).await;
}

#[tokio::test]
async fn delete_hold_is_idempotent() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let h = Ulid::new();
    place_hold(&client, h, "2024-06-01", "2024-06-04", 2).await;

    let msgs = client
        .simple_query(&format!("DELETE FROM holds WHERE id = '{h}'"))
        .await
        .unwrap();
    assert_eq!(affected(&msgs), 1);

    // Releasing an already-released hold reports zero rows, not an error
    let msgs = client
        .simple_query(&format!("DELETE FROM holds WHERE id = '{h}'"))
        .await
        .unwrap();
    assert_eq!(affected(&msgs), 0);
}

#[tokio::test]
async fn illegal_status_moves_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let h = Ulid::new();
    place_hold(&client, h, "2024-06-01", "2024-06-04", 2).await;

    // Can't check in off a mere hold
    let err = client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'checked_in' WHERE id = '{h}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().unwrap().code(),
        &SqlState::RAISE_EXCEPTION
    );

    // Run the lifecycle out, then try to cancel the finished stay
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{h}', 'confirmed')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'checked_in' WHERE id = '{h}'"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'completed' WHERE id = '{h}'"
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{h}'"))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code(), &SqlState::RAISE_EXCEPTION);
    assert!(db_err.message().contains("invalid transition"));
}

#[tokio::test]
async fn one_open_invoice_per_booking() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let h = Ulid::new();
    place_hold(&client, h, "2024-06-01", "2024-06-04", 2).await;
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{h}', 'confirmed')"
        ))
        .await
        .unwrap();

    let first = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO invoices (id, booking_id) VALUES ('{first}', '{h}')"
        ))
        .await
        .unwrap();

    // A second open document for the same booking is refused
    let err = client
        .batch_execute(&format!(
            "INSERT INTO invoices (id, booking_id) VALUES ('{}', '{h}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code(), &SqlState::RAISE_EXCEPTION);
    assert!(db_err.message().contains("already issued"));

    // Cancelling the document reopens the slot; numbering never reuses 1
    client
        .batch_execute(&format!(
            "UPDATE invoices SET status = 'cancelled' WHERE id = '{first}'"
        ))
        .await
        .unwrap();
    let second = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO invoices (id, booking_id) VALUES ('{second}', '{h}')"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM invoices WHERE booking_id = '{h}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    let numbers: Vec<&str> = rows.iter().map(|r| r.get("number").unwrap()).collect();
    assert_eq!(numbers, vec!["1", "2"]);
}

#[tokio::test]
async fn calendar_distinguishes_holds_from_bookings() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;
    configure(&client).await;

    let held = Ulid::new();
    let booked = Ulid::new();
    place_hold(&client, held, "2024-06-01", "2024-06-04", 2).await;
    place_hold(&client, booked, "2024-06-10", "2024-06-14", 2).await;
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{booked}', 'confirmed')"
        ))
        .await
        .unwrap();

    let entries = data_rows(
        client
            .simple_query(
                "SELECT * FROM calendar WHERE start >= '2024-06-01' AND \"end\" <= '2024-06-30'",
            )
            .await
            .unwrap(),
    );
    assert_eq!(entries.len(), 2);
    let kind_of = |id: Ulid| {
        entries
            .iter()
            .find(|r| r.get("booking_id") == Some(id.to_string().as_str()))
            .unwrap()
            .get("kind")
            .unwrap()
            .to_string()
    };
    assert_eq!(kind_of(held), "hold");
    assert_eq!(kind_of(booked), "booked");
}

#[tokio::test]
async fn bad_sql_reports_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "test").await;

    let err = client
        .simple_query("SELECT * FROM rooms")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().unwrap().code(),
        &SqlState::SYNTAX_ERROR
    );

    let err = client.simple_query("SELEKT 1").await.unwrap_err();
    assert_eq!(
        err.as_db_error().unwrap().code(),
        &SqlState::SYNTAX_ERROR
    );
}

#[tokio::test]
async fn properties_isolated_by_database_name() {
    let addr = start_test_server().await;
    let villa = connect(addr, "villa").await;
    let cabin = connect(addr, "cabin").await;

    configure(&villa).await;
    cabin
        .batch_execute("UPDATE settings SET default_nightly_rate = 80, cleaning_fee = 10")
        .await
        .unwrap();

    // The same dates book independently per property
    place_hold(&villa, Ulid::new(), "2024-06-01", "2024-06-04", 2).await;
    place_hold(&cabin, Ulid::new(), "2024-06-01", "2024-06-04", 2).await;

    let quote = "SELECT * FROM quotes WHERE check_in = '2024-08-01' \
                 AND check_out = '2024-08-03' AND guests = 2";
    let villa_rows = data_rows(villa.simple_query(quote).await.unwrap());
    let cabin_rows = data_rows(cabin.simple_query(quote).await.unwrap());
    assert_eq!(villa_rows[0].get("total"), Some("258"));
    assert_eq!(cabin_rows[0].get("total"), Some("170"));
}
