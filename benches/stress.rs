use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("stayd")
        .password("stayd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Days after 2024-01-01, as a SQL date literal.
fn day(offset: i64) -> String {
    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Days::new(offset as u64);
    date.to_string()
}

async fn configure(client: &tokio_postgres::Client) {
    client
        .batch_execute(
            "UPDATE settings SET default_nightly_rate = 100, cleaning_fee = 50, \
             extra_guest_fee = 20, extra_guest_threshold = 2, tourist_tax = 2, max_guests = 6",
        )
        .await
        .unwrap();
}

/// Hold two nights starting at the given day offset, then confirm.
async fn book(client: &tokio_postgres::Client, offset: i64) {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, check_in, check_out, guests) VALUES ('{id}', '{}', '{}', 2)",
            day(offset),
            day(offset + 2),
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO payments (booking_id, outcome) VALUES ('{id}', 'confirmed')"
        ))
        .await
        .unwrap();
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    configure(&client).await;

    let n = 1500;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, (i as i64) * 2).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} hold+confirm pairs in {:.2}s = {ops:.0} bookings/sec",
        elapsed.as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task books its own property (unique dbname from connect())
            let client = connect(&host, port).await;
            configure(&client).await;
            for j in 0..n_per_task {
                book(&client, (j as i64) * 2).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} bookings/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_quotes_under_load(host: &str, port: u16) {
    // Writer tasks: continuously book in their own properties
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            configure(&client).await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let id = Ulid::new();
                // Errors once the calendar fills up are fine; keep writing
                let _ = client
                    .batch_execute(&format!(
                        "INSERT INTO holds (id, check_in, check_out, guests) \
                         VALUES ('{id}', '{}', '{}', 2)",
                        day(i * 2),
                        day(i * 2 + 2),
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    // Reader tasks: quote a fixed window and measure latency
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            configure(&client).await;
            // Seed a season so rate resolution does real work
            let sid = Ulid::new();
            client
                .batch_execute(&format!(
                    r#"INSERT INTO seasons (id, name, start, "end", nightly_rate) VALUES ('{sid}', 'high', '2024-06-01', '2024-09-01', 130)"#
                ))
                .await
                .unwrap();

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(
                        "SELECT * FROM quotes WHERE check_in = '2024-06-10' \
                         AND check_out = '2024-06-17' AND guests = 4",
                    )
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("quote latency", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            configure(&client).await;
            for i in 0..ops_per_conn {
                book(&client, (i as i64) * 2).await;
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("STAYD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid STAYD_PORT");

    println!("=== stayd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own properties (unique dbnames) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] quote latency under write load");
    phase3_quotes_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
