use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

impl Target {
    async fn connect(&self, db: &str, user: &str) -> Client {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(db)
            .user(user)
            .password(&self.password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn date(offset: u64) -> String {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    (base + Days::new(offset)).format("%Y-%m-%d").to_string()
}

fn request_sql(room: Ulid, dates: &[String], start: &str, end: &str) -> String {
    let values: Vec<String> = dates
        .iter()
        .map(|d| format!("('{room}', '{d}', '{start}', '{end}', 'reservation')"))
        .collect();
    format!(
        "INSERT INTO bookings (room_id, date, start_time, end_time, type) VALUES {}",
        values.join(", ")
    )
}

/// Fresh tenant with one room and `users` booking users named u0, u1, ...
async fn new_tenant(target: &Target, users: usize) -> (String, Ulid) {
    let db = format!("bench_{}", Ulid::new());
    let op = target.connect(&db, "operator").await;
    let room = Ulid::new();
    op.batch_execute(&format!("INSERT INTO rooms (id, name) VALUES ('{room}', 'Bench Room')"))
        .await
        .unwrap();
    for i in 0..users {
        op.batch_execute(&format!(
            "INSERT INTO users (name, email) VALUES ('u{i}', 'u{i}@bench.local')"
        ))
        .await
        .unwrap();
    }
    (db, room)
}

async fn phase1_sequential(target: &Target) {
    let (db, room) = new_tenant(target, 1).await;
    let client = target.connect(&db, "u0").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let hour = 8 + (i % 10);
        let sql = request_sql(
            room,
            &[date((i / 10) as u64)],
            &format!("{hour:02}:00"),
            &format!("{hour:02}:59"),
        );
        let t = Instant::now();
        client.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} requests in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request latency", &mut latencies);
}

async fn phase2_contended_slot(target: &Target) {
    let n_tasks = 10;
    let n_per_task = 50;
    let (db, room) = new_tenant(target, n_tasks).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let target = target.clone();
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let client = target.connect(&db, &format!("u{i}")).await;
            for _ in 0..n_per_task {
                client
                    .simple_query(&request_sql(room, &[date(0)], "09:00", "10:00"))
                    .await
                    .unwrap();
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
        "  {n_tasks} users x {n_per_task} requests on one slot = {total} in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );

    // Every request must hold a distinct place in the queue.
    let op = target.connect(&db, "operator").await;
    let rows = op
        .simple_query(&format!(
            "SELECT * FROM queue WHERE room_id = '{room}' AND date = '{}' AND start_time = '09:00' AND end_time = '10:00'",
            date(0)
        ))
        .await
        .unwrap();
    let queued = rows
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count();
    println!("  queue length: {queued} (expected {total})");
}

async fn phase3_read_under_load(target: &Target) {
    let (db, room) = new_tenant(target, 5).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let target = target.clone();
        let db = db.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.connect(&db, &format!("u{w}")).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .simple_query(&request_sql(room, &[date(i % 30)], "13:00", "14:00"))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let target = target.clone();
        let db = db.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.connect(&db, "operator").await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM conflicts WHERE room_id = '{room}' AND date = '{}' AND start_time = '13:30' AND end_time = '14:30'",
                        date((i % 30) as u64)
                    ))
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

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("conflict query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let (db, room) = new_tenant(&target, 1).await;
            let client = target.connect(&db, "u0").await;
            for i in 0..ops_per_conn {
                client
                    .simple_query(&request_sql(room, &[date(i)], "10:00", "11:00"))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} tenants, {ops_per_conn} requests each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOMBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ROOMBOOK_PORT");
    let password = std::env::var("ROOMBOOK_PASSWORD").unwrap_or_else(|_| "roombook".into());
    let target = Target { host, port, password };

    println!("=== roombook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential request throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] many users, one slot");
    phase2_contended_slot(&target).await;

    println!("\n[phase 3] conflict-query latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
