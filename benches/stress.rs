use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2024-01-01T00:00:00Z; stays before 2000 are rejected
const BASE: i64 = 1_704_067_200_000;

struct Target {
    host: String,
    port: u16,
    login: String,
    password: String,
}

async fn connect(target: &Target) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("staydesk")
        .user(&target.login)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

fn insert_stay(id: Ulid, room: Ulid, start: i64, end: i64) -> String {
    let client = Ulid::new();
    format!(
        r#"INSERT INTO stays (id, client_id, room_id, start, "end", status) VALUES ('{id}', '{client}', '{room}', {start}, {end}, 'confirmed')"#
    )
}

async fn count_stays(client: &tokio_postgres::Client, room: Ulid) -> usize {
    client
        .simple_query(&format!("SELECT * FROM stays WHERE room_id = '{room}'"))
        .await
        .unwrap()
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count()
}

async fn phase1_sequential(target: &Target) {
    let client = connect(target).await;
    let room = Ulid::new();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = BASE + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&insert_stay(Ulid::new(), room, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} stays in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task tries to book the same slots of one room. Exactly one booking
/// per slot may win; everything else must be an exclusion violation.
async fn phase2_contended(target: &Arc<Target>) {
    let n_tasks = 10;
    let n_slots = 100;
    let room = Ulid::new();
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let target = target.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for slot in 0..n_slots {
                let s = BASE + slot * HOUR;
                match client.batch_execute(&insert_stay(Ulid::new(), room, s, s + HOUR)).await {
                    Ok(()) => {
                        won.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                        lost.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {won} booked, {lost} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );

    let client = connect(target).await;
    let stored = count_stays(&client, room).await;
    assert_eq!(won, n_slots as usize, "each slot must be booked exactly once");
    assert_eq!(stored, won, "stored stays must match accepted inserts");
    println!("  no double booking: {stored} stays for {n_slots} slots");
}

async fn phase3_read_under_load(target: &Arc<Target>) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let room = Ulid::new();
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = BASE + i * HOUR;
                let _ = client.batch_execute(&insert_stay(Ulid::new(), room, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let room = Ulid::new();
            for i in 0..50 {
                let s = BASE + (i as i64) * HOUR;
                client
                    .batch_execute(&insert_stay(Ulid::new(), room, s, s + HOUR))
                    .await
                    .unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                count_stays(&client, room).await;
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

    print_latency("room listing", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let target = Arc::new(Target {
        host: std::env::var("STAYDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("STAYDESK_PORT")
            .unwrap_or_else(|_| "5434".into())
            .parse()
            .expect("invalid STAYDESK_PORT"),
        login: std::env::var("STAYDESK_ADMIN_EMAIL").unwrap_or_else(|_| "admin@localhost".into()),
        password: std::env::var("STAYDESK_PASSWORD").unwrap_or_else(|_| "staydesk".into()),
    });

    println!("=== staydesk stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contended bookings on one room");
    phase2_contended(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n=== done ===");
}
