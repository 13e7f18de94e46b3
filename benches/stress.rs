use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const DAY_MS: i64 = 86_400_000;
/// 2024-10-04, 00:00 UTC.
const FIRST_DAY: i64 = 20_000 * DAY_MS;

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user("bench")
        .password(password);

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
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        ms(avg),
        ms(percentile(latencies, 50.0)),
        ms(percentile(latencies, 95.0)),
        ms(percentile(latencies, 99.0)),
        ms(latencies[latencies.len() - 1]),
    );
}

/// First column of every returned row.
async fn column(client: &Client, sql: &str) -> Result<Vec<String>, tokio_postgres::Error> {
    Ok(client
        .simple_query(sql)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .collect())
}

async fn book(client: &Client, slot: &str, user: Ulid) -> Result<String, tokio_postgres::Error> {
    let ids = column(
        client,
        &format!("INSERT INTO bookings (slot_id, user_id) VALUES ('{slot}', '{user}') RETURNING id"),
    )
    .await?;
    Ok(ids.into_iter().next().unwrap_or_default())
}

async fn cancel(client: &Client, booking: &str, user: Ulid) {
    client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{booking}' AND user_id = '{user}'"
        ))
        .await
        .unwrap();
}

/// A fresh item with `days` days of generated slots. Returns (item, slot ids).
async fn setup_item(client: &Client, days: i64) -> (Ulid, Vec<String>) {
    let item = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO items (id, name) VALUES ('{item}', 'bench {item}')"))
        .await
        .unwrap();
    let mut slots = Vec::new();
    for d in 0..days {
        let day = FIRST_DAY + d * DAY_MS;
        client
            .batch_execute(&format!("INSERT INTO schedule (item_id, day) VALUES ('{item}', {day})"))
            .await
            .unwrap();
        slots.extend(
            column(client, &format!("SELECT * FROM slots WHERE item_id = '{item}' AND day = {day}"))
                .await
                .unwrap(),
        );
    }
    (item, slots)
}

async fn phase1_sequential(client: &Client, slots: &[String]) {
    let n = 2000;
    let user = Ulid::new();
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let slot = &slots[i % slots.len()];
        let t = Instant::now();
        let booking = book(client, slot, user).await.unwrap();
        cancel(client, &booking, user).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} book+cancel pairs in {:.2}s = {:.0} pairs/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("book+cancel", &mut latencies);
}

/// Many clients race for the same slots. Every slot must end with exactly one
/// booking no matter how many tried.
async fn phase2_contention(host: &str, port: u16, password: &str, slots: &[String]) {
    let n_clients = 50;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let (host, password) = (host.to_string(), password.to_string());
        let slots = slots.to_vec();
        let (wins, conflicts) = (wins.clone(), conflicts.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            // fresh user per slot so the quota never interferes
            for slot in &slots {
                match book(&client, slot, Ulid::new()).await {
                    Ok(_) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {} slots: {wins} booked, {conflicts} rejected in {:.2}s",
        slots.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(wins, slots.len(), "every slot must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16, password: &str, item: Ulid, slots: &[String]) {
    let writers = 5;
    let stop = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for w in 0..writers {
        let (host, password) = (host.to_string(), password.to_string());
        let my_slots: Vec<String> = slots.iter().skip(w).step_by(writers).cloned().collect();
        let stop = stop.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let user = Ulid::new();
            let mut i = 0;
            while stop.load(Ordering::Relaxed) == 0 {
                let slot = &my_slots[i % my_slots.len()];
                if let Ok(booking) = book(&client, slot, user).await {
                    cancel(&client, &booking, user).await;
                }
                i += 1;
            }
        }));
    }

    let reader = connect(host, port, password).await;
    let mut latencies = Vec::new();
    for _ in 0..500 {
        let t = Instant::now();
        column(&reader, &format!("SELECT * FROM slots WHERE item_id = '{item}' AND day = {FIRST_DAY}"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    stop.store(1, Ordering::Relaxed);
    for h in handles {
        h.await.unwrap();
    }

    print_latency("available slots under write load", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, password: &str, slots: &[String]) {
    let n_conns = 50;
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for i in 0..n_conns {
        let (host, password) = (host.to_string(), password.to_string());
        let slot = slots[i % slots.len()].clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            column(&client, "SELECT * FROM items").await.unwrap();
            let user = Ulid::new();
            if let Ok(booking) = book(&client, &slot, user).await {
                cancel(&client, &booking, user).await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections: {ok}/{n_conns} completed in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");
    let password = std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into());

    println!("=== slotbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let client = connect(&host, port, &password).await;
    let (seq_item, seq_slots) = setup_item(&client, 1).await;
    let (_, race_slots) = setup_item(&client, 7).await;
    println!("  {} + {} slots", seq_slots.len(), race_slots.len());

    println!("\n[phase 1] sequential book/cancel throughput");
    phase1_sequential(&client, &seq_slots).await;

    println!("\n[phase 2] contended booking");
    phase2_contention(&host, port, &password, &race_slots).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, &password, seq_item, &seq_slots).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, &password, &seq_slots).await;

    println!("\n=== benchmark complete ===");
}
