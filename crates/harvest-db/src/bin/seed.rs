//! # Seed Data Generator
//!
//! Fills a development database with queued field records, one survey
//! (profile, household, labour, location, ...) per simulated holding.
//!
//! ## Usage
//! ```bash
//! # 25 holdings for agent-dev (default)
//! cargo run -p harvest-db --bin seed
//!
//! # Custom amount, agent and database
//! cargo run -p harvest-db --bin seed -- --count 200 --agent agent-7 --db ./data/harvest.db
//! ```
//!
//! Each holding enqueues a `subject_profile` record without a subject id and
//! links every follow-up record to it through `metadata.subject_ref`, so a
//! sync pass exercises subject creation and reference resolution.

use std::env;

use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harvest_core::{Payload, QueueRecord, RecordType};
use harvest_db::{Database, DbConfig};

const DEFAULT_FILTER: &str = "info,harvest=debug,sqlx=warn";

const ISLANDS: &[(&str, f64, f64)] = &[
    ("New Providence", 25.03, -77.39),
    ("Grand Bahama", 26.65, -78.52),
    ("Abaco", 26.54, -77.07),
    ("Andros", 24.70, -77.95),
    ("Eleuthera", 25.15, -76.15),
    ("Exuma", 23.62, -75.97),
];

const HOUSING: &[&str] = &["concrete", "wood", "mixed"];
const INCOME: &[&str] = &["crops", "livestock", "fishing", "tourism", "wages"];
const LABOUR: &[&str] = &["permanent", "seasonal", "family"];
const PRIORITIES: &[&str] = &["high", "normal", "normal", "low"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mut count: usize = 25;
    let mut db_path = String::from("./harvest_dev.db");
    let mut agent_id = String::from("agent-dev");
    let mut device_id = String::from("device-dev");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(25);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--agent" | "-a" => {
                if i + 1 < args.len() {
                    agent_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--device" => {
                if i + 1 < args.len() {
                    device_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Harvest Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>      Number of holdings to enqueue (default: 25)");
                println!("  -d, --db <PATH>      Database file path (default: ./harvest_dev.db)");
                println!("  -a, --agent <ID>     Agent id (default: agent-dev)");
                println!("      --device <ID>    Device id (default: device-dev)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, holdings = count, agent_id = %agent_id, "Seeding offline queue");

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let queue = db.queue();

    let existing = queue.stats(&agent_id).await?;
    if existing.active() > 0 {
        warn!(
            pending = existing.pending,
            failed = existing.failed,
            "Queue already has active records, skipping seed"
        );
        return Ok(());
    }

    let start = std::time::Instant::now();
    let mut enqueued = 0usize;

    for holding in 0..count {
        for record in holding_records(&agent_id, &device_id, holding) {
            if let Err(e) = queue.insert(&record).await {
                warn!(record_id = %record.record_id, error = %e, "Failed to enqueue");
                continue;
            }
            enqueued += 1;
        }
    }

    let stats = queue.stats(&agent_id).await?;
    info!(
        enqueued,
        holdings = count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        by_type = ?stats.by_type.keys().collect::<Vec<_>>(),
        "Seed complete"
    );

    Ok(())
}

/// Builds the records of one simulated holding.
fn holding_records(agent_id: &str, device_id: &str, seed: usize) -> Vec<QueueRecord> {
    let (island, lat, lon) = ISLANDS[seed % ISLANDS.len()];
    let jitter = (seed % 100) as f64 / 1000.0;

    let profile = QueueRecord::new(
        agent_id,
        device_id,
        RecordType::SubjectProfile,
        object(json!({
            "name": format!("Holder {seed:04}"),
            "gender": if seed % 2 == 0 { "F" } else { "M" },
            "education_level": "secondary",
            "latitude": lat + jitter,
            "longitude": lon - jitter,
        })),
        None,
        Some(metadata(PRIORITIES[seed % PRIORITIES.len()], None)),
    );

    let linked = |record_type: RecordType, payload: Value| {
        QueueRecord::new(
            agent_id,
            device_id,
            record_type,
            object(payload),
            None,
            Some(metadata("normal", Some(&profile.record_id))),
        )
    };

    let mut records = vec![
        linked(
            RecordType::Household,
            json!({
                "household_size": 2 + seed % 6,
                "dependents": seed % 4,
                "primary_income_source": INCOME[seed % INCOME.len()],
                "housing_type": HOUSING[seed % HOUSING.len()],
            }),
        ),
        linked(
            RecordType::Labour,
            json!({
                "labour_entries": [
                    {"labour_type": LABOUR[seed % LABOUR.len()], "count": 1 + seed % 5},
                    {"labour_type": "family", "count": 1 + seed % 3, "description": island},
                ]
            }),
        ),
        linked(
            RecordType::Location,
            json!({"lat": lat + jitter, "lon": lon - jitter, "accuracy": 5.0}),
        ),
    ];

    if seed % 5 == 0 {
        records.push(linked(
            RecordType::parse("livestock_poultry"),
            json!({"goats": seed % 12, "chickens": seed % 40}),
        ));
    }

    records.insert(0, profile);
    records
}

fn metadata(priority: &str, subject_ref: Option<&str>) -> Payload {
    let mut metadata = Payload::new();
    metadata.insert("priority".into(), json!(priority));
    if let Some(reference) = subject_ref {
        metadata.insert("subject_ref".into(), json!(reference));
    }
    metadata
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
