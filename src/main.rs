// Pulse Engine CLI - init / seed / import / stats

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use std::env;
use std::path::Path;
use std::sync::Arc;

use pulse_engine::{
    load_feed_csv, EngineConfig, EvidenceKind, FixedProvider, SmeProfile, TrustEngine,
    TxnDirection, TxnRecord, UserRole,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_engine=info".into()),
        )
        .init();

    let config = EngineConfig::load().context("Failed to load configuration")?;
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(config),
        Some("seed") => run_seed(config).await,
        Some("import") => {
            let sme_id = args.get(2).context("usage: import <sme-id> <feed.csv>")?;
            let csv_path = args.get(3).context("usage: import <sme-id> <feed.csv>")?;
            run_import(config, sme_id, Path::new(csv_path))
        }
        Some(other) => bail!("unknown command: {} (expected init, seed, or import)", other),
        None => run_stats(config),
    }
}

fn run_init(config: EngineConfig) -> Result<()> {
    println!("🔧 Initializing database at {}", config.database.path);
    let engine = TrustEngine::open(config, Arc::new(FixedProvider::new()))?;
    let stats = engine.stats()?;
    println!("✓ Database ready ({} SMEs, {} users)", stats.smes, stats.users);
    Ok(())
}

/// Walk two demo SMEs through the full pipeline with the fixed provider:
/// one verifies, one stays pending on a short ledger.
async fn run_seed(config: EngineConfig) -> Result<()> {
    println!("🌱 Seeding demo data into {}", config.database.path);

    let provider = FixedProvider::new()
        .with_history("demo-link-long", demo_history(8))
        .with_history("demo-link-short", demo_history(4));
    let engine = TrustEngine::open(config, Arc::new(provider))?;

    engine
        .register_lender(
            "lender@capital.demo",
            "lender-pass-1",
            Some("Capital Partners".to_string()),
        )
        .context("Seed failed (already seeded?)")?;
    println!("✓ Lender registered: lender@capital.demo / lender-pass-1");

    let scenarios = [
        ("verified@acme.demo", "Acme Stores", "demo-link-long"),
        ("pending@bloom.demo", "Bloom Logistics", "demo-link-short"),
    ];

    for (email, name, link_token) in scenarios {
        let record = engine.register_sme(
            email,
            "sme-pass-123",
            SmeProfile {
                name: name.to_string(),
                industry: pulse_engine::Industry::Retail,
                location: pulse_engine::City::Lagos,
                founded_date: None,
                description: format!("{} demo business", name),
            },
        )?;
        let (session, _) = engine.login(email, "sme-pass-123", UserRole::Sme)?;

        engine
            .submit_evidence(&session, &record.id, EvidenceKind::IncorporationDocument, name.as_bytes())
            .await?;
        engine
            .submit_evidence(
                &session,
                &record.id,
                EvidenceKind::AttestationVideo,
                format!("{} attestation", name).as_bytes(),
            )
            .await?;
        engine
            .connect_linked_account(&session, &record.id, link_token)
            .await?;
        engine.refresh_ledger(&record.id).await?;

        let status = engine.advance(&record.id).await?;
        println!("✓ {} → {} ({})", name, status.as_str(), email);
    }

    let stats = engine.stats()?;
    println!(
        "\n✓ Seed complete: {} SMEs, {} users, {} transactions, {} published",
        stats.smes, stats.users, stats.transactions, stats.published
    );
    Ok(())
}

fn run_import(config: EngineConfig, sme_id: &str, csv_path: &Path) -> Result<()> {
    println!("📂 Importing feed {} for SME {}", csv_path.display(), sme_id);

    let records = load_feed_csv(csv_path)?;
    println!("✓ Loaded {} feed rows", records.len());

    let engine = TrustEngine::open(config, Arc::new(FixedProvider::new()))?;
    let inserted = engine.ingest(sme_id, records)?;
    println!("✓ Inserted: {} transactions", inserted);

    Ok(())
}

fn run_stats(config: EngineConfig) -> Result<()> {
    let engine = TrustEngine::open(config, Arc::new(FixedProvider::new()))?;
    let stats = engine.stats()?;

    println!("Pulse Engine v{}", pulse_engine::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("SMEs:          {}", stats.smes);
    println!("Users:         {}", stats.users);
    println!("Transactions:  {}", stats.transactions);
    println!("Published:     {}", stats.published);
    println!("\nCommands: init | seed | import <sme-id> <feed.csv>");

    Ok(())
}

/// Deterministic monthly history for the seed scenarios.
fn demo_history(months: u32) -> Vec<TxnRecord> {
    let mut records = Vec::new();
    for m in 0..months {
        let ts = Utc
            .with_ymd_and_hms(2025, 1, 15, 10, 0, 0)
            .unwrap()
            .checked_add_months(chrono::Months::new(m))
            .unwrap();
        records.push(TxnRecord {
            external_id: format!("demo-credit-{}", m),
            amount: 2200.0 + m as f64 * 120.0,
            direction: TxnDirection::Credit,
            timestamp: ts,
            category: Some("sales".to_string()),
        });
        records.push(TxnRecord {
            external_id: format!("demo-debit-{}", m),
            amount: 1300.0,
            direction: TxnDirection::Debit,
            timestamp: ts,
            category: Some("inventory".to_string()),
        });
    }
    records
}
