//! CLI command bodies. Each `run_*` function loads what it needs from the
//! config, does its work, and prints a plain-text report.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use crate::app::{self, App};
use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::executor::{self, Dispatch};
use crate::history;
use crate::models::{format_price, JobOutcome, ScrapeJob, StoredProduct};
use crate::reconcile::ReconciliationEngine;
use crate::store::Store;

// ═══════════════════════════════════════════════════════════════════════
// Scraping
// ═══════════════════════════════════════════════════════════════════════

/// Run one full scrape of `source` (or of every enabled source for `all`)
/// in the foreground. Ctrl-C cancels the running job, which closes as
/// partially succeeded and keeps its checkpoint.
pub async fn run_scrape(config: &Config, source: &str, full: bool) -> Result<()> {
    let app = App::open(config.clone()).await?;
    let targets: Vec<String> = if source == "all" {
        app.adapters.keys().cloned().collect()
    } else {
        vec![app.adapter(source)?.source().to_string()]
    };
    if targets.is_empty() {
        bail!("No enabled sources with credentials. Check [sources] and the credential env vars.");
    }

    let handle = Arc::new(CancelHandle::new());
    let on_interrupt = Arc::clone(&handle);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, closing the running job...");
            on_interrupt.cancel();
        }
    });

    for name in targets {
        if handle.signal().is_cancelled() {
            break;
        }
        if full {
            app.store.clear_checkpoint(&name).await?;
        }
        let adapter = app.adapter(&name)?;
        match app.executor.execute(adapter.as_ref(), handle.signal()).await? {
            Dispatch::Completed(outcome) => print_outcome(&outcome),
            Dispatch::Skipped { source } => {
                println!("{}: a scrape is already running, skipped.", source)
            }
        }
    }
    Ok(())
}

fn print_outcome(outcome: &JobOutcome) {
    let c = &outcome.counts;
    println!("{} job {}: {}", outcome.source, outcome.job_id, outcome.state);
    println!(
        "  pages ok: {}  pages failed: {}  items: {} fetched / {} written  price changes: {}  errors: {}",
        c.pages_ok, c.pages_failed, c.items_fetched, c.items_written, c.price_changes, c.errors
    );
    println!("  duration: {:.1}s", outcome.duration_ms as f64 / 1000.0);
    if let Some(kind) = outcome.error_kind {
        println!(
            "  error: {}{}",
            kind,
            outcome
                .reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
    }
    if outcome.needs_operator {
        println!("  operator attention needed: fix credentials or the adapter before the next run.");
    }
}

/// Long-running scheduler. Closes jobs left running by a previous process,
/// then dispatches scrapes, token sweeps, and cleanup until Ctrl-C.
pub async fn run_daemon(config: &Config) -> Result<()> {
    let app = App::open(config.clone()).await?;
    let recovered = executor::recover_interrupted(app.store.as_ref()).await?;
    if recovered > 0 {
        println!("Closed {} job(s) interrupted by a previous shutdown.", recovered);
    }

    let mut scheduler = app.scheduler();
    for (task, next) in scheduler.next_runs() {
        println!("{:<28} next {}", task.to_string(), next.format("%Y-%m-%d %H:%M UTC"));
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = tx.send(true);
        }
    });

    scheduler.run(rx).await?;
    println!("Scheduler stopped.");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

pub async fn list_jobs(config: &Config, source: Option<String>, limit: usize) -> Result<()> {
    let store = app::open_store(config).await?;
    let jobs = store.list_jobs(source.as_deref(), limit).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<14} {:<20} {:<16} {:>6} {:>6} {:>8}  ERROR",
        "ID", "SOURCE", "STATE", "STARTED", "PAGES", "FAILED", "CHANGES"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<14} {:<20} {:<16} {:>6} {:>6} {:>8}  {}",
            job.id,
            job.source,
            job.state.as_str(),
            format_time(job.started_at),
            job.counts.pages_ok,
            job.counts.pages_failed,
            job.counts.price_changes,
            job.error_kind.map(|k| k.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn show_job(config: &Config, id: &str) -> Result<()> {
    let store = app::open_store(config).await?;
    let Some(job) = store.get_job(id).await? else {
        bail!("job not found: {}", id);
    };
    print_job(&job);
    if let Some(cp) = store.get_checkpoint(&job.source).await? {
        if cp.job_id == job.id {
            println!(
                "checkpoint:   category {} (#{}) page {}",
                cp.category_id,
                cp.category_index,
                cp.cursor.page
            );
        }
    }
    Ok(())
}

fn print_job(job: &ScrapeJob) {
    let c = &job.counts;
    println!("id:           {}", job.id);
    println!("source:       {}", job.source);
    println!("state:        {}", job.state);
    println!("started:      {}", format_time(job.started_at));
    println!("finished:     {}", format_time(job.finished_at));
    println!("pages:        {} ok, {} failed", c.pages_ok, c.pages_failed);
    println!("items:        {} fetched, {} written", c.items_fetched, c.items_written);
    println!("changes:      {}", c.price_changes);
    println!("errors:       {}", c.errors);
    if let Some(kind) = job.error_kind {
        println!("error kind:   {}", kind);
    }
    if let Some(reason) = &job.reason {
        println!("reason:       {}", reason);
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ═══════════════════════════════════════════════════════════════════════
// History & comparison
// ═══════════════════════════════════════════════════════════════════════

/// Accepts either a product id or `<source>/<source_product_id>`.
async fn resolve_product(store: &dyn Store, key: &str) -> Result<StoredProduct> {
    if let Some(product) = store.get_product(key).await? {
        return Ok(product);
    }
    if let Some((source, source_product_id)) = key.split_once('/') {
        if let Some(product) = store.find_product(source, source_product_id).await? {
            return Ok(product);
        }
    }
    bail!("product not found: {}", key)
}

pub async fn show_history(
    config: &Config,
    product: &str,
    unit: Option<String>,
    since: Option<String>,
    days: Option<u32>,
) -> Result<()> {
    let store = app::open_store(config).await?;
    let product = resolve_product(store.as_ref(), product).await?;
    println!("{} [{}] {}", product.name, product.source, product.id);

    if let Some(days) = days {
        let Some(unit) = unit.or_else(|| product.units.iter().next().cloned()) else {
            println!("Product has no units.");
            return Ok(());
        };
        let summary =
            history::daily_summary(store.as_ref(), &product.id, &unit, days, Utc::now()).await?;
        println!("{:<12} {:>10} {:>10} {:>10} {:>8}", "DAY", "MIN", "MAX", "CLOSE", "CHANGES");
        for day in summary {
            println!(
                "{:<12} {:>10} {:>10} {:>10} {:>8}",
                day.day,
                format_price(day.min),
                format_price(day.max),
                format_price(day.close),
                day.changes
            );
        }
        return Ok(());
    }

    let since = match since {
        Some(s) => Some(
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("invalid --since date '{}', expected YYYY-MM-DD", s))?
                .and_hms_opt(0, 0, 0)
                .context("invalid --since date")?
                .and_utc(),
        ),
        None => None,
    };
    let records =
        history::price_history(store.as_ref(), &product.id, unit.as_deref(), since).await?;
    if records.is_empty() {
        println!("No price records.");
        return Ok(());
    }
    println!("{:<17} {:<10} {:>10} {:>10} {:<9}", "RECORDED", "UNIT", "PRICE", "WAS", "AVAILABLE");
    for r in records {
        println!(
            "{:<17} {:<10} {:>10} {:>10} {:<9}",
            r.recorded_at.format("%Y-%m-%d %H:%M"),
            r.unit,
            format_price(r.price),
            r.original_price.map(format_price).unwrap_or_else(|| "-".into()),
            r.available
        );
    }
    Ok(())
}

pub async fn run_compare(config: &Config, product: &str) -> Result<()> {
    let store = app::open_store(config).await?;
    let product = resolve_product(store.as_ref(), product).await?;
    let rows = history::compare_product(store.as_ref(), &product.id).await?;
    println!("{} [{}] barcode {}", product.name, product.source, product.barcode.as_deref().unwrap_or("-"));
    if rows.is_empty() {
        for latest in history::latest_prices(store.as_ref(), &product.id).await? {
            println!("{:<10} {:>10}", latest.unit, format_price(latest.price));
        }
        println!("No linked products.");
        return Ok(());
    }

    println!(
        "{:<10} {:>10}  {:<14} {:<10} {:>10} {:>10}",
        "UNIT", "PRICE", "OTHER SOURCE", "OTHER UNIT", "PRICE", "DIFF"
    );
    for row in rows {
        println!(
            "{:<10} {:>10}  {:<14} {:<10} {:>10} {:>10}",
            row.unit,
            row.price.as_ref().map(|p| format_price(p.price)).unwrap_or_else(|| "-".into()),
            row.other.source,
            row.other_unit,
            row.other_price
                .as_ref()
                .map(|p| format_price(p.price))
                .unwrap_or_else(|| "-".into()),
            match (row.same_unit, row.difference()) {
                (true, Some(d)) => format_price(d),
                _ => "-".into(),
            }
        );
    }
    Ok(())
}

pub async fn run_compare_barcode(config: &Config, barcode: &str) -> Result<()> {
    let store = app::open_store(config).await?;
    let quotes = history::compare_barcode(store.as_ref(), barcode.trim()).await?;
    if quotes.is_empty() {
        println!("No priced products with barcode {}.", barcode);
        return Ok(());
    }
    println!("{:<14} {:<10} {:>10} {:<9} NAME", "SOURCE", "UNIT", "PRICE", "AVAILABLE");
    for q in quotes {
        println!(
            "{:<14} {:<10} {:>10} {:<9} {}",
            q.product.source,
            q.unit,
            format_price(q.latest.price),
            q.latest.available,
            q.product.name
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Maintenance
// ═══════════════════════════════════════════════════════════════════════

/// Recompute barcode links for one product, or for one barcode group.
pub async fn run_relink(config: &Config, product: Option<String>, barcode: Option<String>) -> Result<()> {
    let store = app::open_store(config).await?;
    let engine = ReconciliationEngine::new(Arc::clone(&store));
    let outcome = match (product, barcode) {
        (Some(key), None) => {
            let product = resolve_product(store.as_ref(), &key).await?;
            engine.relink(&product.id, Utc::now()).await?
        }
        (None, Some(barcode)) => engine.relink_barcode(barcode.trim(), Utc::now()).await?,
        _ => bail!("pass exactly one of <product> or --barcode"),
    };
    println!(
        "Links: {} created, {} kept, {} removed, {} inconsistent source(s).",
        outcome.created, outcome.kept, outcome.removed, outcome.inconsistencies
    );
    Ok(())
}

pub async fn run_prune(config: &Config, retention_days: Option<u32>) -> Result<()> {
    let days = retention_days.unwrap_or(config.schedule.retention_days);
    if days == 0 {
        bail!("retention must be at least one day");
    }
    let store = app::open_store(config).await?;
    let removed = history::prune(store.as_ref(), days, Utc::now()).await?;
    println!("Removed {} price record(s) older than {} day(s).", removed, days);
    Ok(())
}
