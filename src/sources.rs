use anyhow::Result;

use crate::app;
use crate::config::Config;

/// Print one status line per configured source: adapter family, schedule
/// minute, whether credentials resolve, the last job and catalog size.
pub async fn list_sources(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }
    let store = app::open_store(config).await?;

    println!(
        "{:<16} {:<12} {:<7} {:<8} {:<12} {:<22} PRODUCTS",
        "SOURCE", "ADAPTER", "MINUTE", "ENABLED", "CREDENTIALS", "LAST JOB"
    );
    for (name, source) in &config.sources {
        let credentials = match source.credential(name) {
            Ok(_) => "OK",
            Err(_) => "MISSING",
        };
        let last_job = match store.list_jobs(Some(name), 1).await?.first() {
            Some(job) => format!(
                "{} {}",
                job.state,
                job.started_at
                    .map(|t| t.format("%m-%d %H:%M").to_string())
                    .unwrap_or_default()
            ),
            None => "never".to_string(),
        };
        let counts = store.catalog_counts(name).await?;
        println!(
            "{:<16} {:<12} {:<7} {:<8} {:<12} {:<22} {}",
            name,
            source.adapter.as_str(),
            format!(":{:02}", source.minute),
            source.enabled,
            credentials,
            last_job,
            counts.products
        );
    }

    Ok(())
}
