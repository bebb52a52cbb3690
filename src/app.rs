//! Wiring of the long-lived components from a loaded [`Config`].

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::adapter::{build_adapters, AdapterSet, ScraperAdapter};
use crate::client::RateLimitedClient;
use crate::config::Config;
use crate::db;
use crate::executor::Executor;
use crate::migrate;
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::Scheduler;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::tokens::TokenManager;

pub struct App {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub client: Arc<RateLimitedClient>,
    pub tokens: Arc<TokenManager>,
    pub engine: Arc<ReconciliationEngine>,
    pub executor: Arc<Executor>,
    pub adapters: AdapterSet,
}

impl App {
    /// Open the database (creating tables if needed) and build every
    /// enabled source's adapter.
    pub async fn open(config: Config) -> Result<Self> {
        let store = open_store(&config).await?;
        let client = Arc::new(RateLimitedClient::from_config(&config)?);
        let tokens = Arc::new(TokenManager::new(store.clone()));
        let adapters = build_adapters(&config, client.clone(), tokens.clone()).await?;
        let engine = Arc::new(ReconciliationEngine::new(store.clone()));
        let executor = Arc::new(Executor::from_config(
            &config,
            store.clone(),
            engine.clone(),
            client.clone(),
        ));
        Ok(Self {
            config,
            store,
            client,
            tokens,
            engine,
            executor,
            adapters,
        })
    }

    pub fn adapter(&self, source: &str) -> Result<Arc<dyn ScraperAdapter>> {
        match self.adapters.get(source) {
            Some(adapter) => Ok(adapter.clone()),
            None => {
                let available: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
                bail!(
                    "unknown or disabled source '{}' (available: {})",
                    source,
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                )
            }
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.executor.clone(),
            self.adapters.clone(),
            self.tokens.clone(),
            self.store.clone(),
        )
        .with_config(&self.config, Utc::now())
    }
}

/// Store only, for commands that never talk to an upstream.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}
