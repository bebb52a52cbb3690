//! # pricewatch
//!
//! Scheduled scraping of several grocery-app catalogs, reconciliation of
//! the same product across apps by barcode, and a change-only price
//! history per product unit.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌────────────────┐
//! │ Scheduler │──▶│  Executor  │──▶│ Adapters │──▶│ RateLimited    │──▶ upstream APIs
//! │ (cron-ish)│   │ retry/ckpt │   │ per app  │   │ Client + Tokens│
//! └───────────┘   └─────┬──────┘   └──────────┘   └────────────────┘
//!                       │ canonical products
//!                       ▼
//!               ┌───────────────┐   ┌──────────┐
//!               │ Reconciliation│──▶│  Store   │◀── history / compare
//!               │ links + prices│   │ (SQLite) │
//!               └───────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pricewatch init                      # create database
//! pricewatch sources                   # check configured apps
//! pricewatch scrape alpha              # one foreground scrape
//! pricewatch run                       # hourly scheduler until Ctrl-C
//! pricewatch compare-barcode 6221234567890
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Upstream error taxonomy |
//! | [`limiter`] | Token-bucket rate limiting and jitter |
//! | [`fingerprint`] | Per-job device identities |
//! | [`client`] | Rate-limited HTTP client |
//! | [`tokens`] | Per-source session management |
//! | [`adapter`] / [`adapters`] | Upstream API families |
//! | [`retry`] | Bounded exponential backoff |
//! | [`cancel`] | Cooperative job cancellation |
//! | [`executor`] | One full-catalog scrape job |
//! | [`scheduler`] | Recurring triggers |
//! | [`reconcile`] | Product upsert, price changes, barcode links |
//! | [`history`] | Price history queries and retention |
//! | [`store`] | Persistence trait and implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter;
pub mod adapters;
pub mod app;
pub mod cancel;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod history;
pub mod limiter;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod tokens;
