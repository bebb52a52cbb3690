use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn pricewatch_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pricewatch");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Credential env vars are deliberately unset, so no source is usable
    // for scraping and nothing leaves the machine.
    let config_content = format!(
        r#"[db]
path = "{}/data/pricewatch.sqlite"

[schedule]
retention_days = 30

[sources.alpha]
adapter = "ben_soliman"
base_url = "http://127.0.0.1:9"
minute = 10
username_env = "PW_IT_ALPHA_USER_UNSET"
password_env = "PW_IT_ALPHA_PASS_UNSET"

[sources.beta]
adapter = "paged_rest"
base_url = "http://127.0.0.1:9"
minute = 40
username_env = "PW_IT_BETA_USER_UNSET"
password_env = "PW_IT_BETA_PASS_UNSET"
enabled = false
"#,
        root.display()
    );

    let config_path = config_dir.join("pricewatch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_pricewatch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = pricewatch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pricewatch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pricewatch(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/pricewatch.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_pricewatch(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_pricewatch(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_reports_missing_credentials() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pricewatch(&config_path, &["sources"]);
    assert!(success, "sources failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("SOURCE"));
    assert!(stdout.contains("alpha"));
    assert!(stdout.contains("ben_soliman"));
    assert!(stdout.contains("MISSING"));
    assert!(stdout.contains("never"));
}

#[test]
fn test_jobs_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_pricewatch(&config_path, &["jobs"]);
    assert!(success);
    assert!(stdout.contains("No jobs."));
}

#[test]
fn test_scrape_without_credentials_fails_with_available_list() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pricewatch(&config_path, &["scrape", "alpha"]);
    assert!(!success, "scrape should fail without credentials");
    assert!(stderr.contains("unknown or disabled source 'alpha'"));
    assert!(stderr.contains("available: none"));
}

#[test]
fn test_compare_barcode_with_no_data() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_pricewatch(&config_path, &["compare-barcode", "6221234567890"]);
    assert!(success);
    assert!(stdout.contains("No priced products"));
}

#[test]
fn test_history_unknown_product_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pricewatch(&config_path, &["history", "alpha/404"]);
    assert!(!success);
    assert!(stderr.contains("product not found"));
}

#[test]
fn test_prune_uses_configured_retention() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_pricewatch(&config_path, &["prune"]);
    assert!(success);
    assert!(stdout.contains("Removed 0 price record(s) older than 30 day(s)."));
}

#[test]
fn test_relink_requires_a_target() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pricewatch(&config_path, &["relink"]);
    assert!(!success);
    assert!(stderr.contains("--barcode"));
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        r#"[db]
path = "./x.sqlite"

[sources.alpha]
adapter = "zahcode"
base_url = "ftp://nope"
username_env = "U"
password_env = "P"
"#,
    )
    .unwrap();

    let (_, stderr, success) = run_pricewatch(&bad, &["jobs"]);
    assert!(!success);
    assert!(stderr.contains("base_url"));
}
