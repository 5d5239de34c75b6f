use crate::aggregate::{self, Distribution};
use crate::config::Config;
use crate::db;
use crate::metrics;
use crate::models::{OutputRow, TopLimit};
use eyre::{eyre, Result, WrapErr};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use rusqlite::Connection;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// A raw file streamed into a keyed aggregation structure takes roughly this
/// much memory relative to its size on disk.
const MEMORY_EXPANSION_FACTOR: f64 = 2.5;
/// Memory left for other processes when sizing the worker pool.
const MEMORY_HEADROOM_BYTES: u64 = 1_000_000_000;

/// Parallel workers a ledger can afford: capped by the CPU count and by how
/// many copies of its largest input file fit in the memory budget. 0 means
/// even a single worker cannot load the file safely.
fn worker_bound(memory_budget: u64, max_file_size: u64, cpus: usize) -> usize {
    if max_file_size == 0 {
        return 1;
    }
    let by_memory =
        (memory_budget as f64 / (MEMORY_EXPANSION_FACTOR * max_file_size as f64)) as usize;
    cpus.min(by_memory)
}

fn max_input_file_size(input_dir: &Path, ledger: &str) -> Result<u64> {
    let prefix = format!("{ledger}_");
    let mut max_size = 0;
    let entries = match fs::read_dir(input_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            max_size = max_size.max(entry.metadata()?.len());
        }
    }
    Ok(max_size)
}

/// Maximum parallel worker count per ledger. A ledger whose largest raw file
/// cannot safely fit in memory even for one worker is a fatal configuration
/// error, reported before any work starts.
pub fn concurrency_per_ledger(cfg: &Config) -> Result<HashMap<String, usize>> {
    let mut system = System::new();
    system.refresh_memory();
    let memory_budget = system.total_memory().saturating_sub(MEMORY_HEADROOM_BYTES);
    let cpus = num_cpus::get();

    let mut concurrency = HashMap::new();
    let mut too_large = Vec::new();
    for ledger in &cfg.ledgers {
        let max_file_size = max_input_file_size(&cfg.input_dir, ledger)?;
        let bound = worker_bound(memory_budget, max_file_size, cpus);
        if bound == 0 {
            too_large.push(ledger.clone());
        }
        concurrency.insert(ledger.clone(), bound);
    }
    if !too_large.is_empty() {
        return Err(eyre!(
            "The max input files of the following ledgers are too large to load in memory: {}",
            too_large.join(",")
        ));
    }
    Ok(concurrency)
}

fn compute_metric(metric: &str, dist: &Distribution) -> Result<f64> {
    let d = &dist.balances;
    let circulation = dist.circulation;
    Ok(match metric {
        "gini" => metrics::gini(d, circulation),
        "hhi" => metrics::hhi(d, circulation),
        "shannon_entropy" => metrics::shannon_entropy(d, circulation),
        "theil_index" => metrics::theil_index(d, circulation),
        "max_power_ratio" => metrics::max_power_ratio(d, circulation),
        "total_entities" => metrics::total_entities(d) as f64,
        _ => {
            let threshold: f64 = metric
                .strip_prefix("tau=")
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| eyre!("unknown metric {metric:?}"))?;
            metrics::tau(d, circulation, threshold).0 as f64
        }
    })
}

/// Counting metrics are reported as integers, everything else as floats.
fn render_value(metric: &str, value: f64) -> String {
    if metric == "total_entities" || metric.starts_with("tau=") {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Cached output row for a snapshot, present only when every requested
/// metric exists under the current flag combination.
fn cached_row(
    cfg: &Config,
    conn: &Connection,
    ledger: &str,
    date: &str,
) -> Result<Option<OutputRow>> {
    let Some(ledger_id) = db::get_ledger_id(conn, ledger)? else {
        return Ok(None);
    };
    let Some(snapshot_id) = db::get_snapshot_id(conn, ledger_id, date)? else {
        return Ok(None);
    };
    let flags = cfg.flag_set();
    let mut values = Vec::with_capacity(cfg.metrics.len());
    for metric in &cfg.metrics {
        match db::get_metric(conn, snapshot_id, &flags.qualified_name(metric))? {
            Some(value) => values.push(render_value(metric, value)),
            None => return Ok(None),
        }
    }
    Ok(Some(OutputRow {
        ledger: ledger.to_string(),
        date: date.to_string(),
        values,
    }))
}

/// One snapshot end to end: cache probe, else aggregate, compute and upsert
/// every requested metric. Returns None when the unit's raw data is missing.
fn analyze_unit(cfg: &Config, ledger: &str, date: &str) -> Result<Option<OutputRow>> {
    let mut conn = db::connect(&cfg.db_path)?;

    if !cfg.force_compute {
        if let Some(row) = cached_row(cfg, &conn, ledger, date)? {
            info!("Using cached metrics for {} {}", ledger, date);
            return Ok(Some(row));
        }
    }

    let raw_file = cfg.input_dir.join(format!("{ledger}_{date}_raw_data.csv"));
    if !raw_file.is_file() {
        warn!("No raw data for {} {}, skipping", ledger, date);
        return Ok(None);
    }

    info!("Computing metrics for {} {}", ledger, date);
    let dist = aggregate::get_entries(cfg, &mut conn, ledger, date, &raw_file)?;

    let ledger_id = db::get_ledger_id(&conn, ledger)?
        .ok_or_else(|| eyre!("ledger {ledger} missing after aggregation"))?;
    let snapshot_id = db::get_snapshot_id(&conn, ledger_id, date)?
        .ok_or_else(|| eyre!("snapshot {ledger} {date} missing after aggregation"))?;

    let flags = cfg.flag_set();
    let mut values = Vec::with_capacity(cfg.metrics.len());
    for metric in &cfg.metrics {
        let value = compute_metric(metric, &dist)?;
        db::upsert_metric(&conn, snapshot_id, &flags.qualified_name(metric), value)?;
        values.push(render_value(metric, value));
    }

    Ok(Some(OutputRow {
        ledger: ledger.to_string(),
        date: date.to_string(),
        values,
    }))
}

/// Run every (ledger, date) unit under the per-ledger concurrency bound,
/// collect rows order-independently and write the flag-qualified output csv.
pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let dates = cfg.expanded_snapshot_dates()?;
    let concurrency = concurrency_per_ledger(&cfg)?;

    let mut tasks = FuturesUnordered::new();
    for ledger in cfg.ledgers.clone() {
        let bound = concurrency[&ledger];
        info!("Analyzing {} with up to {} parallel workers", ledger, bound);
        let semaphore = Arc::new(Semaphore::new(bound));
        for date in dates.clone() {
            // Backpressure: submission blocks until a slot frees.
            let permit = semaphore.clone().acquire_owned().await?;
            let cfg = Arc::clone(&cfg);
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                // The permit drops with this task, so the slot is released
                // whatever the outcome of the work.
                let _permit = permit;
                let result = tokio::task::spawn_blocking({
                    let cfg = Arc::clone(&cfg);
                    let ledger = ledger.clone();
                    let date = date.clone();
                    move || analyze_unit(&cfg, &ledger, &date)
                })
                .await;
                (ledger, date, result)
            }));
        }
    }

    let mut rows = Vec::new();
    while let Some(joined) = tasks.next().await {
        match joined {
            Ok((_, _, Ok(Ok(Some(row))))) => rows.push(row),
            Ok((_, _, Ok(Ok(None)))) => {}
            Ok((ledger, date, Ok(Err(e)))) => {
                error!("Analysis failed for {} {}: {:?}", ledger, date, e);
            }
            Ok((ledger, date, Err(e))) => {
                error!("Worker crashed for {} {}: {:?}", ledger, date, e);
            }
            Err(e) => error!("Worker task failed: {:?}", e),
        }
    }

    rows.sort_by(|a, b| (&a.ledger, &a.date).cmp(&(&b.ledger, &b.date)));
    write_output(&cfg, &rows)
}

fn write_output(cfg: &Config, rows: &[OutputRow]) -> Result<()> {
    fs::create_dir_all(&cfg.output_dir)
        .wrap_err_with(|| format!("cannot create {}", cfg.output_dir.display()))?;

    let mut header = vec![
        "ledger".to_string(),
        "snapshot_date".to_string(),
        "clustering".to_string(),
        "exclude_contract_addresses".to_string(),
        "top_limit_type".to_string(),
        "top_limit_value".to_string(),
        "exclude_below_fees".to_string(),
        "exclude_below_usd_cent".to_string(),
    ];
    header.extend(cfg.metrics.iter().cloned());

    let (top_limit_type, top_limit_value) = match cfg.top_limit {
        TopLimit::None => ("absolute".to_string(), "0".to_string()),
        TopLimit::Absolute(v) => ("absolute".to_string(), v.to_string()),
        TopLimit::Percentage(v) => ("percentage".to_string(), v.to_string()),
    };
    let flag_columns = [
        cfg.clustering_enabled().to_string(),
        cfg.exclude_contract_addresses.to_string(),
        top_limit_type,
        top_limit_value,
        cfg.exclude_below_fees.to_string(),
        cfg.exclude_below_usd_cent.to_string(),
    ];

    let mut output = String::new();
    output.push_str(&header.join(","));
    output.push('\n');
    for row in rows {
        let mut line = vec![row.ledger.clone(), row.date.clone()];
        line.extend(flag_columns.iter().cloned());
        line.extend(row.values.iter().cloned());
        output.push_str(&line.join(","));
        output.push('\n');
    }

    let path = cfg.output_filename();
    fs::write(&path, output).wrap_err_with(|| format!("cannot write {}", path.display()))?;
    info!("Output written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            ledgers: vec!["bitcoin".to_string()],
            snapshot_dates: vec!["2021-01-01".to_string()],
            granularity: None,
            clustering_sources: vec![],
            exclude_contract_addresses: false,
            exclude_below_fees: false,
            exclude_below_usd_cent: false,
            top_limit: TopLimit::None,
            metrics: vec![
                "gini".to_string(),
                "hhi".to_string(),
                "shannon_entropy".to_string(),
                "total_entities".to_string(),
                "tau=0.5".to_string(),
                "tau=0.66".to_string(),
            ],
            force_map: false,
            force_compute: false,
            db_path: dir.path().join("test.db").to_string_lossy().into_owned(),
            input_dir: dir.path().join("input"),
            output_dir: dir.path().join("output"),
            mapping_info_dir: dir.path().join("mapping_information"),
            tx_fees_dir: dir.path().join("tx_fees"),
            price_data_dir: dir.path().join("price_data"),
        }
    }

    fn write_raw(cfg: &Config, ledger: &str, date: &str, contents: &str) {
        fs::create_dir_all(&cfg.input_dir).unwrap();
        let path = cfg.input_dir.join(format!("{ledger}_{date}_raw_data.csv"));
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn init_db(cfg: &Config) {
        let conn = db::connect(&cfg.db_path).unwrap();
        db::run_migrations(&conn).unwrap();
    }

    #[test]
    fn worker_bound_caps_by_memory_and_cpus() {
        let gb = 1_000_000_000;
        assert_eq!(worker_bound(10 * gb, gb, 8), 4);
        assert_eq!(worker_bound(100 * gb, gb, 8), 8);
        // No input files: a single worker slot.
        assert_eq!(worker_bound(10 * gb, 0, 8), 1);
        // Largest file cannot fit even once.
        assert_eq!(worker_bound(gb, gb, 8), 0);
    }

    #[test]
    fn max_input_file_size_matches_ledger_prefix() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        write_raw(&cfg, "bitcoin", "2021-01-01", "address,balance\na,1\n");
        write_raw(&cfg, "bitcoin", "2021-02-01", "address,balance\na,1\nb,2\nc,3\n");
        write_raw(&cfg, "litecoin", "2021-01-01", &"x".repeat(4096));

        let big = max_input_file_size(&cfg.input_dir, "bitcoin").unwrap();
        assert!(big > 0);
        assert!(max_input_file_size(&cfg.input_dir, "litecoin").unwrap() > big);
        assert_eq!(max_input_file_size(&cfg.input_dir, "ethereum").unwrap(), 0);
        assert_eq!(max_input_file_size(Path::new("/nonexistent"), "bitcoin").unwrap(), 0);
    }

    #[test]
    fn analyze_unit_end_to_end() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        init_db(&cfg);
        write_raw(&cfg, "bitcoin", "2021-01-01", "address,balance\na,3\nb,2\nc,1\n");

        let row = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(row.ledger, "bitcoin");
        assert_eq!(row.date, "2021-01-01");

        let gini: f64 = row.values[0].parse().unwrap();
        assert!((gini - 0.22222).abs() < 1e-5);
        let hhi: f64 = row.values[1].parse().unwrap();
        assert!((hhi - 3888.9).abs() < 0.1);
        let entropy: f64 = row.values[2].parse().unwrap();
        assert!((entropy - 1.459).abs() < 1e-3);
        assert_eq!(row.values[3], "3");
        assert_eq!(row.values[4], "1");
        assert_eq!(row.values[5], "2");
    }

    #[test]
    fn analyze_unit_skips_missing_raw_data() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        init_db(&cfg);
        assert!(analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().is_none());
    }

    #[test]
    fn cache_is_reused_unless_forced() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.metrics = vec!["hhi".to_string()];
        init_db(&cfg);
        write_raw(&cfg, "bitcoin", "2021-01-01", "address,balance\na,1\n");

        let first = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(first.values, ["10000"]);

        // Poke a different value into the cache; a plain rerun must return
        // it, a forced rerun must recompute.
        let conn = db::connect(&cfg.db_path).unwrap();
        let ledger_id = db::get_ledger_id(&conn, "bitcoin").unwrap().unwrap();
        let snapshot_id = db::get_snapshot_id(&conn, ledger_id, "2021-01-01").unwrap().unwrap();
        db::upsert_metric(&conn, snapshot_id, "non-clustered hhi", 1.0).unwrap();
        drop(conn);

        let cached = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(cached.values, ["1"]);

        cfg.force_compute = true;
        let recomputed = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(recomputed.values, ["10000"]);
    }

    #[test]
    fn cache_rows_are_scoped_by_flag_combination() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.metrics = vec!["total_entities".to_string()];
        init_db(&cfg);
        write_raw(&cfg, "bitcoin", "2021-01-01", "address,balance\na,3\nb,2\nc,1\n");

        let unlimited = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(unlimited.values, ["3"]);

        // Same snapshot under a different flag combination misses the cache
        // and computes its own row.
        cfg.top_limit = TopLimit::Absolute(1);
        let limited = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(limited.values, ["1"]);

        // Both cache entries now coexist.
        cfg.top_limit = TopLimit::None;
        let again = analyze_unit(&cfg, "bitcoin", "2021-01-01").unwrap().unwrap();
        assert_eq!(again.values, ["3"]);
    }

    #[tokio::test]
    async fn run_writes_sorted_output() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.ledgers = vec!["litecoin".to_string(), "bitcoin".to_string()];
        cfg.snapshot_dates = vec!["2021-02-01".to_string(), "2021-01-01".to_string()];
        cfg.metrics = vec!["total_entities".to_string()];
        init_db(&cfg);
        write_raw(&cfg, "bitcoin", "2021-01-01", "address,balance\na,1\n");
        write_raw(&cfg, "bitcoin", "2021-02-01", "address,balance\na,1\nb,2\n");
        write_raw(&cfg, "litecoin", "2021-01-01", "address,balance\na,1\n");
        // litecoin 2021-02-01 has no raw data: its row is omitted.

        run(Arc::new(cfg.clone())).await.unwrap();

        let output = fs::read_to_string(cfg.output_filename()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines[0],
            "ledger,snapshot_date,clustering,exclude_contract_addresses,top_limit_type,\
             top_limit_value,exclude_below_fees,exclude_below_usd_cent,total_entities"
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("bitcoin,2021-01-01,"));
        assert!(lines[2].starts_with("bitcoin,2021-02-01,"));
        assert!(lines[3].starts_with("litecoin,2021-01-01,"));
        assert!(lines[1].ends_with(",1"));
        assert!(lines[2].ends_with(",2"));
    }

    #[test]
    fn output_filenames_differ_per_flag_combination() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        let plain = cfg.output_filename();
        cfg.exclude_below_fees = true;
        let with_fees = cfg.output_filename();
        cfg.top_limit = TopLimit::Absolute(100);
        let with_limit = cfg.output_filename();
        assert_ne!(plain, with_fees);
        assert_ne!(with_fees, with_limit);
        assert_ne!(plain, with_limit);
    }
}
