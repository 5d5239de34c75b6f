use crate::config::{self, Config};
use crate::db;
use crate::models::SpecialAddress;
use eyre::{eyre, Result, WrapErr};
use rusqlite::Connection;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// A descending per-entity (or per-address) balance distribution together
/// with the circulation it sums to.
#[derive(Debug, PartialEq)]
pub struct Distribution {
    pub balances: Vec<f64>,
    pub circulation: f64,
}

/// How many of the ledger's smallest raw units make up one unit of the
/// analysis denomination (e.g. ethereum balances are analyzed in Gwei).
fn ingest_divisor(ledger: &str) -> Decimal {
    match ledger {
        "ethereum" => Decimal::from(1_000_000_000u64),
        _ => Decimal::ONE,
    }
}

/// Analysis units per coin, used to convert a coin price into a per-unit
/// price.
fn denomination(ledger: &str) -> f64 {
    match ledger {
        "bitcoin" | "bitcoin_cash" | "litecoin" => 1e8,
        "cardano" | "tezos" => 1e6,
        "ethereum" => 1e9,
        _ => {
            warn!("No denomination found for {}", ledger);
            1.0
        }
    }
}

/// Addresses excluded unconditionally (burn/foundation/vesting), curated in
/// the mapping information. Missing file means none.
fn special_addresses(cfg: &Config, ledger: &str) -> Result<HashSet<String>> {
    let path = cfg
        .mapping_info_dir
        .join("special_addresses")
        .join(format!("{ledger}.json"));
    if !path.is_file() {
        return Ok(HashSet::new());
    }
    let file = File::open(&path).wrap_err_with(|| format!("cannot open {}", path.display()))?;
    let entries: Vec<SpecialAddress> = serde_json::from_reader(file)?;
    Ok(entries.into_iter().map(|e| e.address).collect())
}

/// Median transaction fee for the ledger at the given date, in analysis
/// units; 0 when no fee data is available.
fn median_tx_fee(cfg: &Config, ledger: &str, date: &str) -> f64 {
    let granularity = cfg.granularity.map(|g| g.as_str()).unwrap_or("day");
    let path = cfg
        .tx_fees_dir
        .join(ledger)
        .join(format!("median_tx_fees_{granularity}.json"));
    let fees: HashMap<String, f64> = match File::open(&path) {
        Ok(file) => match serde_json::from_reader(file) {
            Ok(fees) => fees,
            Err(e) => {
                warn!("Malformed median tx fees for {}: {}", ledger, e);
                return 0.0;
            }
        },
        Err(_) => {
            warn!("No median tx fees found for {}", ledger);
            return 0.0;
        }
    };
    let key = config::fee_lookup_date(date, cfg.granularity);
    match fees.get(&key) {
        Some(fee) => *fee,
        None => {
            warn!("No median tx fee found for {} on {}", ledger, key);
            0.0
        }
    }
}

/// Amount of analysis units worth one USD cent at the given date; 0 when no
/// price data is available.
fn usd_cent_equivalent(cfg: &Config, ledger: &str, date: &str) -> f64 {
    let path = cfg.price_data_dir.join(format!("{ledger}-USD.csv"));
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => {
            warn!("No price data found for {}", ledger);
            return 0.0;
        }
    };
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => continue,
        };
        let Some((key, value)) = line.split_once(',') else {
            continue;
        };
        if key.trim() == date {
            let Ok(price) = value.trim().parse::<f64>() else {
                continue;
            };
            let denomination_price = price / denomination(ledger);
            return 0.01 / denomination_price;
        }
    }
    warn!("No price data found for {} on {}", ledger, date);
    0.0
}

/// Balance below which entries are excluded: the larger of the median tx fee
/// and the USD-cent equivalent, each only when its flag is enabled.
fn exclusion_threshold(cfg: &Config, ledger: &str, date: &str) -> f64 {
    let mut threshold: f64 = 0.0;
    if cfg.exclude_below_fees {
        threshold = threshold.max(median_tx_fee(cfg, ledger, date));
    }
    if cfg.exclude_below_usd_cent {
        threshold = threshold.max(usd_cent_equivalent(cfg, ledger, date));
    }
    threshold
}

/// Stream one snapshot's raw balance csv and produce the sorted distribution
/// the metrics run on.
///
/// Special addresses are dropped, each remaining address is resolved through
/// the stored mapping (itself when unmapped or clustering is off), contract
/// addresses are optionally dropped, and per-key aggregates strictly above
/// the exclusion threshold survive. The raw per-address balances and the
/// snapshot's full circulation are persisted as the audit trail. The
/// returned circulation is the sum of exactly the surviving (possibly
/// top-limited) entries.
pub fn get_entries(
    cfg: &Config,
    conn: &mut Connection,
    ledger: &str,
    date: &str,
    raw_file: &Path,
) -> Result<Distribution> {
    let threshold = exclusion_threshold(cfg, ledger, date);
    let special = special_addresses(cfg, ledger)?;
    let divisor = ingest_divisor(ledger);
    let clustering = cfg.clustering_enabled();

    let tx = conn.transaction()?;
    let ledger_id = db::get_or_create_ledger(&tx, ledger)?;
    let snapshot_id = db::get_or_create_snapshot(&tx, ledger_id, date)?;
    let mapping = db::load_mapping(&tx, ledger_id)?;

    let file =
        File::open(raw_file).wrap_err_with(|| format!("cannot open {}", raw_file.display()))?;
    let mut lines = BufReader::new(file).lines();
    lines.next(); // header

    let mut aggregated: HashMap<String, Decimal> = HashMap::new();
    let mut full_circulation = Decimal::ZERO;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let address = line
            .split(',')
            .next()
            .ok_or_else(|| eyre!("malformed balance row: {line}"))?
            .trim();
        let raw_balance = line
            .rsplit(',')
            .next()
            .ok_or_else(|| eyre!("malformed balance row: {line}"))?
            .trim();
        let balance = Decimal::from_str(raw_balance)
            .wrap_err_with(|| format!("malformed balance for {address}: {raw_balance:?}"))?
            / divisor;

        if special.contains(address) {
            continue;
        }

        full_circulation += balance;
        let address_id = db::get_or_create_address(&tx, ledger_id, address)?;
        db::upsert_balance(&tx, snapshot_id, address_id, &balance)?;

        let (entity, is_contract) = match mapping.get(address) {
            Some((entity, is_contract)) => (entity.as_deref(), *is_contract),
            None => (None, false),
        };
        if cfg.exclude_contract_addresses && is_contract {
            continue;
        }
        let key = if clustering {
            entity.unwrap_or(address)
        } else {
            address
        };
        *aggregated.entry(key.to_string()).or_insert(Decimal::ZERO) += balance;
    }

    db::set_circulation(&tx, snapshot_id, &full_circulation)?;
    tx.commit()?;

    let mut balances: Vec<f64> = aggregated
        .into_values()
        .map(|b| b.to_f64().unwrap_or(0.0))
        .filter(|b| *b > threshold)
        .collect();
    balances.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    balances.truncate(cfg.top_limit.keep(balances.len()));
    let circulation = balances.iter().sum();

    Ok(Distribution {
        balances,
        circulation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TopLimit;
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
            metrics: vec!["gini".to_string()],
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

    fn write_raw(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn open_db(cfg: &Config) -> Connection {
        let conn = db::connect(&cfg.db_path).unwrap();
        db::run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn aggregates_and_sorts_descending() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,3\nc,2\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![3.0, 2.0, 1.0]);
        assert_eq!(dist.circulation, 6.0);
    }

    #[test]
    fn special_addresses_are_dropped() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let special_dir = cfg.mapping_info_dir.join("special_addresses");
        std::fs::create_dir_all(&special_dir).unwrap();
        let mut f = File::create(special_dir.join("bitcoin.json")).unwrap();
        f.write_all(br#"[{"address": "burn"}]"#).unwrap();

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nburn,100\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![1.0]);

        // The audit trail excludes them too.
        let ledger_id = db::get_ledger_id(&conn, "bitcoin").unwrap().unwrap();
        let snapshot_id = db::get_snapshot_id(&conn, ledger_id, "2021-01-01").unwrap().unwrap();
        assert_eq!(db::get_circulation(&conn, snapshot_id).unwrap(), Some(Decimal::from(1)));
    }

    #[test]
    fn clustering_aggregates_mapped_addresses() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.clustering_sources = vec!["explorers".to_string()];
        let mut conn = open_db(&cfg);

        let ledger_id = db::get_or_create_ledger(&conn, "bitcoin").unwrap();
        let entity = db::get_or_create_entity(&conn, ledger_id, "exchange").unwrap();
        db::set_address_entity(&conn, ledger_id, "a", entity, false).unwrap();
        db::set_address_entity(&conn, ledger_id, "b", entity, false).unwrap();

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,3\nc,2\n");
        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        // a and b collapse into one entity holding 4; c stays itself.
        assert_eq!(dist.balances, vec![4.0, 2.0]);
        assert_eq!(dist.circulation, 6.0);
    }

    #[test]
    fn clustering_disabled_keeps_addresses_separate() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let mut conn = open_db(&cfg);

        let ledger_id = db::get_or_create_ledger(&conn, "bitcoin").unwrap();
        let entity = db::get_or_create_entity(&conn, ledger_id, "exchange").unwrap();
        db::set_address_entity(&conn, ledger_id, "a", entity, false).unwrap();
        db::set_address_entity(&conn, ledger_id, "b", entity, false).unwrap();

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,3\n");
        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![3.0, 1.0]);
    }

    #[test]
    fn contract_addresses_are_excluded_when_flagged() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.exclude_contract_addresses = true;
        let mut conn = open_db(&cfg);

        let ledger_id = db::get_or_create_ledger(&conn, "bitcoin").unwrap();
        let entity = db::get_or_create_entity(&conn, ledger_id, "dex").unwrap();
        db::set_address_entity(&conn, ledger_id, "pool", entity, true).unwrap();

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\npool,50\n");
        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![1.0]);
        assert_eq!(dist.circulation, 1.0);
    }

    #[test]
    fn fee_threshold_excludes_strictly() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.exclude_below_fees = true;
        let fee_dir = cfg.tx_fees_dir.join("bitcoin");
        std::fs::create_dir_all(&fee_dir).unwrap();
        let mut f = File::create(fee_dir.join("median_tx_fees_day.json")).unwrap();
        f.write_all(br#"{"2021-01-01": 2}"#).unwrap();

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,2\nc,3\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        // Strictly greater than the threshold: the entry equal to it drops.
        assert_eq!(dist.balances, vec![3.0]);
        assert_eq!(dist.circulation, 3.0);
    }

    #[test]
    fn top_limit_truncates_after_sorting() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.top_limit = TopLimit::Absolute(2);

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,4\nc,2\nd,3\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![4.0, 3.0]);
        // Circulation is recomputed over only the kept entries.
        assert_eq!(dist.circulation, 7.0);
    }

    #[test]
    fn percentage_limit_floors() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.top_limit = TopLimit::Percentage(0.5);

        let raw = write_raw(&dir, "raw.csv", "address,balance\na,1\nb,4\nc,2\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![4.0]);
        assert_eq!(dist.circulation, 4.0);
    }

    #[test]
    fn ethereum_balances_are_divided_to_gwei() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let raw = write_raw(&dir, "raw.csv", "address,balance\na,2000000000\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "ethereum", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![2.0]);
    }

    #[test]
    fn usd_cent_threshold_uses_price_and_denomination() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.exclude_below_usd_cent = true;
        std::fs::create_dir_all(&cfg.price_data_dir).unwrap();
        // 1 BTC = 10000 USD: one cent is 100000 satoshi.
        let mut f = File::create(cfg.price_data_dir.join("bitcoin-USD.csv")).unwrap();
        f.write_all(b"2021-01-01,10000\n").unwrap();

        let raw =
            write_raw(&dir, "raw.csv", "address,balance\na,100000\nb,100001\nc,5000000\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![5000000.0, 100001.0]);
    }

    #[test]
    fn extra_middle_columns_are_ignored() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let raw = write_raw(&dir, "raw.csv", "address,kind,balance\na,p2pkh,7\n");
        let mut conn = open_db(&cfg);

        let dist = get_entries(&cfg, &mut conn, "bitcoin", "2021-01-01", &raw).unwrap();
        assert_eq!(dist.balances, vec![7.0]);
    }
}
