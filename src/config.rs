use crate::models::{FlagSet, Granularity, TopLimit};
use chrono::{Datelike, Duration, Months, NaiveDate};
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::path::PathBuf;

const KNOWN_METRICS: &[&str] = &[
    "gini",
    "hhi",
    "shannon_entropy",
    "theil_index",
    "max_power_ratio",
    "total_entities",
];

/// Everything the batch run needs, built once at startup and passed by
/// reference into the resolver, aggregator and orchestrator. Malformed values
/// are fatal here, never at compute time.
#[derive(Debug, Clone)]
pub struct Config {
    pub ledgers: Vec<String>,
    pub snapshot_dates: Vec<String>,
    pub granularity: Option<Granularity>,
    pub clustering_sources: Vec<String>,
    pub exclude_contract_addresses: bool,
    pub exclude_below_fees: bool,
    pub exclude_below_usd_cent: bool,
    pub top_limit: TopLimit,
    pub metrics: Vec<String>,
    pub force_map: bool,
    pub force_compute: bool,
    pub db_path: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mapping_info_dir: PathBuf,
    pub tx_fees_dir: PathBuf,
    pub price_data_dir: PathBuf,
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let ledgers = csv_list(&env::var("LEDGERS").unwrap_or_else(|_| "bitcoin".to_string()));
    if ledgers.is_empty() {
        return Err(eyre!("LEDGERS must name at least one ledger"));
    }

    let mut snapshot_dates =
        csv_list(&env::var("SNAPSHOT_DATES").map_err(|_| eyre!("SNAPSHOT_DATES not set"))?);
    if snapshot_dates.is_empty() {
        return Err(eyre!("SNAPSHOT_DATES must name at least one date"));
    }
    snapshot_dates.sort();
    for date in &snapshot_dates {
        date_beginning(date).wrap_err_with(|| format!("malformed snapshot date {date:?}"))?;
    }

    let granularity = match env::var("GRANULARITY").ok().filter(|s| !s.is_empty()) {
        Some(s) => Some(Granularity::parse(&s).ok_or_else(|| {
            eyre!("malformed GRANULARITY {s:?}; should be one of: day, week, month, year")
        })?),
        None => None,
    };

    let clustering_sources = csv_list(&env::var("CLUSTERING_SOURCES").unwrap_or_default());

    let top_limit = load_top_limit()?;

    let metrics = csv_list(&env::var("METRICS").unwrap_or_else(|_| {
        "gini,hhi,shannon_entropy,theil_index,max_power_ratio,total_entities,tau=0.33,tau=0.5,tau=0.66"
            .to_string()
    }));
    if metrics.is_empty() {
        return Err(eyre!("METRICS must name at least one metric"));
    }
    for metric in &metrics {
        validate_metric(metric)?;
    }

    let cfg = Config {
        ledgers,
        snapshot_dates,
        granularity,
        clustering_sources,
        exclude_contract_addresses: env_flag("EXCLUDE_CONTRACT_ADDRESSES")?,
        exclude_below_fees: env_flag("EXCLUDE_BELOW_FEES")?,
        exclude_below_usd_cent: env_flag("EXCLUDE_BELOW_USD_CENT")?,
        top_limit,
        metrics,
        force_map: env_flag("FORCE_MAP")?,
        force_compute: env_flag("FORCE_COMPUTE")?,
        db_path: env::var("DATABASE_URL").unwrap_or_else(|_| "concentration.db".to_string()),
        input_dir: env_dir("INPUT_DIR", "input"),
        output_dir: env_dir("OUTPUT_DIR", "output"),
        mapping_info_dir: env_dir("MAPPING_INFO_DIR", "mapping_information"),
        tx_fees_dir: env_dir("TX_FEES_DIR", "tx_fees"),
        price_data_dir: env_dir("PRICE_DATA_DIR", "price_data"),
    };

    Ok(cfg)
}

impl Config {
    /// Clustering is on whenever at least one alias source is active.
    pub fn clustering_enabled(&self) -> bool {
        !self.clustering_sources.is_empty()
    }

    pub fn flag_set(&self) -> FlagSet {
        FlagSet {
            clustering: self.clustering_enabled(),
            exclude_contracts: self.exclude_contract_addresses,
            exclude_below_fees: self.exclude_below_fees,
            exclude_below_usd_cent: self.exclude_below_usd_cent,
            top_limit: self.top_limit,
        }
    }

    /// Snapshot dates to analyze: the configured dates normalized to their
    /// first day, or, with a granularity set, every granularity step between
    /// the beginning of the first date and the end of the last.
    pub fn expanded_snapshot_dates(&self) -> Result<Vec<String>> {
        match self.granularity {
            None => self
                .snapshot_dates
                .iter()
                .map(|d| date_beginning(d).map(|nd| nd.format("%Y-%m-%d").to_string()))
                .collect(),
            Some(granularity) => {
                let (first, last) = match (self.snapshot_dates.first(), self.snapshot_dates.last())
                {
                    (Some(first), Some(last)) => (first, last),
                    _ => return Err(eyre!("SNAPSHOT_DATES must name at least one date")),
                };
                let start = date_beginning(first)?;
                let end = date_end(last)?;
                dates_between(start, end, granularity)
            }
        }
    }

    /// Output file whose name encodes the active non-default flags, so runs
    /// with different configurations never clobber each other.
    pub fn output_filename(&self) -> PathBuf {
        let mut name = String::from("output");
        if self.exclude_contract_addresses {
            name.push_str("-exclude_contract_addresses");
        }
        match self.top_limit {
            TopLimit::Absolute(v) => name.push_str(&format!("-absolute_{v}")),
            TopLimit::Percentage(v) => name.push_str(&format!("-percentage_{v}")),
            TopLimit::None => {}
        }
        if self.exclude_below_fees {
            name.push_str("-exclude_below_fees");
        }
        if self.exclude_below_usd_cent {
            name.push_str("-exclude_below_usd_cent");
        }
        name.push_str(".csv");
        self.output_dir.join(name)
    }
}

fn load_top_limit() -> Result<TopLimit> {
    let limit_type = env::var("TOP_LIMIT_TYPE").unwrap_or_else(|_| "absolute".to_string());
    let raw_value = env::var("TOP_LIMIT_VALUE").unwrap_or_else(|_| "0".to_string());
    match limit_type.as_str() {
        "absolute" => {
            let value: i64 = raw_value
                .parse()
                .map_err(|_| eyre!("malformed TOP_LIMIT_VALUE {raw_value:?}"))?;
            if value < 0 {
                return Err(eyre!("malformed TOP_LIMIT_VALUE; should be non-negative"));
            }
            if value == 0 {
                Ok(TopLimit::None)
            } else {
                Ok(TopLimit::Absolute(value as u64))
            }
        }
        "percentage" => {
            let value: f64 = raw_value
                .parse()
                .map_err(|_| eyre!("malformed TOP_LIMIT_VALUE {raw_value:?}"))?;
            if !(0.0..=1.0).contains(&value) {
                return Err(eyre!("malformed TOP_LIMIT_VALUE; should be in [0, 1]"));
            }
            if value == 0.0 {
                Ok(TopLimit::None)
            } else {
                Ok(TopLimit::Percentage(value))
            }
        }
        other => Err(eyre!(
            "malformed TOP_LIMIT_TYPE {other:?}; should be \"absolute\" or \"percentage\""
        )),
    }
}

fn validate_metric(metric: &str) -> Result<()> {
    if KNOWN_METRICS.contains(&metric) {
        return Ok(());
    }
    if let Some(raw) = metric.strip_prefix("tau=") {
        let threshold: f64 = raw
            .parse()
            .map_err(|_| eyre!("malformed tau threshold in metric {metric:?}"))?;
        if threshold > 0.0 && threshold <= 1.0 {
            return Ok(());
        }
        return Err(eyre!("tau threshold in {metric:?} should be in (0, 1]"));
    }
    Err(eyre!("unknown metric {metric:?}"))
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_flag(key: &str) -> Result<bool> {
    match env::var(key) {
        Err(_) => Ok(false),
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" | "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            other => Err(eyre!("malformed {key} {other:?}; should be a boolean")),
        },
    }
}

fn env_dir(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

/// First day covered by a YYYY, YYYY-MM or YYYY-MM-DD date string.
pub fn date_beginning(date: &str) -> Result<NaiveDate> {
    let padded = match date.len() {
        4 => format!("{date}-01-01"),
        7 => format!("{date}-01"),
        _ => date.to_string(),
    };
    NaiveDate::parse_from_str(&padded, "%Y-%m-%d")
        .map_err(|_| eyre!("invalid date {date:?}; use YYYY-MM-DD (day and month can be omitted)"))
}

/// Last day covered by a YYYY, YYYY-MM or YYYY-MM-DD date string.
pub fn date_end(date: &str) -> Result<NaiveDate> {
    if date.len() == 10 {
        return date_beginning(date);
    }
    let with_month = if date.len() == 4 {
        format!("{date}-12")
    } else {
        date.to_string()
    };
    let first = date_beginning(&with_month)?;
    let next_month = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| eyre!("date out of range: {date:?}"))?;
    Ok(next_month - Duration::days(1))
}

/// Dates between start and end (inclusive of start; end only if a step lands
/// on it), stepped by the given granularity, in YYYY-MM-DD format.
pub fn dates_between(
    start: NaiveDate,
    end: NaiveDate,
    granularity: Granularity,
) -> Result<Vec<String>> {
    if end < start {
        return Err(eyre!("invalid start/end dates: {start} / {end}"));
    }
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current.format("%Y-%m-%d").to_string());
        current = match granularity {
            Granularity::Day => current + Duration::days(1),
            Granularity::Week => current + Duration::weeks(1),
            Granularity::Month => current
                .checked_add_months(Months::new(1))
                .ok_or_else(|| eyre!("date out of range past {current}"))?,
            Granularity::Year => current
                .checked_add_months(Months::new(12))
                .ok_or_else(|| eyre!("date out of range past {current}"))?,
        };
    }
    Ok(dates)
}

/// Date key used for median-fee lookups: the snapshot date truncated to the
/// run's granularity.
pub fn fee_lookup_date(date: &str, granularity: Option<Granularity>) -> String {
    match granularity {
        Some(Granularity::Year) => date[..4].to_string(),
        Some(Granularity::Month) => date[..7].to_string(),
        Some(Granularity::Week) => match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(d) => {
                let monday = d - Duration::days(d.weekday().num_days_from_monday() as i64);
                monday.format("%Y-%m-%d").to_string()
            }
            Err(_) => date.to_string(),
        },
        Some(Granularity::Day) | None => date.to_string(),
    }
}
