// src/models.rs
use serde::Deserialize;

/// One line of a ledger's alias file (JSON Lines).
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRecord {
    pub address: String,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub is_contract: bool,
}

/// Entry of a ledger's special-addresses file (burn/foundation/vesting
/// addresses that are excluded unconditionally).
#[derive(Debug, Deserialize)]
pub struct SpecialAddress {
    pub address: String,
}

/// Cap restricting the analysis to the largest holders only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TopLimit {
    None,
    /// Keep at most this many leading entries.
    Absolute(u64),
    /// Keep the leading `floor(n * fraction)` entries; fraction in [0, 1].
    Percentage(f64),
}

impl TopLimit {
    /// Number of leading entries to keep out of `total`.
    pub fn keep(&self, total: usize) -> usize {
        match *self {
            TopLimit::None => total,
            TopLimit::Absolute(k) => total.min(k as usize),
            TopLimit::Percentage(f) => (total as f64 * f) as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Granularity> {
        match s {
            "day" => Some(Granularity::Day),
            "week" => Some(Granularity::Week),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

/// The exact combination of active flags a metric value was computed under.
///
/// Serves as the structured cache key: `qualified_name` renders it
/// deterministically into the stored metric name, so two different flag
/// combinations can never collide in the metrics table.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSet {
    pub clustering: bool,
    pub exclude_contracts: bool,
    pub exclude_below_fees: bool,
    pub exclude_below_usd_cent: bool,
    pub top_limit: TopLimit,
}

impl FlagSet {
    pub fn qualified_name(&self, metric: &str) -> String {
        let mut name = metric.to_string();
        if !self.clustering {
            name = format!("non-clustered {name}");
        }
        if self.exclude_contracts {
            name = format!("exclude_contracts {name}");
        }
        if self.exclude_below_fees {
            name = format!("exclude_below_fees {name}");
        }
        if self.exclude_below_usd_cent {
            name = format!("exclude_below_usd_cent {name}");
        }
        match self.top_limit {
            TopLimit::Absolute(v) => name = format!("top-{v}_absolute {name}"),
            TopLimit::Percentage(v) => name = format!("top-{v}_percentage {name}"),
            TopLimit::None => {}
        }
        name
    }
}

/// One line of the output csv: metric values in configured order.
#[derive(Debug)]
pub struct OutputRow {
    pub ledger: String,
    pub date: String,
    pub values: Vec<String>,
}
