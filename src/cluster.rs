use crate::config::Config;
use crate::db;
use crate::models::MappingRecord;
use eyre::{eyre, Result, WrapErr};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MappingError {
    /// One address resolves to two different entities after clustering; the
    /// alias sources are corrupt and this ledger's mapping step must abort.
    #[error("address {address} associated with two entities: {first} and {second}")]
    InconsistentEntity {
        address: String,
        first: String,
        second: String,
    },
}

/// Disjoint-set over entity names, with path compression and union by size.
struct UnionFind {
    parent: HashMap<String, String>,
    size: HashMap<String, usize>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: HashMap::new(),
            size: HashMap::new(),
        }
    }

    fn insert(&mut self, name: &str) {
        if !self.parent.contains_key(name) {
            self.parent.insert(name.to_string(), name.to_string());
            self.size.insert(name.to_string(), 1);
        }
    }

    fn find(&mut self, name: &str) -> String {
        let mut root = name.to_string();
        while self.parent[&root] != root {
            root = self.parent[&root].clone();
        }
        // Path compression: point the whole chain at the root.
        let mut current = name.to_string();
        while current != root {
            let next = self.parent[&current].clone();
            self.parent.insert(current, root.clone());
            current = next;
        }
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        self.insert(a);
        self.insert(b);
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        let (small, large) = if self.size[&root_a] < self.size[&root_b] {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        let small_size = self.size[&small];
        if let Some(size) = self.size.get_mut(&large) {
            *size += small_size;
        }
        self.parent.insert(small, large);
    }

    fn members(&self) -> impl Iterator<Item = &String> {
        self.parent.keys()
    }
}

/// Record one address -> entity binding for the current run. Returns false
/// when the binding already exists (a repeat record, skip it); errors when
/// the address was already bound to a different entity.
fn bind_address(
    resolved: &mut HashMap<String, String>,
    address: &str,
    entity: &str,
) -> Result<bool, MappingError> {
    match resolved.get(address) {
        Some(previous) if previous == entity => Ok(false),
        Some(previous) => Err(MappingError::InconsistentEntity {
            address: address.to_string(),
            first: previous.clone(),
            second: entity.to_string(),
        }),
        None => {
            resolved.insert(address.to_string(), entity.to_string());
            Ok(true)
        }
    }
}

fn mapping_file(cfg: &Config, ledger: &str) -> PathBuf {
    cfg.mapping_info_dir.join("addresses").join(format!("{ledger}.jsonl"))
}

/// Alias sources active for this run: the union of the source lists that the
/// configured keywords select in sources.json.
pub fn active_sources(cfg: &Config) -> Result<HashSet<String>> {
    let path = cfg.mapping_info_dir.join("sources.json");
    let file = File::open(&path).wrap_err_with(|| format!("cannot open {}", path.display()))?;
    let keyword_sources: HashMap<String, Vec<String>> = serde_json::from_reader(file)?;

    let mut active = HashSet::new();
    for keyword in &cfg.clustering_sources {
        let sources = keyword_sources
            .get(keyword)
            .ok_or_else(|| eyre!("unknown clustering source keyword {keyword:?}"))?;
        active.extend(sources.iter().cloned());
    }
    Ok(active)
}

fn read_records(path: &Path) -> Result<impl Iterator<Item = Result<MappingRecord>>> {
    let file = File::open(path).wrap_err_with(|| format!("cannot open {}", path.display()))?;
    Ok(BufReader::new(file).lines().map(|line| {
        let line = line?;
        serde_json::from_str::<MappingRecord>(&line)
            .wrap_err_with(|| format!("malformed mapping record: {line}"))
    }))
}

/// Build the entity -> cluster-label mapping for a ledger from its alias
/// file.
///
/// Two streaming passes: the first finds addresses referenced by more than
/// one alias record (holding only the address set in memory), the second
/// collects the entities those addresses link, restricted to active sources.
/// Entities linked by a shared address are merged transitively; each merged
/// group gets a synthetic label that cannot collide with real entity names.
pub fn build_clusters(cfg: &Config, ledger: &str) -> Result<HashMap<String, String>> {
    let path = mapping_file(cfg, ledger);
    let active = active_sources(cfg)?;

    let mut seen = HashSet::new();
    let mut multi_record_addresses = HashSet::new();
    for record in read_records(&path)? {
        let record = record?;
        if !seen.insert(record.address.clone()) {
            multi_record_addresses.insert(record.address);
        }
    }
    drop(seen);

    let mut address_entities: HashMap<String, HashSet<String>> = HashMap::new();
    for record in read_records(&path)? {
        let record = record?;
        if multi_record_addresses.contains(&record.address) && active.contains(&record.source) {
            address_entities.entry(record.address).or_default().insert(record.name);
        }
    }
    drop(multi_record_addresses);

    let mut uf = UnionFind::new();
    for entities in address_entities.values() {
        let mut iter = entities.iter();
        if let Some(first) = iter.next() {
            uf.insert(first);
            for entity in iter {
                uf.union(first, entity);
            }
        }
    }
    drop(address_entities);

    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    let members: Vec<String> = uf.members().cloned().collect();
    for entity in members {
        let root = uf.find(&entity);
        groups.entry(root).or_default().push(entity);
    }

    // Number clusters deterministically by their smallest member name.
    let mut clusters: Vec<Vec<String>> = groups.into_values().collect();
    for members in &mut clusters {
        members.sort();
    }
    clusters.sort();

    let mut cluster_mapping = HashMap::new();
    for (idx, members) in clusters.into_iter().enumerate() {
        let label = format!("-++-{}-++-", idx + 1);
        for entity in members {
            cluster_mapping.insert(entity, label.clone());
        }
    }
    Ok(cluster_mapping)
}

/// Stream a ledger's alias records and persist `(address, resolved entity,
/// is_contract)` rows. The per-ledger mapping must be a function after
/// cluster resolution: an address resolving to two different entities within
/// one run aborts the step (and rolls the transaction back). Re-running with
/// identical data is a no-op; a later import with changed data overwrites.
pub fn apply_mapping(cfg: &Config, conn: &mut Connection, ledger: &str) -> Result<()> {
    let path = mapping_file(cfg, ledger);
    if !path.is_file() {
        warn!("No mapping file for {}, skipping mapping", ledger);
        return Ok(());
    }

    info!("Mapping {}", ledger);
    let clusters = build_clusters(cfg, ledger)?;
    let active = active_sources(cfg)?;

    let tx = conn.transaction()?;
    let ledger_id = db::get_or_create_ledger(&tx, ledger)?;

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut inserted = 0usize;
    for record in read_records(&path)? {
        let record = record?;
        if !active.contains(&record.source) {
            continue;
        }
        let entity = clusters.get(&record.name).cloned().unwrap_or(record.name);

        if !bind_address(&mut resolved, &record.address, &entity)? {
            continue;
        }

        let entity_id = db::get_or_create_entity(&tx, ledger_id, &entity)?;
        db::set_address_entity(&tx, ledger_id, &record.address, entity_id, record.is_contract)?;
        inserted += 1;
    }
    tx.commit()?;

    info!("Mapped {} addresses for {}", inserted, ledger);
    Ok(())
}
