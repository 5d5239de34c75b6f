use eyre::Result;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ledgers (
  id   INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
  id        INTEGER PRIMARY KEY AUTOINCREMENT,
  name      TEXT NOT NULL,
  ledger_id INTEGER NOT NULL REFERENCES ledgers (id),
  UNIQUE(name, ledger_id)
);

CREATE TABLE IF NOT EXISTS addresses (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  name        TEXT NOT NULL,
  ledger_id   INTEGER NOT NULL REFERENCES ledgers (id),
  entity_id   INTEGER REFERENCES entities (id),
  is_contract INTEGER NOT NULL DEFAULT 0,
  UNIQUE(name, ledger_id)
);

CREATE TABLE IF NOT EXISTS snapshots (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  name        TEXT NOT NULL,
  ledger_id   INTEGER NOT NULL REFERENCES ledgers (id),
  circulation TEXT, -- Decimal stored as string
  UNIQUE(ledger_id, name)
);

CREATE TABLE IF NOT EXISTS balances (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  balance     TEXT NOT NULL, -- Decimal stored as string
  snapshot_id INTEGER NOT NULL REFERENCES snapshots (id),
  address_id  INTEGER NOT NULL REFERENCES addresses (id),
  UNIQUE(address_id, snapshot_id)
);

CREATE TABLE IF NOT EXISTS metrics (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  name        TEXT NOT NULL,
  value       REAL,
  snapshot_id INTEGER NOT NULL REFERENCES snapshots (id),
  UNIQUE(name, snapshot_id)
);
"#;

/// Connect to SQLite (WAL mode, busy timeout for concurrent workers)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

pub fn get_or_create_ledger(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT OR IGNORE INTO ledgers(name) VALUES (?1)", params![name])?;
    let id = conn.query_row("SELECT id FROM ledgers WHERE name=?1", params![name], |r| r.get(0))?;
    Ok(id)
}

pub fn get_ledger_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT id FROM ledgers WHERE name=?1", params![name], |r| r.get(0))
        .optional()?;
    Ok(id)
}

pub fn get_or_create_entity(conn: &Connection, ledger_id: i64, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO entities(name, ledger_id) VALUES (?1, ?2)",
        params![name, ledger_id],
    )?;
    let id = conn.query_row(
        "SELECT id FROM entities WHERE name=?1 AND ledger_id=?2",
        params![name, ledger_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn get_or_create_address(conn: &Connection, ledger_id: i64, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO addresses(name, ledger_id) VALUES (?1, ?2)",
        params![name, ledger_id],
    )?;
    let id = conn.query_row(
        "SELECT id FROM addresses WHERE name=?1 AND ledger_id=?2",
        params![name, ledger_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Bind an address to an entity, overwriting any previous linkage and
/// contract flag (later imports win).
pub fn set_address_entity(
    conn: &Connection,
    ledger_id: i64,
    address: &str,
    entity_id: i64,
    is_contract: bool,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO addresses (name, ledger_id, entity_id, is_contract)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(name, ledger_id) DO UPDATE SET
            entity_id   = excluded.entity_id,
            is_contract = excluded.is_contract
        "#,
        params![address, ledger_id, entity_id, is_contract],
    )?;
    Ok(())
}

pub fn get_or_create_snapshot(conn: &Connection, ledger_id: i64, date: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO snapshots(name, ledger_id) VALUES (?1, ?2)",
        params![date, ledger_id],
    )?;
    let id = conn.query_row(
        "SELECT id FROM snapshots WHERE ledger_id=?1 AND name=?2",
        params![ledger_id, date],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn get_snapshot_id(conn: &Connection, ledger_id: i64, date: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM snapshots WHERE ledger_id=?1 AND name=?2",
            params![ledger_id, date],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn set_circulation(conn: &Connection, snapshot_id: i64, circulation: &Decimal) -> Result<()> {
    conn.execute(
        "UPDATE snapshots SET circulation=?1 WHERE id=?2",
        params![circulation.to_string(), snapshot_id],
    )?;
    Ok(())
}

/// Insert or update one address balance for a snapshot. Re-imports overwrite
/// in place, never double-count.
pub fn upsert_balance(
    conn: &Connection,
    snapshot_id: i64,
    address_id: i64,
    balance: &Decimal,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO balances (balance, snapshot_id, address_id)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(address_id, snapshot_id) DO UPDATE SET
            balance = excluded.balance
        "#,
        params![balance.to_string(), snapshot_id, address_id],
    )?;
    Ok(())
}

/// Insert or update a metric value for a snapshot
pub fn upsert_metric(conn: &Connection, snapshot_id: i64, name: &str, value: f64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO metrics (name, value, snapshot_id)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(name, snapshot_id) DO UPDATE SET
            value = excluded.value
        "#,
        params![name, value, snapshot_id],
    )?;
    Ok(())
}

pub fn get_metric(conn: &Connection, snapshot_id: i64, name: &str) -> Result<Option<f64>> {
    let value = conn
        .query_row(
            "SELECT value FROM metrics WHERE snapshot_id=?1 AND name=?2",
            params![snapshot_id, name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Full address resolution table for a ledger: address -> (entity, contract).
/// Addresses with no mapping row resolve to themselves upstream.
pub fn load_mapping(
    conn: &Connection,
    ledger_id: i64,
) -> Result<HashMap<String, (Option<String>, bool)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT addresses.name, entities.name, addresses.is_contract
        FROM addresses
        LEFT JOIN entities ON addresses.entity_id = entities.id
        WHERE addresses.ledger_id = ?1
          AND (addresses.entity_id IS NOT NULL OR addresses.is_contract != 0)
        "#,
    )?;
    let rows = stmt.query_map(params![ledger_id], |r| {
        Ok((r.get::<_, String>(0)?, (r.get::<_, Option<String>>(1)?, r.get::<_, bool>(2)?)))
    })?;

    let mut mapping = HashMap::new();
    for row in rows {
        let (address, info) = row?;
        mapping.insert(address, info);
    }
    Ok(mapping)
}

/// Number of addresses already linked to an entity for a ledger; zero means
/// the mapping has not been applied yet.
pub fn mapped_address_count(conn: &Connection, ledger: &str) -> Result<i64> {
    let count = conn.query_row(
        r#"
        SELECT COUNT(*)
        FROM addresses
        JOIN ledgers ON addresses.ledger_id = ledgers.id
        WHERE ledgers.name = ?1 AND addresses.entity_id IS NOT NULL
        "#,
        params![ledger],
        |r| r.get(0),
    )?;
    Ok(count)
}

pub fn get_circulation(conn: &Connection, snapshot_id: i64) -> Result<Option<Decimal>> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT circulation FROM snapshots WHERE id=?1",
            params![snapshot_id],
            |r| r.get(0),
        )
        .optional()?;
    match raw.flatten() {
        Some(s) => Ok(Some(Decimal::from_str(&s).map_err(eyre::Report::from)?)),
        None => Ok(None),
    }
}
