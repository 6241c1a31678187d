//! SQLite persistence for the Control Plane Server (spec.md §4.9).
//!
//! Four tables, exactly as named in spec.md: `parties`, `peers`, `relays`,
//! `auth_tokens`. Queries go through `sqlx`'s runtime-checked `query`/
//! `query_as` builders rather than the `query!` compile-time macros, since
//! those require a live database at build time.

use chrono::{DateTime, Utc};
use meshnet_model::{Endpoint, NatClass, PartyId, Peer, PeerId, RelayRecord};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

pub async fn connect(database_url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS parties (
            party_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            host_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS peers (
            peer_id TEXT PRIMARY KEY,
            party_id TEXT NOT NULL REFERENCES parties(party_id),
            name TEXT NOT NULL,
            tunnel_public_key TEXT NOT NULL,
            virtual_address TEXT,
            reflexive_ip TEXT,
            reflexive_port INTEGER,
            local_ip TEXT,
            local_port INTEGER,
            nat_class TEXT NOT NULL,
            last_seen TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_peers_party_id ON peers(party_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS relays (
            relay_id TEXT PRIMARY KEY,
            public_ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            region TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            registered_at TEXT NOT NULL,
            last_seen TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS auth_tokens (
            token TEXT PRIMARY KEY,
            peer_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_tokens_expires_at ON auth_tokens(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("stored row has a malformed {0}")]
    Malformed(&'static str),
}

fn parse_ip(value: &str) -> Result<IpAddr, RowError> {
    IpAddr::from_str(value).map_err(|_| RowError::Malformed("ip address"))
}

fn nat_class_to_column(class: NatClass) -> &'static str {
    match class {
        NatClass::Open => "open",
        NatClass::FullCone => "full_cone",
        NatClass::RestrictedCone => "restricted_cone",
        NatClass::PortRestrictedCone => "port_restricted_cone",
        NatClass::Symmetric => "symmetric",
        NatClass::Unknown => "unknown",
    }
}

fn nat_class_from_column(value: &str) -> Result<NatClass, RowError> {
    match value {
        "open" => Ok(NatClass::Open),
        "full_cone" => Ok(NatClass::FullCone),
        "restricted_cone" => Ok(NatClass::RestrictedCone),
        "port_restricted_cone" => Ok(NatClass::PortRestrictedCone),
        "symmetric" => Ok(NatClass::Symmetric),
        "unknown" => Ok(NatClass::Unknown),
        _ => Err(RowError::Malformed("nat_class")),
    }
}

fn peer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Peer, RowError> {
    let peer_id: String = row.get("peer_id");
    let party_id: String = row.get("party_id");
    let reflexive_ip: Option<String> = row.get("reflexive_ip");
    let reflexive_port: Option<i64> = row.get("reflexive_port");
    let local_ip: Option<String> = row.get("local_ip");
    let local_port: Option<i64> = row.get("local_port");
    let nat_class: String = row.get("nat_class");

    Ok(Peer {
        peer_id: peer_id.parse().map_err(|_| RowError::Malformed("peer_id"))?,
        name: row.get("name"),
        public_key: row
            .get::<String, _>("tunnel_public_key")
            .parse()
            .map_err(|_| RowError::Malformed("tunnel_public_key"))?,
        nat_class: nat_class_from_column(&nat_class)?,
        reflexive_endpoint: match (reflexive_ip, reflexive_port) {
            (Some(ip), Some(port)) => Some(Endpoint::new(parse_ip(&ip)?, port as u16)),
            _ => None,
        },
        declared_local_endpoint: match (local_ip, local_port) {
            (Some(ip), Some(port)) => Some(Endpoint::new(parse_ip(&ip)?, port as u16)),
            _ => None,
        },
        last_seen: row.get("last_seen"),
        party_id: party_id.parse().map_err(|_| RowError::Malformed("party_id"))?,
    })
}

pub async fn insert_token(
    pool: &SqlitePool,
    token: &str,
    peer_id: PeerId,
    ttl: Duration,
) -> sqlx::Result<DateTime<Utc>> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));

    sqlx::query("INSERT INTO auth_tokens (token, peer_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(token)
        .bind(peer_id.to_string())
        .bind(now)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(expires_at)
}

/// Returns the token's associated peer, or `None` if the token is unknown
/// or expired.
pub async fn lookup_token(pool: &SqlitePool, token: &str) -> sqlx::Result<Option<PeerId>> {
    let row = sqlx::query("SELECT peer_id, expires_at FROM auth_tokens WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let expires_at: DateTime<Utc> = row.get("expires_at");
    if expires_at <= Utc::now() {
        return Ok(None);
    }

    let peer_id: String = row.get("peer_id");
    Ok(peer_id.parse().ok())
}

/// Creates a party and registers its host peer. Returns `false` without
/// writing anything if `party_id` or the host's `peer_id` already exists
/// (spec.md §6 "409 on host/party-uniqueness conflicts").
pub async fn create_party(pool: &SqlitePool, party_id: PartyId, name: &str, host: &Peer) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let party_exists: Option<String> = sqlx::query("SELECT party_id FROM parties WHERE party_id = ?")
        .bind(party_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("party_id"));

    if party_exists.is_some() || peer_id_exists(&mut tx, host.peer_id).await? {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query("INSERT INTO parties (party_id, name, host_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
        .bind(party_id.to_string())
        .bind(name)
        .bind(host.peer_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    insert_peer_in(&mut tx, host).await?;

    tx.commit().await?;
    Ok(true)
}

async fn peer_id_exists(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, peer_id: PeerId) -> sqlx::Result<bool> {
    let row: Option<String> = sqlx::query("SELECT peer_id FROM peers WHERE peer_id = ?")
        .bind(peer_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("peer_id"));
    Ok(row.is_some())
}

async fn insert_peer_in(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, peer: &Peer) -> sqlx::Result<()> {
    let reflexive = peer.reflexive_endpoint;
    let local = peer.declared_local_endpoint;

    sqlx::query(
        "INSERT INTO peers (peer_id, party_id, name, tunnel_public_key, virtual_address,
            reflexive_ip, reflexive_port, local_ip, local_port, nat_class, last_seen)
         VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(peer_id) DO UPDATE SET
            name = excluded.name,
            tunnel_public_key = excluded.tunnel_public_key,
            reflexive_ip = excluded.reflexive_ip,
            reflexive_port = excluded.reflexive_port,
            local_ip = excluded.local_ip,
            local_port = excluded.local_port,
            nat_class = excluded.nat_class,
            last_seen = excluded.last_seen",
    )
    .bind(peer.peer_id.to_string())
    .bind(peer.party_id.to_string())
    .bind(&peer.name)
    .bind(peer.public_key.to_string())
    .bind(reflexive.map(|e| e.ip.to_string()))
    .bind(reflexive.map(|e| e.port as i64))
    .bind(local.map(|e| e.ip.to_string()))
    .bind(local.map(|e| e.port as i64))
    .bind(nat_class_to_column(peer.nat_class))
    .bind(peer.last_seen)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Adds `peer` to its party. Returns `false` without writing anything if
/// `peer_id` is already registered (spec.md §7 "Conflict — duplicate party/
/// peer id on creation"); re-registration of an existing peer goes through
/// `heartbeat_peer` instead, not a second `join_party`.
pub async fn join_party(pool: &SqlitePool, peer: &Peer) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;

    if peer_id_exists(&mut tx, peer.peer_id).await? {
        tx.rollback().await?;
        return Ok(false);
    }

    insert_peer_in(&mut tx, peer).await?;
    sqlx::query("UPDATE parties SET updated_at = ? WHERE party_id = ?")
        .bind(Utc::now())
        .bind(peer.party_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

pub struct PartyRow {
    pub party_id: PartyId,
    pub name: String,
    pub host_peer_id: PeerId,
}

pub async fn get_party(pool: &SqlitePool, party_id: PartyId) -> sqlx::Result<Option<PartyRow>> {
    let row = sqlx::query("SELECT party_id, name, host_id FROM parties WHERE party_id = ?")
        .bind(party_id.to_string())
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(row) => {
            let host_id: String = row.get("host_id");
            Some(PartyRow {
                party_id,
                name: row.get("name"),
                host_peer_id: host_id.parse().unwrap_or_else(|_| PeerId::random()),
            })
        }
        None => None,
    })
}

pub async fn list_peers(pool: &SqlitePool, party_id: PartyId) -> Result<Vec<Peer>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM peers WHERE party_id = ?")
        .bind(party_id.to_string())
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .filter_map(|row| peer_from_row(row).ok())
        .collect())
}

pub async fn get_peer(pool: &SqlitePool, party_id: PartyId, peer_id: PeerId) -> sqlx::Result<Option<Peer>> {
    let row = sqlx::query("SELECT * FROM peers WHERE party_id = ? AND peer_id = ?")
        .bind(party_id.to_string())
        .bind(peer_id.to_string())
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|row| peer_from_row(&row).ok()))
}

/// Deletes a peer; if they were the host or the last peer in the party,
/// deletes the party too. Returns `true` if the peer existed.
pub async fn delete_peer(pool: &SqlitePool, party_id: PartyId, peer_id: PeerId) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("DELETE FROM peers WHERE party_id = ? AND peer_id = ?")
        .bind(party_id.to_string())
        .bind(peer_id.to_string())
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let party = sqlx::query("SELECT host_id FROM parties WHERE party_id = ?")
        .bind(party_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
    let remaining: i64 = sqlx::query("SELECT COUNT(*) AS count FROM peers WHERE party_id = ?")
        .bind(party_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("count");

    let was_host = party
        .map(|row| row.get::<String, _>("host_id") == peer_id.to_string())
        .unwrap_or(false);

    if was_host || remaining == 0 {
        sqlx::query("DELETE FROM peers WHERE party_id = ?")
            .bind(party_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM parties WHERE party_id = ?")
            .bind(party_id.to_string())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(true)
}

pub async fn heartbeat_peer(pool: &SqlitePool, party_id: PartyId, peer_id: PeerId) -> sqlx::Result<bool> {
    let result = sqlx::query("UPDATE peers SET last_seen = ? WHERE party_id = ? AND peer_id = ?")
        .bind(Utc::now())
        .bind(party_id.to_string())
        .bind(peer_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn upsert_relay(pool: &SqlitePool, record: &RelayRecord) -> sqlx::Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO relays (relay_id, public_ip, port, region, capacity, registered_at, last_seen)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(relay_id) DO UPDATE SET
            public_ip = excluded.public_ip,
            port = excluded.port,
            region = excluded.region,
            capacity = excluded.capacity,
            last_seen = excluded.last_seen",
    )
    .bind(&record.relay_id)
    .bind(record.public_endpoint.ip.to_string())
    .bind(record.public_endpoint.port as i64)
    .bind(&record.region)
    .bind(record.capacity as i64)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_relays(pool: &SqlitePool) -> sqlx::Result<Vec<RelayRecord>> {
    let rows = sqlx::query("SELECT * FROM relays").fetch_all(pool).await?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let public_ip: String = row.get("public_ip");
            let port: i64 = row.get("port");
            Some(RelayRecord {
                relay_id: row.get("relay_id"),
                public_endpoint: Endpoint::new(parse_ip(&public_ip).ok()?, port as u16),
                region: row.get("region"),
                capacity: row.get::<i64, _>("capacity") as u32,
                registered_at: row.get("registered_at"),
                last_heartbeat: row.get("last_seen"),
            })
        })
        .collect())
}

pub struct HealthCounts {
    pub parties: i64,
    pub peers: i64,
    pub relays: i64,
}

pub async fn health_counts(pool: &SqlitePool) -> sqlx::Result<HealthCounts> {
    let parties: i64 = sqlx::query("SELECT COUNT(*) AS count FROM parties")
        .fetch_one(pool)
        .await?
        .get("count");
    let peers: i64 = sqlx::query("SELECT COUNT(*) AS count FROM peers")
        .fetch_one(pool)
        .await?
        .get("count");
    let relays: i64 = sqlx::query("SELECT COUNT(*) AS count FROM relays")
        .fetch_one(pool)
        .await?
        .get("count");
    Ok(HealthCounts { parties, peers, relays })
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub stale_peers: u64,
    pub empty_parties: u64,
    pub expired_tokens: u64,
    pub stale_relays: u64,
}

/// Runs the periodic sweep described in spec.md §4.9: stale peers, then
/// empty parties, then expired tokens, then stale relays.
pub async fn cleanup(
    pool: &SqlitePool,
    peer_stale_after: Duration,
    relay_stale_after: Duration,
) -> sqlx::Result<CleanupReport> {
    let now = Utc::now();
    let peer_cutoff = now - chrono::Duration::from_std(peer_stale_after).unwrap_or(chrono::Duration::minutes(5));
    let relay_cutoff = now - chrono::Duration::from_std(relay_stale_after).unwrap_or(chrono::Duration::minutes(2));

    let mut tx = pool.begin().await?;

    let stale_peers = sqlx::query("DELETE FROM peers WHERE last_seen < ?")
        .bind(peer_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let empty_parties = sqlx::query(
        "DELETE FROM parties WHERE party_id NOT IN (SELECT DISTINCT party_id FROM peers)",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let expired_tokens = sqlx::query("DELETE FROM auth_tokens WHERE expires_at < ?")
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let stale_relays = sqlx::query("DELETE FROM relays WHERE last_seen < ?")
        .bind(relay_cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(CleanupReport {
        stale_peers,
        empty_parties,
        expired_tokens,
        stale_relays,
    })
}
