use crate::config::StorageConfig;
use crate::crdt::{self, DiffOptions};
use crate::error::{Error, Result};
use crate::storage::sql_utils::{placeholders, soul_and_fields};
use crate::storage::{GraphAdapter, SyncGraphAdapter};
use crate::types::{
    CHANGELOG_SOUL, GetOpts, GraphData, Node, PEERS_PREFIX, State, Value, iso_timestamp,
};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, error, info, trace, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Stored in `nodes.data` when the node's fields live in `wide_fields`.
const WIDE_NODE_MARKER: &[u8] = b"WIDE_NODE";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const FIELD_CHUNK: usize = 500;

/// Bytes of a node exactly as stored, used for before/after comparison.
#[derive(Debug, Clone, PartialEq)]
enum RawNode {
    Missing,
    Blob(Bytes),
    /// Per-field rows that were read (or are to be written) for a wide node.
    Wide(BTreeMap<String, Bytes>),
}

/// Row payload of one field of a wide node.
#[derive(Debug, Serialize, Deserialize)]
struct WideField {
    #[serde(rename = "stateVector")]
    state: State,
    value: Value,
}

/// SQLite reference engine.
///
/// Every write goes through an optimistic read-diff-verify-write cycle: the
/// raw bytes read before diffing are read again inside the write
/// transaction, and the cycle restarts when they differ.
pub struct SqliteAdapter {
    pool: DbPool,
    config: StorageConfig,
    diff_opts: DiffOptions,
}

impl SqliteAdapter {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig, diff_opts: DiffOptions) -> Result<Self> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = rusqlite::Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(1))
            .build(manager)?;

        debug!(path = ?path_ref, "Opened SQLite graph store");
        Ok(SqliteAdapter {
            pool,
            config: config.clone(),
            diff_opts,
        })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One row per soul: the serialized node, or the wide-node marker
            CREATE TABLE IF NOT EXISTS nodes (
                soul TEXT PRIMARY KEY,
                data BLOB NOT NULL
            ) WITHOUT ROWID;

            -- Fields of wide nodes, one row each: {"stateVector": n, "value": v}
            CREATE TABLE IF NOT EXISTS wide_fields (
                soul TEXT NOT NULL,
                field TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (soul, field)
            ) WITHOUT ROWID;
            "#,
        )?;

        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn is_wide(&self, soul: &str, field_count: usize, existing: &RawNode) -> bool {
        matches!(existing, RawNode::Wide(_))
            || soul == CHANGELOG_SOUL
            || soul.starts_with(PEERS_PREFIX)
            || field_count > self.config.wide_node_threshold
    }

    fn read_marker(conn: &Connection, soul: &str) -> Result<Option<Vec<u8>>> {
        Ok(conn
            .query_row(
                "SELECT data FROM nodes WHERE soul = ?1",
                params![soul],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Raw state of `soul`. For wide nodes only `fields` are read, or every
    /// field when `fields` is `None`.
    fn read_raw(&self, conn: &Connection, soul: &str, fields: Option<&[String]>) -> Result<RawNode> {
        let Some(data) = Self::read_marker(conn, soul)? else {
            return Ok(RawNode::Missing);
        };
        if data != WIDE_NODE_MARKER {
            return Ok(RawNode::Blob(Bytes::from(data)));
        }

        let rows = match fields {
            Some(fields) => Self::read_wide_fields(conn, soul, fields)?,
            None => Self::read_wide_range(conn, soul, None, None, -1)?,
        };
        Ok(RawNode::Wide(rows))
    }

    fn read_wide_fields(conn: &Connection, soul: &str, fields: &[String]) -> Result<BTreeMap<String, Bytes>> {
        let mut rows = BTreeMap::new();
        for chunk in fields.chunks(FIELD_CHUNK) {
            let sql = format!(
                "SELECT field, data FROM wide_fields WHERE soul = ? AND field IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let iter = stmt.query_map(rusqlite::params_from_iter(soul_and_fields(soul, chunk)), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for r in iter {
                let (field, data) = r?;
                rows.insert(field, Bytes::from(data));
            }
        }
        Ok(rows)
    }

    /// Inclusive range scan; `limit` of -1 reads everything.
    fn read_wide_range(
        conn: &Connection,
        soul: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: i64,
    ) -> Result<BTreeMap<String, Bytes>> {
        let mut stmt = conn.prepare_cached(
            "SELECT field, data FROM wide_fields
             WHERE soul = ?1
               AND (?2 IS NULL OR field >= ?2)
               AND (?3 IS NULL OR field <= ?3)
             ORDER BY field
             LIMIT ?4",
        )?;
        let iter = stmt.query_map(params![soul, from, to, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut rows = BTreeMap::new();
        for r in iter {
            let (field, data) = r?;
            rows.insert(field, Bytes::from(data));
        }
        Ok(rows)
    }

    fn encode(&self, json: Vec<u8>) -> Result<Bytes> {
        if !self.config.compress {
            return Ok(Bytes::from(json));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Readers accept both compressed and plain payloads.
    fn inflate(raw: &[u8]) -> Result<Cow<'_, [u8]>> {
        if !raw.starts_with(&GZIP_MAGIC) {
            return Ok(Cow::Borrowed(raw));
        }
        let mut out = Vec::new();
        GzDecoder::new(raw).read_to_end(&mut out)?;
        Ok(Cow::Owned(out))
    }

    fn decode_node(soul: &str, raw: &RawNode) -> Result<Option<Node>> {
        match raw {
            RawNode::Missing => Ok(None),
            RawNode::Blob(data) => {
                let mut node: Node = serde_json::from_slice(&Self::inflate(data)?)?;
                if node.meta.soul.is_empty() {
                    node.meta.soul = soul.to_string();
                }
                Ok(Some(node))
            }
            RawNode::Wide(rows) => {
                let mut node = Node::new(soul);
                for (field, data) in rows {
                    let wide: WideField = serde_json::from_slice(&Self::inflate(data)?)?;
                    node.set(field.clone(), wide.value, wide.state);
                }
                Ok(Some(node))
            }
        }
    }

    /// Raw rows to write for `merged`. Wide nodes that already exist only
    /// rewrite the fields in `diff`.
    fn node_to_raw(&self, merged: &Node, diff: &Node, existing: &RawNode) -> Result<RawNode> {
        let soul = merged.soul();
        if !self.is_wide(soul, merged.len(), existing) {
            return Ok(RawNode::Blob(self.encode(serde_json::to_vec(merged)?)?));
        }

        let source = match existing {
            RawNode::Wide(_) => diff,
            _ => merged,
        };
        let mut rows = BTreeMap::new();
        for (field, value) in &source.fields {
            let wide = WideField {
                state: merged.state_of(field).unwrap_or_default(),
                value: value.clone(),
            };
            rows.insert(field.clone(), self.encode(serde_json::to_vec(&wide)?)?);
        }
        Ok(RawNode::Wide(rows))
    }

    fn write_rows(conn: &Connection, soul: &str, raw: &RawNode) -> Result<()> {
        match raw {
            RawNode::Missing => {}
            RawNode::Blob(data) => {
                conn.execute(
                    "INSERT OR REPLACE INTO nodes (soul, data) VALUES (?1, ?2)",
                    params![soul, data.as_ref()],
                )?;
            }
            RawNode::Wide(rows) => {
                conn.execute(
                    "INSERT OR REPLACE INTO nodes (soul, data) VALUES (?1, ?2)",
                    params![soul, WIDE_NODE_MARKER],
                )?;
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO wide_fields (soul, field, data) VALUES (?1, ?2, ?3)",
                )?;
                for (field, data) in rows {
                    stmt.execute(params![soul, field, data.as_ref()])?;
                }
            }
        }
        Ok(())
    }

    /// Diff `node` against its stored state. Returns the diff and the rows
    /// to write, or `None` when nothing advanced.
    fn plan_write(&self, soul: &str, node: &Node, existing_raw: &RawNode) -> Result<Option<(Node, RawNode)>> {
        let existing_node = Self::decode_node(soul, existing_raw)?;
        let mut existing = GraphData::new();
        if let Some(existing_node) = &existing_node {
            existing.insert(soul.to_string(), Some(existing_node.clone()));
        }
        let mut updated = GraphData::new();
        updated.insert(soul.to_string(), Some(node.clone()));

        let Some(Some(diff)) = crdt::diff(&updated, &existing, &self.diff_opts).and_then(|mut d| d.remove(soul))
        else {
            return Ok(None);
        };
        let mut merged = existing_node.unwrap_or_else(|| Node::new(soul));
        crdt::merge_node_in_place(&mut merged, &diff);
        let raw = self.node_to_raw(&merged, &diff, existing_raw)?;
        Ok(Some((diff, raw)))
    }

    /// Every soul of `graph` through one optimistic cycle, committed
    /// together. Returns the diff written.
    fn patch_graph(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        let updates: Vec<(&str, &Node, Vec<String>)> = graph
            .iter()
            .filter_map(|(soul, node)| {
                let node = node.as_ref()?;
                Some((soul.as_str(), node, node.fields.keys().cloned().collect()))
            })
            .collect();

        let mut conn = self.pool.get()?;
        let mut contended = String::new();
        for attempt in 1..=self.config.max_put_attempts {
            let mut reads = Vec::new();
            let mut planned = Vec::new();
            let mut written = GraphData::new();
            for (soul, node, fields) in &updates {
                let existing_raw = self.read_raw(&conn, soul, Some(fields.as_slice()))?;
                let Some((diff, raw)) = self.plan_write(soul, node, &existing_raw)? else {
                    continue;
                };
                planned.push((*soul, raw));
                written.insert(soul.to_string(), Some(diff));
                reads.push((*soul, fields.as_slice(), existing_raw));
            }
            if planned.is_empty() {
                trace!(souls = updates.len(), "Nothing to write");
                return Ok(None);
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut changed = None;
            for (soul, fields, raw) in &reads {
                if self.read_raw(&tx, soul, Some(*fields))? != *raw {
                    changed = Some(*soul);
                    break;
                }
            }
            let Some(soul) = changed else {
                for (soul, raw) in &planned {
                    Self::write_rows(&tx, soul, raw)?;
                }
                tx.commit()?;
                return Ok(Some(written));
            };
            drop(tx);

            warn!(soul = %soul, attempt, "Node changed during write, retrying");
            contended = soul.to_string();
        }

        error!(
            soul = %contended,
            attempts = self.config.max_put_attempts,
            "Giving up on contended write"
        );
        Err(Error::Conflict {
            soul: contended,
            attempts: self.config.max_put_attempts,
        })
    }

    /// Read-modify-write across several souls under the optimistic discipline.
    ///
    /// `f` may run several times; every raw read it makes is verified again
    /// before its writes are committed. Returns the diff actually written.
    pub fn transaction<F>(&self, mut f: F) -> Result<Option<GraphData>>
    where
        F: FnMut(&mut SqliteTransaction<'_>) -> Result<()>,
    {
        let mut conn = self.pool.get()?;
        for attempt in 1..=self.config.max_put_attempts {
            let mut view = SqliteTransaction {
                adapter: self,
                conn: &conn,
                reads: BTreeMap::new(),
                writes: GraphData::new(),
            };
            f(&mut view)?;
            let SqliteTransaction { mut reads, writes, .. } = view;

            let mut planned = Vec::new();
            let mut written = GraphData::new();
            for (soul, node) in &writes {
                let Some(node) = node else { continue };
                let existing_raw = match reads.get(soul) {
                    Some((_, raw)) => raw.clone(),
                    None => {
                        let fields: Vec<String> = node.fields.keys().cloned().collect();
                        let raw = self.read_raw(&conn, soul, Some(fields.as_slice()))?;
                        reads.insert(soul.clone(), (Some(fields), raw.clone()));
                        raw
                    }
                };
                let Some((diff, raw)) = self.plan_write(soul, node, &existing_raw)? else {
                    continue;
                };
                planned.push((soul.clone(), raw));
                written.insert(soul.clone(), Some(diff));
            }

            if planned.is_empty() {
                return Ok(None);
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut stable = true;
            for (soul, (fields, raw)) in &reads {
                if self.read_raw(&tx, soul, fields.as_deref())? != *raw {
                    stable = false;
                    break;
                }
            }
            if stable {
                for (soul, raw) in &planned {
                    Self::write_rows(&tx, soul, raw)?;
                }
                tx.commit()?;
                return Ok(Some(written));
            }
            drop(tx);

            warn!(attempt, "Transaction read set changed, retrying");
        }

        error!(attempts = self.config.max_put_attempts, "Giving up on contended transaction");
        Err(Error::Conflict {
            soul: "<transaction>".to_string(),
            attempts: self.config.max_put_attempts,
        })
    }
}

/// View handed to [`SqliteAdapter::transaction`] closures.
pub struct SqliteTransaction<'a> {
    adapter: &'a SqliteAdapter,
    conn: &'a Connection,
    reads: BTreeMap<String, (Option<Vec<String>>, RawNode)>,
    writes: GraphData,
}

impl SqliteTransaction<'_> {
    /// Whole node, recorded for verification at commit.
    pub fn get(&mut self, soul: &str) -> Result<Option<Node>> {
        let raw = self.adapter.read_raw(self.conn, soul, None)?;
        let node = SqliteAdapter::decode_node(soul, &raw)?;
        self.reads.insert(soul.to_string(), (None, raw));
        Ok(node)
    }

    /// Queue a write; later puts to the same soul merge into earlier ones.
    pub fn put(&mut self, mut graph: GraphData) {
        crdt::add_missing_state(&mut graph, crate::types::machine_state());
        crdt::merge_graph(&mut self.writes, &graph);
    }
}

impl SyncGraphAdapter for SqliteAdapter {
    fn get_sync(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        let conn = self.pool.get()?;
        let Some(data) = Self::read_marker(&conn, soul)? else {
            return Ok(None);
        };
        let opts = opts.filter(|o| !o.is_empty());

        let node = if data == WIDE_NODE_MARKER {
            let (from, to) = opts.map(GetOpts::bounds).unwrap_or((None, None));
            let limit = match opts {
                Some(_) => self.config.get_max_keys() as i64,
                None => -1,
            };
            let rows = Self::read_wide_range(&conn, soul, from, to, limit)?;
            Self::decode_node(soul, &RawNode::Wide(rows))?
        } else {
            let node = Self::decode_node(soul, &RawNode::Blob(Bytes::from(data)))?;
            match (node, opts) {
                (Some(node), Some(opts)) => Some(opts.filter(&node)),
                (node, _) => node,
            }
        };

        Ok(node.filter(|n| !n.is_empty()))
    }

    fn put_sync(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        self.patch_graph(graph)
    }
}

#[async_trait]
impl GraphAdapter for SqliteAdapter {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.get_sync(soul, opts)
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        self.put_sync(graph)
    }

    async fn prune_changelog(&self, before: State) -> Result<()> {
        let cutoff = iso_timestamp(before);
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM wide_fields WHERE soul = ?1 AND field < ?2",
            params![CHANGELOG_SOUL, cutoff],
        )?;
        info!(deleted, cutoff = %cutoff, "Pruned changelog");
        Ok(())
    }
}
