//! SQLite persistence for servers, operations, profiles, edges, and runs.
//!
//! Single connection behind a mutex; critical sections are short and the
//! broker has one sequential writer per flow, so no pooling is needed.
//! Edge identity is the 4-tuple compound key with `UNIQUE` + upsert.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    Compatibility, EdgeKey, GraphEdge, OperationDescriptor, SemanticProfile, ServerRecord,
    ServerStatus,
};

/// Aggregate counts over the stored state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Registered servers.
    pub servers: usize,
    /// Declared operations across all servers.
    pub operations: usize,
    /// Stored edges.
    pub edges: usize,
    /// Edges with `direct` compatibility.
    pub direct_edges: usize,
    /// Edges with `translatable` compatibility.
    pub translatable_edges: usize,
    /// Recorded pipeline runs.
    pub pipeline_runs: usize,
}

/// One row of pipeline-run history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineRunRecord {
    /// Row id.
    pub id: i64,
    /// Original request text.
    pub request: String,
    /// Discovered steps (JSON).
    pub steps: serde_json::Value,
    /// Run context (JSON).
    pub context: serde_json::Value,
    /// `running`, `completed`, or `failed`.
    pub status: String,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    /// RFC 3339 completion timestamp, if finished.
    pub completed_at: Option<String>,
    /// Total wall time in milliseconds, if finished.
    pub total_duration_ms: Option<u64>,
    /// Result payload (JSON), if finished.
    pub result: Option<serde_json::Value>,
}

/// SQLite-backed store. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// # Errors
    /// Fails when the file cannot be opened or the schema cannot be applied.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open database at {}", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    /// Fails when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            BEGIN;
            CREATE TABLE IF NOT EXISTS servers(
                name TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                args TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'registered',
                registered_at TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE TABLE IF NOT EXISTS operations(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_name TEXT NOT NULL REFERENCES servers(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT,
                input_schema TEXT,
                output_schema TEXT,
                UNIQUE(server_name, name)
            );
            CREATE TABLE IF NOT EXISTS semantic_profiles(
                server_name TEXT PRIMARY KEY REFERENCES servers(name) ON DELETE CASCADE,
                summary TEXT,
                capability_tags TEXT,
                input_concepts TEXT,
                output_concepts TEXT,
                use_cases TEXT,
                compatible_with TEXT,
                domain TEXT
            );
            CREATE TABLE IF NOT EXISTS edges(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_server TEXT NOT NULL,
                source_op TEXT NOT NULL,
                target_server TEXT NOT NULL,
                target_op TEXT NOT NULL,
                compatibility TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.0,
                translation_hint TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(source_server, source_op, target_server, target_op)
            );
            CREATE TABLE IF NOT EXISTS pipeline_runs(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request TEXT NOT NULL,
                steps TEXT NOT NULL,
                context TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                total_duration_ms INTEGER,
                result TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_operations_server ON operations(server_name);
            CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_server, source_op);
            CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_server, target_op);
            COMMIT;",
        )
        .context("initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("storage connection lock poisoned"))
    }

    // ---- servers ----

    /// Upsert a server record with its operations and profile.
    ///
    /// # Errors
    /// Fails on serialization or SQL errors.
    pub fn save_server(&self, record: &ServerRecord) -> Result<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO servers (name, command, args, status, registered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                 command = excluded.command,
                 args = excluded.args,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![
                record.name,
                record.command,
                serde_json::to_string(&record.args)?,
                record.status.as_str(),
                record.registered_at,
                now,
            ],
        )
        .context("upsert server")?;

        conn.execute(
            "DELETE FROM operations WHERE server_name = ?1",
            params![record.name],
        )?;
        for op in &record.operations {
            conn.execute(
                "INSERT INTO operations (server_name, name, description, input_schema, output_schema)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.name,
                    op.name,
                    op.description,
                    serde_json::to_string(&op.input_schema)?,
                    serde_json::to_string(&op.output_schema)?,
                ],
            )
            .context("insert operation")?;
        }

        if let Some(ref profile) = record.profile {
            conn.execute(
                "INSERT INTO semantic_profiles
                 (server_name, summary, capability_tags, input_concepts,
                  output_concepts, use_cases, compatible_with, domain)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(server_name) DO UPDATE SET
                     summary = excluded.summary,
                     capability_tags = excluded.capability_tags,
                     input_concepts = excluded.input_concepts,
                     output_concepts = excluded.output_concepts,
                     use_cases = excluded.use_cases,
                     compatible_with = excluded.compatible_with,
                     domain = excluded.domain",
                params![
                    record.name,
                    profile.plain_language_summary,
                    serde_json::to_string(&profile.capability_tags)?,
                    serde_json::to_string(&profile.input_concepts)?,
                    serde_json::to_string(&profile.output_concepts)?,
                    serde_json::to_string(&profile.use_cases)?,
                    serde_json::to_string(&profile.compatible_with)?,
                    profile.domain,
                ],
            )
            .context("upsert semantic profile")?;
        }
        Ok(())
    }

    /// Load one server with operations and profile.
    ///
    /// # Errors
    /// Fails on SQL or deserialization errors; an unknown name is `Ok(None)`.
    pub fn load_server(&self, name: &str) -> Result<Option<ServerRecord>> {
        let conn = self.lock()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT command, args, status, registered_at FROM servers WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .context("load server row")?;
        let Some((command, args, status, registered_at)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT name, description, input_schema, output_schema
             FROM operations WHERE server_name = ?1 ORDER BY id",
        )?;
        let operations = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(op_name, description, input_schema, output_schema)| {
                Ok(OperationDescriptor {
                    name: op_name,
                    description: description.unwrap_or_default(),
                    input_schema: decode_json_column(input_schema.as_deref())?,
                    output_schema: decode_json_column(output_schema.as_deref())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let profile = conn
            .query_row(
                "SELECT summary, capability_tags, input_concepts, output_concepts,
                        use_cases, compatible_with, domain
                 FROM semantic_profiles WHERE server_name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .context("load semantic profile")?
            .map(
                |(summary, tags, inputs, outputs, uses, compatible, domain)| {
                    Ok::<_, anyhow::Error>(SemanticProfile {
                        plain_language_summary: summary.unwrap_or_default(),
                        capability_tags: decode_list_column(tags.as_deref())?,
                        input_concepts: decode_list_column(inputs.as_deref())?,
                        output_concepts: decode_list_column(outputs.as_deref())?,
                        use_cases: decode_list_column(uses.as_deref())?,
                        compatible_with: decode_list_column(compatible.as_deref())?,
                        domain: domain.unwrap_or_default(),
                    })
                },
            )
            .transpose()?;

        Ok(Some(ServerRecord {
            name: name.to_string(),
            command,
            args: serde_json::from_str(&args).context("decode server args")?,
            operations,
            profile,
            status: ServerStatus::parse(&status),
            registered_at,
        }))
    }

    /// Load every stored server, keyed by name.
    ///
    /// # Errors
    /// Fails on SQL or deserialization errors.
    pub fn load_all_servers(&self) -> Result<std::collections::HashMap<String, ServerRecord>> {
        let names: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT name FROM servers ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut servers = std::collections::HashMap::new();
        for name in names {
            if let Some(record) = self.load_server(&name)? {
                servers.insert(name, record);
            }
        }
        Ok(servers)
    }

    /// Delete a server; cascades to operations and profile. Returns whether
    /// a row was removed.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn delete_server(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM servers WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    /// Whether a server row exists.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn server_exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM servers WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    // ---- edges ----

    /// Upsert an edge by compound key; compatibility, confidence, and hint
    /// are overwritten on conflict (last validation wins).
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn save_edge(&self, edge: &GraphEdge) -> Result<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO edges
             (source_server, source_op, target_server, target_op,
              compatibility, confidence, translation_hint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(source_server, source_op, target_server, target_op) DO UPDATE SET
                 compatibility = excluded.compatibility,
                 confidence = excluded.confidence,
                 translation_hint = excluded.translation_hint",
            params![
                edge.source_server,
                edge.source_op,
                edge.target_server,
                edge.target_op,
                edge.compatibility.as_str(),
                edge.confidence,
                edge.translation_hint,
                now,
            ],
        )
        .context("upsert edge")?;
        Ok(())
    }

    /// Load every stored edge.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn load_all_edges(&self) -> Result<Vec<GraphEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_server, source_op, target_server, target_op,
                    compatibility, confidence, translation_hint
             FROM edges ORDER BY id",
        )?;
        let edges = stmt
            .query_map([], |row| {
                Ok(GraphEdge {
                    source_server: row.get(0)?,
                    source_op: row.get(1)?,
                    target_server: row.get(2)?,
                    target_op: row.get(3)?,
                    compatibility: Compatibility::parse(&row.get::<_, String>(4)?),
                    confidence: row.get(5)?,
                    translation_hint: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Whether an edge with this compound key exists.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn edge_exists(&self, key: &EdgeKey) -> Result<bool> {
        let conn = self.lock()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM edges
                 WHERE source_server = ?1 AND source_op = ?2
                   AND target_server = ?3 AND target_op = ?4",
                params![
                    key.source_server,
                    key.source_op,
                    key.target_server,
                    key.target_op
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Delete every edge touching the server on either endpoint. Returns the
    /// number removed.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn delete_edges_for_server(&self, server: &str) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM edges WHERE source_server = ?1 OR target_server = ?1",
            params![server],
        )?;
        Ok(removed)
    }

    /// Delete all edges. Returns the number removed.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn clear_all_edges(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM edges", [])?;
        Ok(removed)
    }

    // ---- pipeline runs ----

    /// Record the start of a pipeline run; returns the run id.
    ///
    /// # Errors
    /// Fails on serialization or SQL errors.
    pub fn record_run_started(
        &self,
        request: &str,
        steps: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO pipeline_runs (request, steps, context, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![
                request,
                serde_json::to_string(steps)?,
                serde_json::to_string(context)?,
                now,
            ],
        )
        .context("insert pipeline run")?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the completion of a pipeline run.
    ///
    /// # Errors
    /// Fails on serialization or SQL errors.
    pub fn record_run_finished(
        &self,
        run_id: i64,
        status: &str,
        result: &serde_json::Value,
        total_duration_ms: u64,
    ) -> Result<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE pipeline_runs
             SET status = ?1, result = ?2, total_duration_ms = ?3, completed_at = ?4
             WHERE id = ?5",
            params![
                status,
                serde_json::to_string(result)?,
                i64::try_from(total_duration_ms).unwrap_or(i64::MAX),
                now,
                run_id,
            ],
        )
        .context("update pipeline run")?;
        Ok(())
    }

    /// Most recent pipeline runs, newest first.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, request, steps, context, status, started_at,
                    completed_at, total_duration_ms, result
             FROM pipeline_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(
                |(id, request, steps, context, status, started_at, completed_at, dur, result)| {
                    PipelineRunRecord {
                        id,
                        request,
                        steps: serde_json::from_str(&steps)
                            .unwrap_or(serde_json::Value::Array(vec![])),
                        context: context
                            .as_deref()
                            .and_then(|c| serde_json::from_str(c).ok())
                            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                        status,
                        started_at,
                        completed_at,
                        total_duration_ms: dur.and_then(|d| u64::try_from(d).ok()),
                        result: result.as_deref().and_then(|r| serde_json::from_str(r).ok()),
                    }
                },
            )
            .collect();
        Ok(runs)
    }

    // ---- stats ----

    /// Aggregate counts over the stored state.
    ///
    /// # Errors
    /// Fails on SQL errors.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(StorageStats {
            servers: count("SELECT COUNT(*) FROM servers")?,
            operations: count("SELECT COUNT(*) FROM operations")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            direct_edges: count("SELECT COUNT(*) FROM edges WHERE compatibility = 'direct'")?,
            translatable_edges: count(
                "SELECT COUNT(*) FROM edges WHERE compatibility = 'translatable'",
            )?,
            pipeline_runs: count("SELECT COUNT(*) FROM pipeline_runs")?,
        })
    }
}

fn decode_json_column(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        None | Some("") => Ok(serde_json::json!({})),
        Some(text) => serde_json::from_str(text).context("decode JSON column"),
    }
}

fn decode_list_column(raw: Option<&str>) -> Result<Vec<String>> {
    match raw {
        None | Some("") => Ok(vec![]),
        Some(text) => serde_json::from_str(text).context("decode list column"),
    }
}
