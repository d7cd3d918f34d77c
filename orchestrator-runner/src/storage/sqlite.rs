// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite storage.
//!
//! Every shard process opens its own connection. Mutations that touch more than one row run
//! inside `BEGIN IMMEDIATE` transactions, which take the database write lock up front, so
//! concurrent shards serialize on the lock rather than failing on upgrade. Claims are a single
//! `UPDATE … RETURNING` statement.

use super::{NewRun, StorageAdapter, TestVerdict};
use crate::{
    errors::StorageError,
    history::{HistoryEntry, HistoryRecord, HistoryStats},
};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use orchestrator_metadata::{
    ReportSnapshot, RunConfig, RunReport, RunStatus, RunUuid, TestIdentity, TestItem,
    TestPosition, TestReport, TestReportResult, TestRunInfo, TestStatus,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage in a SQLite database.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tables: Tables,
    history_ttl: Duration,
}

#[derive(Debug)]
struct Tables {
    runs: String,
    tests: String,
    info: String,
    history: String,
    prefix: String,
}

impl Tables {
    fn new(prefix: &str) -> Result<Self, StorageError> {
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::InvalidTablePrefix {
                prefix: prefix.to_owned(),
            });
        }
        Ok(Self {
            runs: format!("{prefix}_test_runs"),
            tests: format!("{prefix}_tests"),
            info: format!("{prefix}_test_info"),
            history: format!("{prefix}_test_info_history"),
            prefix: prefix.to_owned(),
        })
    }
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// `table_prefix` may only contain ASCII letters, digits and `_`.
    pub fn open(
        path: &Utf8Path,
        table_prefix: &str,
        history_ttl: Duration,
    ) -> Result<Self, StorageError> {
        let tables = Tables::new(table_prefix)?;
        let conn = Connection::open(path).map_err(StorageError::sqlite("opening database"))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StorageError::sqlite("setting busy timeout"))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(StorageError::sqlite("enabling WAL"))?;
        debug!(%path, journal_mode = %mode, "opened sqlite storage");

        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            history_ttl,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_run(&self, conn: &Connection, run_id: RunUuid) -> Result<RunConfig, StorageError> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT config, status, updated FROM {} WHERE id = ?1",
                    self.tables.runs
                ),
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(StorageError::sqlite("reading run"))?;
        let Some((config, status, updated)) = row else {
            return Err(StorageError::RunNotFound { run_id });
        };

        let mut config: RunConfig =
            serde_json::from_str(&config).map_err(|error| StorageError::Deserialize {
                what: format!("configuration of run {run_id}"),
                error,
            })?;
        config.status = RunStatus::from_code(status)?;
        config.updated = from_millis(updated)?;
        Ok(config)
    }

    fn load_history(
        &self,
        conn: &Connection,
        identity: &TestIdentity,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        let info = conn
            .query_row(
                &format!(
                    "SELECT created, ema FROM {} WHERE identity = ?1",
                    self.tables.info
                ),
                params![identity.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()
            .map_err(StorageError::sqlite("reading history"))?;
        let Some((created, ema)) = info else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT duration, status, updated FROM {} WHERE identity = ?1 ORDER BY id",
                self.tables.history
            ))
            .map_err(StorageError::sqlite("reading history entries"))?;
        let rows = stmt
            .query_map(params![identity.as_str()], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(StorageError::sqlite("reading history entries"))?;

        let history = rows
            .into_iter()
            .map(|(duration, status, updated)| {
                Ok(HistoryEntry {
                    duration,
                    status: TestStatus::from_code(status)?,
                    updated: from_millis(updated)?,
                })
            })
            .collect::<Result<VecDeque<_>, StorageError>>()?;

        Ok(Some(HistoryRecord {
            created: from_millis(created)?,
            ema,
            history,
        }))
    }

    fn purge_expired_history(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.history_ttl.is_zero() {
            return Ok(());
        }
        let Some(cutoff) = chrono::Duration::from_std(self.history_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return Ok(());
        };
        let cutoff = cutoff.timestamp_millis();
        let Tables { info, history, .. } = &self.tables;

        let purged = conn
            .execute(
                &format!(
                    "DELETE FROM {info} WHERE COALESCE(
                        (SELECT MAX(h.updated) FROM {history} h WHERE h.identity = {info}.identity),
                        created
                    ) < ?1"
                ),
                params![cutoff],
            )
            .map_err(StorageError::sqlite("purging expired history"))?;
        conn.execute(
            &format!("DELETE FROM {history} WHERE identity NOT IN (SELECT identity FROM {info})"),
            [],
        )
        .map_err(StorageError::sqlite("purging expired history"))?;

        if purged > 0 {
            debug!(purged, "purged expired history records");
        }
        Ok(())
    }
}

impl StorageAdapter for SqliteStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        let Tables {
            runs,
            tests,
            info,
            history,
            prefix,
        } = &self.tables;
        self.conn()
            .execute_batch(&format!(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS {runs} (
                    id TEXT PRIMARY KEY,
                    config TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    updated INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {tests} (
                    run_id TEXT NOT NULL,
                    order_num INTEGER NOT NULL,
                    file TEXT NOT NULL,
                    line INTEGER NOT NULL,
                    col INTEGER NOT NULL,
                    project TEXT NOT NULL,
                    timeout INTEGER NOT NULL,
                    identity TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    report TEXT,
                    updated INTEGER NOT NULL,
                    PRIMARY KEY (run_id, order_num)
                );
                CREATE INDEX IF NOT EXISTS {prefix}_tests_status_idx
                    ON {tests} (run_id, status, order_num);
                CREATE TABLE IF NOT EXISTS {info} (
                    identity TEXT PRIMARY KEY,
                    created INTEGER NOT NULL,
                    ema REAL NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {history} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    identity TEXT NOT NULL,
                    duration REAL NOT NULL,
                    status INTEGER NOT NULL,
                    updated INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {prefix}_test_info_history_idx
                    ON {history} (identity, id);
                COMMIT;"
            ))
            .map_err(StorageError::sqlite("creating schema"))
    }

    fn save_test_run(
        &self,
        info: &TestRunInfo,
        args: &[String],
        history_window: usize,
    ) -> Result<RunUuid, StorageError> {
        let now = Utc::now();
        // Validates identities before anything is written.
        let new_run = NewRun::new(info, args, history_window, now)?;

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::sqlite("beginning run creation"))?;

        self.purge_expired_history(&tx, now)?;

        let mut stats = HashMap::new();
        for identity in new_run.identities() {
            match self.load_history(&tx, identity)? {
                Some(record) => {
                    stats.insert(identity.clone(), record.stats());
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (identity, created, ema) VALUES (?1, ?2, 0)",
                            self.tables.info
                        ),
                        params![identity.as_str(), now.timestamp_millis()],
                    )
                    .map_err(StorageError::sqlite("creating history"))?;
                    stats.insert(identity.clone(), HistoryStats::default());
                }
            }
        }

        let (run_id, config, items) = new_run.schedule(&stats);
        let config_json =
            serde_json::to_string(&config).map_err(|error| StorageError::Serialize {
                what: "run configuration",
                error,
            })?;
        tx.execute(
            &format!(
                "INSERT INTO {} (id, config, status, updated) VALUES (?1, ?2, ?3, ?4)",
                self.tables.runs
            ),
            params![
                run_id.to_string(),
                config_json,
                config.status.code(),
                now.timestamp_millis()
            ],
        )
        .map_err(StorageError::sqlite("inserting run"))?;

        {
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO {} (run_id, order_num, file, line, col, project, timeout,
                        identity, status, report, updated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)",
                    self.tables.tests
                ))
                .map_err(StorageError::sqlite("inserting tests"))?;
            for item in &items {
                insert
                    .execute(params![
                        run_id.to_string(),
                        i64::from(item.order),
                        item.file.as_str(),
                        i64::from(item.position.line),
                        i64::from(item.position.column),
                        item.project,
                        item.timeout as i64,
                        item.identity.as_str(),
                        TestStatus::Ready.code(),
                        now.timestamp_millis(),
                    ])
                    .map_err(StorageError::sqlite("inserting tests"))?;
            }
        }

        tx.commit()
            .map_err(StorageError::sqlite("committing run creation"))?;
        debug!(%run_id, tests = items.len(), "created run");
        Ok(run_id)
    }

    fn start_shard(&self, run_id: RunUuid) -> Result<RunConfig, StorageError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::sqlite("beginning shard start"))?;
        let mut config = self.load_run(&tx, run_id)?;

        if let Some(next) = config.status.on_shard_start() {
            let now = Utc::now();
            if config.status.rearms_failed() {
                let rearmed = tx
                    .execute(
                        &format!(
                            "UPDATE {} SET status = ?1, updated = ?2 WHERE run_id = ?3 AND status = ?4",
                            self.tables.tests
                        ),
                        params![
                            TestStatus::Ready.code(),
                            now.timestamp_millis(),
                            run_id.to_string(),
                            TestStatus::Failed.code()
                        ],
                    )
                    .map_err(StorageError::sqlite("re-arming failed tests"))?;
                debug!(%run_id, rearmed, "re-armed failed tests");
            }
            tx.execute(
                &format!(
                    "UPDATE {} SET status = ?1, updated = ?2 WHERE id = ?3",
                    self.tables.runs
                ),
                params![next.code(), now.timestamp_millis(), run_id.to_string()],
            )
            .map_err(StorageError::sqlite("updating run status"))?;
            debug!(%run_id, from = %config.status, to = %next, "run status transition");
            config.status = next;
            config.updated = from_millis(now.timestamp_millis())?;
        }

        tx.commit()
            .map_err(StorageError::sqlite("committing shard start"))?;
        Ok(config)
    }

    fn get_next_test(
        &self,
        run_id: RunUuid,
        _config: &RunConfig,
    ) -> Result<Option<TestItem>, StorageError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::sqlite("beginning claim"))?;
        let tests = &self.tables.tests;
        let claimed = tx
            .query_row(
                &format!(
                    "UPDATE {tests} SET status = ?1, updated = ?2
                     WHERE run_id = ?3 AND status = ?4 AND order_num = (
                        SELECT MIN(order_num) FROM {tests} WHERE run_id = ?3 AND status = ?4
                     )
                     RETURNING order_num, file, line, col, project, timeout, identity"
                ),
                params![
                    TestStatus::Ongoing.code(),
                    Utc::now().timestamp_millis(),
                    run_id.to_string(),
                    TestStatus::Ready.code()
                ],
                |row| {
                    Ok(TestItem {
                        order: row.get(0)?,
                        file: row.get::<_, String>(1)?.into(),
                        position: TestPosition::new(row.get(2)?, row.get(3)?),
                        project: row.get(4)?,
                        timeout: row.get::<_, i64>(5)? as u64,
                        identity: TestIdentity::new(row.get::<_, String>(6)?),
                    })
                },
            )
            .optional()
            .map_err(StorageError::sqlite("claiming test"))?;
        tx.commit().map_err(StorageError::sqlite("committing claim"))?;

        if let Some(item) = &claimed {
            debug!(%run_id, order = item.order, identity = %item.identity, "claimed test");
        }
        Ok(claimed)
    }

    fn record_result(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        verdict: TestVerdict,
        result: &TestReportResult,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::sqlite("beginning result recording"))?;

        let mut record = self
            .load_history(&tx, &item.identity)?
            .unwrap_or_else(|| HistoryRecord::new(now));
        let before = record.record(
            HistoryEntry {
                duration: result.duration,
                status: verdict.status(),
                updated: now,
            },
            config.history_window,
        );
        let snapshot: ReportSnapshot = before.snapshot(result.title.clone(), result.duration);
        let snapshot =
            serde_json::to_string(&snapshot).map_err(|error| StorageError::Serialize {
                what: "report snapshot",
                error,
            })?;

        let updated = tx
            .execute(
                &format!(
                    "UPDATE {} SET status = ?1, report = ?2, updated = ?3
                     WHERE run_id = ?4 AND order_num = ?5 AND status = ?6",
                    self.tables.tests
                ),
                params![
                    verdict.status().code(),
                    snapshot,
                    now.timestamp_millis(),
                    run_id.to_string(),
                    i64::from(item.order),
                    TestStatus::Ongoing.code()
                ],
            )
            .map_err(StorageError::sqlite("updating test status"))?;
        if updated == 0 {
            let status: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT status FROM {} WHERE run_id = ?1 AND order_num = ?2",
                        self.tables.tests
                    ),
                    params![run_id.to_string(), i64::from(item.order)],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StorageError::sqlite("reading test status"))?;
            return Err(match status {
                Some(code) => StorageError::TestItemNotStarted {
                    run_id,
                    order: item.order,
                    status: TestStatus::from_code(code)?,
                },
                None => StorageError::TestItemNotFound {
                    run_id,
                    order: item.order,
                },
            });
        }

        let Tables { info, history, .. } = &self.tables;
        tx.execute(
            &format!(
                "INSERT INTO {info} (identity, created, ema) VALUES (?1, ?2, ?3)
                 ON CONFLICT (identity) DO UPDATE SET ema = excluded.ema"
            ),
            params![
                item.identity.as_str(),
                record.created.timestamp_millis(),
                record.ema
            ],
        )
        .map_err(StorageError::sqlite("updating history"))?;
        tx.execute(
            &format!(
                "INSERT INTO {history} (identity, duration, status, updated) VALUES (?1, ?2, ?3, ?4)"
            ),
            params![
                item.identity.as_str(),
                result.duration,
                verdict.status().code(),
                now.timestamp_millis()
            ],
        )
        .map_err(StorageError::sqlite("appending history"))?;
        tx.execute(
            &format!(
                "DELETE FROM {history} WHERE identity = ?1 AND id NOT IN (
                    SELECT id FROM {history} WHERE identity = ?1 ORDER BY id DESC LIMIT ?2
                 )"
            ),
            params![item.identity.as_str(), config.history_window as i64],
        )
        .map_err(StorageError::sqlite("trimming history"))?;

        tx.commit()
            .map_err(StorageError::sqlite("committing result"))?;
        debug!(%run_id, order = item.order, ?verdict, "recorded result");
        Ok(())
    }

    fn finish_shard(&self, run_id: RunUuid) -> Result<(), StorageError> {
        let updated = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET status = ?1, updated = ?2 WHERE id = ?3",
                    self.tables.runs
                ),
                params![
                    RunStatus::Finished.code(),
                    Utc::now().timestamp_millis(),
                    run_id.to_string()
                ],
            )
            .map_err(StorageError::sqlite("finishing shard"))?;
        if updated == 0 {
            return Err(StorageError::RunNotFound { run_id });
        }
        Ok(())
    }

    fn get_report_data(&self, run_id: RunUuid) -> Result<RunReport, StorageError> {
        let conn = self.conn();
        let config = self.load_run(&conn, run_id)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT file, line, col, project, status, report FROM {}
                 WHERE run_id = ?1 ORDER BY order_num",
                self.tables.tests
            ))
            .map_err(StorageError::sqlite("reading tests"))?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TestPosition::new(row.get(1)?, row.get(2)?),
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(StorageError::sqlite("reading tests"))?;

        let tests = rows
            .into_iter()
            .map(|(file, position, project, status, report)| {
                let snapshot = report
                    .map(|report| serde_json::from_str::<ReportSnapshot>(&report))
                    .transpose()
                    .map_err(|error| StorageError::Deserialize {
                        what: format!("report of {file}:{position}"),
                        error,
                    })?;
                Ok(TestReport::new(
                    file.into(),
                    position,
                    project,
                    TestStatus::from_code(status)?,
                    snapshot,
                ))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(RunReport {
            run_id,
            config,
            tests,
        })
    }

    fn get_history(&self, identity: &TestIdentity) -> Result<Option<HistoryRecord>, StorageError> {
        let conn = self.conn();
        self.load_history(&conn, identity)
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(StorageError::CorruptTimestamp { millis })
}
