//! Database schema for the job queue.
//!
//! Defines the versioned schemas of the jobs table.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// One row per enqueued unit of work.
pub const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("queue", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("reserved_at", &SqlType::Integer),
        sqlite_column!("available_at", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_jobs_queue", "queue"),
        (
            "idx_jobs_queue_reserved_available",
            "queue, reserved_at, available_at",
        ),
    ],
};

pub const JOB_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &JOB_QUEUE_VERSIONED_SCHEMAS[0];
        schema
            .create(&conn)
            .expect("Schema v0 should create successfully");
        schema
            .validate(&conn)
            .expect("Schema v0 should validate successfully");
    }

    #[test]
    fn test_indices_exist() {
        let conn = Connection::open_in_memory().unwrap();
        JOB_QUEUE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(indexes.contains(&"idx_jobs_queue".to_string()));
        assert!(indexes.contains(&"idx_jobs_queue_reserved_available".to_string()));
    }

    #[test]
    fn test_attempts_defaults_to_zero_and_ids_increase() {
        let conn = Connection::open_in_memory().unwrap();
        JOB_QUEUE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        for _ in 0..2 {
            conn.execute(
                "INSERT INTO jobs (queue, payload, available_at, created_at) VALUES ('default', x'00', 1, 1)",
                [],
            )
            .unwrap();
        }

        let rows: Vec<(i64, u32)> = conn
            .prepare("SELECT id, attempts FROM jobs ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(rows, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_queue_is_required() {
        let conn = Connection::open_in_memory().unwrap();
        JOB_QUEUE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO jobs (payload, available_at, created_at) VALUES (x'00', 1, 1)",
            [],
        );
        assert!(result.is_err());
    }
}
