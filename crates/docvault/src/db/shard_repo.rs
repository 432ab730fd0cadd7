//! Shard tree repository: the singleton row in `shard_tree`.
//!
//! Writes are conditional on `version` so two allocators that read the same
//! record cannot both re-hash a level.

use rusqlite::{params, OptionalExtension};

use super::{now_rfc3339, Database, DatabaseError};

pub const SHARD_DEPTH: usize = 5;

const LEVEL_COLUMNS: [&str; SHARD_DEPTH] = ["level1", "level2", "level3", "level4", "level5"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTreeRow {
    pub levels: [String; SHARD_DEPTH],
    pub version: i64,
}

pub fn load(db: &Database) -> Result<Option<ShardTreeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT level1, level2, level3, level4, level5, version
                 FROM shard_tree WHERE id = 1",
                [],
                |r| {
                    Ok(ShardTreeRow {
                        levels: [r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?],
                        version: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts the initial record unless one already exists. Returns whether this
/// call created it.
pub fn insert_initial(db: &Database, levels: &[String; SHARD_DEPTH]) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO shard_tree
             (id, level1, level2, level3, level4, level5, version, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                levels[0],
                levels[1],
                levels[2],
                levels[3],
                levels[4],
                now_rfc3339()
            ],
        )?;
        Ok(inserted == 1)
    })
}

/// Replaces the hash at `level` (0-based) if the record is still at
/// `expected_version`. Returns whether the write won.
pub fn replace_level(
    db: &Database,
    level: usize,
    hash: &str,
    expected_version: i64,
) -> Result<bool, DatabaseError> {
    let column = LEVEL_COLUMNS
        .get(level)
        .ok_or_else(|| DatabaseError::Decode {
            column: "level",
            reason: format!("shard level {} out of range", level),
        })?;

    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE shard_tree SET {} = ?1, version = version + 1, updated_at = ?2
             WHERE id = 1 AND version = ?3",
            column
        );
        let updated = conn.execute(&sql, params![hash, now_rfc3339(), expected_version])?;
        Ok(updated == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(prefix: &str) -> [String; SHARD_DEPTH] {
        std::array::from_fn(|i| format!("{}{}", prefix, i))
    }

    #[test]
    fn test_load_empty() {
        let db = Database::open_in_memory().unwrap();
        assert!(load(&db).unwrap().is_none());
    }

    #[test]
    fn test_insert_initial_only_once() {
        let db = Database::open_in_memory().unwrap();
        assert!(insert_initial(&db, &levels("a")).unwrap());
        assert!(!insert_initial(&db, &levels("b")).unwrap());

        let row = load(&db).unwrap().unwrap();
        assert_eq!(row.levels, levels("a"));
        assert_eq!(row.version, 0);
    }

    #[test]
    fn test_replace_level_is_conditional_on_version() {
        let db = Database::open_in_memory().unwrap();
        insert_initial(&db, &levels("a")).unwrap();

        assert!(replace_level(&db, 4, "fresh1", 0).unwrap());
        // A second writer still holding version 0 loses.
        assert!(!replace_level(&db, 4, "fresh2", 0).unwrap());

        let row = load(&db).unwrap().unwrap();
        assert_eq!(row.levels[4], "fresh1");
        assert_eq!(row.levels[3], "a3");
        assert_eq!(row.version, 1);
    }

    #[test]
    fn test_replace_level_out_of_range() {
        let db = Database::open_in_memory().unwrap();
        assert!(replace_level(&db, SHARD_DEPTH, "x", 0).is_err());
    }
}
