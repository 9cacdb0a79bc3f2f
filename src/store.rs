//! SQLite persistence for users, videos and watch history
//!
//! The store is the only module that talks to the database. SQLite uses
//! file locking underneath, so all access goes through one mutex; worker
//! threads hold it only for the duration of a single statement.

use std::fmt::Display;
use std::path::Path;
use std::sync::Mutex;

use log::info;
use rusqlite::{params, Connection as DbConnection, OptionalExtension};
use serde::Serialize;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS videos (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    title     TEXT NOT NULL,
    filepath  TEXT NOT NULL,
    thumbnail TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS watch_history (
    user_id    INTEGER NOT NULL,
    video_id   INTEGER NOT NULL,
    position   INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, video_id)
);
";

/// Failures surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// No row matched; for credentials this covers bad passwords too.
    NotFound,
    /// A uniqueness constraint was violated (duplicate username).
    Conflict,
    /// The database itself failed.
    Sqlite(rusqlite::Error),
    /// Query results could not be serialized.
    Serialize(serde_json::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => f.write_str("no matching row"),
            StoreError::Conflict => f.write_str("row already exists"),
            StoreError::Sqlite(e) => write!(f, "database error: {e}"),
            StoreError::Serialize(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict
            }
            other => StoreError::Sqlite(other),
        }
    }
}

#[derive(Debug, Serialize)]
struct VideoRow {
    id: i64,
    title: String,
    filepath: String,
    thumbnail: String,
    position: i64,
}

/// Handle to the server's relational state.
#[derive(Debug)]
pub struct Store {
    db: Mutex<DbConnection>,
}

impl Store {
    /// Opens (creating if necessary) the database at `path`, applies the
    /// schema, and seeds demo data on first run.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(DbConnection::open(path)?)
    }

    /// Opens a throwaway in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(DbConnection::open_in_memory()?)
    }

    fn from_connection(db: DbConnection) -> Result<Self, StoreError> {
        db.execute_batch(SCHEMA)?;
        let store = Self { db: Mutex::new(db) };
        store.seed()?;
        Ok(store)
    }

    // First-run seed: one demo account and the bundled sample library.
    fn seed(&self) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap();

        let users: i64 = db.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        if users == 0 {
            db.execute(
                "INSERT INTO users (username, password) VALUES (?1, ?2)",
                params!["user1", "1234"],
            )?;
            info!("seeded demo user");
        }

        let videos: i64 = db.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))?;
        if videos == 0 {
            let mut insert = db.prepare(
                "INSERT INTO videos (title, filepath, thumbnail) VALUES (?1, ?2, ?3)",
            )?;
            for (title, filepath, thumbnail) in [
                ("Intro", "videos/intro.mp4", "static/thumbs/intro.jpg"),
                ("Big Buck Bunny", "videos/bunny.mp4", "static/thumbs/bunny.jpg"),
                ("Sintel", "videos/sintel.mp4", "static/thumbs/sintel.jpg"),
            ] {
                insert.execute(params![title, filepath, thumbnail])?;
            }
            info!("seeded sample video library");
        }

        Ok(())
    }

    /// Checks credentials, returning the user id on a match.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<i64, StoreError> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id FROM users WHERE username = ?1 AND password = ?2",
            params![username, password],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    /// Creates an account. Duplicate usernames are a [`StoreError::Conflict`].
    pub fn create_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO users (username, password) VALUES (?1, ?2)",
            params![username, password],
        )?;
        Ok(())
    }

    /// Records the resume position for one user and video, inserting or
    /// overwriting as needed.
    pub fn update_history(
        &self,
        user_id: i64,
        video_id: i64,
        position: i64,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO watch_history (user_id, video_id, position, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s', 'now'))
             ON CONFLICT (user_id, video_id)
             DO UPDATE SET position = excluded.position, updated_at = excluded.updated_at",
            params![user_id, video_id, position],
        )?;
        Ok(())
    }

    /// Serializes the video library, joined with `user_id`'s resume
    /// positions, as a JSON array.
    pub fn video_list_json(&self, user_id: i64) -> Result<String, StoreError> {
        let db = self.db.lock().unwrap();
        let mut select = db.prepare(
            "SELECT v.id, v.title, v.filepath, v.thumbnail, COALESCE(h.position, 0)
             FROM videos v
             LEFT JOIN watch_history h ON h.video_id = v.id AND h.user_id = ?1
             ORDER BY v.id",
        )?;

        let rows = select
            .query_map(params![user_id], |row| {
                Ok(VideoRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    filepath: row.get(2)?,
                    thumbnail: row.get(3)?,
                    position: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        serde_json::to_string(&rows).map_err(StoreError::Serialize)
    }
}

#[cfg(test)]
mod test {
    use super::{Store, StoreError};

    #[test]
    fn seeded_demo_user_verifies() {
        let store = Store::open_in_memory().unwrap();
        let user_id = store.verify_user("user1", "1234").unwrap();
        assert!(user_id > 0);
    }

    #[test]
    fn wrong_credentials_are_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.verify_user("user1", "wrong"),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.verify_user("nobody", "1234"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn created_users_verify_and_duplicates_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.create_user("alice", "s3cret").unwrap();
        store.verify_user("alice", "s3cret").unwrap();
        assert!(matches!(
            store.create_user("alice", "other"),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn update_history_upserts_the_position() {
        let store = Store::open_in_memory().unwrap();
        let user = store.verify_user("user1", "1234").unwrap();

        store.update_history(user, 1, 30).unwrap();
        store.update_history(user, 1, 95).unwrap();

        let json = store.video_list_json(user).unwrap();
        let rows: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(95, rows[0]["position"]);
    }

    #[test]
    fn video_list_is_a_json_array_with_zero_default_positions() {
        let store = Store::open_in_memory().unwrap();
        let user = store.verify_user("user1", "1234").unwrap();

        let rows: serde_json::Value =
            serde_json::from_str(&store.video_list_json(user).unwrap()).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(3, rows.len());
        assert!(rows.iter().all(|r| r["position"] == 0));
        assert_eq!("Intro", rows[0]["title"]);
        assert!(rows[0]["filepath"].as_str().unwrap().ends_with(".mp4"));
    }

    #[test]
    fn reopening_does_not_duplicate_seed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ott.db");

        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        let user = store.verify_user("user1", "1234").unwrap();
        let rows: serde_json::Value =
            serde_json::from_str(&store.video_list_json(user).unwrap()).unwrap();
        assert_eq!(3, rows.as_array().unwrap().len());
    }
}
