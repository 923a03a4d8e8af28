//! File catalog for the ProjectLoupe preview service.
//!
//! The catalog maps the opaque file ids used by the web client to a path on
//! disk, the library root that owns it, and (once computed) the SHA-256 of
//! its content. Rendered previews are keyed by that hash, so files with
//! identical bytes share previews.
//!
//! The default database lives at:
//!   ~/.projectloupe/catalog.db
//!
//! Uses WAL mode so lookups from the preview workers don't block writers.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Lookups the preview pipeline needs from the catalog
pub trait Catalog: Send + Sync {
    fn resolve_path(&self, file_id: &str) -> Result<Option<PathBuf>>;

    fn get_hash(&self, file_id: &str) -> Result<Option<String>>;

    /// Record a content hash computed on demand
    fn set_hash(&self, file_id: &str, hash: &str) -> Result<()>;

    /// Library root owning the file; scopes progress notifications
    fn resolve_owning_root(&self, file_id: &str) -> Result<Option<String>>;
}

/// A catalogued file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub root_id: String,
    pub path: PathBuf,
    pub content_hash: Option<String>,
}

const UPSERT_FILE: &str = "INSERT INTO files (id, root_id, path) VALUES (?1, ?2, ?3)
     ON CONFLICT(id) DO UPDATE SET
        root_id = excluded.root_id,
        content_hash = CASE WHEN files.path = excluded.path THEN files.content_hash END,
        hashed_at = CASE WHEN files.path = excluded.path THEN files.hashed_at END,
        path = excluded.path";

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteCatalog {
    /// Open or create the catalog at the default location.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".projectloupe");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir: {}", dir.display()))?;
        Self::open_at(&dir.join("catalog.db"))
    }

    /// Open a database at a specific path.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let catalog = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        catalog.create_tables()?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    // -- Schema --

    fn create_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS roots (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                root_id TEXT NOT NULL REFERENCES roots(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                content_hash TEXT,
                hashed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_files_root ON files(root_id);
            CREATE INDEX IF NOT EXISTS idx_files_hash ON files(content_hash);
            ",
        )?;
        Ok(())
    }

    // -- Seeding --

    pub fn add_root(&self, root_id: &str, path: &Path) -> Result<()> {
        self.conn.lock().execute(
            // REPLACE would cascade-delete the root's files
            "INSERT INTO roots (id, path) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET path = excluded.path",
            params![root_id, path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Insert or update a file. An existing hash is kept when the path is unchanged.
    pub fn upsert_file(&self, file_id: &str, root_id: &str, path: &Path) -> Result<()> {
        self.conn.lock().execute(
            UPSERT_FILE,
            params![file_id, root_id, path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Batch insert files (wrapped in a transaction for speed).
    pub fn upsert_files(&self, root_id: &str, files: &[(String, PathBuf)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (file_id, path) in files {
            tx.execute(
                UPSERT_FILE,
                params![file_id, root_id, path.to_string_lossy()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT id, root_id, path, content_hash FROM files WHERE id = ?1",
                params![file_id],
                |row| {
                    Ok(FileRecord {
                        id: row.get(0)?,
                        root_id: row.get(1)?,
                        path: PathBuf::from(row.get::<_, String>(2)?),
                        content_hash: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // -- Statistics --

    pub fn file_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn hashed_count(&self) -> Result<i64> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM files WHERE content_hash IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl Catalog for SqliteCatalog {
    fn resolve_path(&self, file_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.load_file(file_id)?.map(|f| f.path))
    }

    fn get_hash(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self.load_file(file_id)?.and_then(|f| f.content_hash))
    }

    fn set_hash(&self, file_id: &str, hash: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE files SET content_hash = ?1, hashed_at = ?2 WHERE id = ?3",
            params![hash, Utc::now().to_rfc3339(), file_id],
        )?;
        Ok(())
    }

    fn resolve_owning_root(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self.load_file(file_id)?.map(|f| f.root_id))
    }
}

/// In-memory catalog for tests and embedding.
#[derive(Default)]
pub struct MemoryCatalog {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_id: &str, root_id: &str, path: impl Into<PathBuf>) {
        self.files.write().insert(
            file_id.to_string(),
            FileRecord {
                id: file_id.to_string(),
                root_id: root_id.to_string(),
                path: path.into(),
                content_hash: None,
            },
        );
    }
}

impl Catalog for MemoryCatalog {
    fn resolve_path(&self, file_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.files.read().get(file_id).map(|f| f.path.clone()))
    }

    fn get_hash(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self
            .files
            .read()
            .get(file_id)
            .and_then(|f| f.content_hash.clone()))
    }

    fn set_hash(&self, file_id: &str, hash: &str) -> Result<()> {
        if let Some(file) = self.files.write().get_mut(file_id) {
            file.content_hash = Some(hash.to_string());
        }
        Ok(())
    }

    fn resolve_owning_root(&self, file_id: &str) -> Result<Option<String>> {
        Ok(self.files.read().get(file_id).map(|f| f.root_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (SqliteCatalog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteCatalog::open_at(&dir.path().join("test.db")).unwrap();
        db.add_root("root-1", Path::new("/photos")).unwrap();
        (db, dir)
    }

    #[test]
    fn test_create_empty() {
        let (db, _dir) = test_db();
        assert_eq!(db.file_count().unwrap(), 0);
        assert_eq!(db.resolve_path("missing").unwrap(), None);
    }

    #[test]
    fn test_upsert_and_resolve() {
        let (db, _dir) = test_db();
        db.upsert_file("f1", "root-1", Path::new("/photos/a.NEF"))
            .unwrap();

        assert_eq!(
            db.resolve_path("f1").unwrap(),
            Some(PathBuf::from("/photos/a.NEF"))
        );
        assert_eq!(
            db.resolve_owning_root("f1").unwrap(),
            Some("root-1".to_string())
        );
        assert_eq!(db.get_hash("f1").unwrap(), None);
    }

    #[test]
    fn test_set_hash() {
        let (db, _dir) = test_db();
        db.upsert_file("f1", "root-1", Path::new("/photos/a.jpg"))
            .unwrap();
        db.set_hash("f1", "abc").unwrap();

        assert_eq!(db.get_hash("f1").unwrap(), Some("abc".to_string()));
        assert_eq!(db.hashed_count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_keeps_hash_for_same_path() {
        let (db, _dir) = test_db();
        db.upsert_file("f1", "root-1", Path::new("/photos/a.jpg"))
            .unwrap();
        db.set_hash("f1", "abc").unwrap();

        db.upsert_file("f1", "root-1", Path::new("/photos/a.jpg"))
            .unwrap();
        assert_eq!(db.get_hash("f1").unwrap(), Some("abc".to_string()));

        // Moved file: the old hash no longer describes it
        db.upsert_file("f1", "root-1", Path::new("/photos/b.jpg"))
            .unwrap();
        assert_eq!(db.get_hash("f1").unwrap(), None);
    }

    #[test]
    fn test_readding_root_keeps_files_and_hashes() {
        let (db, _dir) = test_db();
        db.upsert_file("f1", "root-1", Path::new("/photos/a.jpg"))
            .unwrap();
        db.set_hash("f1", "abc").unwrap();

        db.add_root("root-1", Path::new("/photos")).unwrap();
        assert_eq!(db.file_count().unwrap(), 1);
        assert_eq!(db.get_hash("f1").unwrap(), Some("abc".to_string()));

        let files = vec![("f1".to_string(), PathBuf::from("/photos/a.jpg"))];
        db.upsert_files("root-1", &files).unwrap();
        assert_eq!(db.get_hash("f1").unwrap(), Some("abc".to_string()));

        // A moved root updates its path in place
        db.add_root("root-1", Path::new("/mnt/photos")).unwrap();
        assert_eq!(db.file_count().unwrap(), 1);
    }

    #[test]
    fn test_batch_upsert() {
        let (db, _dir) = test_db();
        let files: Vec<_> = (0..100)
            .map(|i| {
                (
                    format!("f{}", i),
                    PathBuf::from(format!("/photos/img_{:04}.NEF", i)),
                )
            })
            .collect();
        db.upsert_files("root-1", &files).unwrap();
        assert_eq!(db.file_count().unwrap(), 100);
    }

    #[test]
    fn test_memory_catalog() {
        let catalog = MemoryCatalog::new();
        catalog.insert("f1", "root-1", "/photos/a.jpg");

        assert_eq!(catalog.get_hash("f1").unwrap(), None);
        catalog.set_hash("f1", "h").unwrap();
        assert_eq!(catalog.get_hash("f1").unwrap(), Some("h".to_string()));
        assert_eq!(catalog.resolve_path("nope").unwrap(), None);
    }
}
