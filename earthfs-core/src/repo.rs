//! Repository layout and store-connection factory.
//!
//! A repo is a directory tree plus an embedded SQLite database:
//!
//! ```text
//! <repo>/data/<ii>/<H>   content-addressed blobs, ii = H[0..2]
//! <repo>/tmp/<random>    staging; unlinked after link-or-fail
//! <repo>/cache/          derived artifacts
//! <repo>/efs.db          embedded relational store
//! ```

use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        file_id INTEGER PRIMARY KEY,
        internal_hash TEXT NOT NULL,
        file_type TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        UNIQUE(internal_hash, file_type)
    );

    CREATE TABLE IF NOT EXISTS uris (
        uri_id INTEGER PRIMARY KEY,
        uri TEXT UNIQUE NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_uris (
        file_id INTEGER NOT NULL REFERENCES files(file_id),
        uri_id INTEGER NOT NULL REFERENCES uris(uri_id),
        UNIQUE(file_id, uri_id)
    );

    CREATE TABLE IF NOT EXISTS file_permissions (
        file_id INTEGER NOT NULL REFERENCES files(file_id),
        user_id INTEGER NOT NULL,
        meta_file_id INTEGER NOT NULL,
        UNIQUE(file_id, user_id, meta_file_id)
    );

    CREATE TABLE IF NOT EXISTS links (
        source_uri_id INTEGER NOT NULL REFERENCES uris(uri_id),
        target_uri_id INTEGER NOT NULL REFERENCES uris(uri_id),
        meta_file_id INTEGER NOT NULL,
        UNIQUE(source_uri_id, target_uri_id, meta_file_id)
    );

    CREATE INDEX IF NOT EXISTS idx_file_uris_uri ON file_uris(uri_id);
    CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_uri_id);
";

/// Repository paths plus the store-connection factory. Pure value holder;
/// callers connect per transaction, no pooling.
#[derive(Debug)]
pub struct Repo {
    path: PathBuf,
    data_path: PathBuf,
    tmp_path: PathBuf,
    cache_path: PathBuf,
    db_path: PathBuf,
}

impl Repo {
    /// Wrap an existing repo directory.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            data_path: path.join("data"),
            tmp_path: path.join("tmp"),
            cache_path: path.join("cache"),
            db_path: path.join("efs.db"),
            path,
        }
    }

    /// Create the on-disk layout and bootstrap the schema. Idempotent.
    pub fn create(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let repo = Self::open(path);
        for dir in [&repo.path, &repo.data_path, &repo.tmp_path, &repo.cache_path] {
            mkdir_p(dir)?;
        }
        let conn = Connection::open(&repo.db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Content-addressed location of a blob: `data/<ii>/<H>`.
    pub fn internal_path(&self, internal_hash: &str) -> PathBuf {
        let prefix = &internal_hash[..internal_hash.len().min(2)];
        self.data_path.join(prefix).join(internal_hash)
    }

    /// A fresh staging path under `tmp/`.
    pub fn temp_path(&self) -> PathBuf {
        self.tmp_path.join(Uuid::new_v4().simple().to_string())
    }

    /// Open the embedded store read/write. The no-mutex flag is safe:
    /// callers never share one connection across threads.
    pub fn connect(&self) -> crate::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(conn)
    }
}

/// Recursive mkdir with mode 0700 on unix.
pub(crate) fn mkdir_p(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// An acting user against a repo; imported files are granted to
/// `user_id` in `file_permissions`.
#[derive(Debug, Clone)]
pub struct Session {
    repo: Arc<Repo>,
    user_id: i64,
}

impl Session {
    pub fn new(repo: Arc<Repo>, user_id: i64) -> Self {
        Self { repo, user_id }
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }
}
