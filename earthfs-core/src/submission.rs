//! Streaming submissions: bytes go to a staging file while being hashed
//! and meta-parsed, then commit into the content-addressed tree and the
//! relational index.

use crate::hasher::Hasher;
use crate::meta_file::{MetaFile, META_TYPE};
use crate::repo::{mkdir_p, Repo, Session};
use crate::EfsError;
use rusqlite::{params, Connection};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// One pending import. Lifecycle: created open for writing, `end`
/// finalises the digests and closes the staging file, `store` moves the
/// bytes into the content tree and indexes them, drop releases whatever
/// is left.
pub struct Submission {
    repo: Arc<Repo>,
    file_type: String,

    tmp_path: Option<PathBuf>,
    file: Option<File>,
    size: u64,
    hasher: Option<Hasher>,
    meta: MetaFile,

    uris: Vec<String>,
    internal_hash: Option<String>,
}

impl Submission {
    /// Allocate a staging file under the repo's `tmp/` and set up the
    /// streaming hasher and meta parser for `file_type`.
    pub fn create(repo: &Arc<Repo>, file_type: &str) -> crate::Result<Self> {
        let tmp_path = repo.temp_path();
        if let Some(parent) = tmp_path.parent() {
            mkdir_p(parent).inspect_err(|_| {
                error!("couldn't create temp dir {}", tmp_path.display());
            })?;
        }

        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o400);
        }
        let file = opts.open(&tmp_path).inspect_err(|_| {
            error!("couldn't create temp file {}", tmp_path.display());
        })?;

        Ok(Self {
            repo: Arc::clone(repo),
            file_type: file_type.to_string(),
            tmp_path: Some(tmp_path),
            file: Some(file),
            size: 0,
            hasher: Some(Hasher::new()),
            meta: MetaFile::new(file_type),
            uris: Vec::new(),
            internal_hash: None,
        })
    }

    /// Append to the staging file and feed the hasher and meta parser.
    pub fn write(&mut self, buf: &[u8]) -> crate::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or(EfsError::InvalidState("submission already ended"))?;
        file.write_all(buf)?;
        self.size += buf.len() as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(buf);
        }
        self.meta.update(buf);
        Ok(())
    }

    /// Drain `reader` to EOF, then finalise.
    pub fn write_from(&mut self, reader: &mut dyn Read) -> crate::Result<()> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
        }
        self.end()
    }

    /// Finalise digests and meta parsing and close the staging file.
    /// Fails if called twice.
    pub fn end(&mut self) -> crate::Result<()> {
        let hasher = self
            .hasher
            .take()
            .ok_or(EfsError::InvalidState("submission already ended"))?;
        let digests = hasher.finish();
        self.uris = digests.uris;
        self.internal_hash = Some(digests.internal_hash);
        self.meta.finish();
        self.file = None;
        Ok(())
    }

    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Canonical content address; available once ended.
    pub fn internal_hash(&self) -> Option<&str> {
        self.internal_hash.as_deref()
    }

    /// Content URIs, primary first; available once ended.
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn primary_uri(&self) -> Option<&str> {
        self.uris.first().map(String::as_str)
    }

    /// URIs the meta parser captured from the indexable prefix.
    pub fn captured_links(&self) -> &[String] {
        self.meta.captured_uris()
    }

    /// Commit into the repo within the caller's transaction or savepoint.
    ///
    /// The staging file is hard-linked to `data/<ii>/<H>` (already-exists
    /// is dedup success) and unlinked; the relational rows are all
    /// `INSERT OR IGNORE`. Re-running after a rolled-back transaction is
    /// safe: the content file stays in place and the filesystem step is
    /// skipped once the staging path is consumed.
    pub fn store(&mut self, conn: &Connection, user_id: i64) -> crate::Result<()> {
        let internal_hash = self
            .internal_hash
            .clone()
            .ok_or(EfsError::InvalidState("submission not ended"))?;
        let preferred_uri = self
            .primary_uri()
            .ok_or(EfsError::InvalidState("submission has no URIs"))?
            .to_string();

        if let Some(tmp_path) = &self.tmp_path {
            let internal_path = self.repo.internal_path(&internal_hash);
            if let Some(parent) = internal_path.parent() {
                mkdir_p(parent)?;
            }
            match fs::hard_link(tmp_path, &internal_path) {
                Ok(()) => {}
                // The blob is already in the content tree; same bytes.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    error!(
                        "couldn't move {} to {}",
                        tmp_path.display(),
                        internal_path.display()
                    );
                    return Err(e.into());
                }
            }
            let _ = fs::remove_file(tmp_path);
            self.tmp_path = None;
        }

        conn.execute(
            "INSERT OR IGNORE INTO files (internal_hash, file_type, file_size)
             VALUES (?, ?, ?)",
            params![internal_hash, self.file_type, self.size as i64],
        )?;
        // last_insert_rowid() is useless when the row already existed.
        let file_id: i64 = conn.query_row(
            "SELECT file_id FROM files WHERE internal_hash = ? AND file_type = ?",
            params![internal_hash, self.file_type],
            |row| row.get(0),
        )?;

        {
            let mut insert_uri = conn.prepare("INSERT OR IGNORE INTO uris (uri) VALUES (?)")?;
            let mut insert_file_uri = conn.prepare(
                "INSERT OR IGNORE INTO file_uris (file_id, uri_id)
                 SELECT ?, uri_id FROM uris WHERE uri = ? LIMIT 1",
            )?;
            for uri in &self.uris {
                insert_uri.execute([uri.as_str()])?;
                insert_file_uri.execute(params![file_id, uri])?;
            }
        }

        // The grant is self-issued: the session user is also the grantor.
        conn.execute(
            "INSERT OR IGNORE INTO file_permissions (file_id, user_id, meta_file_id)
             VALUES (?, ?, ?)",
            params![file_id, user_id, user_id],
        )?;

        self.meta.store(conn, file_id, &preferred_uri)?;
        Ok(())
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if let Some(tmp_path) = &self.tmp_path {
            let _ = fs::remove_file(tmp_path);
        }
    }
}

/// Single streaming sink that emits a (file, meta) submission pair on
/// `end`. The meta-file body is the primary URI line followed by the
/// URIs captured from the primary's indexable prefix.
pub struct SubmissionPair {
    primary: Submission,
}

impl SubmissionPair {
    pub fn create(repo: &Arc<Repo>, file_type: &str) -> crate::Result<Self> {
        Ok(Self {
            primary: Submission::create(repo, file_type)?,
        })
    }

    pub fn write(&mut self, buf: &[u8]) -> crate::Result<()> {
        self.primary.write(buf)
    }

    /// Finalise both submissions: the file itself and its companion
    /// meta-file.
    pub fn end(mut self) -> crate::Result<(Submission, Submission)> {
        self.primary.end()?;
        let source = self
            .primary
            .primary_uri()
            .ok_or(EfsError::InvalidState("submission has no URIs"))?;

        let mut body = String::with_capacity(64);
        body.push_str(source);
        body.push('\n');
        for uri in self.primary.captured_links() {
            body.push_str(uri);
            body.push('\n');
        }

        let repo = Arc::clone(&self.primary.repo);
        let mut meta = Submission::create(&repo, META_TYPE)?;
        meta.write(body.as_bytes())?;
        meta.end()?;
        Ok((self.primary, meta))
    }
}

impl Session {
    /// One-shot commit of a single submission in its own transaction.
    pub fn add_submission(&self, sub: &mut Submission) -> crate::Result<()> {
        let mut conn = self.repo().connect()?;
        let tx = conn.transaction()?;
        sub.store(&tx, self.user_id())?;
        tx.commit()?;
        Ok(())
    }
}
