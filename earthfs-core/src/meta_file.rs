//! Meta-file parsing: inter-document links extracted from the indexable
//! prefix of a byte stream.
//!
//! Meta-files (type [`META_TYPE`]) carry an explicit link list: the first
//! line is the source URI, subsequent lines are targets. Any other type is
//! scanned for content URIs embedded in its text; those become the captured
//! list a [`crate::SubmissionPair`] writes into the companion meta-file.

use crate::hasher::parse_uri;
use rusqlite::{params, Connection};

/// Only the first `INDEXABLE_PREFIX` bytes of a stream are parsed for
/// links; larger files get partial metadata and `has_more` is set.
pub const INDEXABLE_PREFIX: usize = 100 * 1024;

/// MIME type of the companion meta-file a pull stores next to each import.
pub const META_TYPE: &str = "text/x-earthfs-meta";

/// Streaming link parser over the indexable prefix.
pub struct MetaFile {
    is_meta: bool,
    prefix: Vec<u8>,
    has_more: bool,
    /// URIs captured from the prefix, in order of appearance. Populated
    /// by `finish`.
    captured: Vec<String>,
    /// Meta type only: the body's first line parsed as a URI, making
    /// `captured[0]` the link source.
    explicit_source: bool,
}

impl MetaFile {
    pub fn new(file_type: &str) -> Self {
        Self {
            is_meta: file_type == META_TYPE,
            prefix: Vec::new(),
            has_more: false,
            captured: Vec::new(),
            explicit_source: false,
        }
    }

    /// Buffer bytes up to the indexable prefix; the rest only flips
    /// `has_more`.
    pub fn update(&mut self, buf: &[u8]) {
        let room = INDEXABLE_PREFIX.saturating_sub(self.prefix.len());
        if buf.len() > room {
            self.has_more = true;
        }
        self.prefix.extend_from_slice(&buf[..buf.len().min(room)]);
    }

    /// Parse the buffered prefix. Deterministic given bytes + type.
    pub fn finish(&mut self) {
        let text = String::from_utf8_lossy(&self.prefix);
        if self.is_meta {
            for (i, line) in text.lines().enumerate() {
                let line = line.trim();
                if parse_uri(line).is_some() {
                    if i == 0 {
                        self.explicit_source = true;
                    }
                    self.captured.push(line.to_string());
                }
            }
        } else {
            for token in text.split_whitespace() {
                if parse_uri(token).is_some() {
                    self.captured.push(token.to_string());
                }
            }
        }
        self.prefix = Vec::new();
    }

    /// True when the stream ran past the indexable prefix and link
    /// extraction was truncated.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn captured_uris(&self) -> &[String] {
        &self.captured
    }

    /// Emit `links` rows for a stored meta-file. Source is the parsed
    /// slot 0 when the body led with one, else `preferred_uri`; remaining
    /// URIs are targets. Non-meta types emit nothing — their captured
    /// URIs reach the store through the companion meta-file.
    pub fn store(
        &self,
        conn: &Connection,
        meta_file_id: i64,
        preferred_uri: &str,
    ) -> crate::Result<()> {
        if !self.is_meta {
            return Ok(());
        }
        let (source, targets) = if self.explicit_source {
            (self.captured[0].as_str(), &self.captured[1..])
        } else {
            (preferred_uri, &self.captured[..])
        };
        if targets.is_empty() {
            return Ok(());
        }

        let mut insert_uri = conn.prepare("INSERT OR IGNORE INTO uris (uri) VALUES (?)")?;
        let mut insert_link = conn.prepare(
            "INSERT OR IGNORE INTO links (source_uri_id, target_uri_id, meta_file_id)
             SELECT s.uri_id, t.uri_id, ? FROM uris s, uris t WHERE s.uri = ? AND t.uri = ?",
        )?;
        insert_uri.execute([source])?;
        for target in targets {
            insert_uri.execute([target.as_str()])?;
            insert_link.execute(params![meta_file_id, source, target])?;
        }
        Ok(())
    }
}
