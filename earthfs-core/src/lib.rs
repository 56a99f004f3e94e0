//! EarthFS Core - content-addressed file repository
//!
//! This library provides the repository layout, embedded store access,
//! and the streaming submission path (hashing + meta-file parsing) used
//! to commit files into a repo.

pub mod config;
pub mod error;
pub mod hasher;
pub mod meta_file;
pub mod repo;
pub mod submission;

pub use config::PullConfig;
pub use error::EfsError;
pub use hasher::{parse_uri, Digests, Hasher};
pub use meta_file::{MetaFile, INDEXABLE_PREFIX, META_TYPE};
pub use repo::{Repo, Session};
pub use submission::{Submission, SubmissionPair};

/// Result type alias for earthfs operations
pub type Result<T> = std::result::Result<T, EfsError>;
