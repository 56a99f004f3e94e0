//! Pull replication for earthfs.
//!
//! Streams a remote peer's URI listing, fetches each file by its content
//! hash, verifies integrity while hashing, and transactionally commits
//! batches of submissions to the local repository.

pub mod peer;
pub mod pull;

pub use peer::{FileResponse, Listing, PeerClient, URI_MAX};
pub use pull::{Pull, BATCH_SIZE, READER_COUNT, RETRY_DELAY};
