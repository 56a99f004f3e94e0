//! Pull coordinator: reader fetchers and a single batch writer over a
//! shared listing connection.
//!
//! Readers take turns consuming one URI line from the listing (and
//! reserving a slot pair for it) under the listing lock, then download
//! and hash outside it so fetches overlap. The writer drains the batch
//! into the store inside one savepoint. Backpressure is a fixed-size
//! batch: readers block when no slot pair is free, the writer blocks
//! until every reserved slot is fulfilled.

use crossbeam_channel::{bounded, Receiver};
use earthfs_core::{
    parse_uri, EfsError, PullConfig, Result, Session, Submission, SubmissionPair,
};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::peer::{Listing, PeerClient};

/// Concurrent fetcher tasks per pull.
pub const READER_COUNT: usize = 4;
/// Submission slots per batch; even, reserved and filled in
/// (file, meta) pairs.
pub const BATCH_SIZE: usize = 10;
/// Backoff before retrying any failed network or store operation.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fixed-capacity submission batch. `reserved` is the next free pair
/// index, `fulfilled` counts deposited slots; both only ever reset to
/// zero together on writer drain.
struct Batch {
    slots: Vec<Option<Submission>>,
    reserved: usize,
    fulfilled: usize,
}

struct ListingState {
    listing: Option<Listing>,
}

struct Shared {
    session: Session,
    config: PullConfig,
    peer: PeerClient,
    cookie: Mutex<Option<String>>,
    stop: AtomicBool,
    /// Serialises listing reads and slot reservation. Lock order is
    /// always listing before batch.
    listing: Mutex<ListingState>,
    batch: Mutex<Batch>,
    /// Readers wait here for the writer to drain a full batch.
    slot_freed: Condvar,
    /// The writer waits here for deposits.
    batch_ready: Condvar,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// One pull subscription, replicating a peer repository into the local
/// session's repo.
pub struct Pull {
    shared: Arc<Shared>,
    exits: Option<Receiver<()>>,
}

impl Pull {
    pub fn new(session: Session, config: PullConfig) -> Result<Self> {
        let peer = PeerClient::new(&config.host)?;
        let shared = Arc::new(Shared {
            peer,
            cookie: Mutex::new(config.cookie.clone()),
            session,
            config,
            stop: AtomicBool::new(false),
            listing: Mutex::new(ListingState { listing: None }),
            batch: Mutex::new(Batch {
                slots: (0..BATCH_SIZE).map(|_| None).collect(),
                reserved: 0,
                fulfilled: 0,
            }),
            slot_freed: Condvar::new(),
            batch_ready: Condvar::new(),
        });
        Ok(Self {
            shared,
            exits: None,
        })
    }

    /// Spawn `READER_COUNT` reader tasks and one writer task, then
    /// return.
    pub fn start(&mut self) -> Result<()> {
        if self.exits.is_some() {
            return Err(EfsError::InvalidState("pull already running"));
        }
        info!(pull_id = self.shared.config.pull_id, "pull starting");
        let (exit_tx, exit_rx) = bounded(READER_COUNT + 1);
        for i in 0..READER_COUNT {
            let shared = Arc::clone(&self.shared);
            let exit = exit_tx.clone();
            thread::Builder::new()
                .name(format!("efs-pull-reader-{i}"))
                .spawn(move || {
                    reader(&shared);
                    let _ = exit.send(());
                })?;
        }
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("efs-pull-writer".to_string())
            .spawn(move || {
                writer(&shared);
                let _ = exit_tx.send(());
            })?;
        self.exits = Some(exit_rx);
        Ok(())
    }

    /// Signal stop, wake every blocked task, and wait until all
    /// `READER_COUNT + 1` tasks have exited. Submissions still sitting
    /// in the batch are released.
    pub fn stop(&mut self) {
        let Some(exits) = self.exits.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        // Hold the batch lock across the notify so no task sits between
        // its stop check and its wait.
        drop(self.shared.batch.lock().unwrap());
        self.shared.slot_freed.notify_all();
        self.shared.batch_ready.notify_all();
        for _ in 0..READER_COUNT + 1 {
            let _ = exits.recv();
        }

        let mut batch = self.shared.batch.lock().unwrap();
        for slot in batch.slots.iter_mut() {
            slot.take();
        }
        batch.reserved = 0;
        batch.fulfilled = 0;
        drop(batch);

        self.shared.listing.lock().unwrap().listing = None;
        self.shared.stop.store(false, Ordering::SeqCst);
        info!(pull_id = self.shared.config.pull_id, "pull stopped");
    }
}

impl Drop for Pull {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader(shared: &Shared) {
    // Per-reader fetch connection, cached across imports and dropped on
    // any HTTP error.
    let mut conn: Option<PeerClient> = None;
    while !shared.stopped() {
        let Some((uri, slot)) = next_uri(shared) else {
            continue;
        };
        loop {
            match import(shared, &uri, slot, &mut conn) {
                Ok(()) => break,
                Err(EfsError::Cancelled) => break,
                Err(e) => {
                    error!("import of {uri} failed: {e}");
                    if shared.stopped() {
                        break;
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
}

/// Read one URI from the shared listing and reserve a slot pair for it.
/// The listing lock is held across both so batch slot order tracks
/// listing order. `None` means go around again: stop was signalled, or
/// the listing was just (re)connected.
fn next_uri(shared: &Shared) -> Option<(String, usize)> {
    let mut state = shared.listing.lock().unwrap();
    let uri = loop {
        if shared.stopped() {
            return None;
        }
        let result = match state.listing.as_mut() {
            Some(listing) => listing.read_uri(),
            None => Ok(None),
        };
        match result {
            Ok(Some(uri)) => break uri,
            Ok(None) | Err(_) => {
                if let Err(e) = result {
                    debug!("listing read failed: {e}");
                }
                // Listing over or broken. Reconnect with backoff while
                // still holding the listing lock, so exactly one reader
                // re-establishes the connection.
                loop {
                    if shared.stopped() {
                        return None;
                    }
                    match reconnect(shared, &mut state) {
                        Ok(()) => return None,
                        Err(e) => {
                            error!("pull connection error: {e}");
                            if shared.stopped() {
                                return None;
                            }
                            thread::sleep(RETRY_DELAY);
                        }
                    }
                }
            }
        }
    };

    // Reserve two adjacent slots, blocking while the batch has no room.
    let mut batch = shared.batch.lock().unwrap();
    while batch.reserved + 2 > BATCH_SIZE {
        if shared.stopped() {
            return None;
        }
        batch = shared.slot_freed.wait(batch).unwrap();
    }
    let slot = batch.reserved;
    batch.reserved += 2;
    debug_assert!(batch.fulfilled <= batch.reserved && batch.reserved <= BATCH_SIZE);
    Some((uri, slot))
}

/// Tear down any stale listing and open a fresh one. A 403 triggers one
/// re-auth attempt; the error is still returned so the caller retries
/// the listing with the new cookie.
fn reconnect(shared: &Shared, state: &mut ListingState) -> Result<()> {
    state.listing = None;
    let cookie = shared.cookie.lock().unwrap().clone();
    match shared.peer.query_listing(cookie.as_deref()) {
        Ok(listing) => {
            debug!("listing connected");
            state.listing = Some(listing);
            Ok(())
        }
        Err(EfsError::AuthRequired) => {
            warn!("listing refused, re-authenticating");
            match shared.peer.auth() {
                Ok(new_cookie) => *shared.cookie.lock().unwrap() = Some(new_cookie),
                Err(e) => error!("auth failed: {e}"),
            }
            Err(EfsError::AuthRequired)
        }
        Err(e) => Err(e),
    }
}

/// Download one URI into a submission pair and deposit it in the
/// reserved slots. An unparseable URI deposits a null pair: the slots
/// were reserved, so the writer must still see them fulfilled.
fn import(
    shared: &Shared,
    uri: &str,
    slot: usize,
    conn: &mut Option<PeerClient>,
) -> Result<()> {
    let pair = match parse_uri(uri) {
        Some((algo, hash)) => match fetch(shared, uri, algo, hash, conn) {
            Ok(pair) => Some(pair),
            // A 4xx on the file itself won't heal with a retry: fill the
            // reserved pair with nulls and move on. (403 stays retryable;
            // reconnect refreshes the cookie.)
            Err(EfsError::Status(status)) if (400..500).contains(&status) => {
                warn!("peer has no usable copy of {uri} (status {status})");
                None
            }
            Err(e) => return Err(e),
        },
        None => {
            warn!("skipping unparseable URI {uri:?}");
            None
        }
    };

    let (sub, meta) = match pair {
        Some((sub, meta)) => (Some(sub), Some(meta)),
        None => (None, None),
    };
    let mut batch = shared.batch.lock().unwrap();
    batch.slots[slot] = sub;
    batch.slots[slot + 1] = meta;
    batch.fulfilled += 2;
    debug_assert!(batch.fulfilled <= batch.reserved);
    drop(batch);
    shared.batch_ready.notify_one();
    Ok(())
}

fn fetch(
    shared: &Shared,
    uri: &str,
    algo: &str,
    hash: &str,
    conn: &mut Option<PeerClient>,
) -> Result<(Submission, Submission)> {
    info!("pulling {uri}");
    let client = match conn {
        Some(client) => &*client,
        None => &*conn.insert(PeerClient::new(&shared.config.host)?),
    };
    let cookie = shared.cookie.lock().unwrap().clone();
    let result = fetch_one(shared, client, algo, hash, cookie.as_deref());
    if result.is_err() {
        // The exchange may have left the connection in an unknown state.
        *conn = None;
    }
    result
}

fn fetch_one(
    shared: &Shared,
    client: &PeerClient,
    algo: &str,
    hash: &str,
    cookie: Option<&str>,
) -> Result<(Submission, Submission)> {
    let mut resp = client.fetch_file(algo, hash, cookie)?;
    let mut pair = SubmissionPair::create(shared.session.repo(), resp.content_type())?;
    let mut buf = [0u8; 16 * 1024];
    loop {
        if shared.stopped() {
            return Err(EfsError::Cancelled);
        }
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pair.write(&buf[..n])?;
    }
    pair.end()
}

fn writer(shared: &Shared) {
    while !shared.stopped() {
        let Some(mut snapshot) = next_batch(shared) else {
            continue;
        };
        shared.slot_freed.notify_all();
        if snapshot.is_empty() {
            // Every pair in the batch was null.
            continue;
        }
        loop {
            match commit_batch(shared, &mut snapshot) {
                Ok(()) => {
                    info!(count = snapshot.len(), "batch committed");
                    break;
                }
                Err(e) => {
                    error!("batch commit failed: {e}");
                    if shared.stopped() {
                        break;
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
        // Dropping the snapshot releases any uncommitted staging files.
    }
}

/// Wait until the batch is quiescent (every reserved slot fulfilled,
/// at least one pair present), then take its submissions and reset the
/// counters. `None` on stop.
fn next_batch(shared: &Shared) -> Option<Vec<Submission>> {
    let mut batch = shared.batch.lock().unwrap();
    while batch.fulfilled == 0 || batch.fulfilled != batch.reserved {
        if shared.stopped() {
            return None;
        }
        batch = shared.batch_ready.wait(batch).unwrap();
    }
    let snapshot = batch.slots.iter_mut().filter_map(|s| s.take()).collect();
    batch.reserved = 0;
    batch.fulfilled = 0;
    Some(snapshot)
}

/// Store every submission of the batch inside a single savepoint; any
/// failure rolls the whole batch back for a clean retry.
fn commit_batch(shared: &Shared, batch: &mut [Submission]) -> Result<()> {
    let mut conn = shared.session.repo().connect()?;
    let sp = conn.savepoint_with_name("store")?;
    for sub in batch.iter_mut() {
        sub.store(&sp, shared.session.user_id())?;
    }
    sp.commit()?;
    Ok(())
}
