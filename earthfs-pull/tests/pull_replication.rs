//! End-to-end pull replication tests against an in-process peer server.

use earthfs_core::{PullConfig, Repo, Session, Submission, META_TYPE};
use earthfs_pull::Pull;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Minimal peer: serves the listing, file fetches, and auth.
struct PeerState {
    listing: Vec<String>,
    /// `<algo>:<hash>` -> (content type, bytes)
    files: HashMap<String, (String, Vec<u8>)>,
    /// When set, listing and file routes demand this exact Cookie value.
    require_cookie: Option<String>,
    /// When set, file bodies are written in two chunks with this pause.
    body_delay: Option<Duration>,
    auth_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl PeerState {
    fn new() -> Self {
        Self {
            listing: Vec::new(),
            files: HashMap::new(),
            require_cookie: None,
            body_delay: None,
            auth_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    fn with_file(mut self, content_type: &str, body: &[u8]) -> Self {
        let uri = format!("sha256:{}", hex::encode(Sha256::digest(body)));
        self.listing.push(uri.clone());
        self.files
            .insert(uri, (content_type.to_string(), body.to_vec()));
        self
    }
}

fn spawn_peer(state: Arc<PeerState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let state = Arc::clone(&state);
            std::thread::spawn(move || handle(stream, &state));
        }
    });
    format!("127.0.0.1:{port}")
}

fn handle(mut stream: TcpStream, state: &PeerState) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut cookie = None;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("cookie") {
                cookie = Some(value.trim().to_string());
            }
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method == "POST" && path == "/auth" {
        state.auth_calls.fetch_add(1, Ordering::SeqCst);
        let session = state
            .require_cookie
            .clone()
            .unwrap_or_else(|| "s=anon".to_string());
        respond(
            &mut stream,
            "200 OK",
            &[
                ("Set-Cookie", &format!("{session}; Path=/; HttpOnly")),
                ("Content-Length", "0"),
            ],
            b"",
        );
        return;
    }

    let authed = match &state.require_cookie {
        None => true,
        Some(expected) => cookie.as_deref() == Some(expected.as_str()),
    };
    if !authed {
        respond(
            &mut stream,
            "403 Forbidden",
            &[("Content-Length", "0")],
            b"",
        );
        return;
    }

    if method == "GET" && path.starts_with("/query") {
        let mut body = state.listing.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        respond(
            &mut stream,
            "200 OK",
            &[
                ("Content-Type", "text/uri-list"),
                ("Content-Length", &body.len().to_string()),
            ],
            body.as_bytes(),
        );
        return;
    }

    if method == "GET" && path.starts_with("/file/") {
        state.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let key = path["/file/".len()..].replacen('/', ":", 1);
        match state.files.get(&key) {
            Some((content_type, body)) => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                if let Some(delay) = state.body_delay {
                    let mid = body.len() / 2;
                    let _ = stream.write_all(&body[..mid]);
                    let _ = stream.flush();
                    std::thread::sleep(delay);
                    let _ = stream.write_all(&body[mid..]);
                } else {
                    let _ = stream.write_all(body);
                }
                let _ = stream.flush();
            }
            None => respond(
                &mut stream,
                "404 Not Found",
                &[("Content-Length", "0")],
                b"",
            ),
        }
        return;
    }

    respond(
        &mut stream,
        "404 Not Found",
        &[("Content-Length", "0")],
        b"",
    );
}

fn respond(stream: &mut TcpStream, status: &str, headers: &[(&str, &str)], body: &[u8]) {
    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

/// Honors RUST_LOG when debugging a test run.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_repo() -> (TempDir, Arc<Repo>) {
    let dir = TempDir::new().unwrap();
    let repo = Repo::create(dir.path().join("repo")).unwrap();
    (dir, Arc::new(repo))
}

fn config(host: &str, pull_id: i64, user_id: i64) -> PullConfig {
    PullConfig {
        pull_id,
        user_id,
        host: host.to_string(),
        username: String::new(),
        password: String::new(),
        cookie: None,
        query: None,
    }
}

fn count(repo: &Repo, sql: &str) -> i64 {
    let conn = repo.connect().unwrap();
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

/// Poll until `pred` holds or the timeout elapses.
fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn tmp_is_empty(repo: &Repo) -> bool {
    std::fs::read_dir(repo.tmp_path()).unwrap().count() == 0
}

#[test]
fn test_pull_imports_listing() {
    init_logs();
    let state = Arc::new(
        PeerState::new()
            .with_file("text/plain", b"A")
            .with_file("text/plain", b"BB"),
    );
    let host = spawn_peer(Arc::clone(&state));
    let (_dir, repo) = test_repo();

    let mut pull = Pull::new(Session::new(Arc::clone(&repo), 1), config(&host, 1, 1)).unwrap();
    pull.start().unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || count(
            &repo,
            "SELECT COUNT(*) FROM files WHERE file_type = 'text/plain'"
        ) == 2),
        "both files imported"
    );
    pull.stop();

    let conn = repo.connect().unwrap();
    let sizes: Vec<i64> = {
        let mut stmt = conn
            .prepare("SELECT file_size FROM files WHERE file_type = 'text/plain' ORDER BY file_size")
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    };
    assert_eq!(sizes, [1, 2]);

    // Each blob landed at data/<ii>/<H>.
    for body in [&b"A"[..], &b"BB"[..]] {
        let hash = hex::encode(Sha256::digest(body));
        assert!(repo.internal_path(&hash).is_file(), "blob {hash} stored");
    }

    // Primary plus sha1 URI per file.
    let file_uris: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM file_uris
             WHERE file_id IN (SELECT file_id FROM files WHERE file_type = 'text/plain')",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(file_uris, 4);

    // Companion meta-files were committed alongside.
    let metas: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM files WHERE file_type = ?",
            [META_TYPE],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(metas, 2);

    assert!(tmp_is_empty(&repo), "no staging files leaked");
}

#[test]
fn test_missing_file_yields_null_pair_and_progress() {
    init_logs();
    let mut state = PeerState::new();
    // Advertised but not fetchable: every fetch 404s.
    state
        .listing
        .push(format!("sha256:{}", hex::encode(Sha256::digest(b"CC"))));
    let state = Arc::new(state);
    let host = spawn_peer(Arc::clone(&state));
    let (_dir, repo) = test_repo();

    let mut pull = Pull::new(Session::new(Arc::clone(&repo), 1), config(&host, 2, 1)).unwrap();
    pull.start().unwrap();

    // The reader moves on past the 404 (the listing repeats, so the URI
    // is fetched again on the next cycle) instead of wedging.
    assert!(
        wait_until(Duration::from_secs(10), || {
            state.fetch_calls.load(Ordering::SeqCst) >= 2
        }),
        "reader kept making progress after 404"
    );
    assert_eq!(count(&repo, "SELECT COUNT(*) FROM files"), 0);
    pull.stop();
    assert!(tmp_is_empty(&repo));
}

#[test]
fn test_listing_403_triggers_single_reauth() {
    init_logs();
    let mut state = PeerState::new().with_file("text/plain", b"DD");
    state.require_cookie = Some("s=sesame".to_string());
    let state = Arc::new(state);
    let host = spawn_peer(Arc::clone(&state));
    let (_dir, repo) = test_repo();

    let mut pull = Pull::new(Session::new(Arc::clone(&repo), 1), config(&host, 3, 1)).unwrap();
    pull.start().unwrap();

    // First listing attempt 403s, auth captures the cookie, and the
    // retried listing succeeds after one backoff.
    assert!(
        wait_until(Duration::from_secs(15), || count(
            &repo,
            "SELECT COUNT(*) FROM files WHERE file_type = 'text/plain'"
        ) == 1),
        "import succeeded after re-auth"
    );
    assert_eq!(state.auth_calls.load(Ordering::SeqCst), 1);
    pull.stop();
}

#[test]
fn test_stop_mid_download_joins_all_tasks() {
    init_logs();
    let mut state = PeerState::new()
        .with_file("text/plain", b"a slow body that arrives in two chunks")
        .with_file("text/plain", b"another slow body");
    state.body_delay = Some(Duration::from_millis(500));
    let state = Arc::new(state);
    let host = spawn_peer(Arc::clone(&state));
    let (_dir, repo) = test_repo();

    let mut pull = Pull::new(Session::new(Arc::clone(&repo), 1), config(&host, 4, 1)).unwrap();
    pull.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // stop() resumes only after all READER_COUNT + 1 tasks exit.
    let start = Instant::now();
    pull.stop();
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "all tasks exited within one backoff cycle"
    );
    assert!(tmp_is_empty(&repo), "no staging files leaked on stop");
}

#[test]
fn test_batch_rolls_back_and_retries_exactly_once() {
    // Writer-shaped commit: everything inside one savepoint, a failure
    // rolls the whole batch back, the retry commits each row once.
    let (_dir, repo) = test_repo();
    let mut subs: Vec<Submission> = Vec::new();
    for body in [&b"one"[..], b"two", b"three"] {
        let mut sub = Submission::create(&repo, "text/plain").unwrap();
        sub.write(body).unwrap();
        sub.end().unwrap();
        subs.push(sub);
    }
    // Not ended: storing this one fails after the first two stored.
    let mut broken = Submission::create(&repo, "text/plain").unwrap();
    broken.write(b"late").unwrap();

    let mut conn = repo.connect().unwrap();
    {
        let sp = conn.savepoint_with_name("store").unwrap();
        let mut failed = false;
        for sub in subs.iter_mut().take(2) {
            sub.store(&sp, 1).unwrap();
        }
        if broken.store(&sp, 1).is_err() {
            failed = true;
        }
        assert!(failed);
        // Dropped uncommitted: rollback.
    }
    assert_eq!(count(&repo, "SELECT COUNT(*) FROM files"), 0);

    // Retry the whole batch; already-linked content files are fine.
    broken.end().unwrap();
    subs.push(broken);
    let sp = conn.savepoint_with_name("store").unwrap();
    for sub in subs.iter_mut() {
        sub.store(&sp, 1).unwrap();
    }
    sp.commit().unwrap();

    assert_eq!(count(&repo, "SELECT COUNT(*) FROM files"), 4);
    assert_eq!(count(&repo, "SELECT COUNT(*) FROM file_uris"), 8);
    assert!(tmp_is_empty(&repo));
}

#[test]
fn test_concurrent_pulls_dedup_one_file() {
    init_logs();
    let state = Arc::new(PeerState::new().with_file("text/plain", b"shared"));
    let host = spawn_peer(Arc::clone(&state));
    let (_dir, repo) = test_repo();

    let mut pull_a = Pull::new(Session::new(Arc::clone(&repo), 1), config(&host, 5, 1)).unwrap();
    let mut pull_b = Pull::new(Session::new(Arc::clone(&repo), 2), config(&host, 6, 2)).unwrap();
    pull_a.start().unwrap();
    pull_b.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || count(
            &repo,
            "SELECT COUNT(DISTINCT user_id) FROM file_permissions"
        ) == 2),
        "both sessions granted"
    );
    pull_a.stop();
    pull_b.stop();

    assert_eq!(
        count(&repo, "SELECT COUNT(*) FROM files WHERE file_type = 'text/plain'"),
        1,
        "same bytes dedup to one file row"
    );
}
