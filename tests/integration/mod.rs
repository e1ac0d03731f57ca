//! Integration tests for Mimic
//!
//! Remote collections are real collections in a temporary directory served
//! over HTTP from a loopback listener. Every network operation runs end to end:
//! manifest fetch, diff, ordered phases and commit.

use ::mimic::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve files below `root` over HTTP, returning the base URI
///
/// Each connection handles one GET and is closed. Missing files get a 404.
async fn serve(root: PathBuf) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let root = root.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request = String::from_utf8_lossy(&request);
                let target = request.split_whitespace().nth(1).unwrap_or("/");
                let target = target.split('?').next().unwrap_or(target);
                let file = root.join(percent_decode(target.trim_start_matches('/')));
                let response = match fs::read(&file) {
                    Ok(body) if file.is_file() => {
                        let mut out = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        out.extend_from_slice(&body);
                        out
                    }
                    _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/", addr)
}

/// Decode `%XX` escapes in a request path
fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&path[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A served remote collection plus a local workspace
pub struct RemoteFixture {
    pub remote_dir: TempDir,
    pub local_dir: TempDir,
    pub base: String,
}

impl RemoteFixture {
    /// Create a remote collection with a small tree and serve it
    pub async fn new() -> Self {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let remote = Collection::init(remote_dir.path()).unwrap();

        fs::write(remote_dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(remote_dir.path().join("b")).unwrap();
        fs::write(remote_dir.path().join("b/c.txt"), b"charlie").unwrap();
        remote.add(remote.root(), &ScanOptions::default()).unwrap();

        let base = serve(remote.root().to_path_buf()).await;
        Self {
            remote_dir,
            local_dir,
            base,
        }
    }

    pub fn remote(&self) -> Collection {
        Collection::open(self.remote_dir.path()).unwrap()
    }

    pub fn settings(&self) -> HostSettings {
        HostSettings::new(self.base.clone(), "anonymous")
    }

    /// Initialize and configure a local collection at `name`
    pub fn local(&self, name: &str) -> Collection {
        let collection = Collection::init(&self.local_dir.path().join(name)).unwrap();
        collection.configure(Direction::Pull, self.settings()).unwrap();
        collection
    }

    /// Re-scan the remote after changing it
    pub fn refresh_remote(&self) {
        let remote = self.remote();
        remote.refresh(remote.root(), &RefreshOptions::default()).unwrap();
    }
}

fn options() -> TransferOptions {
    TransferOptions::default().with_max_concurrency(4)
}

fn assert_mirrors(local: &Collection, remote: &Collection) {
    let remote_records = remote.load_manifest().unwrap();
    assert_eq!(local.load_manifest().unwrap(), remote_records);
    for record in &remote_records {
        let path = local.root().join(record.path.trim_start_matches("./"));
        if record.is_dir() {
            assert!(path.is_dir(), "missing folder {}", record.path);
        } else {
            let expected = fs::read(remote.root().join(record.path.trim_start_matches("./"))).unwrap();
            assert_eq!(fs::read(&path).unwrap(), expected, "content of {}", record.path);
        }
    }
}

fn modified_millis(path: &Path) -> u64 {
    mimic::utils::to_millis(fs::metadata(path).unwrap().modified().unwrap())
}

#[tokio::test]
async fn test_pull_mirrors_remote() {
    let fixture = RemoteFixture::new().await;
    let local = fixture.local("mirror");

    let report = local.pull(&fixture.settings(), &options()).await.unwrap();
    assert_eq!(report.copied, 2);
    assert_eq!(report.bytes, 12);
    assert_eq!(report.created, 1);
    assert!(report.is_complete());
    assert!(report.committed);
    assert!(!local.staging_path().exists());

    let remote = fixture.remote();
    assert_mirrors(&local, &remote);

    let record = remote.load_manifest().unwrap().get("./a.txt").cloned().unwrap();
    assert_eq!(modified_millis(&local.root().join("a.txt")), record.modified);

    // Fetched times and restamped folders match, so nothing looks changed
    let status = local.status(local.root(), &RefreshOptions::default()).unwrap();
    assert!(!status.has_changes(), "unexpected changes: {:?}", status);
}

#[tokio::test]
async fn test_sync_converges_and_removes_entries() {
    let fixture = RemoteFixture::new().await;
    let local = fixture.local("mirror");
    local.sync_pull(&options()).await.unwrap();

    let remote_root = fixture.remote_dir.path();
    fs::remove_file(remote_root.join("b/c.txt")).unwrap();
    fs::write(remote_root.join("a.txt"), b"alpha-2").unwrap();
    fs::write(remote_root.join("d.txt"), b"delta").unwrap();
    fixture.refresh_remote();

    let report = local.sync_pull(&options()).await.unwrap();
    assert!(report.committed);
    assert!(report.removed >= 2);
    assert!(!local.root().join("b/c.txt").exists());
    assert_eq!(fs::read(local.root().join("a.txt")).unwrap(), b"alpha-2");
    assert_mirrors(&local, &fixture.remote());

    // Converged: nothing left to do
    let report = local.sync_pull(&options()).await.unwrap();
    assert_eq!((report.copied, report.removed, report.created), (0, 0, 0));
    assert!(report.committed);
}

#[tokio::test]
async fn test_failed_item_leaves_manifest_uncommitted() {
    let fixture = RemoteFixture::new().await;
    let remote = fixture.remote();
    let mut records = remote.load_manifest().unwrap();
    records.insert(ManifestRecord::file(4, 1_600_000_000_000, "ffff", "./ghost.txt"));
    remote.store_manifest(&records).unwrap();

    let local = fixture.local("mirror");
    let report = local.sync_pull(&options()).await.unwrap();

    assert_eq!(report.failed, vec!["./ghost.txt".to_string()]);
    assert!(!report.committed);
    assert!(local.load_manifest().unwrap().is_empty());
    assert!(!local.staging_path().exists());
    assert!(!local.root().join("ghost.txt").exists());
    // Everything else still arrived
    assert_eq!(fs::read(local.root().join("b/c.txt")).unwrap(), b"charlie");
}

#[tokio::test]
async fn test_blocked_folder_is_failed_and_blocks_commit() {
    let fixture = RemoteFixture::new().await;
    let local = fixture.local("mirror");
    // A plain file where the remote has folder `b`
    fs::write(local.root().join("b"), b"in the way").unwrap();

    let report = local.pull(&fixture.settings(), &options()).await.unwrap();
    assert!(report.failed.contains(&"./b".to_string()), "failed: {:?}", report.failed);
    assert!(report.failed.contains(&"./b/c.txt".to_string()));
    assert!(!report.committed);
    assert!(local.load_manifest().unwrap().is_empty());
    assert!(!local.staging_path().exists());

    // The unrelated file still arrived
    assert_eq!(report.copied, 1);
    assert_eq!(fs::read(local.root().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(local.root().join("b")).unwrap(), b"in the way");
}

#[tokio::test]
async fn test_missing_remote_manifest_is_an_error() {
    let fixture = RemoteFixture::new().await;
    let local = fixture.local("mirror");
    fs::write(local.root().join("keep.txt"), b"local").unwrap();
    local.add(local.root(), &ScanOptions::default()).unwrap();
    let before = local.load_manifest().unwrap();

    let settings = HostSettings::new(format!("{}nowhere", fixture.base), "anonymous");
    let result = local.sync_with_pull(&settings, &options()).await;
    assert!(matches!(result, Err(MimicError::TransferFailed { .. })));
    assert_eq!(local.load_manifest().unwrap(), before);
    assert!(local.root().join("keep.txt").exists());
}

#[tokio::test]
async fn test_clone_follows_remote_bundle() {
    let fixture = RemoteFixture::new().await;
    let remote = fixture.remote();
    let sub = Collection::init(&remote.root().join("sub")).unwrap();
    fs::write(sub.root().join("s.txt"), b"sierra").unwrap();
    sub.add(sub.root(), &ScanOptions::default()).unwrap();
    remote.bundle_add(sub.root(), false).unwrap();
    remote.add(remote.root(), &ScanOptions::default()).unwrap();

    let target = fixture.local_dir.path().join("clone");
    let clone = clone_collection(&target, Direction::Pull, fixture.settings(), &options())
        .await
        .unwrap();

    assert!(clone.report.committed);
    assert_eq!(clone.nested.len(), 1);
    assert!(matches!(clone.nested[0].result, Ok(BundleOutcome::Pulled(_))));

    let local = Collection::open(&target).unwrap();
    assert_mirrors(&local, &remote);
    assert!(local.load_bundle().unwrap().contains_key("./sub"));

    let local_sub = Collection::open_exact(&target.join("sub")).unwrap();
    assert_mirrors(&local_sub, &sub);
    let nested_uri = local_sub.pull_settings().unwrap().uri.unwrap();
    assert!(nested_uri.ends_with("/sub"), "{}", nested_uri);
}

#[tokio::test]
async fn test_clone_push_is_rejected_before_touching_disk() {
    let fixture = RemoteFixture::new().await;
    let target = fixture.local_dir.path().join("never");
    let result = clone_collection(&target, Direction::Push, fixture.settings(), &options()).await;
    assert!(matches!(result, Err(MimicError::PushNotImplemented)));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_pull_all_syncs_each_bundled_collection() {
    let fixture = RemoteFixture::new().await;
    let parent = Collection::init(&fixture.local_dir.path().join("parent")).unwrap();
    let child = Collection::init(&parent.root().join("child")).unwrap();
    child.configure(Direction::Pull, fixture.settings()).unwrap();
    parent.bundle_add(child.root(), false).unwrap();

    let visits = pull_all(&parent, &options()).await.unwrap();
    assert_eq!(visits.len(), 1);
    match &visits[0].result {
        Ok(BundleOutcome::Pulled(report)) => assert_eq!(report.copied, 2),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_mirrors(&child, &fixture.remote());
}

#[tokio::test]
async fn test_download_package_into_plain_folder() {
    let fixture = RemoteFixture::new().await;
    let records = fixture.remote().load_manifest().unwrap();
    let package = fixture.local_dir.path().join("files.pkg");
    let text = format!(
        "# {{\"uri\": \"{}\"}}\n{}",
        fixture.base,
        mimic::manifest::format_manifest(&records, false)
    );
    fs::write(&package, text).unwrap();

    let home = fixture.local_dir.path().join("download");
    let report = download(&home, &package, None, None, &options()).await.unwrap();
    assert_eq!(report.copied, 2);
    assert!(report.is_complete());
    assert_eq!(fs::read(home.join("b/c.txt")).unwrap(), b"charlie");
    assert!(!home.join(".mimic").exists());
}

#[test]
fn test_bundle_refresh_visits_depth_first_in_key_order() {
    let temp_dir = TempDir::new().unwrap();
    let top = Collection::init(temp_dir.path()).unwrap();
    let x = Collection::init(&top.root().join("x")).unwrap();
    let z = Collection::init(&x.root().join("z")).unwrap();
    let y = Collection::init(&top.root().join("y")).unwrap();
    for (collection, name) in [(&x, "x.txt"), (&y, "y.txt"), (&z, "z.txt")] {
        fs::write(collection.root().join(name), name).unwrap();
    }
    top.bundle_add(y.root(), false).unwrap();
    top.bundle_add(x.root(), false).unwrap();
    x.bundle_add(z.root(), false).unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let visits = runtime
        .block_on(refresh_all(&top, &RefreshOptions::default()))
        .unwrap();

    let order: Vec<PathBuf> = visits.iter().map(|v| v.root.clone()).collect();
    assert_eq!(
        order,
        vec![x.root().to_path_buf(), z.root().to_path_buf(), y.root().to_path_buf()]
    );
    for visit in &visits {
        match &visit.result {
            Ok(BundleOutcome::Refreshed(report)) => assert!(report.added.files >= 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(z.load_manifest().unwrap().contains("./z.txt"));
}

// `?` is not a valid file name character on Windows
#[cfg(unix)]
#[tokio::test]
async fn test_pull_fetches_names_needing_escapes() {
    let fixture = RemoteFixture::new().await;
    let remote_root = fixture.remote_dir.path();
    fs::write(remote_root.join("a#1.txt"), b"hash").unwrap();
    fs::write(remote_root.join("what?.txt"), b"query").unwrap();
    fs::write(remote_root.join("two words.txt"), b"space").unwrap();
    fixture.refresh_remote();

    let local = fixture.local("mirror");
    let report = local.pull(&fixture.settings(), &options()).await.unwrap();
    assert!(report.is_complete(), "failed: {:?}", report.failed);
    assert!(report.committed);
    assert_eq!(fs::read(local.root().join("a#1.txt")).unwrap(), b"hash");
    assert_eq!(fs::read(local.root().join("what?.txt")).unwrap(), b"query");
    assert_eq!(fs::read(local.root().join("two words.txt")).unwrap(), b"space");
    assert_mirrors(&local, &fixture.remote());
}
