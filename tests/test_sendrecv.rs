use std::{fs::File,
          io::{Seek, SeekFrom, Write},
          time::{Duration, Instant}};

use tempdir::TempDir;

use libzfs::{errors::{codes::*, ErrorKind},
             native::memory::MemoryBackend,
             property::PropertySource,
             zfs::{receive, Dataset, DatasetProp, DatasetProperties, DatasetType, OutputScrapingEstimator, RecvFlags,
                   SendFlags, SendSizeEstimator},
             zpool::{CreatePoolRequest, Pool, VdevSpec},
             Config, Libzfs};

static ONE_MB_IN_BYTES: u64 = 1024 * 1024;
static STREAM_SIZE: u64 = 43520;

fn setup() -> (TempDir, MemoryBackend, Libzfs) {
    let dir = TempDir::new("sendrecv-tests").unwrap();
    let vdev = dir.path().join("vdev0");
    File::create(&vdev).unwrap().set_len(64 * ONE_MB_IN_BYTES).unwrap();

    let backend = MemoryBackend::new();
    let config = Config::builder().create_open_backoff(Duration::from_millis(1)).build().unwrap();
    let zfs = Libzfs::with_config(backend.clone(), config);
    let request = CreatePoolRequest::builder().name("tank").vdevs(vec![VdevSpec::file(vdev)]).build().unwrap();
    Pool::create(&zfs, &request).unwrap();
    Dataset::create(&zfs, "tank/a", DatasetType::FILESYSTEM, &DatasetProperties::new()).unwrap();
    (dir, backend, zfs)
}

fn snapshot(zfs: &Libzfs, path: &str) -> Dataset {
    Dataset::snapshot(zfs, path, false, &DatasetProperties::new()).unwrap()
}

fn rewind(mut file: File) -> File {
    file.seek(SeekFrom::Start(0)).unwrap();
    file
}

fn exists(zfs: &Libzfs, path: &str) -> bool { Dataset::open(zfs, path).is_ok() }

#[test]
fn full_then_incremental() {
    let (_dir, _backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");

    let stream = tempfile::tempfile().unwrap();
    s1.send(&stream, SendFlags::empty()).unwrap();
    receive(&zfs, "tank/b", &rewind(stream), RecvFlags::empty()).unwrap();
    assert!(exists(&zfs, "tank/b@s1"));
    let b = Dataset::open(&zfs, "tank/b").unwrap();
    assert_eq!(Some("/tank/b".to_string()), b.is_mounted().unwrap());

    let s2 = snapshot(&zfs, "tank/a@s2");
    let stream = tempfile::tempfile().unwrap();
    s2.send_from("@s1", &stream, SendFlags::empty()).unwrap();
    b.receive(&rewind(stream), RecvFlags::empty()).unwrap();
    assert!(exists(&zfs, "tank/b@s2"));

    // Same thing with the source spelled out in full.
    let s3 = snapshot(&zfs, "tank/a@s3");
    let stream = tempfile::tempfile().unwrap();
    s3.send_from("tank/a@s2", &stream, SendFlags::empty()).unwrap();
    b.receive(&rewind(stream), RecvFlags::empty()).unwrap();
    assert!(exists(&zfs, "tank/b@s3"));
}

#[test]
fn incremental_source_checks() {
    let (_dir, _backend, zfs) = setup();
    Dataset::create(&zfs, "tank/other", DatasetType::FILESYSTEM, &DatasetProperties::new()).unwrap();
    snapshot(&zfs, "tank/a@s1");
    let s2 = snapshot(&zfs, "tank/a@s2");
    let out = tempfile::tempfile().unwrap();

    let err = s2.send_from("tank/other@s1", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Unsupported, err.kind());
    assert_eq!("Incremental source must be in same filesystem.", err.to_string());

    let err = s2.send_from("tank/a", &out, SendFlags::empty()).unwrap_err();
    assert_eq!("Invalid incremental source.", err.to_string());
    let err = s2.send_from("@s1@s0", &out, SendFlags::empty()).unwrap_err();
    assert_eq!("Invalid incremental source.", err.to_string());
    for from in &["@s1/x", "tank/a@", "tank/a#mark", "tank/a@s1#x"] {
        let err = s2.send_from(from, &out, SendFlags::empty()).unwrap_err();
        assert_eq!("Invalid incremental source.", err.to_string(), "{}", from);
    }
    let err = s2.send_from("tank@s1", &out, SendFlags::empty()).unwrap_err();
    assert_eq!("Incremental source must be in same filesystem.", err.to_string());

    // Later snapshot as the source.
    let s1 = Dataset::open(&zfs, "tank/a@s1").unwrap();
    let err = s1.send_from("@s2", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(EZFS_BADBACKUP, err.code());
    let err = s1.send_from("@nope", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(EZFS_NOENT, err.code());
}

#[test]
fn send_needs_a_snapshot() {
    let (_dir, _backend, zfs) = setup();
    let a = Dataset::open(&zfs, "tank/a").unwrap();
    let out = tempfile::tempfile().unwrap();

    let err = a.send(&out, SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Unsupported, err.kind());
    assert_eq!("Unsupported method on filesystem or bookmark. Use send_one() for that purpose.", err.to_string());
    assert_eq!(EZFS_NOTSUP, err.code());
}

#[test]
fn send_from_clone_origin() {
    let (_dir, _backend, zfs) = setup();
    let base = snapshot(&zfs, "tank/a@base");

    let stream = tempfile::tempfile().unwrap();
    base.send(&stream, SendFlags::empty()).unwrap();
    receive(&zfs, "tank/copy", &rewind(stream), RecvFlags::empty()).unwrap();

    base.clone_to("tank/c", &DatasetProperties::new()).unwrap();
    let c1 = snapshot(&zfs, "tank/c@c1");
    let stream = tempfile::tempfile().unwrap();
    c1.send_from("tank/a@base", &stream, SendFlags::empty()).unwrap();

    // The origin only exists under the source pool's name, so it has to be mapped.
    receive(&zfs, "tank/a/c", &rewind(stream), RecvFlags::empty()).unwrap();
    let received = Dataset::open(&zfs, "tank/a/c").unwrap();
    assert_eq!("tank/a@base", received.property(DatasetProp::Origin).unwrap().value());
    assert!(exists(&zfs, "tank/a/c@c1"));
}

#[test]
fn send_one_filesystem_and_bookmark() {
    let (_dir, backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");
    let a = Dataset::open(&zfs, "tank/a").unwrap();

    let stream = tempfile::tempfile().unwrap();
    a.send_one("", &stream, SendFlags::LARGE_BLOCK | SendFlags::COMPRESS).unwrap();
    receive(&zfs, "tank/full", &rewind(stream), RecvFlags::empty()).unwrap();
    assert!(exists(&zfs, "tank/full"));

    assert!(backend.add_bookmark("tank/a@s1", "mark"));
    let stream = tempfile::tempfile().unwrap();
    a.send_one("#mark", &stream, SendFlags::empty()).unwrap();
    let stream = tempfile::tempfile().unwrap();
    a.send_one("tank/a#mark", &stream, SendFlags::EMBED_DATA).unwrap();

    let out = tempfile::tempfile().unwrap();
    let err = a.send_one("#missing", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(EZFS_NOENT, err.code());
    let err = s1.send_one("", &out, SendFlags::empty()).unwrap_err();
    assert_eq!("Unsupported with snapshot. Use send() for that purpose.", err.to_string());
    let err = a.send_one("@s1", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Unsupported, err.kind());
    let err = a.send_one("", &out, SendFlags::REPLICATE).unwrap_err();
    assert_eq!("Unsupported flag with filesystem or bookmark.", err.to_string());
    let err = a.send_one("", &out, SendFlags::DRY_RUN).unwrap_err();
    assert_eq!(ErrorKind::Unsupported, err.kind());

    // Bookmarks can't be sent with send().
    let err = s1.send_from("tank/a#mark", &out, SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Unsupported, err.kind());
}

#[test]
fn receive_failures() {
    let (_dir, _backend, zfs) = setup();

    let mut garbage = tempfile::tempfile().unwrap();
    garbage.write_all(b"definitely not a stream").unwrap();
    let err = receive(&zfs, "tank/x", &rewind(garbage), RecvFlags::empty()).unwrap_err();
    assert_eq!(EZFS_BADSTREAM, err.code());
    assert!(err.to_string().starts_with("ZFS receive of tank/x failed. "), "{}", err);
    assert!(!exists(&zfs, "tank/x"));

    let s1 = snapshot(&zfs, "tank/a@s1");
    let stream = tempfile::tempfile().unwrap();
    s1.send(&stream, SendFlags::empty()).unwrap();
    // Full stream into an existing filesystem.
    let err = receive(&zfs, "tank/a", &rewind(stream), RecvFlags::empty()).unwrap_err();
    assert_eq!(EZFS_EXISTS, err.code());

    let stream = tempfile::tempfile().unwrap();
    s1.send(&stream, SendFlags::empty()).unwrap();
    let err = receive(&zfs, "tank/missing/x", &rewind(stream), RecvFlags::empty()).unwrap_err();
    assert_eq!(EZFS_NOENT, err.code());
}

#[test]
fn force_receive_rolls_back() {
    let (_dir, _backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");
    let stream = tempfile::tempfile().unwrap();
    s1.send(&stream, SendFlags::empty()).unwrap();
    receive(&zfs, "tank/b", &rewind(stream), RecvFlags::empty()).unwrap();
    snapshot(&zfs, "tank/b@local");

    let s2 = snapshot(&zfs, "tank/a@s2");
    let stream = tempfile::tempfile().unwrap();
    s2.send_from("@s1", &stream, SendFlags::empty()).unwrap();
    let stream = rewind(stream);
    let err = receive(&zfs, "tank/b", &stream, RecvFlags::empty()).unwrap_err();
    assert_eq!(EZFS_BADRESTORE, err.code());

    let stream = rewind(stream);
    receive(&zfs, "tank/b", &stream, RecvFlags::FORCE).unwrap();
    assert!(exists(&zfs, "tank/b@s2"));
    assert!(!exists(&zfs, "tank/b@local"));
}

#[test]
fn receive_with_tail_and_props() {
    let (_dir, _backend, zfs) = setup();
    Dataset::create(&zfs, "tank/backup", DatasetType::FILESYSTEM, &DatasetProperties::new()).unwrap();
    let mut a = Dataset::open(&zfs, "tank/a").unwrap();
    a.set_property(DatasetProp::Compression, "lz4").unwrap();
    let s1 = snapshot(&zfs, "tank/a@s1");

    let stream = tempfile::tempfile().unwrap();
    s1.send(&stream, SendFlags::PROPS).unwrap();
    receive(&zfs, "tank/backup", &rewind(stream), RecvFlags::IS_TAIL | RecvFlags::NO_MOUNT).unwrap();

    let received = Dataset::open(&zfs, "tank/backup/a").unwrap();
    let compression = received.property(DatasetProp::Compression).unwrap();
    assert_eq!("lz4", compression.value());
    assert_eq!(&PropertySource::Received, compression.source());
    assert_eq!(None, received.is_mounted().unwrap());
    assert!(exists(&zfs, "tank/backup/a@s1"));
}

#[test]
fn replicate_sends_every_snapshot() {
    let (_dir, _backend, zfs) = setup();
    snapshot(&zfs, "tank/a@s1");
    snapshot(&zfs, "tank/a@s2");
    let s3 = snapshot(&zfs, "tank/a@s3");

    let stream = tempfile::tempfile().unwrap();
    s3.send(&stream, SendFlags::REPLICATE).unwrap();
    receive(&zfs, "tank/r", &rewind(stream), RecvFlags::empty()).unwrap();

    let r = Dataset::open(&zfs, "tank/r").unwrap();
    let snapshots: Vec<String> = r.children().iter().map(|child| child.path().unwrap()).collect();
    assert_eq!(vec!["tank/r@s1", "tank/r@s2", "tank/r@s3"], snapshots);
}

#[test]
fn send_size() {
    let (_dir, _backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");
    snapshot(&zfs, "tank/a@s2");
    let s3 = snapshot(&zfs, "tank/a@s3");

    assert_eq!(STREAM_SIZE, s1.send_size("", SendFlags::empty()).unwrap());
    assert_eq!(STREAM_SIZE, s3.send_size("@s1", SendFlags::empty()).unwrap());
    assert_eq!(2 * STREAM_SIZE, s3.send_size("@s1", SendFlags::DO_ALL).unwrap());

    let a = Dataset::open(&zfs, "tank/a").unwrap();
    assert_eq!(ErrorKind::Unsupported, a.send_size("", SendFlags::empty()).unwrap_err().kind());
    assert_eq!(EZFS_NOENT, s3.send_size("@nope", SendFlags::empty()).unwrap_err().code());
}

#[test]
fn send_size_deadline() {
    let (_dir, backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");
    backend.set_send_delay(Duration::from_millis(500));

    let estimator = OutputScrapingEstimator::new(Duration::from_secs(15)).with_deadline(Duration::from_millis(50));
    let err = estimator.estimate(&s1, "", SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());
    assert_eq!("Operation timed out after 50ms", err.to_string());
}

#[test]
fn missed_deadline_leaves_context_usable() {
    let (_dir, backend, zfs) = setup();
    let s1 = snapshot(&zfs, "tank/a@s1");
    backend.set_send_delay(Duration::from_secs(3));

    let err = OutputScrapingEstimator::new(Duration::from_millis(100)).estimate(&s1, "", SendFlags::empty()).unwrap_err();
    assert_eq!(ErrorKind::Timeout, err.kind());

    // The dry run is still stuck in the backend.
    let started = Instant::now();
    let pool = Pool::open(&zfs, "tank").unwrap();
    drop(pool);
    drop(s1);
    assert!(exists(&zfs, "tank/a@s1"));
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(1), "context was blocked for {:?}", elapsed);
}
