use std::{collections::BTreeMap,
          fs::File,
          path::{Path, PathBuf},
          sync::Arc,
          thread,
          time::Duration};

use rand::Rng;
use tempdir::TempDir;

use libzfs::{errors::{codes::*, ErrorKind},
             native::memory::MemoryBackend,
             slog::*,
             zfs::{Dataset, DatasetProperties, DatasetType},
             zpool::{CreatePoolRequest, Pool, PoolProp, PoolProperties, PoolState, PoolStatus, VdevSpec},
             Config, Libzfs};

static ONE_MB_IN_BYTES: u64 = 1024 * 1024;

// Only used for debugging
#[allow(dead_code)]
fn get_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}

fn get_pool_name() -> String {
    let mut rng = rand::thread_rng();
    format!("tests-zpool-{}", rng.gen::<u32>())
}

fn setup() -> (TempDir, MemoryBackend, Libzfs) {
    let dir = TempDir::new("zpool-tests").unwrap();
    let backend = MemoryBackend::new();
    let config = Config::builder().create_open_backoff(Duration::from_millis(1)).build().unwrap();
    let zfs = Libzfs::with_config(backend.clone(), config);
    (dir, backend, zfs)
}

fn setup_vdev(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    File::create(&path).unwrap().set_len(64 * ONE_MB_IN_BYTES).unwrap();
    path
}

fn single_file_request(dir: &Path, name: &str) -> CreatePoolRequest {
    CreatePoolRequest::builder()
        .name(name)
        .vdevs(vec![VdevSpec::file(setup_vdev(dir, &format!("{}-vdev0", name)))])
        .build()
        .unwrap()
}

#[test]
fn create_check_destroy() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();

    let mut pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    assert!(pool.is_open());
    assert_eq!(name, pool.name().unwrap());
    assert_eq!(PoolState::Active, pool.state().unwrap());
    assert_eq!(PoolStatus::Ok, pool.status().unwrap());
    assert_eq!(&name, pool.property(PoolProp::Name).unwrap().value());
    assert_eq!(64 * ONE_MB_IN_BYTES, pool.property(PoolProp::Size).unwrap().as_u64().unwrap());
    assert_eq!(23, pool.properties().len());
    assert_eq!(Some(&"enabled".to_string()), pool.features().get("lz4_compress"));
    assert_eq!(3, pool.features().len());

    pool.destroy("destroyed by test").unwrap();
    pool.close();
    assert!(!pool.is_open());

    let err = Pool::open(&zfs, &name).unwrap_err();
    assert_eq!(EZFS_NOENT, err.code());
    assert_eq!(0, backend.live_handles());
    assert_eq!(0, backend.live_nvlists());
}

#[test]
fn closed_pool_reports_handle_error() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();

    let mut pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    pool.close();
    pool.close();
    let err = pool.export(false, "").unwrap_err();
    assert_eq!(ErrorKind::HandleClosed, err.kind());
    assert_eq!("Pool handle not initialized or its closed", err.to_string());
    assert_eq!(ErrorKind::HandleClosed, pool.name().unwrap_err().kind());
}

#[test]
fn create_retries_while_pool_is_not_visible() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    backend.set_pool_open_lag(2);

    let pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    assert!(pool.is_open());
}

#[test]
fn create_gives_up_after_configured_attempts() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    backend.set_pool_open_lag(10);

    let err = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap_err();
    assert_eq!(EZFS_NOENT, err.code());
    assert!(err.to_string().ends_with(" (PoolOpen)"), "{}", err);
}

#[test]
fn create_does_not_retry_other_open_errors() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    // Consumed by the first open, a retry would succeed.
    backend.fail_pool_open_with(EZFS_PERM);

    let err = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap_err();
    assert_eq!(EZFS_PERM, err.code());
    assert_eq!(ErrorKind::Native, err.kind());
}

#[test]
fn create_failure_has_context() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();

    let _pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    let other = CreatePoolRequest::builder()
        .name(name.as_str())
        .vdevs(vec![VdevSpec::file(setup_vdev(dir.path(), "other"))])
        .build()
        .unwrap();
    let err = Pool::create(&zfs, &other).unwrap_err();
    assert_eq!(EZFS_EXISTS, err.code());
    assert!(err.to_string().ends_with(" (zpool_create)"), "{}", err);
}

#[test]
fn reuse_vdev() {
    let (dir, _backend, zfs) = setup();
    let name_1 = get_pool_name();
    let name_2 = format!("{}-fail", name_1);
    let vdev = setup_vdev(dir.path(), "shared");

    let request = |name: &str| {
        CreatePoolRequest::builder().name(name).vdevs(vec![VdevSpec::file(vdev.clone())]).build().unwrap()
    };
    let _pool = Pool::create(&zfs, &request(&name_1)).unwrap();
    let err = Pool::create(&zfs, &request(&name_2)).unwrap_err();
    assert_eq!(EZFS_BADDEV, err.code());
}

#[test]
fn missing_vdev_file() {
    let (dir, _backend, zfs) = setup();
    let request = CreatePoolRequest::builder()
        .name(get_pool_name())
        .vdevs(vec![VdevSpec::file(dir.path().join("does-not-exist"))])
        .build()
        .unwrap();
    let err = Pool::create(&zfs, &request).unwrap_err();
    assert_eq!(EZFS_BADDEV, err.code());
}

#[test]
fn invalid_layout_fails_before_allocating() {
    let (dir, backend, zfs) = setup();
    let request = CreatePoolRequest::builder()
        .name(get_pool_name())
        .vdevs(vec![VdevSpec::mirror(vec![VdevSpec::file(setup_vdev(dir.path(), "lonely"))])])
        .build()
        .unwrap();

    let err = Pool::create(&zfs, &request).unwrap_err();
    assert_eq!(ErrorKind::InvalidVdev, err.kind());
    assert_eq!(
        "Invalid vdev specification: mirror supports no less than 2 or more than 2147483647 devices",
        err.to_string()
    );
    assert_eq!(0, backend.total_nvlist_allocations());
}

#[test]
fn allocation_failure_leaks_nothing() {
    let (dir, backend, zfs) = setup();
    let vdevs = vec![
        VdevSpec::mirror(vec![VdevSpec::file(setup_vdev(dir.path(), "m0")), VdevSpec::file(setup_vdev(dir.path(), "m1"))]),
        VdevSpec::spare(vec![VdevSpec::file(setup_vdev(dir.path(), "s0"))]),
    ];
    let mut props = PoolProperties::new();
    props.insert(PoolProp::Comment, "leak check".into());
    let request = CreatePoolRequest::builder().name(get_pool_name()).vdevs(vdevs).props(props).build().unwrap();

    for budget in 0..6 {
        backend.fail_nvlist_alloc_after(budget);
        let err = Pool::create(&zfs, &request).unwrap_err();
        assert_eq!(ErrorKind::NvOpError, err.kind());
        assert_eq!(EZFS_NOMEM, err.code());
        assert_eq!(0, backend.live_nvlists(), "leak with budget {}", budget);
    }
}

#[test]
fn create_with_full_layout() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();
    let file = |n: &str| VdevSpec::file(setup_vdev(dir.path(), n));
    let request = CreatePoolRequest::builder()
        .name(name.as_str())
        .vdevs(vec![
            VdevSpec::raidz(1, vec![file("r0"), file("r1"), file("r2")]),
            VdevSpec::log(vec![VdevSpec::mirror(vec![file("l0"), file("l1")])]),
            VdevSpec::spare(vec![file("s0")]),
            VdevSpec::l2cache(vec![file("c0")]),
        ])
        .build()
        .unwrap();

    let pool = Pool::create(&zfs, &request).unwrap();
    // Two data disks worth of space, logs don't count.
    assert_eq!(128 * ONE_MB_IN_BYTES, pool.property(PoolProp::Size).unwrap().as_u64().unwrap());
}

#[test]
fn create_with_props_and_features() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();

    let mut props = PoolProperties::new();
    props.insert(PoolProp::Ashift, "12".into());
    props.insert(PoolProp::Failuremode, "continue".into());
    let mut features = BTreeMap::new();
    features.insert("lz4_compress".to_string(), "disabled".to_string());
    let mut fs_props = DatasetProperties::new();
    fs_props.insert(libzfs::zfs::DatasetProp::Compression, "lz4".into());

    let request = CreatePoolRequest::builder()
        .name(name.as_str())
        .vdevs(vec![VdevSpec::disk(setup_vdev(dir.path(), "disk0"))])
        .props(props)
        .features(features)
        .fs_props(fs_props)
        .build()
        .unwrap();

    let pool = Pool::create(&zfs, &request).unwrap();
    assert_eq!("12", pool.property(PoolProp::Ashift).unwrap().value());
    assert_eq!("continue", pool.property(PoolProp::Failuremode).unwrap().value());
    assert_eq!(Some(&"disabled".to_string()), pool.features().get("lz4_compress"));
    assert_eq!(Some(&"enabled".to_string()), pool.features().get("async_destroy"));

    let root = Dataset::open(&zfs, &name).unwrap();
    assert_eq!("lz4", root.property(libzfs::zfs::DatasetProp::Compression).unwrap().value());
}

#[test]
fn set_and_get_property() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();
    let mut pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();

    pool.set_property(PoolProp::Comment, "hello").unwrap();
    let comment = pool.property(PoolProp::Comment).unwrap();
    assert_eq!("hello", comment.value());
    assert_eq!("local", comment.source().as_str());

    let err = pool.set_property(PoolProp::Failuremode, "explode").unwrap_err();
    assert_eq!(EZFS_BADPROP, err.code());
    assert_eq!("wait", pool.property(PoolProp::Failuremode).unwrap().value());

    let err = pool.set_property(PoolProp::Size, "1").unwrap_err();
    assert_eq!(EZFS_PROPREADONLY, err.code());

    assert_eq!("hello", pool.get_property(PoolProp::Comment).unwrap().value());
}

#[test]
fn get_feature() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();
    let mut pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();

    assert_eq!("enabled", pool.get_feature("bookmarks").unwrap());
    assert_eq!(Some(&"enabled".to_string()), pool.features().get("bookmarks"));

    let err = pool.get_feature("no_such_feature").unwrap_err();
    assert_eq!("Unknown zpool feature: no_such_feature", err.to_string());
    assert_eq!(EZFS_BADPROP, err.code());
}

#[test]
fn export_and_import() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    let pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    let fs = format!("{}/data", name);
    Dataset::create(&zfs, &fs, DatasetType::FILESYSTEM, &DatasetProperties::new()).unwrap();

    pool.export(false, "exported by test").unwrap();
    drop(pool);
    assert_eq!(EZFS_NOENT, Pool::open(&zfs, &name).unwrap_err().code());
    assert_eq!(EZFS_NOENT, Dataset::open(&zfs, &fs).unwrap_err().code());

    let pool = Pool::import(&zfs, &name, &[dir.path().to_path_buf()]).unwrap();
    assert_eq!(PoolState::Active, pool.state().unwrap());
    let dataset = Dataset::open(&zfs, &fs).unwrap();
    assert_eq!(Some(format!("/{}", fs)), dataset.is_mounted().unwrap());

    drop(dataset);
    drop(pool);
    assert_eq!(0, backend.live_handles());
    assert_eq!(0, backend.live_nvlists());
}

#[test]
fn import_unknown_pool() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    let pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    pool.export(false, "").unwrap();

    let err = Pool::import(&zfs, "nope", &[dir.path().to_path_buf()]).unwrap_err();
    assert_eq!(ErrorKind::PoolNotFound, err.kind());
    assert_eq!("No pools to import found with name nope", err.to_string());

    // Wrong directory, nothing to find.
    let elsewhere = TempDir::new("zpool-tests-empty").unwrap();
    let err = Pool::import(&zfs, &name, &[elsewhere.path().to_path_buf()]).unwrap_err();
    assert_eq!(ErrorKind::PoolNotFound, err.kind());
    assert_eq!(0, backend.live_nvlists());
}

#[test]
fn import_scan_failure_is_distinct() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    let pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    pool.export(false, "").unwrap();

    backend.fail_nvlist_alloc_after(0);
    let err = Pool::import(&zfs, &name, &[dir.path().to_path_buf()]).unwrap_err();
    assert_eq!(ErrorKind::PoolListFailed, err.kind());
    assert_eq!("Failed to list pools", err.to_string());
}

#[test]
fn export_busy_pool() {
    let (dir, backend, zfs) = setup();
    let name = get_pool_name();
    let pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    let fs = format!("{}/busy", name);
    Dataset::create(&zfs, &fs, DatasetType::FILESYSTEM, &DatasetProperties::new()).unwrap();
    backend.set_dataset_busy(&fs, true);

    let err = pool.export(false, "").unwrap_err();
    assert_eq!(EZFS_BUSY, err.code());
    assert_eq!(PoolState::Active, pool.state().unwrap());

    pool.export_force("forced by test").unwrap();
    assert_eq!(PoolState::Exported, pool.state().unwrap());
}

#[test]
fn open_all_and_close_all() {
    let (dir, backend, zfs) = setup();
    let names = vec![get_pool_name(), get_pool_name()];
    for name in &names {
        Pool::create(&zfs, &single_file_request(dir.path(), name)).unwrap();
    }
    assert_eq!(0, backend.live_handles());

    let mut pools = Pool::open_all(&zfs).unwrap();
    assert_eq!(2, pools.len());
    assert_eq!(2, backend.live_handles());
    let mut found: Vec<String> = pools.iter_mut().map(|pool| pool.name().unwrap()).collect();
    found.sort();
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(expected, found);

    Pool::close_all(&mut pools);
    assert_eq!(0, backend.live_handles());
}

#[test]
fn last_error_and_clear() {
    let (_dir, _backend, zfs) = setup();
    assert!(zfs.last_error().is_none());

    let _ = Pool::open(&zfs, "missing");
    let last = zfs.last_error().unwrap();
    assert_eq!(EZFS_NOENT, last.code());

    let cleared = zfs.clear_last_error().unwrap();
    assert_eq!(EZFS_NOENT, cleared.code());
    assert!(zfs.last_error().is_none());
    assert!(zfs.clear_last_error().is_none());
}

#[test]
fn concurrent_errors_stay_with_their_call() {
    let (dir, _backend, zfs) = setup();
    let name = get_pool_name();
    let mut pool = Pool::create(&zfs, &single_file_request(dir.path(), &name)).unwrap();
    pool.close();
    let zfs = Arc::new(zfs);

    let missing = {
        let zfs = Arc::clone(&zfs);
        thread::spawn(move || {
            for _ in 0..200 {
                let err = Pool::open(&zfs, "missing").unwrap_err();
                assert_eq!(EZFS_NOENT, err.code());
            }
        })
    };
    let bad_prop = {
        let zfs = Arc::clone(&zfs);
        let name = name.clone();
        thread::spawn(move || {
            let mut pool = Pool::open(&zfs, &name).unwrap();
            for _ in 0..200 {
                let err = pool.set_property(PoolProp::Autoexpand, "sometimes").unwrap_err();
                assert_eq!(EZFS_BADPROP, err.code());
            }
        })
    };
    let read_only = {
        let zfs = Arc::clone(&zfs);
        let name = name.clone();
        thread::spawn(move || {
            let mut pool = Pool::open(&zfs, &name).unwrap();
            for _ in 0..200 {
                let err = pool.set_property(PoolProp::Guid, "1").unwrap_err();
                assert_eq!(EZFS_PROPREADONLY, err.code());
            }
        })
    };
    missing.join().unwrap();
    bad_prop.join().unwrap();
    read_only.join().unwrap();
}
