//! In-process libzfs stand-in.
//!
//! Keeps pools, datasets and name/value lists in memory and reports failures through the same
//! `errno`/description pair libzfs does. File vdevs have to exist on disk, nothing is ever written
//! to them. The test suite runs against this backend, so it also carries knobs to make specific
//! calls fail or stall.
use std::{collections::{BTreeMap, BTreeSet, HashMap},
          fs::{self, File},
          io::{self, Read, Write},
          mem::ManuallyDrop,
          os::unix::io::{FromRawFd, RawFd},
          path::PathBuf,
          str::FromStr,
          sync::{Arc, Mutex, MutexGuard, PoisonError},
          thread,
          time::Duration};

use chrono::Utc;

use super::{Backend, DatasetBackend, DatasetHandle, ErrorState, Failed, NvBackend, NvHandle, NvStatus, PoolBackend,
            PoolHandle, Redirection, Status, StreamBackend};
use crate::{errors::codes::*,
            property::{Property, PropertySource},
            zfs::{DatasetName, DatasetProp, DatasetType, LzcSendFlags, RecvFlags, SendFlags},
            zpool::{PoolProp, PoolState, PoolStatus}};

mod props;
mod stream;

use stream::Stream;

/// Space every dataset accounts for right after creation.
const DATASET_OVERHEAD: u64 = 24576;
/// Size reported for each snapshot in a dry-run send.
const SNAPSHOT_STREAM_SIZE: u64 = 43520;
/// `MS_FORCE`
const MS_FORCE: i32 = 1;

const KNOWN_FEATURES: &[&str] = &[
    "async_destroy",
    "empty_bpobj",
    "lz4_compress",
    "spacemap_histogram",
    "enabled_txg",
    "hole_birth",
    "extensible_dataset",
    "embedded_data",
    "bookmarks",
    "filesystem_limits",
    "large_blocks",
];

type Failure = (i32, String);
type MemResult<T = ()> = std::result::Result<T, Failure>;

fn fail<T, M: Into<String>>(code: i32, message: M) -> MemResult<T> { Err((code, message.into())) }

#[derive(Debug, Clone, PartialEq)]
enum NvValue {
    Str(String),
    U64(u64),
    List(NvList),
    Lists(Vec<NvList>),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl NvList {
    fn set(&mut self, name: &str, value: NvValue) {
        match self.pairs.iter_mut().find(|(key, _)| key == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name.to_string(), value)),
        }
    }

    fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    fn string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(NvValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    fn u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(NvValue::U64(value)) => Some(*value),
            _ => None,
        }
    }

    fn lists(&self, name: &str) -> &[NvList] {
        match self.get(name) {
            Some(NvValue::Lists(values)) => values,
            _ => &[],
        }
    }
}

#[derive(Debug)]
struct NvSlot {
    list: NvList,
    /// Set for handles lent out by `nvlist_nested`, which go away with their parent.
    owner: Option<usize>,
}

#[derive(Debug, Clone)]
struct MemPool {
    guid: u64,
    imported: bool,
    size: u64,
    vdev_tree: NvList,
    devices: Vec<PathBuf>,
    props: BTreeMap<PoolProp, String>,
    features: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct MemDataset {
    kind: DatasetType,
    created: i64,
    createtxg: u64,
    guid: u64,
    objsetid: u64,
    props: BTreeMap<String, String>,
    /// Names in `props` that came in with a stream.
    received: BTreeSet<String>,
    origin: Option<String>,
    mounted: Option<String>,
    /// Local properties of the filesystem when a snapshot was taken.
    frozen: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Bookmark {
    snapshot: String,
    guid: u64,
}

#[derive(Debug, Default)]
struct State {
    errno: i32,
    description: String,
    next_id: usize,
    txg: u64,
    guid_seed: u64,

    nvlists: HashMap<usize, NvSlot>,
    nvlist_allocations: usize,
    nvlist_alloc_budget: Option<usize>,
    nvlist_add_budget: Option<usize>,

    pools: BTreeMap<String, MemPool>,
    datasets: BTreeMap<String, MemDataset>,
    bookmarks: BTreeMap<String, Bookmark>,
    pool_handles: HashMap<usize, String>,
    dataset_handles: HashMap<usize, String>,

    pool_open_lag: u32,
    pending_open_failures: HashMap<String, u32>,
    pool_open_error: Option<i32>,
    children_iter_failures: BTreeSet<String>,
    send_delay: Duration,
    busy: BTreeSet<String>,
    diagnostics: Option<RawFd>,
}

/// Pool a dataset name belongs to.
fn pool_of(name: &str) -> &str { name.split(|c| c == '/' || c == '@' || c == '#').next().unwrap_or(name) }

fn parent_of(name: &str) -> Option<&str> {
    if let Some(idx) = name.find(|c| c == '@' || c == '#') {
        return Some(&name[..idx]);
    }
    name.rfind('/').map(|idx| &name[..idx])
}

/// `name` is `root` or lives below it.
fn in_tree(name: &str, root: &str) -> bool {
    name == root
        || (name.len() > root.len()
            && name.starts_with(root)
            && matches!(name.as_bytes()[root.len()], b'/' | b'@' | b'#'))
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<()> {
    // The descriptor belongs to the caller.
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.write_all(data)?;
    file.flush()
}

fn read_fd(fd: RawFd) -> io::Result<String> {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn vdev_size(vdev: &NvList) -> u64 {
    let children = vdev.lists("children");
    let smallest = || children.iter().map(vdev_size).min().unwrap_or(0);
    match vdev.string("type") {
        Some("disk") | Some("file") => {
            vdev.string("path").and_then(|path| fs::metadata(path).ok()).map_or(0, |meta| meta.len())
        },
        Some("mirror") => smallest(),
        Some("raidz") => {
            let parity = vdev.u64("nparity").unwrap_or(1) as usize;
            smallest() * children.len().saturating_sub(parity) as u64
        },
        _ => 0,
    }
}

fn collect_devices(vdev: &NvList, out: &mut Vec<PathBuf>) -> MemResult {
    match vdev.string("type") {
        Some("disk") | Some("file") => match vdev.string("path") {
            Some(path) => out.push(PathBuf::from(path)),
            None => return fail(EZFS_INVALCONFIG, "leaf vdev without a path"),
        },
        Some("mirror") | Some("raidz") | Some("root") | Some("spare") | Some("log") | Some("l2cache") => {},
        other => return fail(EZFS_INVALCONFIG, format!("unknown vdev type '{}'", other.unwrap_or(""))),
    }
    for child in vdev.lists("children").iter().chain(vdev.lists("spares")).chain(vdev.lists("l2cache")) {
        collect_devices(child, out)?;
    }
    Ok(())
}

impl State {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn next_txg(&mut self) -> u64 {
        self.txg += 1;
        self.txg
    }

    /// xorshift, good enough for guids that only have to differ.
    fn next_guid(&mut self) -> u64 {
        if self.guid_seed == 0 {
            self.guid_seed = 0x9E37_79B9_7F4A_7C15;
        }
        let mut x = self.guid_seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.guid_seed = x;
        x
    }

    fn nvlist(&self, handle: NvHandle) -> MemResult<&NvList> {
        match self.nvlists.get(&handle.0) {
            Some(slot) => Ok(&slot.list),
            None => fail(EZFS_INVALCONFIG, "invalid name/value list"),
        }
    }

    fn opt_nvlist(&self, handle: Option<NvHandle>) -> MemResult<NvList> {
        match handle {
            Some(handle) => self.nvlist(handle).map(Clone::clone),
            None => Ok(NvList::default()),
        }
    }

    /// Count one list allocation against the budget, `false` once it is spent.
    fn charge_alloc(&mut self) -> bool {
        if let Some(budget) = self.nvlist_alloc_budget.as_mut() {
            if *budget == 0 {
                return false;
            }
            *budget -= 1;
        }
        self.nvlist_allocations += 1;
        true
    }

    fn nvlist_add(&mut self, handle: NvHandle, name: &str, value: NvValue) -> NvStatus {
        if let Some(budget) = self.nvlist_add_budget.as_mut() {
            if *budget == 0 {
                return Err(libc::ENOMEM);
            }
            *budget -= 1;
        }
        match self.nvlists.get_mut(&handle.0) {
            Some(slot) => {
                slot.list.set(name, value);
                Ok(())
            },
            None => Err(libc::EINVAL),
        }
    }

    fn is_visible(&self, name: &str) -> bool {
        self.pools.get(pool_of(name)).map_or(false, |pool| pool.imported) && self.datasets.contains_key(name)
    }

    fn pool(&self, handle: PoolHandle) -> MemResult<(String, &MemPool)> {
        let name = self.pool_handles.get(&handle.0).cloned().unwrap_or_default();
        match self.pools.get(&name) {
            Some(pool) if pool.imported => Ok((name, pool)),
            _ => fail(EZFS_NOENT, format!("cannot open '{}': no such pool", name)),
        }
    }

    fn dataset(&self, handle: DatasetHandle) -> MemResult<String> {
        let name = self.dataset_handles.get(&handle.0).cloned().unwrap_or_default();
        if self.is_visible(&name) {
            Ok(name)
        } else {
            fail(EZFS_NOENT, format!("cannot open '{}': dataset does not exist", name))
        }
    }

    fn open_dataset_handle(&mut self, name: &str) -> DatasetHandle {
        let id = self.next_id();
        self.dataset_handles.insert(id, name.to_string());
        DatasetHandle(id)
    }

    fn new_dataset(&mut self, kind: DatasetType) -> MemDataset {
        MemDataset {
            kind,
            created: Utc::now().timestamp(),
            createtxg: self.next_txg(),
            guid: self.next_guid(),
            objsetid: self.next_id() as u64,
            props: BTreeMap::new(),
            received: BTreeSet::new(),
            origin: None,
            mounted: None,
            frozen: BTreeMap::new(),
        }
    }

    /// Direct children: filesystems and volumes by name, then snapshots by age.
    fn children_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{}/", name);
        let mut filesystems: Vec<String> = self
            .datasets
            .keys()
            .filter(|child| child.starts_with(&prefix) && !child[prefix.len()..].contains(|c| c == '/' || c == '@'))
            .cloned()
            .collect();
        filesystems.sort();
        filesystems.extend(self.snapshots_of(name));
        filesystems
    }

    fn snapshots_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{}@", name);
        let mut snapshots: Vec<(&String, u64)> = self
            .datasets
            .iter()
            .filter(|(child, _)| child.starts_with(&prefix))
            .map(|(child, dataset)| (child, dataset.createtxg))
            .collect();
        snapshots.sort_by_key(|(_, txg)| *txg);
        snapshots.into_iter().map(|(child, _)| child.clone()).collect()
    }

    fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, dataset)| dataset.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    // Properties

    /// Closest local value of `name` at or above `dataset`, with the dataset it was found on.
    fn lookup_inherited(&self, dataset: &str, name: &str) -> Option<(String, String)> {
        let mut current = Some(dataset);
        while let Some(at) = current {
            if let Some(value) = self.datasets.get(at).and_then(|ds| ds.props.get(name)) {
                return Some((value.clone(), at.to_string()));
            }
            current = parent_of(at);
        }
        None
    }

    fn local_source(&self, dataset: &str, name: &str) -> PropertySource {
        match self.datasets.get(dataset) {
            Some(ds) if ds.received.contains(name) => PropertySource::Received,
            _ => PropertySource::Local,
        }
    }

    fn used(&self, name: &str) -> u64 {
        let filesystems =
            self.datasets.iter().filter(|(child, ds)| in_tree(child, name) && !ds.kind.contains(DatasetType::SNAPSHOT));
        filesystems.count() as u64 * DATASET_OVERHEAD
    }

    fn get_prop(&self, name: &str, prop: DatasetProp) -> MemResult<Property> {
        use DatasetProp::*;
        let dataset = match self.datasets.get(name) {
            Some(dataset) => dataset,
            None => return fail(EZFS_NOENT, format!("cannot open '{}': dataset does not exist", name)),
        };
        if !props::applies_to(prop).intersects(dataset.kind) {
            return fail(EZFS_PROPTYPE, format!("property '{}' does not apply to {}", prop.name(), dataset.kind.name()));
        }
        let fixed = |value: String| -> MemResult<Property> { Ok(Property::new(value, PropertySource::None)) };
        let is_snapshot = dataset.kind.contains(DatasetType::SNAPSHOT);
        match prop {
            Type => fixed(dataset.kind.name().to_string()),
            Name => fixed(name.to_string()),
            Creation => fixed(dataset.created.to_string()),
            Createtxg => fixed(dataset.createtxg.to_string()),
            Guid => fixed(dataset.guid.to_string()),
            Objsetid => fixed(dataset.objsetid.to_string()),
            Used | Logicalused if is_snapshot => fixed("0".to_string()),
            Used | Logicalused => fixed(self.used(name).to_string()),
            Usedds | Referenced | Logicalreferenced => fixed(DATASET_OVERHEAD.to_string()),
            Usedchild => fixed(self.used(name).saturating_sub(DATASET_OVERHEAD).to_string()),
            Available => {
                let pool = self.pools.get(pool_of(name)).map_or(0, |pool| pool.size);
                fixed(pool.saturating_sub(self.used(pool_of(name))).to_string())
            },
            Compressratio | Refratio => fixed("1.00".to_string()),
            Mounted => fixed((if dataset.mounted.is_some() { "yes" } else { "no" }).to_string()),
            Origin => fixed(dataset.origin.clone().unwrap_or_default()),
            Numclones => fixed(self.clones_of(name).len().to_string()),
            Clones => fixed(self.clones_of(name).join(",")),
            Usedsnap | Usedrefreserv | Unique | Written | Userrefs | Inconsistent => fixed("0".to_string()),
            Useraccounting => fixed("1".to_string()),
            DeferDestroy => fixed("off".to_string()),
            Version => fixed("5".to_string()),
            Mountpoint => Ok(self.mountpoint(name)),
            _ => {
                if let Some(value) = dataset.props.get(prop.name()) {
                    return Ok(Property::new(value.clone(), self.local_source(name, prop.name())));
                }
                if props::is_inheritable(prop) {
                    if let Some((value, from)) = parent_of(name).and_then(|parent| self.lookup_inherited(parent, prop.name())) {
                        return Ok(Property::new(value, PropertySource::Inherited(from)));
                    }
                }
                match props::settable_default(prop) {
                    Some(value) => Ok(Property::new(value, PropertySource::Default)),
                    None => fail(EZFS_BADPROP, format!("property '{}' is not available", prop.name())),
                }
            },
        }
    }

    fn mountpoint(&self, name: &str) -> Property {
        let key = DatasetProp::Mountpoint.name();
        match self.lookup_inherited(name, key) {
            Some((value, from)) if from == name => Property::new(value, self.local_source(name, key)),
            Some((value, from)) => {
                let value = if value == "none" || value == "legacy" {
                    value
                } else {
                    format!("{}{}", value.trim_end_matches('/'), &name[from.len()..])
                };
                Property::new(value, PropertySource::Inherited(from))
            },
            None => Property::new(format!("/{}", name), PropertySource::Default),
        }
    }

    /// Validate a property for a dataset of `kind` and return the stored form.
    fn check_prop(&self, dataset: &str, kind: DatasetType, name: &str, value: &str, creating: bool) -> MemResult<String> {
        let cannot = |what: &str| format!("cannot set property for '{}': {}", dataset, what);
        if name.contains(':') {
            return Ok(value.to_string());
        }
        let prop = match DatasetProp::from_str(name) {
            Ok(prop) => prop,
            Err(_) => return fail(EZFS_BADPROP, cannot(&format!("invalid property '{}'", name))),
        };
        if !props::is_settable(prop) || (props::is_create_only(prop) && !creating) {
            return fail(EZFS_PROPREADONLY, cannot(&format!("'{}' is readonly", name)));
        }
        if !props::applies_to(prop).intersects(kind) {
            return fail(EZFS_PROPTYPE, cannot(&format!("'{}' does not apply to datasets of this type", name)));
        }
        props::normalize(prop, value).or_else(|why| fail(EZFS_BADPROP, cannot(&format!("'{}' {}", name, why))))
    }

    fn check_props(&self, dataset: &str, kind: DatasetType, list: &NvList, creating: bool) -> MemResult<BTreeMap<String, String>> {
        let mut checked = BTreeMap::new();
        for (name, value) in &list.pairs {
            let value = match value {
                NvValue::Str(value) => value.clone(),
                NvValue::U64(value) => value.to_string(),
                _ => return fail(EZFS_BADPROP, format!("'{}' must be a string", name)),
            };
            checked.insert(name.clone(), self.check_prop(dataset, kind, name, &value, creating)?);
        }
        Ok(checked)
    }

    // Mounts

    fn auto_mount(&mut self, name: &str) {
        let mountable = match self.datasets.get(name) {
            Some(ds) => {
                ds.kind.contains(DatasetType::FILESYSTEM)
                    && ds.props.get(DatasetProp::Canmount.name()).map_or(true, |value| value == "on")
            },
            None => false,
        };
        let mountpoint = self.mountpoint(name);
        let mountpoint = mountpoint.value();
        if mountable && mountpoint.starts_with('/') {
            let mountpoint = mountpoint.clone();
            if let Some(ds) = self.datasets.get_mut(name) {
                ds.mounted = Some(mountpoint);
            }
        }
    }

    fn unmount_tree(&mut self, root: &str) {
        for (_, ds) in self.datasets.iter_mut().filter(|(name, _)| in_tree(name, root)) {
            ds.mounted = None;
        }
    }

    fn busy_in_tree(&self, root: &str) -> Option<String> {
        self.busy.iter().find(|name| in_tree(name, root) && self.is_visible(name)).cloned()
    }

    /// Move `old` (and with `tree`, everything below it) to `new`, following every reference.
    fn rename(&mut self, old: &str, new: &str, tree: bool) {
        let matches = |name: &str| if tree { in_tree(name, old) } else { name == old };
        let renamed = |name: &str| format!("{}{}", new, &name[old.len()..]);

        let moved: Vec<String> = self.datasets.keys().filter(|name| matches(name)).cloned().collect();
        for name in moved {
            if let Some(ds) = self.datasets.remove(&name) {
                self.datasets.insert(renamed(&name), ds);
            }
        }
        let moved: Vec<String> = self.bookmarks.keys().filter(|name| matches(name)).cloned().collect();
        for name in moved {
            if let Some(bookmark) = self.bookmarks.remove(&name) {
                self.bookmarks.insert(renamed(&name), bookmark);
            }
        }
        for bookmark in self.bookmarks.values_mut() {
            if matches(&bookmark.snapshot) {
                bookmark.snapshot = renamed(&bookmark.snapshot);
            }
        }
        for name in self.dataset_handles.values_mut() {
            if matches(name) {
                *name = renamed(name);
            }
        }
        for ds in self.datasets.values_mut() {
            if let Some(origin) = ds.origin.as_mut() {
                if matches(origin) {
                    *origin = renamed(origin);
                }
            }
        }
        self.busy = self.busy.iter().map(|name| if matches(name) { renamed(name) } else { name.clone() }).collect();
    }

    fn remove_dataset(&mut self, name: &str) {
        self.datasets.remove(name);
        self.busy.remove(name);
    }

    // Pools

    fn pool_prop(&self, name: &str, pool: &MemPool, prop: PoolProp) -> Property {
        use PoolProp::*;
        let fixed = |value: String| Property::new(value, PropertySource::None);
        let allocated = self.used(name);
        match prop {
            Name => fixed(name.to_string()),
            Size => fixed(pool.size.to_string()),
            Free => fixed(pool.size.saturating_sub(allocated).to_string()),
            Allocated => fixed(allocated.to_string()),
            Capacity => fixed((if pool.size == 0 { 0 } else { allocated * 100 / pool.size }).to_string()),
            Health => fixed("ONLINE".to_string()),
            Guid => fixed(pool.guid.to_string()),
            Dedupratio => fixed("1.00x".to_string()),
            Expandsz => fixed("-".to_string()),
            Freeing => fixed("0".to_string()),
            _ => match pool.props.get(&prop) {
                Some(value) => Property::new(value.clone(), PropertySource::Local),
                None => Property::new(pool_prop_default(prop), PropertySource::Default),
            },
        }
    }
}

fn pool_prop_default(prop: PoolProp) -> &'static str {
    use PoolProp::*;
    match prop {
        Altroot | Bootfs | Cachefile | Comment | Version => "-",
        Delegation => "on",
        Autoreplace | Listsnaps | Autoexpand | Readonly => "off",
        Failuremode => "wait",
        Dedupditto | Ashift => "0",
        _ => "-",
    }
}

fn check_pool_prop(pool: &str, prop: PoolProp, value: &str) -> MemResult<String> {
    use PoolProp::*;
    let cannot = |what: String| format!("cannot set property for '{}': {}", pool, what);
    match prop {
        Delegation | Autoreplace | Listsnaps | Autoexpand | Readonly => {
            if value == "on" || value == "off" {
                Ok(value.to_string())
            } else {
                fail(EZFS_BADPROP, cannot(format!("'{}' must be 'on' or 'off'", prop.name())))
            }
        },
        Failuremode => match value {
            "wait" | "continue" | "panic" => Ok(value.to_string()),
            _ => fail(EZFS_BADPROP, cannot("'failmode' must be one of 'wait | continue | panic'".to_string())),
        },
        Ashift => match value.parse::<u64>() {
            Ok(shift) if shift == 0 || (9..=13).contains(&shift) => Ok(value.to_string()),
            _ => fail(EZFS_BADPROP, cannot("'ashift' must be 0 or between 9 and 13".to_string())),
        },
        Altroot | Bootfs | Cachefile | Comment | Dedupditto | Version => Ok(value.to_string()),
        _ => fail(EZFS_PROPREADONLY, cannot(format!("'{}' is readonly", prop.name()))),
    }
}

/// In-memory libzfs. See the module docs.
///
/// Clones share state, so a test can keep one to inspect and tweak while a `Libzfs` owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Run `f` and on failure record the error the way libzfs does.
    fn run<T, F>(&self, f: F) -> Status<T>
    where F: FnOnce(&mut State) -> MemResult<T> {
        let mut state = self.state();
        match f(&mut state) {
            Ok(value) => Ok(value),
            Err((code, message)) => {
                state.errno = code;
                state.description = message;
                Err(Failed)
            },
        }
    }

    /// Lists allocated by callers and not freed yet.
    pub fn live_nvlists(&self) -> usize { self.state().nvlists.values().filter(|slot| slot.owner.is_none()).count() }

    pub fn total_nvlist_allocations(&self) -> usize { self.state().nvlist_allocations }

    /// Pool and dataset handles not closed yet.
    pub fn live_handles(&self) -> usize {
        let state = self.state();
        state.pool_handles.len() + state.dataset_handles.len()
    }

    /// Let `n` more list allocations succeed, fail every one after that.
    pub fn fail_nvlist_alloc_after(&self, n: usize) { self.state().nvlist_alloc_budget = Some(n); }

    /// Let `n` more list inserts succeed, fail every one after that.
    pub fn fail_nvlist_add_after(&self, n: usize) { self.state().nvlist_add_budget = Some(n); }

    /// Newly created pools can't be opened for the first `n` attempts.
    pub fn set_pool_open_lag(&self, n: u32) { self.state().pool_open_lag = n; }

    /// Next pool open fails with `code`.
    pub fn fail_pool_open_with(&self, code: i32) { self.state().pool_open_error = Some(code); }

    pub fn fail_children_iter_of(&self, path: &str) { self.state().children_iter_failures.insert(path.to_string()); }

    /// Every send sleeps this long before doing anything.
    pub fn set_send_delay(&self, delay: Duration) { self.state().send_delay = delay; }

    /// A busy dataset can't be unmounted or destroyed and keeps its pool from being exported
    /// without force.
    pub fn set_dataset_busy(&self, path: &str, busy: bool) {
        let mut state = self.state();
        if busy {
            state.busy.insert(path.to_string());
        } else {
            state.busy.remove(path);
        }
    }

    /// Bookmark `snapshot` as `fs#name`.
    pub fn add_bookmark(&self, snapshot: &str, name: &str) -> bool {
        let mut state = self.state();
        let guid = match state.datasets.get(snapshot) {
            Some(ds) if ds.kind.contains(DatasetType::SNAPSHOT) => ds.guid,
            _ => return false,
        };
        let filesystem = parent_of(snapshot).unwrap_or(snapshot).to_string();
        state.bookmarks.insert(format!("{}#{}", filesystem, name), Bookmark { snapshot: snapshot.to_string(), guid });
        true
    }
}

impl ErrorState for MemoryBackend {
    fn errno(&self) -> i32 { self.state().errno }

    fn error_description(&self) -> String { self.state().description.clone() }

    fn clear_error(&self) {
        let mut state = self.state();
        state.errno = EZFS_SUCCESS;
        state.description.clear();
    }
}

impl NvBackend for MemoryBackend {
    fn nvlist_alloc(&self) -> NvStatus<NvHandle> {
        let mut state = self.state();
        if !state.charge_alloc() {
            return Err(libc::ENOMEM);
        }
        let id = state.next_id();
        state.nvlists.insert(id, NvSlot { list: NvList::default(), owner: None });
        Ok(NvHandle(id))
    }

    fn nvlist_free(&self, list: NvHandle) {
        let mut state = self.state();
        state.nvlists.remove(&list.0);
        state.nvlists.retain(|_, slot| slot.owner != Some(list.0));
    }

    fn nvlist_add_string(&self, list: NvHandle, name: &str, value: &str) -> NvStatus {
        self.state().nvlist_add(list, name, NvValue::Str(value.to_string()))
    }

    fn nvlist_add_u64(&self, list: NvHandle, name: &str, value: u64) -> NvStatus {
        self.state().nvlist_add(list, name, NvValue::U64(value))
    }

    fn nvlist_add_nvlist(&self, list: NvHandle, name: &str, value: NvHandle) -> NvStatus {
        let mut state = self.state();
        let value = state.nvlists.get(&value.0).map(|slot| slot.list.clone()).ok_or(libc::EINVAL)?;
        state.nvlist_add(list, name, NvValue::List(value))
    }

    fn nvlist_add_nvlist_array(&self, list: NvHandle, name: &str, values: &[NvHandle]) -> NvStatus {
        let mut state = self.state();
        let values = values
            .iter()
            .map(|value| state.nvlists.get(&value.0).map(|slot| slot.list.clone()).ok_or(libc::EINVAL))
            .collect::<NvStatus<Vec<NvList>>>()?;
        state.nvlist_add(list, name, NvValue::Lists(values))
    }

    fn nvlist_lookup_string(&self, list: NvHandle, name: &str) -> NvStatus<String> {
        let state = self.state();
        let slot = state.nvlists.get(&list.0).ok_or(libc::EINVAL)?;
        slot.list.string(name).map(str::to_string).ok_or(libc::ENOENT)
    }

    fn nvlist_nested(&self, list: NvHandle) -> NvStatus<Vec<(String, NvHandle)>> {
        let mut state = self.state();
        let nested: Vec<(String, NvList)> = match state.nvlists.get(&list.0) {
            Some(slot) => slot
                .list
                .pairs
                .iter()
                .filter_map(|(name, value)| match value {
                    NvValue::List(nested) => Some((name.clone(), nested.clone())),
                    _ => None,
                })
                .collect(),
            None => return Err(libc::EINVAL),
        };
        let mut handles = Vec::with_capacity(nested.len());
        for (name, nested) in nested {
            let id = state.next_id();
            state.nvlists.insert(id, NvSlot { list: nested, owner: Some(list.0) });
            handles.push((name, NvHandle(id)));
        }
        Ok(handles)
    }
}

impl PoolBackend for MemoryBackend {
    fn pool_open(&self, name: &str) -> Status<PoolHandle> {
        self.run(|state| {
            if let Some(code) = state.pool_open_error.take() {
                return fail(code, format!("cannot open '{}'", name));
            }
            if let Some(pending) = state.pending_open_failures.get_mut(name) {
                if *pending > 0 {
                    *pending -= 1;
                    return fail(EZFS_NOENT, format!("cannot open '{}': no such pool", name));
                }
            }
            if !state.pools.get(name).map_or(false, |pool| pool.imported) {
                return fail(EZFS_NOENT, format!("cannot open '{}': no such pool", name));
            }
            let id = state.next_id();
            state.pool_handles.insert(id, name.to_string());
            Ok(PoolHandle(id))
        })
    }

    fn pool_iter(&self) -> Status<Vec<PoolHandle>> {
        self.run(|state| {
            let names: Vec<String> =
                state.pools.iter().filter(|(_, pool)| pool.imported).map(|(name, _)| name.clone()).collect();
            let mut handles = Vec::with_capacity(names.len());
            for name in names {
                let id = state.next_id();
                state.pool_handles.insert(id, name);
                handles.push(PoolHandle(id));
            }
            Ok(handles)
        })
    }

    fn pool_close(&self, pool: PoolHandle) { self.state().pool_handles.remove(&pool.0); }

    fn pool_name(&self, pool: PoolHandle) -> String { self.state().pool_handles.get(&pool.0).cloned().unwrap_or_default() }

    fn pool_state(&self, pool: PoolHandle) -> PoolState {
        let state = self.state();
        let name = state.pool_handles.get(&pool.0).cloned().unwrap_or_default();
        match state.pools.get(&name) {
            Some(pool) if pool.imported => PoolState::Active,
            Some(_) => PoolState::Exported,
            None => PoolState::Destroyed,
        }
    }

    fn pool_status(&self, pool: PoolHandle) -> PoolStatus {
        let state = self.state();
        match state.pool(pool) {
            Ok(_) => PoolStatus::Ok,
            Err(_) => PoolStatus::MissingDevNr,
        }
    }

    fn pool_get_prop(&self, pool: PoolHandle, prop: PoolProp) -> Status<Property> {
        self.run(|state| {
            let (name, mem_pool) = state.pool(pool)?;
            Ok(state.pool_prop(&name, mem_pool, prop))
        })
    }

    fn pool_set_prop(&self, pool: PoolHandle, name: &str, value: &str) -> Status {
        self.run(|state| {
            let (pool_name, _) = state.pool(pool)?;
            if let Some(feature) = name.strip_prefix("feature@") {
                if !KNOWN_FEATURES.contains(&feature) || value != "enabled" {
                    return fail(EZFS_BADPROP, format!("cannot set property for '{}': invalid feature '{}'", pool_name, feature));
                }
                if let Some(mem_pool) = state.pools.get_mut(&pool_name) {
                    mem_pool.features.entry(feature.to_string()).or_insert_with(|| value.to_string());
                }
                return Ok(());
            }
            let prop = PoolProp::from_str(name).or_else(|_| {
                fail(EZFS_BADPROP, format!("cannot set property for '{}': invalid property '{}'", pool_name, name))
            })?;
            let value = check_pool_prop(&pool_name, prop, value)?;
            if let Some(mem_pool) = state.pools.get_mut(&pool_name) {
                mem_pool.props.insert(prop, value);
            }
            Ok(())
        })
    }

    fn pool_get_feature(&self, pool: PoolHandle, name: &str) -> Status<String> {
        self.run(|state| {
            let (pool_name, mem_pool) = state.pool(pool)?;
            let feature = name.strip_prefix("feature@").unwrap_or(name);
            match mem_pool.features.get(feature) {
                Some(value) => Ok(value.clone()),
                None => fail(EZFS_BADPROP, format!("cannot get property for '{}': invalid feature '{}'", pool_name, feature)),
            }
        })
    }

    fn pool_create(&self, name: &str, root: NvHandle, props: Option<NvHandle>, fs_props: Option<NvHandle>) -> Status {
        self.run(|state| {
            let cannot = |what: &str| format!("cannot create '{}': {}", name, what);
            if !name.starts_with(|c: char| c.is_ascii_alphabetic()) || name.contains(|c| c == '/' || c == '@' || c == '#') {
                return fail(EZFS_INVALIDNAME, cannot("invalid pool name"));
            }
            if state.pools.contains_key(name) {
                return fail(EZFS_EXISTS, cannot("pool already exists"));
            }
            let tree = state.nvlist(root)?.clone();
            if tree.string("type") != Some("root") || tree.lists("children").is_empty() {
                return fail(EZFS_INVALCONFIG, cannot("invalid vdev specification"));
            }
            let mut devices = Vec::new();
            collect_devices(&tree, &mut devices)?;
            for (idx, device) in devices.iter().enumerate() {
                if !device.exists() {
                    return fail(EZFS_BADDEV, cannot(&format!("cannot open '{}': No such file or directory", device.display())));
                }
                if devices[..idx].contains(device) {
                    return fail(EZFS_BADDEV, cannot("one or more vdevs refer to the same device"));
                }
                if let Some((owner, _)) = state.pools.iter().find(|(_, pool)| pool.devices.contains(device)) {
                    return fail(EZFS_BADDEV, cannot(&format!("{} is part of pool '{}'", device.display(), owner)));
                }
            }

            let mut pool_props = BTreeMap::new();
            let mut features: BTreeMap<String, String> =
                KNOWN_FEATURES.iter().map(|feature| (feature.to_string(), "enabled".to_string())).collect();
            for (prop, value) in &state.opt_nvlist(props)?.pairs {
                let value = match value {
                    NvValue::Str(value) => value.clone(),
                    NvValue::U64(value) => value.to_string(),
                    _ => return fail(EZFS_BADPROP, cannot("property values must be strings")),
                };
                if let Some(feature) = prop.strip_prefix("feature@") {
                    if !KNOWN_FEATURES.contains(&feature) || (value != "enabled" && value != "disabled") {
                        return fail(EZFS_BADPROP, cannot(&format!("invalid feature '{}'", feature)));
                    }
                    features.insert(feature.to_string(), value);
                    continue;
                }
                let pool_prop = PoolProp::from_str(prop)
                    .or_else(|_| fail(EZFS_BADPROP, cannot(&format!("invalid property '{}'", prop))))?;
                pool_props.insert(pool_prop, check_pool_prop(name, pool_prop, &value)?);
            }
            if let Some(ashift) = tree.lists("children").iter().filter_map(|vdev| vdev.u64("ashift")).next() {
                pool_props.entry(PoolProp::Ashift).or_insert_with(|| ashift.to_string());
            }
            let root_props = state.check_props(name, DatasetType::FILESYSTEM, &state.opt_nvlist(fs_props)?, true)?;

            let size = tree
                .lists("children")
                .iter()
                .filter(|vdev| vdev.u64("is_log").unwrap_or(0) == 0)
                .map(vdev_size)
                .sum();
            let guid = state.next_guid();
            state.pools.insert(name.to_string(), MemPool {
                guid,
                imported: true,
                size,
                vdev_tree: tree,
                devices,
                props: pool_props,
                features,
            });
            let mut root_dataset = state.new_dataset(DatasetType::FILESYSTEM);
            root_dataset.props = root_props;
            state.datasets.insert(name.to_string(), root_dataset);
            state.auto_mount(name);
            let lag = state.pool_open_lag;
            state.pending_open_failures.insert(name.to_string(), lag);
            Ok(())
        })
    }

    fn pool_destroy(&self, pool: PoolHandle, _log: &str) -> Status {
        self.run(|state| {
            let (name, _) = state.pool(pool)?;
            if state.busy_in_tree(&name).is_some() {
                return fail(EZFS_BUSY, format!("cannot destroy '{}': pool is busy", name));
            }
            state.pools.remove(&name);
            state.datasets.retain(|dataset, _| !in_tree(dataset, &name));
            state.bookmarks.retain(|bookmark, _| !in_tree(bookmark, &name));
            Ok(())
        })
    }

    fn pool_export(&self, pool: PoolHandle, force: bool, _log: &str) -> Status {
        self.run(|state| {
            let (name, _) = state.pool(pool)?;
            if !force && state.busy_in_tree(&name).is_some() {
                return fail(EZFS_BUSY, format!("cannot export '{}': pool is busy", name));
            }
            state.unmount_tree(&name);
            if let Some(mem_pool) = state.pools.get_mut(&name) {
                mem_pool.imported = false;
            }
            Ok(())
        })
    }

    fn pool_export_force(&self, pool: PoolHandle, log: &str) -> Status { self.pool_export(pool, true, log) }

    fn pool_find_import(&self, dirs: &[PathBuf]) -> Status<NvHandle> {
        self.run(|state| {
            if !state.charge_alloc() {
                return fail(EZFS_NOMEM, "cannot discover pools: out of memory");
            }
            let found: Vec<(String, NvList)> = state
                .pools
                .iter()
                .filter(|(_, pool)| !pool.imported)
                .filter(|(_, pool)| {
                    pool.devices.iter().all(|device| device.parent().map_or(false, |dir| dirs.iter().any(|d| d == dir)))
                })
                .map(|(name, pool)| {
                    let mut config = NvList::default();
                    config.set("name", NvValue::Str(name.clone()));
                    config.set("pool_guid", NvValue::U64(pool.guid));
                    config.set("state", NvValue::U64(PoolState::Exported as u64));
                    config.set("vdev_tree", NvValue::List(pool.vdev_tree.clone()));
                    (name.clone(), config)
                })
                .collect();
            let mut list = NvList::default();
            for (name, config) in found {
                list.set(&name, NvValue::List(config));
            }
            let id = state.next_id();
            state.nvlists.insert(id, NvSlot { list, owner: None });
            Ok(NvHandle(id))
        })
    }

    fn pool_import(&self, config: NvHandle, name: &str) -> Status {
        self.run(|state| {
            let config = state.nvlist(config)?;
            let (original, guid) = match (config.string("name"), config.u64("pool_guid")) {
                (Some(original), Some(guid)) => (original.to_string(), guid),
                _ => return fail(EZFS_INVALCONFIG, format!("cannot import '{}': invalid config", name)),
            };
            match state.pools.get(&original) {
                Some(pool) if !pool.imported && pool.guid == guid => {},
                Some(_) => return fail(EZFS_EXISTS, format!("cannot import '{}': a pool with that name is already created/imported", name)),
                None => return fail(EZFS_NOENT, format!("cannot import '{}': no such pool available", name)),
            }
            if original != name {
                if state.pools.contains_key(name) {
                    return fail(EZFS_EXISTS, format!("cannot import '{}': pool already exists", name));
                }
                if let Some(pool) = state.pools.remove(&original) {
                    state.pools.insert(name.to_string(), pool);
                }
                state.rename(&original, name, true);
            }
            if let Some(pool) = state.pools.get_mut(name) {
                pool.imported = true;
            }
            let filesystems: Vec<String> = state.datasets.keys().filter(|ds| in_tree(ds, name)).cloned().collect();
            for filesystem in filesystems {
                state.auto_mount(&filesystem);
            }
            Ok(())
        })
    }
}

impl DatasetBackend for MemoryBackend {
    fn dataset_open(&self, path: &str) -> Status<DatasetHandle> {
        self.run(|state| {
            if !state.is_visible(path) {
                return fail(EZFS_NOENT, format!("cannot open '{}': dataset does not exist", path));
            }
            Ok(state.open_dataset_handle(path))
        })
    }

    fn dataset_iter_root(&self) -> Status<Vec<DatasetHandle>> {
        self.run(|state| {
            let roots: Vec<String> = state
                .pools
                .iter()
                .filter(|(name, pool)| pool.imported && state.datasets.contains_key(*name))
                .map(|(name, _)| name.clone())
                .collect();
            Ok(roots.iter().map(|root| state.open_dataset_handle(root)).collect())
        })
    }

    fn dataset_iter_children(&self, dataset: DatasetHandle) -> Status<Vec<DatasetHandle>> {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            if state.children_iter_failures.contains(&name) {
                return fail(EZFS_NOMEM, format!("cannot iterate filesystems of '{}': out of memory", name));
            }
            let children = state.children_of(&name);
            Ok(children.iter().map(|child| state.open_dataset_handle(child)).collect())
        })
    }

    fn dataset_close(&self, dataset: DatasetHandle) { self.state().dataset_handles.remove(&dataset.0); }

    fn dataset_type(&self, dataset: DatasetHandle) -> DatasetType {
        let state = self.state();
        state
            .dataset_handles
            .get(&dataset.0)
            .and_then(|name| state.datasets.get(name))
            .map_or(DatasetType::FILESYSTEM, |ds| ds.kind)
    }

    fn dataset_name(&self, dataset: DatasetHandle) -> String {
        self.state().dataset_handles.get(&dataset.0).cloned().unwrap_or_default()
    }

    fn dataset_pool_name(&self, dataset: DatasetHandle) -> String { pool_of(&self.dataset_name(dataset)).to_string() }

    fn dataset_get_prop(&self, dataset: DatasetHandle, prop: DatasetProp) -> Status<Property> {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            state.get_prop(&name, prop)
        })
    }

    fn dataset_get_user_prop(&self, dataset: DatasetHandle, name: &str) -> Status<Option<(String, String)>> {
        self.run(|state| {
            let path = state.dataset(dataset)?;
            Ok(state.lookup_inherited(&path, name).map(|(value, from)| {
                if from == path && state.local_source(&path, name) == PropertySource::Received {
                    (value, "$recvd".to_string())
                } else {
                    (value, from)
                }
            }))
        })
    }

    fn dataset_set_prop(&self, dataset: DatasetHandle, name: &str, value: &str) -> Status {
        self.run(|state| {
            let path = state.dataset(dataset)?;
            let kind = state.datasets.get(&path).map_or(DatasetType::FILESYSTEM, |ds| ds.kind);
            let value = state.check_prop(&path, kind, name, value, false)?;
            if let Some(ds) = state.datasets.get_mut(&path) {
                ds.props.insert(name.to_string(), value);
                ds.received.remove(name);
            }
            if name == DatasetProp::Mountpoint.name() {
                let mounted: Vec<String> = state
                    .datasets
                    .iter()
                    .filter(|(child, ds)| in_tree(child, &path) && ds.mounted.is_some())
                    .map(|(child, _)| child.clone())
                    .collect();
                state.unmount_tree(&path);
                for child in mounted {
                    state.auto_mount(&child);
                }
            }
            Ok(())
        })
    }

    fn dataset_create(&self, path: &str, kind: DatasetType, props: Option<NvHandle>) -> Status {
        self.run(|state| {
            let cannot = |what: &str| format!("cannot create '{}': {}", path, what);
            let name = DatasetName::from_str(path).or_else(|_| fail(EZFS_INVALIDNAME, cannot("invalid dataset name")))?;
            if name.is_snapshot() || name.is_bookmark() {
                return fail(EZFS_INVALIDNAME, cannot("invalid dataset name"));
            }
            if kind != DatasetType::FILESYSTEM && kind != DatasetType::VOLUME {
                return fail(EZFS_BADTYPE, cannot("invalid dataset type"));
            }
            if state.is_visible(path) {
                return fail(EZFS_EXISTS, cannot("dataset already exists"));
            }
            match name.parent() {
                Some(parent) if state.is_visible(parent) => {
                    let parent_kind = state.datasets.get(parent).map_or(DatasetType::empty(), |ds| ds.kind);
                    if !parent_kind.contains(DatasetType::FILESYSTEM) {
                        return fail(EZFS_BADTYPE, cannot("parent is not a filesystem"));
                    }
                },
                _ => return fail(EZFS_NOENT, cannot("parent does not exist")),
            }
            let local = state.check_props(path, kind, &state.opt_nvlist(props)?, true)?;
            if kind == DatasetType::VOLUME && local.get(DatasetProp::Volsize.name()).map_or(true, |size| size == "0") {
                return fail(EZFS_BADPROP, cannot("missing volume size"));
            }
            let mut dataset = state.new_dataset(kind);
            dataset.props = local;
            state.datasets.insert(path.to_string(), dataset);
            state.auto_mount(path);
            Ok(())
        })
    }

    fn dataset_destroy(&self, dataset: DatasetHandle, defer: bool) -> Status {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            let cannot = |what: &str| format!("cannot destroy '{}': {}", name, what);
            if !name.contains(|c| c == '/' || c == '@') {
                return fail(EZFS_NOTSUP, cannot("operation does not apply to pools"));
            }
            if state.busy.contains(&name) {
                return fail(EZFS_BUSY, cannot("dataset is busy"));
            }
            if !state.children_of(&name).is_empty() {
                return fail(EZFS_EXISTS, cannot("filesystem has children"));
            }
            if !state.clones_of(&name).is_empty() {
                if defer {
                    return Ok(());
                }
                return fail(EZFS_EXISTS, cannot("snapshot has dependent clones"));
            }
            state.remove_dataset(&name);
            Ok(())
        })
    }

    fn dataset_clone(&self, snapshot: DatasetHandle, target: &str, props: Option<NvHandle>) -> Status {
        self.run(|state| {
            let source = state.dataset(snapshot)?;
            let cannot = |what: &str| format!("cannot create '{}': {}", target, what);
            if !source.contains('@') {
                return fail(EZFS_BADTYPE, cannot("source is not a snapshot"));
            }
            let name = DatasetName::from_str(target).or_else(|_| fail(EZFS_INVALIDNAME, cannot("invalid dataset name")))?;
            if name.is_snapshot() || name.is_bookmark() {
                return fail(EZFS_INVALIDNAME, cannot("invalid dataset name"));
            }
            if pool_of(target) != pool_of(&source) {
                return fail(EZFS_CROSSTARGET, cannot("source and target pools differ"));
            }
            if state.is_visible(target) {
                return fail(EZFS_EXISTS, cannot("dataset already exists"));
            }
            if !name.parent().map_or(false, |parent| state.is_visible(parent)) {
                return fail(EZFS_NOENT, cannot("parent does not exist"));
            }
            let kind = parent_of(&source)
                .and_then(|fs| state.datasets.get(fs))
                .map_or(DatasetType::FILESYSTEM, |ds| ds.kind);
            let local = state.check_props(target, kind, &state.opt_nvlist(props)?, true)?;
            let mut clone = state.new_dataset(kind);
            clone.props = local;
            clone.origin = Some(source);
            state.datasets.insert(target.to_string(), clone);
            state.auto_mount(target);
            Ok(())
        })
    }

    fn dataset_snapshot(&self, path: &str, recursive: bool, props: Option<NvHandle>) -> Status {
        self.run(|state| {
            let cannot = |what: &str| format!("cannot create snapshot '{}': {}", path, what);
            let (filesystem, snapshot) = match path.split_once('@') {
                Some(split) if path.is_valid_snapshot() => split,
                _ => return fail(EZFS_INVALIDNAME, cannot("invalid snapshot name")),
            };
            if !state.is_visible(filesystem) {
                return fail(EZFS_NOENT, cannot("dataset does not exist"));
            }
            let mut targets = vec![filesystem.to_string()];
            if recursive {
                targets.extend(
                    state
                        .datasets
                        .iter()
                        .filter(|(name, ds)| {
                            name.as_str() != filesystem
                                && in_tree(name, filesystem)
                                && !ds.kind.intersects(DatasetType::SNAPSHOT | DatasetType::BOOKMARK)
                        })
                        .map(|(name, _)| name.clone()),
                );
            }
            if targets.iter().any(|target| state.datasets.contains_key(&format!("{}@{}", target, snapshot))) {
                return fail(EZFS_EXISTS, cannot("dataset already exists"));
            }
            let user_props = state.opt_nvlist(props)?;
            let mut local = BTreeMap::new();
            for (name, value) in &user_props.pairs {
                match value {
                    NvValue::Str(value) if name.contains(':') => {
                        local.insert(name.clone(), value.clone());
                    },
                    _ => return fail(EZFS_BADPROP, cannot(&format!("property '{}' can't be set on snapshots", name))),
                }
            }
            let txg = state.next_txg();
            for target in targets {
                let frozen = state.datasets.get(&target).map(|ds| ds.props.clone()).unwrap_or_default();
                let mut snap = state.new_dataset(DatasetType::SNAPSHOT);
                snap.createtxg = txg;
                snap.props = local.clone();
                snap.frozen = frozen;
                state.datasets.insert(format!("{}@{}", target, snapshot), snap);
            }
            Ok(())
        })
    }

    fn dataset_rollback(&self, dataset: DatasetHandle, snapshot: DatasetHandle, force: bool) -> Status {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            let snap = state.dataset(snapshot)?;
            let cannot = |what: &str| format!("cannot rollback '{}': {}", name, what);
            if parent_of(&snap) != Some(name.as_str()) || !snap.contains('@') {
                return fail(EZFS_BADTYPE, cannot(&format!("'{}' is not a snapshot of this dataset", snap)));
            }
            if !force && state.busy.contains(&name) {
                return fail(EZFS_BUSY, cannot("dataset is busy"));
            }
            let txg = state.datasets.get(&snap).map_or(0, |ds| ds.createtxg);
            let later: Vec<String> = state
                .snapshots_of(&name)
                .into_iter()
                .filter(|later| state.datasets.get(later).map_or(false, |ds| ds.createtxg > txg))
                .collect();
            if let Some(cloned) = later.iter().find(|later| !state.clones_of(later).is_empty()) {
                return fail(EZFS_EXISTS, cannot(&format!("'{}' has dependent clones", cloned)));
            }
            for later in later {
                state.remove_dataset(&later);
            }
            Ok(())
        })
    }

    fn dataset_promote(&self, dataset: DatasetHandle) -> Status {
        self.run(|state| {
            let clone = state.dataset(dataset)?;
            let origin = match state.datasets.get(&clone).and_then(|ds| ds.origin.clone()) {
                Some(origin) => origin,
                None => return fail(EZFS_BADTYPE, format!("cannot promote '{}': not a cloned filesystem", clone)),
            };
            let (origin_fs, _) = origin.split_once('@').unwrap_or((origin.as_str(), ""));
            let origin_fs = origin_fs.to_string();
            let origin_txg = state.datasets.get(&origin).map_or(0, |ds| ds.createtxg);
            let moving: Vec<String> = state
                .snapshots_of(&origin_fs)
                .into_iter()
                .filter(|snap| state.datasets.get(snap).map_or(false, |ds| ds.createtxg <= origin_txg))
                .collect();
            for snap in &moving {
                let short = snap.split_once('@').map_or("", |(_, short)| short);
                if state.datasets.contains_key(&format!("{}@{}", clone, short)) {
                    return fail(EZFS_EXISTS, format!("cannot promote '{}': snapshot name '{}' conflicts", clone, short));
                }
            }
            let promoted_origin = state.datasets.get(&origin_fs).and_then(|ds| ds.origin.clone());
            for snap in moving {
                let short = snap.split_once('@').map_or("", |(_, short)| short).to_string();
                state.rename(&snap, &format!("{}@{}", clone, short), false);
            }
            let new_origin = format!("{}@{}", clone, origin.split_once('@').map_or("", |(_, short)| short));
            if let Some(ds) = state.datasets.get_mut(&origin_fs) {
                ds.origin = Some(new_origin);
            }
            if let Some(ds) = state.datasets.get_mut(&clone) {
                ds.origin = promoted_origin;
            }
            Ok(())
        })
    }

    fn dataset_rename(&self, dataset: DatasetHandle, target: &str, recursive: bool, force_unmount: bool) -> Status {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            let cannot = |what: &str| format!("cannot rename '{}': {}", name, what);
            if state.datasets.contains_key(target) {
                return fail(EZFS_EXISTS, cannot("dataset already exists"));
            }
            if pool_of(target) != pool_of(&name) {
                return fail(EZFS_CROSSTARGET, cannot("datasets must be within same pool"));
            }
            if let Some((filesystem, old_snap)) = name.split_once('@') {
                let new_snap = match target.split_once('@') {
                    Some((target_fs, new_snap)) if target_fs == filesystem && target.is_valid_snapshot() => new_snap,
                    _ => return fail(EZFS_INVALIDNAME, cannot("snapshots must be part of same dataset")),
                };
                let mut renames = vec![(name.clone(), target.to_string())];
                if recursive {
                    for (child, _) in state.datasets.iter().filter(|(child, _)| {
                        child.ends_with(&format!("@{}", old_snap)) && in_tree(child, filesystem) && **child != name
                    }) {
                        let child_fs = parent_of(child).unwrap_or(child);
                        renames.push((child.clone(), format!("{}@{}", child_fs, new_snap)));
                    }
                }
                if renames.iter().any(|(_, new)| state.datasets.contains_key(new)) {
                    return fail(EZFS_EXISTS, cannot("dataset already exists"));
                }
                for (old, new) in renames {
                    state.rename(&old, &new, false);
                }
                return Ok(());
            }
            if recursive {
                return fail(EZFS_BADTYPE, cannot("recursive rename is only for snapshots"));
            }
            let new_name = DatasetName::from_str(target).or_else(|_| fail(EZFS_INVALIDNAME, cannot("invalid dataset name")))?;
            if new_name.is_snapshot() || new_name.is_bookmark() || in_tree(target, &name) {
                return fail(EZFS_INVALIDNAME, cannot("invalid target name"));
            }
            if !new_name.parent().map_or(false, |parent| state.is_visible(parent)) {
                return fail(EZFS_NOENT, cannot("parent does not exist"));
            }
            if !force_unmount && state.busy_in_tree(&name).is_some() {
                return fail(EZFS_BUSY, cannot("dataset is busy"));
            }
            let mounted: Vec<String> = state
                .datasets
                .iter()
                .filter(|(child, ds)| in_tree(child, &name) && ds.mounted.is_some())
                .map(|(child, _)| format!("{}{}", target, &child[name.len()..]))
                .collect();
            state.unmount_tree(&name);
            state.rename(&name, target, true);
            for child in mounted {
                state.auto_mount(&child);
            }
            Ok(())
        })
    }

    fn dataset_is_mounted(&self, dataset: DatasetHandle) -> Option<String> {
        let state = self.state();
        let name = state.dataset(dataset).ok()?;
        state.datasets.get(&name).and_then(|ds| ds.mounted.clone())
    }

    fn dataset_mount(&self, dataset: DatasetHandle, _options: &str, _flags: i32) -> Status {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            let cannot = |what: &str| format!("cannot mount '{}': {}", name, what);
            let ds = state.datasets.get(&name).ok_or((EZFS_NOENT, cannot("dataset does not exist")))?;
            if !ds.kind.contains(DatasetType::FILESYSTEM) {
                return fail(EZFS_BADTYPE, cannot("not a filesystem"));
            }
            if ds.mounted.is_some() {
                return fail(EZFS_MOUNTFAILED, cannot("filesystem already mounted"));
            }
            let mountpoint = state.mountpoint(&name).value().clone();
            if !mountpoint.starts_with('/') {
                return fail(EZFS_MOUNTFAILED, cannot(&format!("mountpoint is '{}'", mountpoint)));
            }
            if let Some(ds) = state.datasets.get_mut(&name) {
                ds.mounted = Some(mountpoint);
            }
            Ok(())
        })
    }

    fn dataset_unmount(&self, dataset: DatasetHandle, flags: i32) -> Status {
        self.run(|state| {
            let name = state.dataset(dataset)?;
            if flags & MS_FORCE == 0 && state.busy.contains(&name) {
                return fail(EZFS_UMOUNTFAILED, format!("cannot unmount '{}': target is busy", name));
            }
            if let Some(ds) = state.datasets.get_mut(&name) {
                ds.mounted = None;
            }
            Ok(())
        })
    }
}

/// Snapshot name check that doesn't care about the filesystem part.
trait SnapshotName {
    fn is_valid_snapshot(&self) -> bool;
}

impl SnapshotName for str {
    fn is_valid_snapshot(&self) -> bool { DatasetName::from_str(self).map_or(false, |name| name.is_snapshot()) }
}

impl StreamBackend for MemoryBackend {
    fn send(&self, dataset: DatasetHandle, from: Option<&str>, to: &str, flags: SendFlags, fd: RawFd) -> Status {
        let delay = self.state().send_delay;
        if delay > Duration::from_secs(0) {
            thread::sleep(delay);
        }
        self.run(|state| {
            let filesystem = state.dataset(dataset)?;
            let cannot = |what: &str| format!("cannot send '{}@{}': {}", filesystem, to, what);
            let snapshot = format!("{}@{}", filesystem, to);
            let to_txg = match state.datasets.get(&snapshot) {
                Some(ds) if state.is_visible(&snapshot) => ds.createtxg,
                _ => return fail(EZFS_NOENT, cannot("snapshot does not exist")),
            };
            let ds = state.datasets.get(&filesystem).ok_or((EZFS_NOENT, cannot("dataset does not exist")))?;

            let mut stream = Stream { name: filesystem.clone(), kind: ds.kind, ..Stream::default() };
            let mut from_txg = 0;
            if flags.contains(SendFlags::FROM_ORIGIN) {
                match &ds.origin {
                    Some(origin) => {
                        from_txg = state.datasets.get(origin).map_or(0, |origin| origin.createtxg);
                        stream.origin = Some(origin.clone());
                    },
                    None => return fail(EZFS_BADBACKUP, cannot("not a clone")),
                }
            } else if let Some(from) = from {
                let source = format!("{}@{}", filesystem, from);
                match state.datasets.get(&source) {
                    Some(source) if source.createtxg < to_txg => {
                        from_txg = source.createtxg;
                        stream.from = Some((from.to_string(), source.guid));
                    },
                    Some(_) => return fail(EZFS_BADBACKUP, cannot("incremental source is not earlier than target")),
                    None => return fail(EZFS_NOENT, cannot(&format!("incremental source '{}' does not exist", source))),
                }
            }
            let snapshots = if flags.contains(SendFlags::DO_ALL) {
                state
                    .snapshots_of(&filesystem)
                    .into_iter()
                    .filter(|snap| state.datasets.get(snap).map_or(false, |ds| ds.createtxg > from_txg && ds.createtxg <= to_txg))
                    .collect()
            } else {
                vec![snapshot.clone()]
            };
            for snap in &snapshots {
                let guid = state.datasets.get(snap).map_or(0, |ds| ds.guid);
                let short = snap.split_once('@').map_or("", |(_, short)| short);
                stream.snapshots.push((short.to_string(), guid));
            }
            if flags.contains(SendFlags::PROPS) {
                let frozen = state.datasets.get(&snapshot).map(|ds| ds.frozen.clone()).unwrap_or_default();
                stream.props = frozen.into_iter().collect();
            }

            if flags.contains(SendFlags::DRY_RUN) {
                if flags.intersects(SendFlags::VERBOSE | SendFlags::PARSABLE) {
                    if let Some(diagnostics) = state.diagnostics {
                        let mut report = String::new();
                        let mut previous = stream.from.as_ref().map(|(from, _)| format!("{}@{}", filesystem, from));
                        for (short, _) in &stream.snapshots {
                            let current = format!("{}@{}", filesystem, short);
                            match &previous {
                                Some(prev) => report.push_str(&format!("incremental\t{}\t{}\t{}\n", prev, current, SNAPSHOT_STREAM_SIZE)),
                                None => report.push_str(&format!("full\t{}\t{}\n", current, SNAPSHOT_STREAM_SIZE)),
                            }
                            previous = Some(current);
                        }
                        report.push_str(&format!("size\t{}\n", SNAPSHOT_STREAM_SIZE * stream.snapshots.len() as u64));
                        write_fd(diagnostics, report.as_bytes())
                            .or_else(|err| fail(EZFS_PIPEFAILED, cannot(&err.to_string())))?;
                    }
                }
                return Ok(());
            }
            write_fd(fd, stream.encode().as_bytes()).or_else(|err| fail(EZFS_BADBACKUP, cannot(&err.to_string())))
        })
    }

    fn send_one(&self, dataset: DatasetHandle, from: Option<&str>, fd: RawFd, _flags: LzcSendFlags) -> Status {
        let delay = self.state().send_delay;
        if delay > Duration::from_secs(0) {
            thread::sleep(delay);
        }
        self.run(|state| {
            let name = state.dataset(dataset)?;
            let cannot = |what: &str| format!("cannot send '{}': {}", name, what);
            let ds = state.datasets.get(&name).ok_or((EZFS_NOENT, cannot("dataset does not exist")))?;
            let mut stream = Stream { name: name.clone(), kind: ds.kind, ..Stream::default() };
            if let Some(from) = from {
                let source = if let Some(bookmark) = state.bookmarks.get(from) {
                    Some((bookmark.snapshot.clone(), bookmark.guid))
                } else {
                    state.datasets.get(from).map(|ds| (from.to_string(), ds.guid))
                };
                match source {
                    Some((snapshot, guid)) if parent_of(&snapshot) == Some(name.as_str()) => {
                        let short = snapshot.split_once('@').map_or("", |(_, short)| short);
                        stream.from = Some((short.to_string(), guid));
                    },
                    Some(_) => return fail(EZFS_CROSSTARGET, cannot("incremental source must be in same filesystem")),
                    None => return fail(EZFS_NOENT, cannot(&format!("incremental source '{}' does not exist", from))),
                }
            }
            write_fd(fd, stream.encode().as_bytes()).or_else(|err| fail(EZFS_BADBACKUP, cannot(&err.to_string())))
        })
    }

    fn receive(&self, target: &str, props: NvHandle, flags: RecvFlags, fd: RawFd) -> Status {
        let text = read_fd(fd);
        self.run(|state| {
            let cannot = |what: &str| format!("cannot receive into '{}': {}", target, what);
            let text = text.or_else(|err| fail(EZFS_BADSTREAM, cannot(&err.to_string())))?;
            let stream = Stream::decode(&text).ok_or((EZFS_BADSTREAM, cannot("invalid stream (bad magic number)")))?;
            let override_props = state.nvlist(props)?.clone();

            let (mut filesystem, renamed_snapshot) = match target.split_once('@') {
                Some((filesystem, snapshot)) => (filesystem.to_string(), Some(snapshot.to_string())),
                None => (target.to_string(), None),
            };
            if renamed_snapshot.is_some() && stream.snapshots.len() != 1 {
                return fail(EZFS_BADSTREAM, cannot("snapshot name only allowed for a single snapshot"));
            }
            if flags.contains(RecvFlags::IS_PREFIX) {
                let below_pool = stream.name.splitn(2, '/').nth(1).unwrap_or("");
                if !below_pool.is_empty() {
                    filesystem = format!("{}/{}", filesystem, below_pool);
                }
            } else if flags.contains(RecvFlags::IS_TAIL) {
                let tail = stream.name.rsplit('/').next().unwrap_or(&stream.name);
                filesystem = format!("{}/{}", filesystem, tail);
            }
            let snapshot_names: Vec<(String, u64)> = match &renamed_snapshot {
                Some(renamed) => stream.snapshots.iter().map(|(_, guid)| (renamed.clone(), *guid)).collect(),
                None => stream.snapshots.clone(),
            };

            let exists = state.is_visible(&filesystem);
            let mut clone_of = None;
            if let Some((from, guid)) = &stream.from {
                if !exists {
                    return fail(EZFS_NOENT, cannot(&format!("destination '{}' does not exist", filesystem)));
                }
                let source = format!("{}@{}", filesystem, from);
                let (source_guid, source_txg) = match state.datasets.get(&source) {
                    Some(ds) => (ds.guid, ds.createtxg),
                    None => return fail(EZFS_BADSTREAM, cannot(&format!("destination has no snapshot '{}'", from))),
                };
                if source_guid != *guid {
                    return fail(EZFS_BADSTREAM, cannot("incremental source does not match"));
                }
                let newer: Vec<String> = state
                    .snapshots_of(&filesystem)
                    .into_iter()
                    .filter(|snap| state.datasets.get(snap).map_or(false, |ds| ds.createtxg > source_txg))
                    .collect();
                if !newer.is_empty() {
                    if !flags.contains(RecvFlags::FORCE) {
                        return fail(EZFS_BADRESTORE, cannot("destination has been modified since most recent snapshot"));
                    }
                    if flags.contains(RecvFlags::DRY_RUN) {
                        return Ok(());
                    }
                    for snap in newer {
                        state.remove_dataset(&snap);
                    }
                }
            } else {
                if exists {
                    let replaceable = flags.contains(RecvFlags::FORCE) && state.children_of(&filesystem).is_empty();
                    if !replaceable {
                        return fail(EZFS_EXISTS, cannot(&format!("destination '{}' exists", filesystem)));
                    }
                }
                if !parent_of(&filesystem).map_or(false, |parent| state.is_visible(parent)) {
                    return fail(EZFS_NOENT, cannot("destination parent does not exist"));
                }
                if let Some(origin) = &stream.origin {
                    let local_origin = format!("{}{}", pool_of(&filesystem), &origin[pool_of(origin).len()..]);
                    if !state.is_visible(&local_origin) {
                        return fail(EZFS_NOENT, cannot(&format!("local origin '{}' does not exist", local_origin)));
                    }
                    clone_of = Some(local_origin);
                }
            }
            for (snapshot, _) in &snapshot_names {
                if state.datasets.contains_key(&format!("{}@{}", filesystem, snapshot)) {
                    return fail(EZFS_EXISTS, cannot(&format!("destination '{}@{}' exists", filesystem, snapshot)));
                }
            }
            if flags.contains(RecvFlags::DRY_RUN) {
                return Ok(());
            }

            if stream.from.is_none() {
                if exists {
                    state.remove_dataset(&filesystem);
                }
                let mut dataset = state.new_dataset(stream.kind);
                dataset.origin = clone_of;
                state.datasets.insert(filesystem.clone(), dataset);
            }
            let txg = state.next_txg();
            let mut received = stream.props.iter().cloned().collect::<BTreeMap<String, String>>();
            for (name, value) in &override_props.pairs {
                if let NvValue::Str(value) = value {
                    received.insert(name.clone(), value.clone());
                }
            }
            if let Some(ds) = state.datasets.get_mut(&filesystem) {
                for (name, value) in &received {
                    ds.props.insert(name.clone(), value.clone());
                    ds.received.insert(name.clone());
                }
                if flags.contains(RecvFlags::CAN_MOUNT_OFF) {
                    ds.props.insert(DatasetProp::Canmount.name().to_string(), "off".to_string());
                }
            }
            let frozen = state.datasets.get(&filesystem).map(|ds| ds.props.clone()).unwrap_or_default();
            for (offset, (snapshot, guid)) in snapshot_names.into_iter().enumerate() {
                let mut snap = state.new_dataset(DatasetType::SNAPSHOT);
                snap.createtxg = txg + offset as u64;
                snap.guid = guid;
                snap.frozen = frozen.clone();
                state.datasets.insert(format!("{}@{}", filesystem, snapshot), snap);
            }
            state.txg += stream.snapshots.len().saturating_sub(1) as u64;
            if !flags.contains(RecvFlags::NO_MOUNT) && state.datasets.get(&filesystem).map_or(false, |ds| ds.mounted.is_none()) {
                state.auto_mount(&filesystem);
            }
            Ok(())
        })
    }

    fn redirect_diagnostics(&self, fd: RawFd) -> Status<Redirection> {
        let previous = self.state().diagnostics.replace(fd);
        Ok(Redirection(previous.unwrap_or(-1)))
    }

    fn restore_diagnostics(&self, saved: Redirection) {
        self.state().diagnostics = if saved.0 < 0 { None } else { Some(saved.0) };
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str { "memory" }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;

    fn nvlist(backend: &MemoryBackend, pairs: &[(&str, &str)]) -> NvHandle {
        let list = backend.nvlist_alloc().unwrap();
        for (name, value) in pairs {
            backend.nvlist_add_string(list, name, value).unwrap();
        }
        list
    }

    fn create_pool(backend: &MemoryBackend, name: &str, dir: &Path) {
        let device = dir.join(format!("{}.img", name));
        File::create(&device).unwrap().set_len(64 * 1024 * 1024).unwrap();
        let leaf = nvlist(backend, &[("type", "file"), ("path", device.to_str().unwrap())]);
        let root = nvlist(backend, &[("type", "root")]);
        backend.nvlist_add_nvlist_array(root, "children", &[leaf]).unwrap();
        backend.pool_create(name, root, None, None).unwrap();
        backend.nvlist_free(leaf);
        backend.nvlist_free(root);
    }

    #[test]
    fn names() {
        assert_eq!("tank", pool_of("tank/a/b@snap"));
        assert_eq!("tank", pool_of("tank"));
        assert_eq!(Some("tank/a"), parent_of("tank/a@snap"));
        assert_eq!(Some("tank"), parent_of("tank/a"));
        assert_eq!(None, parent_of("tank"));
        assert!(in_tree("tank/a@s", "tank/a"));
        assert!(!in_tree("tank/ab", "tank/a"));
    }

    #[test]
    fn nested_lists_are_copies() {
        let backend = MemoryBackend::new();
        let inner = nvlist(&backend, &[("name", "tank")]);
        let outer = backend.nvlist_alloc().unwrap();
        backend.nvlist_add_nvlist(outer, "tank", inner).unwrap();
        backend.nvlist_free(inner);
        let nested = backend.nvlist_nested(outer).unwrap();
        assert_eq!(1, nested.len());
        assert_eq!("tank", backend.nvlist_lookup_string(nested[0].1, "name").unwrap());
        assert_eq!(1, backend.live_nvlists());
        backend.nvlist_free(outer);
        assert_eq!(0, backend.live_nvlists());
        assert!(backend.nvlist_lookup_string(nested[0].1, "name").is_err());
    }

    #[test]
    fn failures_set_error_state() {
        let backend = MemoryBackend::new();
        assert!(backend.dataset_open("nope").is_err());
        assert_eq!(EZFS_NOENT, backend.errno());
        assert!(backend.error_description().contains("nope"));
        backend.clear_error();
        assert_eq!(EZFS_SUCCESS, backend.errno());
    }

    #[test]
    fn inherited_and_local_props() {
        let dir = tempdir::TempDir::new("memory-backend").unwrap();
        let backend = MemoryBackend::new();
        create_pool(&backend, "tank", dir.path());
        backend.dataset_create("tank/a", DatasetType::FILESYSTEM, None).unwrap();
        backend.dataset_create("tank/a/b", DatasetType::FILESYSTEM, None).unwrap();
        let a = backend.dataset_open("tank/a").unwrap();
        let b = backend.dataset_open("tank/a/b").unwrap();

        backend.dataset_set_prop(a, "compression", "lz4").unwrap();
        let inherited = backend.dataset_get_prop(b, DatasetProp::Compression).unwrap();
        assert_eq!("lz4", inherited.value());
        assert_eq!(&PropertySource::Inherited("tank/a".into()), inherited.source());

        backend.dataset_set_prop(a, "mountpoint", "/srv").unwrap();
        assert_eq!("/srv/b", backend.dataset_get_prop(b, DatasetProp::Mountpoint).unwrap().value());
        assert_eq!(Some("/srv/b".to_string()), backend.dataset_is_mounted(b));

        assert!(backend.dataset_set_prop(a, "used", "1").is_err());
        assert_eq!(EZFS_PROPREADONLY, backend.errno());
        assert!(backend.dataset_set_prop(a, "atime", "maybe").is_err());
        assert_eq!(EZFS_BADPROP, backend.errno());

        backend.dataset_close(a);
        backend.dataset_close(b);
        assert_eq!(0, backend.live_handles());
    }

    #[test]
    fn pool_open_lag() {
        let dir = tempdir::TempDir::new("memory-backend").unwrap();
        let backend = MemoryBackend::new();
        backend.set_pool_open_lag(2);
        create_pool(&backend, "lagging", dir.path());
        assert!(backend.pool_open("lagging").is_err());
        assert!(backend.pool_open("lagging").is_err());
        let pool = backend.pool_open("lagging").unwrap();
        backend.pool_close(pool);
    }
}
