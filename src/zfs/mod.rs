//! Datasets: filesystems, volumes, snapshots and bookmarks.
//!
//! A [`Dataset`] owns one native handle plus the handles of every child that was found when it was
//! opened. The tree is a snapshot of what existed at open time and is not refreshed on its own.
//! Closing (explicitly or by dropping) walks the tree children first and releases each handle once.
use std::{collections::BTreeMap, os::unix::io::AsRawFd};

use bitflags::bitflags;
use strum::IntoEnumIterator;

use crate::{errors::{codes::EZFS_NOENT, Error, Result, MSG_DATASET_IS_NIL},
            libzfs::{Handle, Libzfs},
            native::DatasetHandle,
            nv::{opt_handle, NvListGuard},
            property::{Property, PropertySource},
            zpool::Pool};

pub mod properties;
pub use properties::{dataset_property_to_name, DatasetProp, DatasetProperties, ZFS_NUM_PROPS};

mod pathext;
pub use pathext::{DatasetName, PathExt};

mod send;
pub use send::{receive, LzcSendFlags, RecvFlags, SendFlags};

pub mod estimate;
pub use estimate::{OutputScrapingEstimator, SendSizeEstimator};

/// Source value libzfs uses for received user properties.
const ZPROP_SOURCE_VAL_RECVD: &str = "$recvd";

bitflags! {
    /// `zfs_type_t`
    #[derive(Default)]
    pub struct DatasetType: i32 {
        const FILESYSTEM = 1 << 0;
        const SNAPSHOT = 1 << 1;
        const VOLUME = 1 << 2;
        const POOL = 1 << 3;
        const BOOKMARK = 1 << 4;
        const DATASET = Self::FILESYSTEM.bits | Self::SNAPSHOT.bits | Self::VOLUME.bits;
    }
}

impl DatasetType {
    /// Name as `zfs_type_to_name` prints it.
    pub fn name(self) -> &'static str {
        if self.contains(DatasetType::SNAPSHOT) {
            "snapshot"
        } else if self.contains(DatasetType::VOLUME) {
            "volume"
        } else if self.contains(DatasetType::BOOKMARK) {
            "bookmark"
        } else if self.contains(DatasetType::POOL) {
            "pool"
        } else {
            "filesystem"
        }
    }
}

/// One dataset and, for filesystems and volumes, everything below it.
#[derive(Debug, Default, Getters, MutGetters)]
pub struct Dataset {
    handle: Handle<DatasetHandle>,
    #[get = "pub"]
    kind: DatasetType,
    /// Cached properties, keyed by id. Refreshed by `reload_properties` and by every call that
    /// changes them.
    #[get = "pub"]
    properties: BTreeMap<DatasetProp, Property>,
    #[get = "pub"]
    #[get_mut = "pub"]
    children: Vec<Dataset>,
}

impl Dataset {
    /// Open the dataset at `path` with its properties and the whole tree below it.
    pub fn open(zfs: &Libzfs, path: &str) -> Result<Dataset> {
        let mut dataset = Self::open_single(zfs, path)?;
        dataset.reload_properties()?;
        dataset.open_children()?;
        Ok(dataset)
    }

    /// Open the root dataset of every pool, each with its tree.
    pub fn open_all(zfs: &Libzfs) -> Result<Vec<Dataset>> {
        let handles = zfs.call("zfs_iter_root", |b| b.dataset_iter_root())?;
        let mut datasets: Vec<Dataset> = handles.into_iter().map(|raw| Self::from_raw(zfs, raw)).collect();
        for dataset in &mut datasets {
            dataset.reload_properties()?;
            dataset.open_children()?;
        }
        Ok(datasets)
    }

    pub fn close_all(datasets: &mut [Dataset]) {
        for dataset in datasets {
            dataset.close();
        }
    }

    /// Create a filesystem or volume and open it.
    pub fn create(zfs: &Libzfs, path: &str, kind: DatasetType, props: &DatasetProperties) -> Result<Dataset> {
        {
            let list = props_to_nvlist(zfs, props)?;
            zfs.call("zfs_create", |b| b.dataset_create(path, kind, opt_handle(&list)))?;
        }
        debug!(zfs.logger(), "dataset created"; "dataset" => path, "kind" => kind.name());
        Dataset::open(zfs, path)
    }

    /// Take a snapshot (`pool/fs@name`) and open it.
    pub fn snapshot(zfs: &Libzfs, path: &str, recursive: bool, props: &DatasetProperties) -> Result<Dataset> {
        {
            let list = props_to_nvlist(zfs, props)?;
            zfs.call("zfs_snapshot", |b| b.dataset_snapshot(path, recursive, opt_handle(&list)))?;
        }
        debug!(zfs.logger(), "snapshot created"; "dataset" => path, "recursive" => recursive);
        Dataset::open(zfs, path)
    }

    fn open_single(zfs: &Libzfs, path: &str) -> Result<Dataset> {
        let raw = zfs
            .call_or_else("zfs_open", || Error::native(EZFS_NOENT, "dataset not found."), |b| b.dataset_open(path))
            .map_err(|err| {
                let message = format!("{} - {}", err, path);
                err.wrap(message)
            })?;
        Ok(Self::from_raw(zfs, raw))
    }

    fn from_raw(zfs: &Libzfs, raw: DatasetHandle) -> Dataset {
        let kind = zfs.with(|b| b.dataset_type(raw));
        Dataset { handle: Handle::open(zfs, raw), kind, properties: BTreeMap::new(), children: Vec::new() }
    }

    fn open_children(&mut self) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let handles = zfs.call("zfs_iter_children", |b| b.dataset_iter_children(raw))?;
        // Own every handle before doing anything that can fail.
        let mut children: Vec<Dataset> = handles.into_iter().map(|child| Self::from_raw(&zfs, child)).collect();
        for child in &mut children {
            child.reload_properties()?;
            child.open_children()?;
        }
        self.children = children;
        Ok(())
    }

    /// Release this handle and every child handle. Safe to call more than once.
    pub fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
        if let Some((zfs, raw)) = self.handle.take() {
            zfs.with(|b| b.dataset_close(raw));
        }
    }

    pub fn is_open(&self) -> bool { self.handle.is_open() }

    /// Full name, `pool/fs@snap`.
    pub fn path(&self) -> Result<String> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        Ok(zfs.with(|b| b.dataset_name(raw)))
    }

    /// Pool this dataset lives in, opened separately.
    pub fn pool(&self) -> Result<Pool> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let name = zfs.with(|b| b.dataset_pool_name(raw));
        Pool::open(&zfs, &name)
    }

    /// Destroy this dataset. Fails if the tree has children, they have to go first.
    pub fn destroy(&self, defer: bool) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        if !self.children.is_empty() {
            return Err(Error::HasChildren { path: self.path()?, kind: self.kind.name().to_string() });
        }
        zfs.call("zfs_destroy", |b| b.dataset_destroy(raw, defer))?;
        debug!(zfs.logger(), "dataset destroyed"; "dataset" => zfs.with(|b| b.dataset_name(raw)));
        Ok(())
    }

    /// Destroy children then this dataset. For a snapshot, destroys the snapshot with the same
    /// name in every filesystem under its parent.
    pub fn destroy_recursive(&mut self) -> Result<()> {
        let path = self.path()?;
        let (zfs, _) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let name = path.validate()?;
        match name.snapshot() {
            None => {
                for child in &mut self.children {
                    child.destroy_recursive()?;
                    child.close();
                }
                self.children.clear();
            },
            Some(snapshot) => {
                let parent = Dataset::open(&zfs, name.filesystem())?;
                for child in parent.children() {
                    let child_name = child.path()?.validate()?;
                    if child_name.is_snapshot() || child_name.is_bookmark() {
                        continue;
                    }
                    let mut same_name = match Dataset::open(&zfs, &format!("{}@{}", child_name, snapshot)) {
                        Ok(dataset) => dataset,
                        Err(_) => continue,
                    };
                    same_name.destroy_recursive()?;
                    same_name.close();
                }
            },
        }
        self.destroy(false)
    }

    /// Re-read every property. Properties that don't apply to this kind of dataset are skipped.
    pub fn reload_properties(&mut self) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let mut properties = BTreeMap::new();
        for prop in DatasetProp::iter() {
            if let Ok(value) = zfs.call("zfs_prop_get", |b| b.dataset_get_prop(raw, prop)) {
                properties.insert(prop, value);
            }
        }
        trace!(zfs.logger(), "properties reloaded"; "count" => properties.len());
        self.properties = properties;
        Ok(())
    }

    /// Re-read one property and update the cache.
    pub fn get_property(&mut self, prop: DatasetProp) -> Result<Property> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let value = zfs.call("zfs_prop_get", |b| b.dataset_get_prop(raw, prop))?;
        self.properties.insert(prop, value.clone());
        Ok(value)
    }

    /// Cached value, `None` if not loaded or not applicable.
    pub fn property(&self, prop: DatasetProp) -> Option<&Property> { self.properties.get(&prop) }

    /// Set a property, then read it back since libzfs may have normalized the value.
    pub fn set_property(&mut self, prop: DatasetProp, value: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_prop_set", |b| b.dataset_set_prop(raw, prop.name(), value))?;
        self.get_property(prop).map(|_| ())
    }

    /// Read a user property (`module:name`). Unset properties read as `-` with source none.
    pub fn get_user_property(&self, name: &str) -> Result<Property> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let found = zfs.call("zfs_get_user_props", |b| b.dataset_get_user_prop(raw, name))?;
        let (value, source) = match found {
            Some(found) => found,
            None => return Ok(Property::absent()),
        };
        let path = zfs.with(|b| b.dataset_name(raw));
        let source = if source == path {
            PropertySource::Local
        } else if source == ZPROP_SOURCE_VAL_RECVD {
            PropertySource::Received
        } else {
            PropertySource::Inherited(source)
        };
        Ok(Property::new(value, source))
    }

    pub fn set_user_property(&mut self, name: &str, value: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_prop_set", |b| b.dataset_set_prop(raw, name, value))
    }

    /// Clone this snapshot into `target` and open the clone. This tree is left as it is.
    pub fn clone_to(&self, target: &str, props: &DatasetProperties) -> Result<Dataset> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        {
            let list = props_to_nvlist(&zfs, props)?;
            zfs.call("zfs_clone", |b| b.dataset_clone(raw, target, opt_handle(&list)))?;
        }
        Dataset::open(&zfs, target)
    }

    /// Roll back to `snapshot`. Later snapshots are destroyed by libzfs.
    pub fn rollback(&mut self, snapshot: &Dataset, force: bool) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let (_, snap_raw) = snapshot.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_rollback", |b| b.dataset_rollback(raw, snap_raw, force))?;
        self.reload_properties()
    }

    /// Turn this clone into the origin of its former origin filesystem.
    pub fn promote(&mut self) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_promote", |b| b.dataset_promote(raw))?;
        self.reload_properties()
    }

    pub fn rename(&mut self, new_name: &str, recursive: bool, force_unmount: bool) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_rename", |b| b.dataset_rename(raw, new_name, recursive, force_unmount))?;
        self.reload_properties()
    }

    /// Mount point, if mounted.
    pub fn is_mounted(&self) -> Result<Option<String>> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        Ok(zfs.with(|b| b.dataset_is_mounted(raw)))
    }

    pub fn mount(&self, options: &str, flags: i32) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_mount", |b| b.dataset_mount(raw, options, flags))
    }

    pub fn unmount(&self, flags: i32) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        zfs.call("zfs_unmount", |b| b.dataset_unmount(raw, flags))
    }

    /// Unmount every child, deepest first, then this dataset.
    pub fn unmount_all(&self, flags: i32) -> Result<()> {
        self.handle.get(MSG_DATASET_IS_NIL)?;
        for child in &self.children {
            child.unmount_all(flags)?;
        }
        self.unmount(flags)
    }

    /// Stream this snapshot into `out`.
    pub fn send<F: AsRawFd>(&self, out: &F, flags: SendFlags) -> Result<()> {
        let mut flags = flags;
        if flags.contains(SendFlags::REPLICATE) {
            flags.insert(SendFlags::DO_ALL);
        }
        self.prepare_send(None, flags)?.run(out.as_raw_fd())
    }

    /// Estimate the size of a send with the scraping estimator.
    pub fn send_size(&self, from: &str, flags: SendFlags) -> Result<u64> {
        let (zfs, _) = self.handle.get(MSG_DATASET_IS_NIL)?;
        OutputScrapingEstimator::new(*zfs.config().send_size_deadline()).estimate(self, from, flags)
    }
}

impl Drop for Dataset {
    fn drop(&mut self) { self.close(); }
}

fn props_to_nvlist<'a>(zfs: &'a Libzfs, props: &DatasetProperties) -> Result<Option<NvListGuard<'a>>> {
    NvListGuard::from_pairs_opt(zfs.backend(), props.iter().map(|(prop, value)| (prop.name(), value)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!("filesystem", DatasetType::FILESYSTEM.name());
        assert_eq!("snapshot", DatasetType::SNAPSHOT.name());
        assert_eq!("volume", DatasetType::VOLUME.name());
        assert_eq!(7, DatasetType::DATASET.bits());
    }

    #[test]
    fn zero_value_close_is_noop() {
        let mut dataset = Dataset::default();
        dataset.close();
        dataset.close();
        assert!(!dataset.is_open());
        assert_eq!(crate::errors::ErrorKind::HandleClosed, dataset.path().unwrap_err().kind());
    }
}
