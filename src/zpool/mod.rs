//! Pools: open, create, import, export and destroy, plus cached properties and feature flags.
//!
//! A [`Pool`] holds one native handle until it is closed or dropped. Its property array and the
//! feature flags are read when the pool is opened and can be refreshed with
//! [`Pool::reload_properties`].
use std::{collections::BTreeMap, path::PathBuf, thread};

use strum::IntoEnumIterator;

use crate::{errors::{codes::EZFS_NOENT, Error, Result, MSG_POOL_IS_NIL},
            libzfs::{Handle, Libzfs},
            native::PoolHandle,
            nv::{opt_handle, NvListGuard},
            property::{Property, PropertySource},
            zfs::DatasetProperties};

pub mod properties;
pub use properties::{pool_property_to_name, pool_state_to_name, PoolProp, PoolProperties, PoolState, PoolStatus,
                     ZPOOL_NUM_PROPS};

mod vdev;
pub use vdev::{validate_vdevs, VdevSpec, VdevType};

/// Feature flags every reload reports, `disabled` unless the pool says otherwise.
const DEFAULT_FEATURES: &[&str] = &["async_destroy", "empty_bpobj", "lz4_compress"];

/// Everything `zpool create` needs.
#[derive(Debug, Clone, Builder, Getters)]
#[builder(setter(into))]
#[get = "pub"]
pub struct CreatePoolRequest {
    /// Name of the new pool.
    name: String,
    /// Top-level devices, spares, logs and cache devices.
    vdevs: Vec<VdevSpec>,
    /// Feature flags by bare name (`lz4_compress`), value `enabled` or `disabled`.
    #[builder(default)]
    features: BTreeMap<String, String>,
    #[builder(default)]
    props: PoolProperties,
    /// Properties of the root filesystem.
    #[builder(default)]
    fs_props: DatasetProperties,
}

impl CreatePoolRequest {
    pub fn builder() -> CreatePoolRequestBuilder { CreatePoolRequestBuilder::default() }
}

#[derive(Debug, Default, Getters)]
pub struct Pool {
    handle: Handle<PoolHandle>,
    /// Cached properties in `PoolProp` order.
    #[get = "pub"]
    properties: Vec<Property>,
    #[get = "pub"]
    features: BTreeMap<String, String>,
}

impl Pool {
    /// Open an imported pool and read its properties.
    pub fn open(zfs: &Libzfs, name: &str) -> Result<Pool> {
        let raw = zfs.call("zpool_open", |b| b.pool_open(name))?;
        let mut pool = Self::from_raw(zfs, raw);
        pool.reload_properties()?;
        Ok(pool)
    }

    /// Open every imported pool.
    pub fn open_all(zfs: &Libzfs) -> Result<Vec<Pool>> {
        let handles = zfs.call("zpool_iter", |b| b.pool_iter())?;
        let mut pools: Vec<Pool> = handles.into_iter().map(|raw| Self::from_raw(zfs, raw)).collect();
        for pool in &mut pools {
            pool.reload_properties()?;
        }
        Ok(pools)
    }

    pub fn close_all(pools: &mut [Pool]) {
        for pool in pools {
            pool.close();
        }
    }

    fn from_raw(zfs: &Libzfs, raw: PoolHandle) -> Pool {
        Pool { handle: Handle::open(zfs, raw), properties: Vec::new(), features: BTreeMap::new() }
    }

    /// Import the exported pool called `name` found in one of `search_paths` and open it.
    pub fn import(zfs: &Libzfs, name: &str, search_paths: &[PathBuf]) -> Result<Pool> {
        let backend = zfs.backend();
        let found = zfs.call("zpool_find_import", |b| b.pool_find_import(search_paths)).map_err(|err| {
            debug!(zfs.logger(), "import scan failed"; "pool" => name, "error" => %err);
            Error::PoolListFailed
        })?;
        // Owns the scan result and everything looked up in it.
        let found = NvListGuard::adopt(backend, found);

        let candidates = backend.nvlist_nested(found.handle()).map_err(|_| Error::PoolListFailed)?;
        let mut config = None;
        for (_, candidate) in candidates {
            let candidate_name = backend.nvlist_lookup_string(candidate, "name").map_err(|_| Error::PoolListFailed)?;
            if candidate_name == name {
                config = Some(candidate);
                break;
            }
        }
        let config = config.ok_or_else(|| Error::PoolNotFound(name.to_string()))?;
        zfs.call("zpool_import", |b| b.pool_import(config, name))?;
        drop(found);

        debug!(zfs.logger(), "pool imported"; "pool" => name);
        Pool::open(zfs, name)
    }

    /// Create a pool and open it. A new pool may take a moment to show up, so opening is retried
    /// while libzfs reports it as missing.
    pub fn create(zfs: &Libzfs, request: &CreatePoolRequest) -> Result<Pool> {
        let name = request.name.as_str();
        {
            let backend = zfs.backend();
            let ashift = request.props.get(&PoolProp::Ashift).and_then(|value| value.parse().ok()).unwrap_or(0);
            let root = vdev::build_root(backend, &request.vdevs, ashift)?;

            let mut props = NvListGuard::from_pairs_opt(
                backend,
                request.props.iter().map(|(prop, value)| (prop.name(), value.as_str())),
            )?;
            if !request.features.is_empty() && props.is_none() {
                props = Some(NvListGuard::new(backend)?);
            }
            if let Some(list) = props.as_mut() {
                for (feature, value) in &request.features {
                    list.insert_string(&format!("feature@{}", feature), value)?;
                }
            }
            let fs_props = NvListGuard::from_pairs_opt(
                backend,
                request.fs_props.iter().map(|(prop, value)| (prop.name(), value.as_str())),
            )?;

            zfs.call("zpool_create", |b| b.pool_create(name, root.handle(), opt_handle(&props), opt_handle(&fs_props)))
                .map_err(|err| err.context(" (zpool_create)"))?;
        }
        debug!(zfs.logger(), "pool created"; "pool" => name);

        let mut attempts_left = *zfs.config().create_open_attempts();
        loop {
            match Pool::open(zfs, name) {
                Ok(pool) => return Ok(pool),
                Err(err) if err.code() == EZFS_NOENT && attempts_left > 0 => {
                    attempts_left -= 1;
                    trace!(zfs.logger(), "new pool not visible yet"; "pool" => name, "attempts_left" => attempts_left);
                    thread::sleep(*zfs.config().create_open_backoff());
                },
                Err(err) => return Err(err.context(" (PoolOpen)")),
            }
        }
    }

    /// Release the handle. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some((zfs, raw)) = self.handle.take() {
            zfs.with(|b| b.pool_close(raw));
        }
    }

    pub fn is_open(&self) -> bool { self.handle.is_open() }

    /// Re-read every property and the feature flags. Cached values only change if all of it
    /// succeeds.
    pub fn reload_properties(&mut self) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        let mut properties = Vec::with_capacity(ZPOOL_NUM_PROPS as usize);
        for prop in PoolProp::iter() {
            properties.push(zfs.call("zpool_get_prop", |b| b.pool_get_prop(raw, prop))?);
        }

        let mut features: BTreeMap<String, String> =
            DEFAULT_FEATURES.iter().map(|feature| (feature.to_string(), "disabled".to_string())).collect();
        // Older pools don't know every feature, those stay disabled.
        for (feature, value) in &mut features {
            let name = format!("feature@{}", feature);
            if let Ok(state) = zfs.call("zpool_get_feature", |b| b.pool_get_feature(raw, &name)) {
                *value = state;
            }
        }

        self.properties = properties;
        self.features = features;
        Ok(())
    }

    /// Read one property from the pool and update the cache.
    pub fn get_property(&mut self, prop: PoolProp) -> Result<Property> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        let property = zfs.call("zpool_get_prop", |b| b.pool_get_prop(raw, prop))?;
        self.cache(prop, property.clone());
        Ok(property)
    }

    /// Cached value of one property, `None` before the first reload.
    pub fn property(&self, prop: PoolProp) -> Option<&Property> { self.properties.get(prop.id() as usize) }

    /// Set a property and read it back, libzfs may store it in a different form.
    pub fn set_property(&mut self, prop: PoolProp, value: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        zfs.call("zpool_set_prop", |b| b.pool_set_prop(raw, prop.name(), value))?;
        debug!(zfs.logger(), "pool property set"; "property" => prop.name(), "value" => value);
        self.get_property(prop).map(|_| ())
    }

    /// State of a feature flag by bare name, `enabled`, `active` or `disabled`.
    pub fn get_feature(&mut self, feature: &str) -> Result<String> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        let name = format!("feature@{}", feature);
        let value = zfs
            .call("zpool_get_feature", |b| b.pool_get_feature(raw, &name))
            .map_err(|err| err.wrap(format!("Unknown zpool feature: {}", feature)))?;
        self.features.insert(feature.to_string(), value.clone());
        Ok(value)
    }

    /// Pool name as libzfs reports it now.
    pub fn name(&mut self) -> Result<String> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        let name = zfs.with(|b| b.pool_name(raw));
        self.cache(PoolProp::Name, Property::new(name.clone(), PropertySource::None));
        Ok(name)
    }

    pub fn state(&self) -> Result<PoolState> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        Ok(zfs.with(|b| b.pool_state(raw)))
    }

    pub fn status(&self) -> Result<PoolStatus> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        Ok(zfs.with(|b| b.pool_status(raw)))
    }

    /// Destroy the pool. The handle stays open until closed.
    pub fn destroy(&self, log: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        zfs.call("zpool_destroy", |b| b.pool_destroy(raw, log))?;
        debug!(zfs.logger(), "pool destroyed"; "pool" => zfs.with(|b| b.pool_name(raw)));
        Ok(())
    }

    /// Export the pool. Without `force` it fails if anything in it is busy.
    pub fn export(&self, force: bool, log: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        zfs.call("zpool_export", |b| b.pool_export(raw, force, log))?;
        debug!(zfs.logger(), "pool exported"; "pool" => zfs.with(|b| b.pool_name(raw)), "force" => force);
        Ok(())
    }

    /// Export even if datasets are busy.
    pub fn export_force(&self, log: &str) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_POOL_IS_NIL)?;
        zfs.call("zpool_export_force", |b| b.pool_export_force(raw, log))?;
        debug!(zfs.logger(), "pool exported"; "pool" => zfs.with(|b| b.pool_name(raw)), "force" => true);
        Ok(())
    }

    fn cache(&mut self, prop: PoolProp, property: Property) {
        if let Some(slot) = self.properties.get_mut(prop.id() as usize) {
            *slot = property;
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) { self.close(); }
}
