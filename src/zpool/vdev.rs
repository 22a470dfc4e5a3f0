//! Device specifications for pool creation.
//!
//! A pool is described as a list of top-level [`VdevSpec`]s. Before anything is handed to libzfs the
//! whole list is validated, so a bad specification fails without allocating a single native list.
use std::path::PathBuf;

use strum_macros::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::{errors::{Error, Result},
            native::Backend,
            nv::NvListGuard};

/// `ZPOOL_CONFIG_TYPE` values.
#[derive(AsRefStr, Display, EnumString, IntoStaticStr, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum VdevType {
    Root,
    Mirror,
    Replacing,
    Raidz,
    Disk,
    File,
    Missing,
    Hole,
    Spare,
    Log,
    L2cache,
}

impl VdevType {
    pub fn as_str(self) -> &'static str { self.into() }

    fn is_leaf(self) -> bool { self == VdevType::Disk || self == VdevType::File }
}

/// One node of a device tree. Grouping nodes carry `devices`, leaves carry `path`.
#[derive(Debug, Clone, PartialEq, Getters)]
#[get = "pub"]
pub struct VdevSpec {
    kind: VdevType,
    devices: Vec<VdevSpec>,
    /// Only meaningful for raidz, clamped to `1..=254`.
    parity: u8,
    path: Option<PathBuf>,
}

impl VdevSpec {
    fn leaf(kind: VdevType, path: PathBuf) -> Self { VdevSpec { kind, devices: Vec::new(), parity: 0, path: Some(path) } }

    fn group(kind: VdevType, devices: Vec<VdevSpec>) -> Self { VdevSpec { kind, devices, parity: 0, path: None } }

    /// Whole block device.
    pub fn disk<P: Into<PathBuf>>(path: P) -> Self { Self::leaf(VdevType::Disk, path.into()) }

    /// File backed device.
    pub fn file<P: Into<PathBuf>>(path: P) -> Self { Self::leaf(VdevType::File, path.into()) }

    pub fn mirror(devices: Vec<VdevSpec>) -> Self { Self::group(VdevType::Mirror, devices) }

    /// raidz with `parity` parity devices, so raidz2 is `raidz(2, ...)`.
    pub fn raidz(parity: u8, devices: Vec<VdevSpec>) -> Self {
        VdevSpec { parity: parity.max(1).min(254), ..Self::group(VdevType::Raidz, devices) }
    }

    /// Hot spares.
    pub fn spare(devices: Vec<VdevSpec>) -> Self { Self::group(VdevType::Spare, devices) }

    /// Intent log devices. Members may be leaves, mirrors or raidz.
    pub fn log(devices: Vec<VdevSpec>) -> Self { Self::group(VdevType::Log, devices) }

    /// Cache devices.
    pub fn l2cache(devices: Vec<VdevSpec>) -> Self { Self::group(VdevType::L2cache, devices) }

    /// Fewest and most children a grouping type accepts. `None` for leaves.
    fn bounds(&self) -> Option<(usize, usize)> {
        match self.kind {
            VdevType::Raidz => Some((usize::from(self.parity.max(1)) + 1, 255)),
            VdevType::Mirror => Some((2, i32::max_value() as usize)),
            VdevType::Spare | VdevType::Log | VdevType::L2cache => Some((1, i32::max_value() as usize)),
            _ => None,
        }
    }

    /// Check this node and everything below it. `top_level` is true for direct members of the pool
    /// and `in_log` for direct members of a log group.
    fn validate(&self, top_level: bool, in_log: bool) -> Result<()> {
        let count = self.devices.len();
        if let Some((min, max)) = self.bounds() {
            if count < min || count > max {
                return Err(Error::InvalidVdev(format!(
                    "{} supports no less than {} or more than {} devices",
                    self.kind, min, max
                )));
            }
        }
        match self.kind {
            VdevType::Disk | VdevType::File => {
                if self.path.as_ref().map_or(true, |path| path.as_os_str().is_empty()) {
                    return Err(Error::InvalidVdev(format!("{} requires a path", self.kind)));
                }
                if count > 0 {
                    return Err(Error::InvalidVdev(format!("{} can't have child devices", self.kind)));
                }
                Ok(())
            },
            VdevType::Mirror | VdevType::Raidz if top_level || in_log => {
                self.devices.iter().try_for_each(|device| device.leaf_only(self.kind))
            },
            VdevType::Spare | VdevType::L2cache if top_level => {
                self.devices.iter().try_for_each(|device| device.leaf_only(self.kind))
            },
            VdevType::Log if top_level => self.devices.iter().try_for_each(|device| device.validate(false, true)),
            _ => Err(Error::InvalidVdev(format!("{} can't be used here", self.kind))),
        }
    }

    fn leaf_only(&self, parent: VdevType) -> Result<()> {
        if !self.kind.is_leaf() {
            return Err(Error::InvalidVdev(format!("{} can only contain disk or file devices", parent)));
        }
        self.validate(false, false)
    }

    /// Native config of one data vdev.
    fn to_nvlist<'a>(&self, backend: &'a dyn Backend, ashift: u64) -> Result<NvListGuard<'a>> {
        let mut list = NvListGuard::new(backend)?;
        list.insert("type", self.kind.as_str())?;
        if self.kind.is_leaf() {
            let path = self.path.as_ref().map(|path| path.to_string_lossy().into_owned()).unwrap_or_default();
            list.insert_u64("whole_disk", if self.kind == VdevType::Disk { 1 } else { 0 })?;
            list.insert("path", path.as_str())?;
            if ashift > 0 {
                list.insert_u64("ashift", ashift)?;
            }
            return Ok(list);
        }
        if self.kind == VdevType::Raidz {
            list.insert_u64("nparity", u64::from(self.parity))?;
        }
        let children =
            self.devices.iter().map(|device| device.to_nvlist(backend, ashift)).collect::<Result<Vec<_>>>()?;
        list.insert_nvlists("children", &children)?;
        Ok(list)
    }
}

/// Validate a whole pool layout without touching libzfs.
pub fn validate_vdevs(vdevs: &[VdevSpec]) -> Result<()> {
    if vdevs.is_empty() {
        return Err(Error::InvalidVdev("pool needs at least one device".to_string()));
    }
    vdevs.iter().try_for_each(|vdev| vdev.validate(true, false))?;
    if vdevs.iter().all(|vdev| matches!(vdev.kind, VdevType::Spare | VdevType::Log | VdevType::L2cache)) {
        return Err(Error::InvalidVdev("pool needs at least one data device".to_string()));
    }
    Ok(())
}

/// Root config for `zpool_create`. Spares and cache devices go into their own arrays, log members
/// become top-level children marked `is_log`.
pub(crate) fn build_root<'a>(backend: &'a dyn Backend, vdevs: &[VdevSpec], ashift: u64) -> Result<NvListGuard<'a>> {
    validate_vdevs(vdevs)?;

    let mut children = Vec::new();
    let mut spares = Vec::new();
    let mut l2cache = Vec::new();
    for vdev in vdevs {
        match vdev.kind {
            VdevType::Spare => {
                for device in &vdev.devices {
                    spares.push(device.to_nvlist(backend, ashift)?);
                }
            },
            VdevType::L2cache => {
                for device in &vdev.devices {
                    l2cache.push(device.to_nvlist(backend, ashift)?);
                }
            },
            VdevType::Log => {
                for device in &vdev.devices {
                    let mut member = device.to_nvlist(backend, ashift)?;
                    member.insert_u64("is_log", 1)?;
                    children.push(member);
                }
            },
            _ => {
                let mut member = vdev.to_nvlist(backend, ashift)?;
                member.insert_u64("is_log", 0)?;
                children.push(member);
            },
        }
    }

    let mut root = NvListGuard::new(backend)?;
    root.insert("type", VdevType::Root.as_str())?;
    root.insert_nvlists("children", &children)?;
    if !spares.is_empty() {
        root.insert_nvlists("spares", &spares)?;
    }
    if !l2cache.is_empty() {
        root.insert_nvlists("l2cache", &l2cache)?;
    }
    Ok(root)
}
