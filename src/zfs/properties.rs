use std::collections::BTreeMap;

use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::errors::{Error, Result};

/// Number of dataset properties libzfs knows about (`ZFS_NUM_PROPS`).
pub const ZFS_NUM_PROPS: i32 = 73;

/// Dataset property ids in `zfs_prop_t` order. Serialized form is the name libzfs uses.
#[derive(AsRefStr, EnumString, Display, EnumIter, EnumCount, FromRepr, IntoStaticStr)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum DatasetProp {
    #[strum(serialize = "type")]
    Type = 0,
    #[strum(serialize = "creation")]
    Creation = 1,
    #[strum(serialize = "used")]
    Used = 2,
    #[strum(serialize = "available")]
    Available = 3,
    #[strum(serialize = "referenced")]
    Referenced = 4,
    #[strum(serialize = "compressratio")]
    Compressratio = 5,
    #[strum(serialize = "mounted")]
    Mounted = 6,
    #[strum(serialize = "origin")]
    Origin = 7,
    #[strum(serialize = "quota")]
    Quota = 8,
    #[strum(serialize = "reservation")]
    Reservation = 9,
    #[strum(serialize = "volsize")]
    Volsize = 10,
    #[strum(serialize = "volblocksize")]
    Volblocksize = 11,
    #[strum(serialize = "recordsize")]
    Recordsize = 12,
    #[strum(serialize = "mountpoint")]
    Mountpoint = 13,
    #[strum(serialize = "sharenfs")]
    Sharenfs = 14,
    #[strum(serialize = "checksum")]
    Checksum = 15,
    #[strum(serialize = "compression")]
    Compression = 16,
    #[strum(serialize = "atime")]
    Atime = 17,
    #[strum(serialize = "devices")]
    Devices = 18,
    #[strum(serialize = "exec")]
    Exec = 19,
    #[strum(serialize = "setuid")]
    Setuid = 20,
    #[strum(serialize = "readonly")]
    Readonly = 21,
    #[strum(serialize = "zoned")]
    Zoned = 22,
    #[strum(serialize = "snapdir")]
    Snapdir = 23,
    /// Not exposed to users.
    #[strum(serialize = "private")]
    Private = 24,
    #[strum(serialize = "aclinherit")]
    Aclinherit = 25,
    #[strum(serialize = "createtxg")]
    Createtxg = 26,
    #[strum(serialize = "name")]
    Name = 27,
    #[strum(serialize = "canmount")]
    Canmount = 28,
    #[strum(serialize = "iscsioptions")]
    Iscsioptions = 29,
    #[strum(serialize = "xattr")]
    Xattr = 30,
    #[strum(serialize = "numclones")]
    Numclones = 31,
    #[strum(serialize = "copies")]
    Copies = 32,
    #[strum(serialize = "version")]
    Version = 33,
    #[strum(serialize = "utf8only")]
    Utf8only = 34,
    #[strum(serialize = "normalization")]
    Normalize = 35,
    #[strum(serialize = "casesensitivity")]
    Case = 36,
    #[strum(serialize = "vscan")]
    Vscan = 37,
    #[strum(serialize = "nbmand")]
    Nbmand = 38,
    #[strum(serialize = "sharesmb")]
    Sharesmb = 39,
    #[strum(serialize = "refquota")]
    Refquota = 40,
    #[strum(serialize = "refreservation")]
    Refreservation = 41,
    #[strum(serialize = "guid")]
    Guid = 42,
    #[strum(serialize = "primarycache")]
    Primarycache = 43,
    #[strum(serialize = "secondarycache")]
    Secondarycache = 44,
    #[strum(serialize = "usedbysnapshots")]
    Usedsnap = 45,
    #[strum(serialize = "usedbydataset")]
    Usedds = 46,
    #[strum(serialize = "usedbychildren")]
    Usedchild = 47,
    #[strum(serialize = "usedbyrefreservation")]
    Usedrefreserv = 48,
    #[strum(serialize = "useraccounting")]
    Useraccounting = 49,
    #[strum(serialize = "stmf_sbd_lu")]
    StmfShareinfo = 50,
    #[strum(serialize = "defer_destroy")]
    DeferDestroy = 51,
    #[strum(serialize = "userrefs")]
    Userrefs = 52,
    #[strum(serialize = "logbias")]
    Logbias = 53,
    #[strum(serialize = "unique")]
    Unique = 54,
    #[strum(serialize = "objsetid")]
    Objsetid = 55,
    #[strum(serialize = "dedup")]
    Dedup = 56,
    #[strum(serialize = "mlslabel")]
    Mlslabel = 57,
    #[strum(serialize = "sync")]
    Sync = 58,
    #[strum(serialize = "refcompressratio")]
    Refratio = 59,
    #[strum(serialize = "written")]
    Written = 60,
    #[strum(serialize = "clones")]
    Clones = 61,
    #[strum(serialize = "logicalused")]
    Logicalused = 62,
    #[strum(serialize = "logicalreferenced")]
    Logicalreferenced = 63,
    #[strum(serialize = "inconsistent")]
    Inconsistent = 64,
    #[strum(serialize = "snapdev")]
    Snapdev = 65,
    #[strum(serialize = "acltype")]
    Acltype = 66,
    #[strum(serialize = "context")]
    SelinuxContext = 67,
    #[strum(serialize = "fscontext")]
    SelinuxFscontext = 68,
    #[strum(serialize = "defcontext")]
    SelinuxDefcontext = 69,
    #[strum(serialize = "rootcontext")]
    SelinuxRootcontext = 70,
    #[strum(serialize = "relatime")]
    Relatime = 71,
    #[strum(serialize = "redundant_metadata")]
    RedundantMetadata = 72,
}

impl DatasetProp {
    /// Validate a raw `zfs_prop_t` id.
    pub fn from_id(id: i32) -> Result<Self> {
        Self::from_repr(id)
            .ok_or_else(|| Error::InvalidProperty(format!("Unknown zfs property id: {}", id)))
    }

    pub fn id(self) -> i32 { self as i32 }

    pub fn name(self) -> &'static str { self.into() }
}

/// Name of a raw dataset property id. The `ZFS_NUM_PROPS` sentinel is `numofprops`.
pub fn dataset_property_to_name(id: i32) -> Option<&'static str> {
    if id == ZFS_NUM_PROPS {
        return Some("numofprops");
    }
    DatasetProp::from_repr(id).map(DatasetProp::name)
}

/// Properties to apply when creating a dataset, snapshot or clone.
pub type DatasetProperties = BTreeMap<DatasetProp, String>;
