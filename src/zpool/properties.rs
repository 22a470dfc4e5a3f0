//! Pool property ids, pool state and status.
use std::collections::BTreeMap;

use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::errors::{Error, Result};

/// Number of pool properties (`ZPOOL_NUM_PROPS`).
pub const ZPOOL_NUM_PROPS: i32 = 23;

/// Pool property ids in `zpool_prop_t` order.
#[derive(AsRefStr, EnumString, Display, EnumIter, EnumCount, FromRepr, IntoStaticStr)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum PoolProp {
    #[strum(serialize = "name")]
    Name = 0,
    #[strum(serialize = "size")]
    Size = 1,
    #[strum(serialize = "capacity")]
    Capacity = 2,
    #[strum(serialize = "altroot")]
    Altroot = 3,
    #[strum(serialize = "health")]
    Health = 4,
    #[strum(serialize = "guid")]
    Guid = 5,
    #[strum(serialize = "version")]
    Version = 6,
    #[strum(serialize = "bootfs")]
    Bootfs = 7,
    #[strum(serialize = "delegation")]
    Delegation = 8,
    #[strum(serialize = "autoreplace")]
    Autoreplace = 9,
    #[strum(serialize = "cachefile")]
    Cachefile = 10,
    #[strum(serialize = "failmode")]
    Failuremode = 11,
    #[strum(serialize = "listsnapshots")]
    Listsnaps = 12,
    #[strum(serialize = "autoexpand")]
    Autoexpand = 13,
    #[strum(serialize = "dedupditto")]
    Dedupditto = 14,
    #[strum(serialize = "dedupratio")]
    Dedupratio = 15,
    #[strum(serialize = "free")]
    Free = 16,
    #[strum(serialize = "allocated")]
    Allocated = 17,
    #[strum(serialize = "readonly")]
    Readonly = 18,
    #[strum(serialize = "ashift")]
    Ashift = 19,
    #[strum(serialize = "comment")]
    Comment = 20,
    #[strum(serialize = "expandsize")]
    Expandsz = 21,
    #[strum(serialize = "freeing")]
    Freeing = 22,
}

impl PoolProp {
    /// Validate a raw `zpool_prop_t` id.
    pub fn from_id(id: i32) -> Result<Self> {
        Self::from_repr(id)
            .ok_or_else(|| Error::InvalidProperty(format!("Unknown zpool property id: {}", id)))
    }

    pub fn id(self) -> i32 { self as i32 }

    pub fn name(self) -> &'static str { self.into() }
}

/// Name of a raw pool property id. The `ZPOOL_NUM_PROPS` sentinel is `numofprops`.
pub fn pool_property_to_name(id: i32) -> Option<&'static str> {
    if id == ZPOOL_NUM_PROPS {
        return Some("numofprops");
    }
    PoolProp::from_repr(id).map(PoolProp::name)
}

/// Pool properties to apply at creation.
pub type PoolProperties = BTreeMap<PoolProp, String>;

/// `pool_state_t`.
#[derive(AsRefStr, Display, FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PoolState {
    #[strum(serialize = "ACTIVE")]
    Active = 0,
    #[strum(serialize = "EXPORTED")]
    Exported = 1,
    #[strum(serialize = "DESTROYED")]
    Destroyed = 2,
    #[strum(serialize = "SPARE")]
    Spare = 3,
    #[strum(serialize = "L2CACHE")]
    L2cache = 4,
    #[strum(serialize = "UNINITIALIZED")]
    Uninitialized = 5,
    #[strum(serialize = "UNAVAIL")]
    Unavail = 6,
    #[strum(serialize = "POTENTIALLY_ACTIVE")]
    PotentiallyActive = 7,
}

impl PoolState {
    /// Unknown raw values read as `Unavail`.
    pub fn from_raw(raw: u64) -> Self { Self::from_repr(raw).unwrap_or(PoolState::Unavail) }
}

/// Same as `zpool_pool_state_to_name`.
pub fn pool_state_to_name(state: PoolState) -> &'static str {
    match state {
        PoolState::Active => "ACTIVE",
        PoolState::Exported => "EXPORTED",
        PoolState::Destroyed => "DESTROYED",
        PoolState::Spare => "SPARE",
        PoolState::L2cache => "L2CACHE",
        PoolState::Uninitialized => "UNINITIALIZED",
        PoolState::Unavail => "UNAVAIL",
        PoolState::PotentiallyActive => "POTENTIALLY_ACTIVE",
    }
}

/// `zpool_status_t`: why a pool is not healthy, or `Ok`.
#[derive(Display, FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PoolStatus {
    CorruptCache = 0,
    MissingDevR,
    MissingDevNr,
    CorruptLabelR,
    CorruptLabelNr,
    BadGuidSum,
    CorruptPool,
    CorruptData,
    FailingDev,
    VersionNewer,
    HostidMismatch,
    IoFailureWait,
    IoFailureContinue,
    BadLog,
    Errata,
    UnsupFeatRead,
    UnsupFeatWrite,
    FaultedDevR,
    FaultedDevNr,
    VersionOlder,
    FeatDisabled,
    Resilvering,
    OfflineDev,
    RemovedDev,
    Ok,
}

impl PoolStatus {
    pub fn from_raw(raw: i32) -> Self { Self::from_repr(raw).unwrap_or(PoolStatus::CorruptPool) }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn pool_table() {
        assert_eq!(ZPOOL_NUM_PROPS as usize, PoolProp::COUNT);
        assert_eq!("failmode", PoolProp::Failuremode.name());
        assert_eq!(Some("numofprops"), pool_property_to_name(ZPOOL_NUM_PROPS));
        assert_eq!(Some("freeing"), pool_property_to_name(22));
        assert!(PoolProp::from_id(23).is_err());
        assert!(PoolProp::from_id(-1).is_err());
    }

    #[test]
    fn states() {
        assert_eq!("ACTIVE", pool_state_to_name(PoolState::Active));
        assert_eq!("POTENTIALLY_ACTIVE", PoolState::PotentiallyActive.to_string());
        assert_eq!(PoolState::Exported, PoolState::from_raw(1));
        assert_eq!(PoolState::Unavail, PoolState::from_raw(99));
        assert_eq!(PoolStatus::Ok, PoolStatus::from_raw(24));
    }
}
