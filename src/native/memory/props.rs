//! Dataset property rules of the in-memory backend.
use crate::zfs::{DatasetProp, DatasetType};

/// Kinds of datasets a property is reported for.
pub(super) fn applies_to(prop: DatasetProp) -> DatasetType {
    use DatasetProp::*;
    let fs = DatasetType::FILESYSTEM;
    let vol = DatasetType::VOLUME;
    let snap = DatasetType::SNAPSHOT;
    match prop {
        Type | Creation | Used | Referenced | Compressratio | Createtxg | Name | Guid | Unique | Objsetid
        | Refratio | Written | Logicalreferenced | Inconsistent | Mlslabel => fs | vol | snap,
        DeferDestroy | Userrefs | Clones | Numclones => snap,
        Volsize | Volblocksize | Snapdev => vol,
        Mounted | Mountpoint | Sharenfs | Atime | Devices | Exec | Setuid | Zoned | Snapdir | Aclinherit
        | Canmount | Xattr | Version | Utf8only | Normalize | Case | Vscan | Nbmand | Sharesmb | Quota
        | Refquota | Recordsize | Acltype | SelinuxContext | SelinuxFscontext | SelinuxDefcontext
        | SelinuxRootcontext | Relatime => fs,
        Private | Iscsioptions | StmfShareinfo => DatasetType::empty(),
        _ => fs | vol,
    }
}

/// Default of a property that can be set. `None` for read-only ones and `mountpoint`, which
/// depends on the dataset name.
pub(super) fn settable_default(prop: DatasetProp) -> Option<&'static str> {
    use DatasetProp::*;
    let value = match prop {
        Sharenfs | Sharesmb | Compression | Readonly | Zoned | Vscan | Nbmand | Dedup | Acltype | Relatime
        | Utf8only => "off",
        Checksum | Atime | Devices | Exec | Setuid | Xattr | Canmount => "on",
        Snapdir | Snapdev => "hidden",
        Aclinherit => "restricted",
        Copies => "1",
        Primarycache | Secondarycache | RedundantMetadata => "all",
        Logbias => "latency",
        Sync => "standard",
        Mlslabel | SelinuxContext | SelinuxFscontext | SelinuxDefcontext | SelinuxRootcontext | Normalize => "none",
        Recordsize => "131072",
        Quota | Reservation | Refquota | Refreservation | Volsize => "0",
        Volblocksize => "8192",
        Case => "sensitive",
        _ => return None,
    };
    Some(value)
}

pub(super) fn is_settable(prop: DatasetProp) -> bool {
    prop == DatasetProp::Mountpoint || settable_default(prop).is_some()
}

pub(super) fn is_inheritable(prop: DatasetProp) -> bool {
    use DatasetProp::*;
    is_settable(prop)
        && !matches!(
            prop,
            Quota | Reservation | Refquota | Refreservation | Canmount | Volsize | Volblocksize | Utf8only | Normalize
                | Case
        )
}

/// Can only be given when the dataset is created.
pub(super) fn is_create_only(prop: DatasetProp) -> bool {
    use DatasetProp::*;
    matches!(prop, Volblocksize | Utf8only | Normalize | Case)
}

fn one_of(value: &str, allowed: &[&str]) -> Result<String, String> {
    if allowed.contains(&value) {
        Ok(value.to_string())
    } else {
        Err(format!("must be one of '{}'", allowed.join(" | ")))
    }
}

/// Check a value and bring it to the form `zfs get` prints.
pub(super) fn normalize(prop: DatasetProp, value: &str) -> Result<String, String> {
    use DatasetProp::*;
    match prop {
        Atime | Devices | Exec | Setuid | Readonly | Zoned | Xattr | Vscan | Nbmand | Utf8only | Relatime => {
            one_of(value, &["on", "off"])
        },
        Compression => {
            let gzip_level = value
                .strip_prefix("gzip-")
                .and_then(|level| level.parse::<u8>().ok())
                .map_or(false, |level| (1..=9).contains(&level));
            if gzip_level {
                Ok(value.to_string())
            } else {
                one_of(value, &["on", "off", "lzjb", "gzip", "zle", "lz4"])
            }
        },
        Checksum => one_of(value, &["on", "off", "fletcher2", "fletcher4", "sha256", "noparity", "sha512", "skein", "edonr"]),
        Dedup => one_of(value, &["on", "off", "verify", "sha256", "sha256,verify"]),
        Snapdir | Snapdev => one_of(value, &["hidden", "visible"]),
        Aclinherit => one_of(value, &["discard", "noallow", "restricted", "passthrough", "passthrough-x"]),
        Copies => one_of(value, &["1", "2", "3"]),
        Primarycache | Secondarycache => one_of(value, &["all", "none", "metadata"]),
        Logbias => one_of(value, &["latency", "throughput"]),
        Sync => one_of(value, &["standard", "always", "disabled"]),
        Canmount => one_of(value, &["on", "off", "noauto"]),
        Case => one_of(value, &["sensitive", "insensitive", "mixed"]),
        Normalize => one_of(value, &["none", "formC", "formD", "formKC", "formKD"]),
        RedundantMetadata => one_of(value, &["all", "most"]),
        Acltype => one_of(value, &["off", "noacl", "posixacl"]),
        Quota | Reservation | Refquota | Refreservation | Volsize => {
            if value == "none" {
                return Ok("0".to_string());
            }
            parse_size(value).map(|size| size.to_string()).ok_or_else(|| "bad numeric value".to_string())
        },
        Recordsize | Volblocksize => match parse_size(value) {
            Some(size) if size.is_power_of_two() && (512..=1 << 20).contains(&size) => Ok(size.to_string()),
            _ => Err("must be power of 2 from 512B to 1M".to_string()),
        },
        Mountpoint => {
            if value == "none" || value == "legacy" || value.starts_with('/') {
                Ok(value.to_string())
            } else {
                Err("must be an absolute path, 'none', or 'legacy'".to_string())
            }
        },
        _ => Ok(value.to_string()),
    }
}

/// `1024`, `4K`, `1.5M` is not accepted, `10G`, `1TB`.
pub(super) fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits = value.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| value.len());
    let (number, suffix) = value.split_at(digits);
    let number: u64 = number.parse().ok()?;
    let suffix = suffix.to_ascii_uppercase();
    let shift = match suffix.trim_end_matches('B') {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        "P" => 50,
        _ => return None,
    };
    number.checked_mul(1 << shift)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Some(1024), parse_size("1024"));
        assert_eq!(Some(4096), parse_size("4K"));
        assert_eq!(Some(10 << 30), parse_size("10G"));
        assert_eq!(Some(1 << 40), parse_size("1TB"));
        assert_eq!(None, parse_size("1.5M"));
        assert_eq!(None, parse_size("lots"));
    }

    #[test]
    fn values_are_checked() {
        assert_eq!(Ok("lz4".to_string()), normalize(DatasetProp::Compression, "lz4"));
        assert_eq!(Ok("gzip-9".to_string()), normalize(DatasetProp::Compression, "gzip-9"));
        assert!(normalize(DatasetProp::Compression, "gzip-10").is_err());
        assert!(normalize(DatasetProp::Atime, "yes").is_err());
        assert_eq!(Ok("0".to_string()), normalize(DatasetProp::Quota, "none"));
        assert_eq!(Ok("1048576".to_string()), normalize(DatasetProp::Quota, "1M"));
        assert!(normalize(DatasetProp::Recordsize, "1000").is_err());
        assert!(normalize(DatasetProp::Mountpoint, "relative").is_err());
    }

    #[test]
    fn classification() {
        assert!(!is_settable(DatasetProp::Used));
        assert!(is_settable(DatasetProp::Mountpoint));
        assert!(is_inheritable(DatasetProp::Compression));
        assert!(!is_inheritable(DatasetProp::Quota));
        assert!(applies_to(DatasetProp::Volsize).contains(DatasetType::VOLUME));
        assert!(!applies_to(DatasetProp::Mountpoint).contains(DatasetType::SNAPSHOT));
    }
}
