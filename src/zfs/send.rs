//! Replication streams.
use std::os::unix::io::{AsRawFd, RawFd};

use bitflags::bitflags;

use crate::{errors::{Error, Result, MSG_DATASET_IS_NIL},
            libzfs::Libzfs,
            native::Backend,
            nv::NvListGuard,
            zfs::{Dataset, DatasetProp, DatasetType, PathExt}};

bitflags! {
    /// `sendflags_t` of `zfs_send`.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Print progress information.
        const VERBOSE = 1 << 0;
        /// Recursive send of the filesystem and all descendants.
        const REPLICATE = 1 << 1;
        /// Send every snapshot between `from` and `to`.
        const DO_ALL = 1 << 2;
        /// Incremental from the origin of a clone.
        const FROM_ORIGIN = 1 << 3;
        const DEDUP = 1 << 4;
        /// Include properties in the stream.
        const PROPS = 1 << 5;
        /// Don't write anything, only report what would be sent.
        const DRY_RUN = 1 << 6;
        /// Machine-readable verbose output.
        const PARSABLE = 1 << 7;
        const PROGRESS = 1 << 8;
        /// Allow records larger than 128KiB.
        const LARGE_BLOCK = 1 << 9;
        const EMBED_DATA = 1 << 10;
        const COMPRESS = 1 << 11;
    }
}

bitflags! {
    /// `lzc_send_flags`
    #[derive(Default)]
    pub struct LzcSendFlags: u32 {
        const EMBED_DATA = 1 << 0;
        const LARGE_BLOCK = 1 << 1;
        const COMPRESS = 1 << 2;
    }
}

bitflags! {
    /// `recvflags_t` of `zfs_receive`.
    #[derive(Default)]
    pub struct RecvFlags: u32 {
        const VERBOSE = 1 << 0;
        /// Use the full sent name, minus the pool, below the target.
        const IS_PREFIX = 1 << 1;
        /// Use only the last component of the sent name below the target.
        const IS_TAIL = 1 << 2;
        const DRY_RUN = 1 << 3;
        /// Roll back the target to its latest snapshot before receiving.
        const FORCE = 1 << 4;
        const CAN_MOUNT_OFF = 1 << 5;
        const RESUMABLE = 1 << 6;
        const BYTE_SWAP = 1 << 7;
        const NO_MOUNT = 1 << 8;
    }
}

const SEND_NOT_A_SNAPSHOT: &str =
    "Unsupported method on filesystem or bookmark. Use send_one() for that purpose.";
const SEND_ONE_SNAPSHOT: &str = "Unsupported with snapshot. Use send() for that purpose.";
const SEND_ONE_FLAGS: &str = "Unsupported flag with filesystem or bookmark.";
const INCREMENTAL_OTHER_FS: &str = "Incremental source must be in same filesystem.";
const INCREMENTAL_INVALID: &str = "Invalid incremental source.";

/// Everything a `zfs_send` needs, resolved up front so the call can run on another thread.
#[derive(Debug)]
pub(crate) struct SendJob {
    zfs: Libzfs,
    filesystem: String,
    from: Option<String>,
    to: String,
    flags: SendFlags,
}

impl SendJob {
    pub(crate) fn zfs(&self) -> &Libzfs { &self.zfs }

    /// Open the filesystem and send into `fd`.
    pub(crate) fn run(&self, fd: RawFd) -> Result<()> { self.run_with(fd, false) }

    /// Same as `run`, but the send itself doesn't hold the context lock.
    pub(crate) fn run_unlocked(&self, fd: RawFd) -> Result<()> { self.run_with(fd, true) }

    fn run_with(&self, fd: RawFd, unlocked: bool) -> Result<()> {
        let filesystem = Dataset::open_single(&self.zfs, &self.filesystem)?;
        let (zfs, raw) = filesystem.handle.get(MSG_DATASET_IS_NIL)?;
        debug!(zfs.logger(), "sending"; "filesystem" => &self.filesystem, "to" => &self.to,
               "from" => self.from.as_deref().unwrap_or(""), "flags" => ?self.flags);
        let send = |b: &dyn Backend| b.send(raw, self.from.as_deref(), &self.to, self.flags, fd);
        if unlocked {
            zfs.call_unlocked("zfs_send", send)
        } else {
            zfs.call("zfs_send", send)
        }
    }
}

impl Dataset {
    /// Validate a snapshot send and split names the way `zfs_send` wants them.
    pub(crate) fn prepare_send(&self, from: Option<&str>, flags: SendFlags) -> Result<SendJob> {
        let (zfs, _) = self.handle.get(MSG_DATASET_IS_NIL)?;
        if !self.kind.contains(DatasetType::SNAPSHOT) || from.map_or(false, |from| from.contains('#')) {
            return Err(Error::Unsupported(SEND_NOT_A_SNAPSHOT));
        }
        let from = match from.filter(|from| !from.is_empty()) {
            None => None,
            Some(from) => match from.strip_prefix('@') {
                Some(snapshot) => Some(snapshot.to_string()),
                None if from.contains('@') => from.validate()?.snapshot().clone(),
                None => Some(from.to_string()),
            },
        };
        let path = self.path()?;
        let name = path.validate()?;
        let to = name.snapshot().clone().ok_or_else(|| Error::InvalidName(path.clone()))?;
        Ok(SendJob { zfs, filesystem: name.filesystem().clone(), from, to, flags })
    }

    /// Incremental send of this snapshot from `from` (`@snap` or `fs@snap` within the same
    /// filesystem). When `from` is the origin of a clone the stream is sent from the origin.
    pub fn send_from<F: AsRawFd>(&self, from: &str, out: &F, flags: SendFlags) -> Result<()> {
        let (zfs, _) = self.handle.get(MSG_DATASET_IS_NIL)?;
        let mut flags = flags;
        let dest = self.path()?.validate()?;

        // Snapshots have no origin of their own, the clone filesystem carries it.
        let origin = Dataset::open_single(&zfs, dest.filesystem())
            .ok()
            .and_then(|filesystem| {
                let (zfs, raw) = filesystem.handle.get(MSG_DATASET_IS_NIL).ok()?;
                zfs.call("zfs_prop_get", |b| b.dataset_get_prop(raw, DatasetProp::Origin)).ok()
            })
            .map(|origin| origin.value().clone())
            .unwrap_or_default();
        if !origin.is_empty() && origin != "-" && origin == from {
            flags.insert(SendFlags::FROM_ORIGIN);
            return self.prepare_send(None, flags)?.run(out.as_raw_fd());
        }

        // `@snap` is relative to this snapshot's filesystem.
        let qualified =
            if from.starts_with('@') { format!("{}{}", dest.filesystem(), from) } else { from.to_string() };
        let source = qualified.validate().map_err(|_| Error::Unsupported(INCREMENTAL_INVALID))?;
        if source.filesystem() != dest.filesystem() {
            return Err(Error::Unsupported(INCREMENTAL_OTHER_FS));
        }
        let snapshot = source.snapshot().as_ref().ok_or(Error::Unsupported(INCREMENTAL_INVALID))?;
        self.prepare_send(Some(&format!("@{}", snapshot)), flags)?.run(out.as_raw_fd())
    }

    /// Send a filesystem or volume, optionally incremental from a bookmark (`#mark`, `@snap` or a
    /// full name).
    pub fn send_one<F: AsRawFd>(&self, from: &str, out: &F, flags: SendFlags) -> Result<()> {
        let (zfs, raw) = self.handle.get(MSG_DATASET_IS_NIL)?;
        if self.kind.contains(DatasetType::SNAPSHOT) || (!from.is_empty() && !from.contains('#')) {
            return Err(Error::Unsupported(SEND_ONE_SNAPSHOT));
        }
        let unsupported =
            SendFlags::REPLICATE | SendFlags::DO_ALL | SendFlags::PROPS | SendFlags::DEDUP | SendFlags::DRY_RUN;
        if flags.intersects(unsupported) {
            return Err(Error::Unsupported(SEND_ONE_FLAGS));
        }
        let mut lzc_flags = LzcSendFlags::empty();
        if flags.contains(SendFlags::LARGE_BLOCK) {
            lzc_flags.insert(LzcSendFlags::LARGE_BLOCK);
        }
        if flags.contains(SendFlags::EMBED_DATA) {
            lzc_flags.insert(LzcSendFlags::EMBED_DATA);
        }
        if flags.contains(SendFlags::COMPRESS) {
            lzc_flags.insert(LzcSendFlags::COMPRESS);
        }
        let from = if from.starts_with('#') || from.starts_with('@') {
            Some(format!("{}{}", self.path()?, from))
        } else if from.is_empty() {
            None
        } else {
            Some(from.to_string())
        };
        zfs.call("zfs_send_one", |b| b.send_one(raw, from.as_deref(), out.as_raw_fd(), lzc_flags))
    }

    /// Receive a stream into this dataset's name.
    pub fn receive<F: AsRawFd>(&self, input: &F, flags: RecvFlags) -> Result<()> {
        let (zfs, _) = self.handle.get(MSG_DATASET_IS_NIL)?;
        receive(&zfs, &self.path()?, input, flags)
    }
}

/// Receive a stream into `target`, which doesn't have to exist for a full stream.
pub fn receive<F: AsRawFd>(zfs: &Libzfs, target: &str, input: &F, flags: RecvFlags) -> Result<()> {
    let props = NvListGuard::new(zfs.backend())?;
    zfs.call("zfs_receive", |b| b.receive(target, props.handle(), flags, input.as_raw_fd()))
        .map_err(|err| {
            let message = format!("ZFS receive of {} failed. {}", target, err);
            err.wrap(message)
        })?;
    debug!(zfs.logger(), "stream received"; "target" => target, "flags" => ?flags);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_value_dataset_is_closed() {
        let dataset = Dataset::default();
        let out = tempfile::tempfile().unwrap();
        let err = dataset.send(&out, SendFlags::empty()).unwrap_err();
        assert_eq!(crate::errors::ErrorKind::HandleClosed, err.kind());
        let err = dataset.send_one("", &out, SendFlags::empty()).unwrap_err();
        assert_eq!(crate::errors::ErrorKind::HandleClosed, err.kind());
    }

    #[test]
    fn flags_are_independent_bits() {
        let all = SendFlags::all();
        assert_eq!(12, all.bits().count_ones());
        assert_eq!(7, LzcSendFlags::all().bits());
        assert!(!RecvFlags::default().contains(RecvFlags::FORCE));
    }
}
