//! The call surface of libzfs this crate relies on.
//!
//! Everything that touches the native library goes through these traits. There are two
//! implementations: [`memory::MemoryBackend`], an in-process stand-in used by the test suite, and
//! `ffi::LibzfsBackend` (feature `native`) which calls into the system `libzfs`.
//!
//! Handles are opaque tokens. A token is only meaningful to the backend that issued it and must be
//! released with the matching `*_close`/`nvlist_free` call exactly once.
//!
//! Methods returning [`Status`] report failure through the library-wide error state: after
//! `Err(Failed)` the caller reads [`ErrorState::errno`] and [`ErrorState::error_description`]
//! before issuing any other call. [`crate::Libzfs`] does that under a single mutex.
use std::{os::unix::io::RawFd, path::PathBuf};

use crate::{property::Property,
            zfs::{DatasetProp, DatasetType, LzcSendFlags, RecvFlags, SendFlags},
            zpool::{PoolProp, PoolState, PoolStatus}};

pub mod memory;

#[cfg(feature = "native")] pub mod ffi;

/// `zpool_handle_t *`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub usize);

/// `zfs_handle_t *`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetHandle(pub usize);

/// `nvlist_t *`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvHandle(pub usize);

/// Saved state of a diagnostics redirection, see [`StreamBackend::redirect_diagnostics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirection(pub RawFd);

/// A native call reported failure. Details are in the library error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failed;

pub type Status<T = ()> = std::result::Result<T, Failed>;

/// Result of a name/value list operation, `Err` carries errno.
pub type NvStatus<T = ()> = std::result::Result<T, i32>;

/// Library-wide last error (`libzfs_errno`, `libzfs_error_description`).
pub trait ErrorState {
    fn errno(&self) -> i32;
    fn error_description(&self) -> String;
    /// Reset the error state to success.
    fn clear_error(&self);
}

/// Name/value lists (`libnvpair`). These never touch the libzfs error state.
pub trait NvBackend {
    /// Allocate an empty list with unique names.
    fn nvlist_alloc(&self) -> NvStatus<NvHandle>;
    /// Release a list and everything nested in it.
    fn nvlist_free(&self, list: NvHandle);
    fn nvlist_add_string(&self, list: NvHandle, name: &str, value: &str) -> NvStatus;
    fn nvlist_add_u64(&self, list: NvHandle, name: &str, value: u64) -> NvStatus;
    /// Copy `value` into `list`. The caller still owns `value`.
    fn nvlist_add_nvlist(&self, list: NvHandle, name: &str, value: NvHandle) -> NvStatus;
    /// Copy `values` into `list`. The caller still owns every element.
    fn nvlist_add_nvlist_array(&self, list: NvHandle, name: &str, values: &[NvHandle]) -> NvStatus;
    fn nvlist_lookup_string(&self, list: NvHandle, name: &str) -> NvStatus<String>;
    /// All list-valued pairs. Returned handles are borrowed from `list`.
    fn nvlist_nested(&self, list: NvHandle) -> NvStatus<Vec<(String, NvHandle)>>;
}

pub trait PoolBackend {
    fn pool_open(&self, name: &str) -> Status<PoolHandle>;
    /// Open every imported pool.
    fn pool_iter(&self) -> Status<Vec<PoolHandle>>;
    fn pool_close(&self, pool: PoolHandle);
    fn pool_name(&self, pool: PoolHandle) -> String;
    fn pool_state(&self, pool: PoolHandle) -> PoolState;
    fn pool_status(&self, pool: PoolHandle) -> PoolStatus;
    fn pool_get_prop(&self, pool: PoolHandle, prop: PoolProp) -> Status<Property>;
    fn pool_set_prop(&self, pool: PoolHandle, name: &str, value: &str) -> Status;
    /// `name` is the full `feature@...` property name.
    fn pool_get_feature(&self, pool: PoolHandle, name: &str) -> Status<String>;
    fn pool_create(&self, name: &str, root: NvHandle, props: Option<NvHandle>, fs_props: Option<NvHandle>) -> Status;
    fn pool_destroy(&self, pool: PoolHandle, log: &str) -> Status;
    fn pool_export(&self, pool: PoolHandle, force: bool, log: &str) -> Status;
    fn pool_export_force(&self, pool: PoolHandle, log: &str) -> Status;
    /// Scan `dirs` for importable pools. Returns an owned list keyed by pool name, each value is a
    /// pool config.
    fn pool_find_import(&self, dirs: &[PathBuf]) -> Status<NvHandle>;
    fn pool_import(&self, config: NvHandle, name: &str) -> Status;
}

pub trait DatasetBackend {
    fn dataset_open(&self, path: &str) -> Status<DatasetHandle>;
    /// Open the root dataset of every imported pool.
    fn dataset_iter_root(&self) -> Status<Vec<DatasetHandle>>;
    /// Open direct children, filesystems and volumes first then snapshots.
    fn dataset_iter_children(&self, dataset: DatasetHandle) -> Status<Vec<DatasetHandle>>;
    fn dataset_close(&self, dataset: DatasetHandle);
    fn dataset_type(&self, dataset: DatasetHandle) -> DatasetType;
    fn dataset_name(&self, dataset: DatasetHandle) -> String;
    fn dataset_pool_name(&self, dataset: DatasetHandle) -> String;
    fn dataset_get_prop(&self, dataset: DatasetHandle, prop: DatasetProp) -> Status<Property>;
    /// Raw value and source of a user property, `None` when it is not set anywhere.
    fn dataset_get_user_prop(&self, dataset: DatasetHandle, name: &str) -> Status<Option<(String, String)>>;
    fn dataset_set_prop(&self, dataset: DatasetHandle, name: &str, value: &str) -> Status;
    fn dataset_create(&self, path: &str, kind: DatasetType, props: Option<NvHandle>) -> Status;
    fn dataset_destroy(&self, dataset: DatasetHandle, defer: bool) -> Status;
    fn dataset_clone(&self, snapshot: DatasetHandle, target: &str, props: Option<NvHandle>) -> Status;
    fn dataset_snapshot(&self, path: &str, recursive: bool, props: Option<NvHandle>) -> Status;
    fn dataset_rollback(&self, dataset: DatasetHandle, snapshot: DatasetHandle, force: bool) -> Status;
    fn dataset_promote(&self, dataset: DatasetHandle) -> Status;
    fn dataset_rename(&self, dataset: DatasetHandle, target: &str, recursive: bool, force_unmount: bool) -> Status;
    /// Mount point if mounted.
    fn dataset_is_mounted(&self, dataset: DatasetHandle) -> Option<String>;
    fn dataset_mount(&self, dataset: DatasetHandle, options: &str, flags: i32) -> Status;
    fn dataset_unmount(&self, dataset: DatasetHandle, flags: i32) -> Status;
}

pub trait StreamBackend {
    /// `zfs_send`: `dataset` is the filesystem, `from`/`to` are bare snapshot names.
    fn send(&self, dataset: DatasetHandle, from: Option<&str>, to: &str, flags: SendFlags, fd: RawFd) -> Status;
    /// `zfs_send_one`: `from` is a full snapshot or bookmark name.
    fn send_one(&self, dataset: DatasetHandle, from: Option<&str>, fd: RawFd, flags: LzcSendFlags) -> Status;
    fn receive(&self, target: &str, props: NvHandle, flags: RecvFlags, fd: RawFd) -> Status;
    /// Point the library's diagnostic output at `fd` until restored.
    fn redirect_diagnostics(&self, fd: RawFd) -> Status<Redirection>;
    fn restore_diagnostics(&self, saved: Redirection);
}

/// Everything a [`crate::Libzfs`] context needs.
pub trait Backend: ErrorState + NvBackend + PoolBackend + DatasetBackend + StreamBackend + Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;
}
