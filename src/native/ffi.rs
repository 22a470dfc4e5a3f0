//! Backend over the system `libzfs` and `libnvpair`.
//!
//! libzfs declarations follow the ZFS on Linux 0.7 headers. Name/value lists the crate builds are
//! owned by `libnv`; lists handed out by libzfs are read through `nvpair-sys`. Handles are raw
//! pointers carried as `usize`.
#![allow(non_camel_case_types)]

use std::{collections::HashMap,
          ffi::CStr,
          os::{raw::{c_char, c_int, c_uint, c_void},
               unix::io::RawFd},
          path::PathBuf,
          ptr,
          sync::{Mutex, MutexGuard, PoisonError}};

use cstr_argument::CStrArgument;
use libnv::{nvpair::NvList, NvError};
use nvpair_sys as nv;
use zfs_core_sys as sys;

use super::{Backend, DatasetBackend, DatasetHandle, ErrorState, Failed, NvBackend, NvHandle, NvStatus, PoolBackend,
            PoolHandle, Redirection, Status, StreamBackend};
use crate::{errors::{codes::{EZFS_INVALIDNAME, EZFS_NOMEM, EZFS_PIPEFAILED, EZFS_SUCCESS},
                     Error, Result},
            property::{Property, PropertySource},
            zfs::{DatasetProp, DatasetType, LzcSendFlags, RecvFlags, SendFlags},
            zpool::{PoolProp, PoolState, PoolStatus}};

#[repr(C)]
pub struct libzfs_handle_t {
    _private: [u8; 0],
}

#[repr(C)]
pub struct zpool_handle_t {
    _private: [u8; 0],
}

#[repr(C)]
pub struct zfs_handle_t {
    _private: [u8; 0],
}

type boolean_t = c_int;
type zpool_iter_f = extern "C" fn(*mut zpool_handle_t, *mut c_void) -> c_int;
type zfs_iter_f = extern "C" fn(*mut zfs_handle_t, *mut c_void) -> c_int;

/// `ZFS_MAXPROPLEN`
const PROP_BUF_LEN: usize = 4096;
const ZPROP_VALUE: &str = "value";
const ZPROP_SOURCE: &str = "source";

/// `sendflags_t`, field order matters.
#[repr(C)]
#[derive(Default)]
struct sendflags_t {
    verbose: boolean_t,
    replicate: boolean_t,
    doall: boolean_t,
    fromorigin: boolean_t,
    dedup: boolean_t,
    props: boolean_t,
    dryrun: boolean_t,
    parsable: boolean_t,
    progress: boolean_t,
    largeblock: boolean_t,
    embed_data: boolean_t,
    compress: boolean_t,
}

/// `recvflags_t`, field order matters.
#[repr(C)]
#[derive(Default)]
struct recvflags_t {
    verbose: boolean_t,
    isprefix: boolean_t,
    istail: boolean_t,
    dryrun: boolean_t,
    force: boolean_t,
    canmountoff: boolean_t,
    resumable: boolean_t,
    byteswap: boolean_t,
    nomount: boolean_t,
}

type nvlist_t = nv::nvlist;

#[link(name = "zfs")]
extern "C" {
    fn libzfs_init() -> *mut libzfs_handle_t;
    fn libzfs_errno(hdl: *mut libzfs_handle_t) -> c_int;
    fn libzfs_error_description(hdl: *mut libzfs_handle_t) -> *const c_char;
    fn zfs_standard_error(hdl: *mut libzfs_handle_t, error: c_int, msg: *const c_char) -> c_int;
    fn zfs_error(hdl: *mut libzfs_handle_t, error: c_int, msg: *const c_char) -> c_int;

    fn zpool_open(hdl: *mut libzfs_handle_t, name: *const c_char) -> *mut zpool_handle_t;
    fn zpool_iter(hdl: *mut libzfs_handle_t, func: zpool_iter_f, data: *mut c_void) -> c_int;
    fn zpool_close(zhp: *mut zpool_handle_t);
    fn zpool_get_name(zhp: *mut zpool_handle_t) -> *const c_char;
    fn zpool_get_state(zhp: *mut zpool_handle_t) -> c_int;
    fn zpool_get_status(zhp: *mut zpool_handle_t, msgid: *mut *mut c_char, errata: *mut c_int) -> c_int;
    fn zpool_get_prop(
        zhp: *mut zpool_handle_t,
        prop: c_int,
        buf: *mut c_char,
        len: usize,
        source: *mut c_uint,
        literal: boolean_t,
    ) -> c_int;
    fn zpool_set_prop(zhp: *mut zpool_handle_t, name: *const c_char, value: *const c_char) -> c_int;
    fn zpool_prop_get_feature(zhp: *mut zpool_handle_t, name: *const c_char, buf: *mut c_char, len: usize) -> c_int;
    fn zpool_create(
        hdl: *mut libzfs_handle_t,
        name: *const c_char,
        nvroot: *mut nvlist_t,
        props: *mut nvlist_t,
        fsprops: *mut nvlist_t,
    ) -> c_int;
    fn zpool_destroy(zhp: *mut zpool_handle_t, log: *const c_char) -> c_int;
    fn zpool_export(zhp: *mut zpool_handle_t, force: boolean_t, log: *const c_char) -> c_int;
    fn zpool_export_force(zhp: *mut zpool_handle_t, log: *const c_char) -> c_int;
    fn zpool_find_import(hdl: *mut libzfs_handle_t, argc: c_int, argv: *mut *mut c_char) -> *mut nvlist_t;
    fn zpool_import(
        hdl: *mut libzfs_handle_t,
        config: *mut nvlist_t,
        newname: *const c_char,
        altroot: *mut c_char,
    ) -> c_int;

    fn zfs_open(hdl: *mut libzfs_handle_t, path: *const c_char, types: c_int) -> *mut zfs_handle_t;
    fn zfs_iter_root(hdl: *mut libzfs_handle_t, func: zfs_iter_f, data: *mut c_void) -> c_int;
    fn zfs_iter_children(zhp: *mut zfs_handle_t, func: zfs_iter_f, data: *mut c_void) -> c_int;
    fn zfs_close(zhp: *mut zfs_handle_t);
    fn zfs_get_type(zhp: *const zfs_handle_t) -> c_int;
    fn zfs_get_name(zhp: *const zfs_handle_t) -> *const c_char;
    fn zfs_get_pool_name(zhp: *const zfs_handle_t) -> *const c_char;
    fn zfs_prop_get(
        zhp: *mut zfs_handle_t,
        prop: c_int,
        buf: *mut c_char,
        len: usize,
        source: *mut c_uint,
        statbuf: *mut c_char,
        statlen: usize,
        literal: boolean_t,
    ) -> c_int;
    fn zfs_get_user_props(zhp: *mut zfs_handle_t) -> *mut nvlist_t;
    fn zfs_prop_set(zhp: *mut zfs_handle_t, name: *const c_char, value: *const c_char) -> c_int;
    fn zfs_create(hdl: *mut libzfs_handle_t, path: *const c_char, kind: c_int, props: *mut nvlist_t) -> c_int;
    fn zfs_destroy(zhp: *mut zfs_handle_t, defer: boolean_t) -> c_int;
    fn zfs_clone(zhp: *mut zfs_handle_t, target: *const c_char, props: *mut nvlist_t) -> c_int;
    fn zfs_snapshot(hdl: *mut libzfs_handle_t, path: *const c_char, recursive: boolean_t, props: *mut nvlist_t)
        -> c_int;
    fn zfs_rollback(zhp: *mut zfs_handle_t, snap: *mut zfs_handle_t, force: boolean_t) -> c_int;
    fn zfs_promote(zhp: *mut zfs_handle_t) -> c_int;
    fn zfs_rename(zhp: *mut zfs_handle_t, target: *const c_char, recursive: boolean_t, force_unmount: boolean_t)
        -> c_int;
    fn zfs_is_mounted(zhp: *mut zfs_handle_t, mountpoint: *mut *mut c_char) -> boolean_t;
    fn zfs_mount(zhp: *mut zfs_handle_t, options: *const c_char, flags: c_int) -> c_int;
    fn zfs_unmount(zhp: *mut zfs_handle_t, mountpoint: *const c_char, flags: c_int) -> c_int;

    fn zfs_send(
        zhp: *mut zfs_handle_t,
        fromsnap: *const c_char,
        tosnap: *const c_char,
        flags: *mut sendflags_t,
        fd: c_int,
        filter: *mut c_void,
        cb_arg: *mut c_void,
        debugnv: *mut *mut nvlist_t,
    ) -> c_int;
    fn zfs_send_one(zhp: *mut zfs_handle_t, from: *const c_char, fd: c_int, flags: c_uint) -> c_int;
    fn zfs_receive(
        hdl: *mut libzfs_handle_t,
        tosnap: *const c_char,
        props: *mut nvlist_t,
        flags: *mut recvflags_t,
        fd: c_int,
        stream_avl: *mut c_void,
    ) -> c_int;
}

fn b(value: bool) -> boolean_t { value as boolean_t }

/// Copy of a C string owned by the library, empty for `NULL`.
unsafe fn owned(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or_else(|| buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn pool_ptr(pool: PoolHandle) -> *mut zpool_handle_t { pool.0 as *mut zpool_handle_t }

fn dataset_ptr(dataset: DatasetHandle) -> *mut zfs_handle_t { dataset.0 as *mut zfs_handle_t }

fn nv_ptr(list: NvHandle) -> *mut nvlist_t { list.0 as *mut nvlist_t }

fn opt_nv_ptr(list: Option<NvHandle>) -> *mut nvlist_t { list.map_or(ptr::null_mut(), nv_ptr) }

fn status(ret: c_int) -> Status {
    if ret == 0 {
        Ok(())
    } else {
        Err(Failed)
    }
}

fn nv_status(ret: c_int) -> NvStatus {
    if ret == 0 {
        Ok(())
    } else {
        Err(ret)
    }
}

extern "C" fn collect_pool(zhp: *mut zpool_handle_t, data: *mut c_void) -> c_int {
    let out = unsafe { &mut *(data as *mut Vec<PoolHandle>) };
    out.push(PoolHandle(zhp as usize));
    0
}

extern "C" fn collect_dataset(zhp: *mut zfs_handle_t, data: *mut c_void) -> c_int {
    let out = unsafe { &mut *(data as *mut Vec<DatasetHandle>) };
    out.push(DatasetHandle(zhp as usize));
    0
}

/// The system libzfs. There is one library handle per process and it is never released.
pub struct LibzfsBackend {
    hdl: *mut libzfs_handle_t,
    /// Lists allocated through `nvlist_alloc`, keyed by their address.
    lists: Mutex<HashMap<usize, NvList>>,
}

// Every call that touches shared library state is serialized by `Libzfs`.
unsafe impl Send for LibzfsBackend {}
unsafe impl Sync for LibzfsBackend {}

impl LibzfsBackend {
    pub fn new() -> Result<Self> {
        let errno = unsafe { sys::libzfs_core_init() };
        if errno != 0 {
            return Err(Error::InitializationFailed(std::io::Error::from_raw_os_error(errno)));
        }
        let hdl = unsafe { libzfs_init() };
        if hdl.is_null() {
            return Err(Error::InitializationFailed(std::io::Error::last_os_error()));
        }
        Ok(LibzfsBackend { hdl, lists: Mutex::new(HashMap::new()) })
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<usize, NvList>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure detected before calling into the library.
    fn fail<T>(&self, code: c_int, msg: &str) -> Status<T> {
        let msg = msg.replace('\0', "");
        let msg = msg.as_str().into_cstr();
        unsafe { zfs_error(self.hdl, code, msg.as_ref().as_ptr()) };
        Err(Failed)
    }

    /// C copy of `value`, or a recorded failure if it has an interior NUL.
    fn c<'a>(&self, value: &'a str) -> Status<<&'a str as CStrArgument>::Output> {
        match value.try_into_cstr() {
            Ok(value) => Ok(value),
            Err(_) => self.fail(EZFS_INVALIDNAME, &format!("invalid name '{}'", value)),
        }
    }
}

fn nv_c(value: &str) -> NvStatus<<&str as CStrArgument>::Output> { value.try_into_cstr().map_err(|_| libc::EINVAL) }

fn nv_errno(err: NvError) -> i32 {
    match err {
        NvError::NativeError(code) => code,
        _ => libc::EINVAL,
    }
}

impl ErrorState for LibzfsBackend {
    fn errno(&self) -> i32 { unsafe { libzfs_errno(self.hdl) } }

    fn error_description(&self) -> String { unsafe { owned(libzfs_error_description(self.hdl)) } }

    fn clear_error(&self) {
        let msg = "success".into_cstr();
        unsafe { zfs_standard_error(self.hdl, EZFS_SUCCESS, msg.as_ref().as_ptr()) };
    }
}

impl NvBackend for LibzfsBackend {
    fn nvlist_alloc(&self) -> NvStatus<NvHandle> {
        let list = NvList::new().map_err(nv_errno)?;
        let handle = list.as_ptr() as usize;
        if handle == 0 {
            return Err(libc::ENOMEM);
        }
        self.lists().insert(handle, list);
        Ok(NvHandle(handle))
    }

    /// Lists returned by libzfs aren't in the table and are freed directly.
    fn nvlist_free(&self, list: NvHandle) {
        if self.lists().remove(&list.0).is_none() {
            unsafe { nv::nvlist_free(nv_ptr(list)) }
        }
    }

    fn nvlist_add_string(&self, list: NvHandle, name: &str, value: &str) -> NvStatus {
        let mut lists = self.lists();
        let target = lists.get_mut(&list.0).ok_or(libc::EINVAL)?;
        target.insert_string(name, value).map_err(nv_errno)
    }

    fn nvlist_add_u64(&self, list: NvHandle, name: &str, value: u64) -> NvStatus {
        let mut lists = self.lists();
        let target = lists.get_mut(&list.0).ok_or(libc::EINVAL)?;
        target.insert_u64(name, value).map_err(nv_errno)
    }

    /// `value` is copied into `list`, the caller still frees it.
    fn nvlist_add_nvlist(&self, list: NvHandle, name: &str, value: NvHandle) -> NvStatus {
        if list == value {
            return Err(libc::EINVAL);
        }
        let mut lists = self.lists();
        let nested = lists.remove(&value.0).ok_or(libc::EINVAL)?;
        let result = match lists.get_mut(&list.0) {
            Some(target) => target.insert_nvlist(name, &nested).map_err(nv_errno),
            None => Err(libc::EINVAL),
        };
        lists.insert(value.0, nested);
        result
    }

    fn nvlist_add_nvlist_array(&self, list: NvHandle, name: &str, values: &[NvHandle]) -> NvStatus {
        let name = nv_c(name)?;
        let mut ptrs: Vec<*mut nvlist_t> = values.iter().map(|value| nv_ptr(*value)).collect();
        nv_status(unsafe {
            nv::nvlist_add_nvlist_array(nv_ptr(list), name.as_ref().as_ptr(), ptrs.as_mut_ptr() as _, ptrs.len() as _)
        })
    }

    fn nvlist_lookup_string(&self, list: NvHandle, name: &str) -> NvStatus<String> {
        let name = nv_c(name)?;
        let mut value: *mut c_char = ptr::null_mut();
        nv_status(unsafe {
            nv::nvlist_lookup_string(nv_ptr(list), name.as_ref().as_ptr(), &mut value as *mut *mut c_char as _)
        })?;
        Ok(unsafe { owned(value) })
    }

    fn nvlist_nested(&self, list: NvHandle) -> NvStatus<Vec<(String, NvHandle)>> {
        let mut nested = Vec::new();
        let mut pair = unsafe { nv::nvlist_next_nvpair(nv_ptr(list), ptr::null_mut()) };
        while !pair.is_null() {
            if unsafe { nv::nvpair_type(pair) } == nv::data_type_t::DATA_TYPE_NVLIST {
                let mut value: *mut nvlist_t = ptr::null_mut();
                nv_status(unsafe { nv::nvpair_value_nvlist(pair, &mut value) })?;
                nested.push((unsafe { owned(nv::nvpair_name(pair)) }, NvHandle(value as usize)));
            }
            pair = unsafe { nv::nvlist_next_nvpair(nv_ptr(list), pair) };
        }
        Ok(nested)
    }
}

impl PoolBackend for LibzfsBackend {
    fn pool_open(&self, name: &str) -> Status<PoolHandle> {
        let name = self.c(name)?;
        let zhp = unsafe { zpool_open(self.hdl, name.as_ref().as_ptr()) };
        if zhp.is_null() {
            return Err(Failed);
        }
        Ok(PoolHandle(zhp as usize))
    }

    fn pool_iter(&self) -> Status<Vec<PoolHandle>> {
        let mut pools: Vec<PoolHandle> = Vec::new();
        let ret = unsafe { zpool_iter(self.hdl, collect_pool, &mut pools as *mut Vec<PoolHandle> as *mut c_void) };
        if ret != 0 {
            for pool in pools {
                self.pool_close(pool);
            }
            return Err(Failed);
        }
        Ok(pools)
    }

    fn pool_close(&self, pool: PoolHandle) { unsafe { zpool_close(pool_ptr(pool)) } }

    fn pool_name(&self, pool: PoolHandle) -> String { unsafe { owned(zpool_get_name(pool_ptr(pool))) } }

    fn pool_state(&self, pool: PoolHandle) -> PoolState {
        PoolState::from_raw(unsafe { zpool_get_state(pool_ptr(pool)) } as u64)
    }

    fn pool_status(&self, pool: PoolHandle) -> PoolStatus {
        let mut msgid: *mut c_char = ptr::null_mut();
        let mut errata: c_int = 0;
        PoolStatus::from_raw(unsafe { zpool_get_status(pool_ptr(pool), &mut msgid, &mut errata) })
    }

    fn pool_get_prop(&self, pool: PoolHandle, prop: PoolProp) -> Status<Property> {
        let mut buf = vec![0u8; PROP_BUF_LEN];
        let mut source: c_uint = 0;
        status(unsafe {
            zpool_get_prop(pool_ptr(pool), prop.id(), buf.as_mut_ptr() as *mut c_char, buf.len(), &mut source, b(true))
        })?;
        Ok(Property::new(buf_to_string(&buf), PropertySource::from_native(source, "")))
    }

    fn pool_set_prop(&self, pool: PoolHandle, name: &str, value: &str) -> Status {
        let (name, value) = (self.c(name)?, self.c(value)?);
        status(unsafe { zpool_set_prop(pool_ptr(pool), name.as_ref().as_ptr(), value.as_ref().as_ptr()) })
    }

    fn pool_get_feature(&self, pool: PoolHandle, name: &str) -> Status<String> {
        let name = self.c(name)?;
        let mut buf = vec![0u8; PROP_BUF_LEN];
        status(unsafe {
            zpool_prop_get_feature(pool_ptr(pool), name.as_ref().as_ptr(), buf.as_mut_ptr() as *mut c_char, buf.len())
        })?;
        Ok(buf_to_string(&buf))
    }

    fn pool_create(&self, name: &str, root: NvHandle, props: Option<NvHandle>, fs_props: Option<NvHandle>) -> Status {
        let name = self.c(name)?;
        status(unsafe {
            zpool_create(self.hdl, name.as_ref().as_ptr(), nv_ptr(root), opt_nv_ptr(props), opt_nv_ptr(fs_props))
        })
    }

    fn pool_destroy(&self, pool: PoolHandle, log: &str) -> Status {
        let log = self.c(log)?;
        status(unsafe { zpool_destroy(pool_ptr(pool), log.as_ref().as_ptr()) })
    }

    fn pool_export(&self, pool: PoolHandle, force: bool, log: &str) -> Status {
        let log = self.c(log)?;
        status(unsafe { zpool_export(pool_ptr(pool), b(force), log.as_ref().as_ptr()) })
    }

    fn pool_export_force(&self, pool: PoolHandle, log: &str) -> Status {
        let log = self.c(log)?;
        status(unsafe { zpool_export_force(pool_ptr(pool), log.as_ref().as_ptr()) })
    }

    fn pool_find_import(&self, dirs: &[PathBuf]) -> Status<NvHandle> {
        let dirs = dirs
            .iter()
            .map(|dir| self.c(&dir.to_string_lossy()).map(|dir| dir.as_ref().to_owned()))
            .collect::<Status<Vec<_>>>()?;
        let mut argv: Vec<*mut c_char> = dirs.iter().map(|dir| dir.as_ptr() as *mut c_char).collect();
        let found = unsafe { zpool_find_import(self.hdl, argv.len() as c_int, argv.as_mut_ptr()) };
        if found.is_null() {
            return Err(Failed);
        }
        Ok(NvHandle(found as usize))
    }

    fn pool_import(&self, config: NvHandle, name: &str) -> Status {
        let name = self.c(name)?;
        status(unsafe { zpool_import(self.hdl, nv_ptr(config), name.as_ref().as_ptr(), ptr::null_mut()) })
    }
}

impl DatasetBackend for LibzfsBackend {
    fn dataset_open(&self, path: &str) -> Status<DatasetHandle> {
        let path = self.c(path)?;
        let zhp = unsafe { zfs_open(self.hdl, path.as_ref().as_ptr(), 0xF) };
        if zhp.is_null() {
            return Err(Failed);
        }
        Ok(DatasetHandle(zhp as usize))
    }

    fn dataset_iter_root(&self) -> Status<Vec<DatasetHandle>> {
        let mut datasets: Vec<DatasetHandle> = Vec::new();
        let data = &mut datasets as *mut Vec<DatasetHandle> as *mut c_void;
        if unsafe { zfs_iter_root(self.hdl, collect_dataset, data) } != 0 {
            for dataset in datasets {
                self.dataset_close(dataset);
            }
            return Err(Failed);
        }
        Ok(datasets)
    }

    fn dataset_iter_children(&self, dataset: DatasetHandle) -> Status<Vec<DatasetHandle>> {
        let mut datasets: Vec<DatasetHandle> = Vec::new();
        let data = &mut datasets as *mut Vec<DatasetHandle> as *mut c_void;
        if unsafe { zfs_iter_children(dataset_ptr(dataset), collect_dataset, data) } != 0 {
            for child in datasets {
                self.dataset_close(child);
            }
            return Err(Failed);
        }
        Ok(datasets)
    }

    fn dataset_close(&self, dataset: DatasetHandle) { unsafe { zfs_close(dataset_ptr(dataset)) } }

    fn dataset_type(&self, dataset: DatasetHandle) -> DatasetType {
        DatasetType::from_bits_truncate(unsafe { zfs_get_type(dataset_ptr(dataset)) })
    }

    fn dataset_name(&self, dataset: DatasetHandle) -> String { unsafe { owned(zfs_get_name(dataset_ptr(dataset))) } }

    fn dataset_pool_name(&self, dataset: DatasetHandle) -> String {
        unsafe { owned(zfs_get_pool_name(dataset_ptr(dataset))) }
    }

    fn dataset_get_prop(&self, dataset: DatasetHandle, prop: DatasetProp) -> Status<Property> {
        let mut buf = vec![0u8; PROP_BUF_LEN];
        let mut statbuf = vec![0u8; PROP_BUF_LEN];
        let mut source: c_uint = 0;
        status(unsafe {
            zfs_prop_get(
                dataset_ptr(dataset),
                prop.id(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
                &mut source,
                statbuf.as_mut_ptr() as *mut c_char,
                statbuf.len(),
                b(true),
            )
        })?;
        Ok(Property::new(buf_to_string(&buf), PropertySource::from_native(source, &buf_to_string(&statbuf))))
    }

    fn dataset_get_user_prop(&self, dataset: DatasetHandle, name: &str) -> Status<Option<(String, String)>> {
        let name = self.c(name)?;
        let props = unsafe { zfs_get_user_props(dataset_ptr(dataset)) };
        let mut entry: *mut nvlist_t = ptr::null_mut();
        if props.is_null() || unsafe { nv::nvlist_lookup_nvlist(props, name.as_ref().as_ptr(), &mut entry) } != 0 {
            return Ok(None);
        }
        let value = self.nvlist_lookup_string(NvHandle(entry as usize), ZPROP_VALUE);
        let source = self.nvlist_lookup_string(NvHandle(entry as usize), ZPROP_SOURCE);
        match (value, source) {
            (Ok(value), Ok(source)) => Ok(Some((value, source))),
            _ => self.fail(EZFS_NOMEM, "malformed user property"),
        }
    }

    fn dataset_set_prop(&self, dataset: DatasetHandle, name: &str, value: &str) -> Status {
        let (name, value) = (self.c(name)?, self.c(value)?);
        status(unsafe { zfs_prop_set(dataset_ptr(dataset), name.as_ref().as_ptr(), value.as_ref().as_ptr()) })
    }

    fn dataset_create(&self, path: &str, kind: DatasetType, props: Option<NvHandle>) -> Status {
        let path = self.c(path)?;
        status(unsafe { zfs_create(self.hdl, path.as_ref().as_ptr(), kind.bits(), opt_nv_ptr(props)) })
    }

    fn dataset_destroy(&self, dataset: DatasetHandle, defer: bool) -> Status {
        status(unsafe { zfs_destroy(dataset_ptr(dataset), b(defer)) })
    }

    fn dataset_clone(&self, snapshot: DatasetHandle, target: &str, props: Option<NvHandle>) -> Status {
        let target = self.c(target)?;
        status(unsafe { zfs_clone(dataset_ptr(snapshot), target.as_ref().as_ptr(), opt_nv_ptr(props)) })
    }

    fn dataset_snapshot(&self, path: &str, recursive: bool, props: Option<NvHandle>) -> Status {
        let path = self.c(path)?;
        status(unsafe { zfs_snapshot(self.hdl, path.as_ref().as_ptr(), b(recursive), opt_nv_ptr(props)) })
    }

    fn dataset_rollback(&self, dataset: DatasetHandle, snapshot: DatasetHandle, force: bool) -> Status {
        status(unsafe { zfs_rollback(dataset_ptr(dataset), dataset_ptr(snapshot), b(force)) })
    }

    fn dataset_promote(&self, dataset: DatasetHandle) -> Status { status(unsafe { zfs_promote(dataset_ptr(dataset)) }) }

    fn dataset_rename(&self, dataset: DatasetHandle, target: &str, recursive: bool, force_unmount: bool) -> Status {
        let target = self.c(target)?;
        status(unsafe { zfs_rename(dataset_ptr(dataset), target.as_ref().as_ptr(), b(recursive), b(force_unmount)) })
    }

    fn dataset_is_mounted(&self, dataset: DatasetHandle) -> Option<String> {
        let mut mountpoint: *mut c_char = ptr::null_mut();
        if unsafe { zfs_is_mounted(dataset_ptr(dataset), &mut mountpoint) } == 0 {
            return None;
        }
        let path = unsafe { owned(mountpoint) };
        if !mountpoint.is_null() {
            unsafe { libc::free(mountpoint as *mut c_void) };
        }
        Some(path)
    }

    fn dataset_mount(&self, dataset: DatasetHandle, options: &str, flags: i32) -> Status {
        let options = self.c(options)?;
        status(unsafe { zfs_mount(dataset_ptr(dataset), options.as_ref().as_ptr(), flags) })
    }

    fn dataset_unmount(&self, dataset: DatasetHandle, flags: i32) -> Status {
        status(unsafe { zfs_unmount(dataset_ptr(dataset), ptr::null(), flags) })
    }
}

impl StreamBackend for LibzfsBackend {
    fn send(&self, dataset: DatasetHandle, from: Option<&str>, to: &str, flags: SendFlags, fd: RawFd) -> Status {
        let from = from.map(|from| self.c(from)).transpose()?;
        let to = self.c(to)?;
        let mut cflags = sendflags_t {
            verbose: b(flags.contains(SendFlags::VERBOSE)),
            replicate: b(flags.contains(SendFlags::REPLICATE)),
            doall: b(flags.contains(SendFlags::DO_ALL)),
            fromorigin: b(flags.contains(SendFlags::FROM_ORIGIN)),
            dedup: b(flags.contains(SendFlags::DEDUP)),
            props: b(flags.contains(SendFlags::PROPS)),
            dryrun: b(flags.contains(SendFlags::DRY_RUN)),
            parsable: b(flags.contains(SendFlags::PARSABLE)),
            progress: b(flags.contains(SendFlags::PROGRESS)),
            largeblock: b(flags.contains(SendFlags::LARGE_BLOCK)),
            embed_data: b(flags.contains(SendFlags::EMBED_DATA)),
            compress: b(flags.contains(SendFlags::COMPRESS)),
        };
        let from_ptr = from.as_ref().map_or(ptr::null(), |from| from.as_ref().as_ptr());
        status(unsafe {
            zfs_send(
                dataset_ptr(dataset),
                from_ptr,
                to.as_ref().as_ptr(),
                &mut cflags,
                fd,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        })
    }

    fn send_one(&self, dataset: DatasetHandle, from: Option<&str>, fd: RawFd, flags: LzcSendFlags) -> Status {
        let from = from.map(|from| self.c(from)).transpose()?;
        let from_ptr = from.as_ref().map_or(ptr::null(), |from| from.as_ref().as_ptr());
        status(unsafe { zfs_send_one(dataset_ptr(dataset), from_ptr, fd, flags.bits()) })
    }

    fn receive(&self, target: &str, props: NvHandle, flags: RecvFlags, fd: RawFd) -> Status {
        let target = self.c(target)?;
        let mut cflags = recvflags_t {
            verbose: b(flags.contains(RecvFlags::VERBOSE)),
            isprefix: b(flags.contains(RecvFlags::IS_PREFIX)),
            istail: b(flags.contains(RecvFlags::IS_TAIL)),
            dryrun: b(flags.contains(RecvFlags::DRY_RUN)),
            force: b(flags.contains(RecvFlags::FORCE)),
            canmountoff: b(flags.contains(RecvFlags::CAN_MOUNT_OFF)),
            resumable: b(flags.contains(RecvFlags::RESUMABLE)),
            byteswap: b(flags.contains(RecvFlags::BYTE_SWAP)),
            nomount: b(flags.contains(RecvFlags::NO_MOUNT)),
        };
        status(unsafe { zfs_receive(self.hdl, target.as_ref().as_ptr(), nv_ptr(props), &mut cflags, fd, ptr::null_mut()) })
    }

    /// libzfs prints dry-run results on stdout, so stdout itself is pointed at `fd`.
    fn redirect_diagnostics(&self, fd: RawFd) -> Status<Redirection> {
        unsafe {
            libc::fflush(ptr::null_mut());
            let saved = libc::dup(libc::STDOUT_FILENO);
            if saved < 0 {
                return self.fail(EZFS_PIPEFAILED, "Redirection of libzfs stdout failed");
            }
            if libc::dup2(fd, libc::STDOUT_FILENO) < 0 {
                libc::close(saved);
                return self.fail(EZFS_PIPEFAILED, "Redirection of libzfs stdout failed");
            }
            Ok(Redirection(saved))
        }
    }

    fn restore_diagnostics(&self, saved: Redirection) {
        unsafe {
            libc::fflush(ptr::null_mut());
            libc::dup2(saved.0, libc::STDOUT_FILENO);
            libc::close(saved.0);
        }
    }
}

impl Backend for LibzfsBackend {
    fn name(&self) -> &'static str { "libzfs" }
}
