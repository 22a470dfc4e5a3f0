use std::{io, time::Duration};

use strum_macros::{AsRefStr, Display};

/// Codes libzfs reports through `libzfs_errno` (`zfs_error_t`).
pub mod codes {
    pub const EZFS_SUCCESS: i32 = 0;
    pub const EZFS_NOMEM: i32 = 2000;
    pub const EZFS_BADPROP: i32 = 2001;
    pub const EZFS_PROPREADONLY: i32 = 2002;
    pub const EZFS_PROPTYPE: i32 = 2003;
    pub const EZFS_PROPNONINHERIT: i32 = 2004;
    pub const EZFS_PROPSPACE: i32 = 2005;
    pub const EZFS_BADTYPE: i32 = 2006;
    pub const EZFS_BUSY: i32 = 2007;
    pub const EZFS_EXISTS: i32 = 2008;
    pub const EZFS_NOENT: i32 = 2009;
    pub const EZFS_BADSTREAM: i32 = 2010;
    pub const EZFS_DSREADONLY: i32 = 2011;
    pub const EZFS_INVALIDNAME: i32 = 2013;
    pub const EZFS_BADRESTORE: i32 = 2014;
    pub const EZFS_BADBACKUP: i32 = 2015;
    pub const EZFS_BADDEV: i32 = 2018;
    pub const EZFS_CROSSTARGET: i32 = 2025;
    pub const EZFS_MOUNTFAILED: i32 = 2027;
    pub const EZFS_UMOUNTFAILED: i32 = 2028;
    pub const EZFS_PERM: i32 = 2031;
    pub const EZFS_IO: i32 = 2034;
    pub const EZFS_INVALCONFIG: i32 = 2037;
    pub const EZFS_POOLPROPS: i32 = 2040;
    pub const EZFS_NOTSUP: i32 = 2056;
    pub const EZFS_PIPEFAILED: i32 = 2062;
    pub const EZFS_UNKNOWN: i32 = 2070;
}

use codes::*;

pub(crate) const MSG_DATASET_IS_NIL: &str = "Dataset handle not initialized or its closed";
pub(crate) const MSG_POOL_IS_NIL: &str = "Pool handle not initialized or its closed";

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        /// Operation on a handle that was never opened or was already closed.
        HandleClosed(msg: &'static str) {
            display("{}", msg)
        }
        /// libzfs reported a failure. `code` is `libzfs_errno` verbatim.
        Native { code: i32, message: String } {
            display("{}", message)
        }
        /// Higher level context on top of another error. Keeps the code of the cause.
        Wrapped { code: i32, message: String, cause: Box<Error> } {
            display("{}", message)
            cause(&**cause)
        }
        /// Property id outside of the namespace it was used with.
        InvalidProperty(msg: String) {
            display("{}", msg)
        }
        /// Device tree violates grouping rules.
        InvalidVdev(msg: String) {
            display("Invalid vdev specification: {}", msg)
        }
        /// Malformed dataset name.
        InvalidName(name: String) {
            display("Invalid dataset name: {}", name)
        }
        HasChildren { path: String, kind: String } {
            display("Cannot destroy dataset {}: {} has children", path, kind)
        }
        /// Method or flag combination not supported for this kind of dataset.
        Unsupported(msg: &'static str) {
            display("{}", msg)
        }
        PoolNotFound(name: String) {
            display("No pools to import found with name {}", name)
        }
        PoolListFailed {
            display("Failed to list pools")
        }
        /// Name/value list operation failed with errno.
        NvOpError(errno: i32) {
            display("nvlist operation failed: {}", io::Error::from_raw_os_error(*errno))
        }
        InitializationFailed(err: io::Error) {
            display("Failed to initialize libzfs: {}", err)
            cause(err)
        }
        /// Best-effort operation did not finish before its deadline.
        Timeout(deadline: Duration) {
            display("Operation timed out after {:?}", deadline)
        }
        /// Best-effort output could not be parsed.
        SizeParse(output: String) {
            display("Failed to parse size estimate from: {:?}", output)
        }
        Io(err: io::Error) {
            display("{}", err)
            cause(err)
            from()
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn native<M: Into<String>>(code: i32, message: M) -> Self {
        Error::Native { code, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::HandleClosed(_) => ErrorKind::HandleClosed,
            Error::Native { .. } => ErrorKind::Native,
            Error::Wrapped { cause, .. } => cause.kind(),
            Error::InvalidProperty(_) => ErrorKind::InvalidProperty,
            Error::InvalidVdev(_) => ErrorKind::InvalidVdev,
            Error::InvalidName(_) => ErrorKind::InvalidName,
            Error::HasChildren { .. } => ErrorKind::HasChildren,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::PoolNotFound(_) => ErrorKind::PoolNotFound,
            Error::PoolListFailed => ErrorKind::PoolListFailed,
            Error::NvOpError(_) => ErrorKind::NvOpError,
            Error::InitializationFailed(_) => ErrorKind::InitializationFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::SizeParse(_) => ErrorKind::SizeParse,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Numeric code of this error. Native errors carry the libzfs code, local errors get the closest
    /// `EZFS_*` code.
    pub fn code(&self) -> i32 {
        match self {
            Error::Native { code, .. } | Error::Wrapped { code, .. } => *code,
            Error::HandleClosed(_) => EZFS_NOENT,
            Error::InvalidProperty(_) => EZFS_BADPROP,
            Error::InvalidVdev(_) => EZFS_INVALCONFIG,
            Error::InvalidName(_) => EZFS_INVALIDNAME,
            Error::HasChildren { .. } => EZFS_EXISTS,
            Error::Unsupported(_) => EZFS_NOTSUP,
            Error::PoolNotFound(_) => EZFS_NOENT,
            Error::PoolListFailed => EZFS_UNKNOWN,
            Error::NvOpError(errno) if *errno == libc::ENOMEM => EZFS_NOMEM,
            Error::NvOpError(_) => EZFS_UNKNOWN,
            Error::InitializationFailed(_) => EZFS_UNKNOWN,
            Error::Timeout(_) | Error::SizeParse(_) => EZFS_UNKNOWN,
            Error::Io(_) => EZFS_IO,
        }
    }

    /// Replace the message, keep the code.
    pub fn wrap<M: Into<String>>(self, message: M) -> Self {
        Error::Wrapped { code: self.code(), message: message.into(), cause: Box::new(self) }
    }

    /// Append context to the message, keep the code.
    pub(crate) fn context(self, suffix: &str) -> Self {
        let message = format!("{}{}", self, suffix);
        self.wrap(message)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, AsRefStr)]
pub enum ErrorKind {
    HandleClosed,
    Native,
    InvalidProperty,
    InvalidVdev,
    InvalidName,
    HasChildren,
    Unsupported,
    PoolNotFound,
    PoolListFailed,
    NvOpError,
    InitializationFailed,
    Timeout,
    SizeParse,
    Io,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool { self.kind() == other.kind() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!("PoolListFailed", Error::PoolListFailed.kind().to_string());
        assert_eq!("HandleClosed", ErrorKind::HandleClosed.as_ref());
    }

    #[test]
    fn wrap_keeps_code_and_kind() {
        let err = Error::native(EZFS_NOENT, "dataset does not exist");
        let wrapped = err.wrap("dataset does not exist - tank/nope");
        assert_eq!(EZFS_NOENT, wrapped.code());
        assert_eq!(ErrorKind::Native, wrapped.kind());
        assert_eq!("dataset does not exist - tank/nope", wrapped.to_string());
    }

    #[test]
    fn context_appends() {
        let err = Error::native(EZFS_EXISTS, "pool already exists").context(" (zpool_create)");
        assert_eq!("pool already exists (zpool_create)", err.to_string());
        assert_eq!(EZFS_EXISTS, err.code());
    }

    #[test]
    fn local_errors_have_codes() {
        assert_eq!(EZFS_INVALCONFIG, Error::InvalidVdev(String::from("x")).code());
        assert_eq!(EZFS_NOMEM, Error::NvOpError(libc::ENOMEM).code());
        assert_eq!(EZFS_UNKNOWN, Error::NvOpError(libc::EINVAL).code());
        assert_eq!(
            "Dataset handle not initialized or its closed",
            Error::HandleClosed(MSG_DATASET_IS_NIL).to_string()
        );
    }

    #[test]
    fn has_children_message() {
        let err = Error::HasChildren { path: "tank/a".into(), kind: "filesystem".into() };
        assert_eq!("Cannot destroy dataset tank/a: filesystem has children", err.to_string());
    }

    #[test]
    fn eq_compares_kinds() {
        assert_eq!(Error::PoolNotFound("a".into()), Error::PoolNotFound("b".into()));
        assert_ne!(Error::PoolNotFound("a".into()), Error::PoolListFailed);
    }
}
