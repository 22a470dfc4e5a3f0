use std::{fmt,
          sync::{Arc, Mutex, PoisonError}};

use slog::Logger;

use crate::{config::Config,
            errors::{codes::EZFS_UNKNOWN, Error, Result},
            native::{Backend, Failed, Status},
            GlobalLogger};

struct Inner {
    backend: Box<dyn Backend>,
    /// Serializes a native call together with the read of the error state it may have set.
    lock: Mutex<()>,
    logger: Logger,
    config: Config,
}

/// Library context. Cheap to clone, every pool and dataset keeps one.
///
/// All native calls that can set the library error state run through [`Libzfs::call`], which holds
/// a single lock from the call until the error has been read back. Dry-run sends for size
/// estimates are the exception, they run unlocked so a missed deadline leaves the context usable.
#[derive(Clone)]
pub struct Libzfs {
    inner: Arc<Inner>,
}

impl fmt::Debug for Libzfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Libzfs").field("backend", &self.inner.backend.name()).finish()
    }
}

impl Libzfs {
    /// Context over the given backend with configuration from the environment.
    pub fn with_backend<B: Backend + 'static>(backend: B) -> Self {
        Self::with_config(backend, Config::from_env())
    }

    pub fn with_config<B: Backend + 'static>(backend: B, config: Config) -> Self {
        let logger = GlobalLogger::get().new(o!("zfs_module" => "libzfs", "backend" => backend.name()));
        Libzfs {
            inner: Arc::new(Inner { backend: Box::new(backend), lock: Mutex::new(()), logger, config }),
        }
    }

    /// Process-wide context over the system libzfs. Initialized on first use, never torn down.
    #[cfg(feature = "native")]
    pub fn native() -> Result<Libzfs> {
        use once_cell::sync::OnceCell;
        static NATIVE: OnceCell<Libzfs> = OnceCell::new();

        NATIVE
            .get_or_try_init(|| crate::native::ffi::LibzfsBackend::new().map(Libzfs::with_backend))
            .map(Clone::clone)
    }

    pub fn config(&self) -> &Config { &self.inner.config }

    pub fn logger(&self) -> &Logger { &self.inner.logger }

    /// Error state of the last failed native call, `None` if it succeeded.
    pub fn last_error(&self) -> Option<Error> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_error()
    }

    /// Capture the current error state and reset it.
    pub fn clear_last_error(&self) -> Option<Error> {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.read_error();
        self.inner.backend.clear_error();
        previous
    }

    fn read_error(&self) -> Option<Error> {
        let backend = &self.inner.backend;
        match backend.errno() {
            0 => None,
            code => Some(Error::native(code, backend.error_description())),
        }
    }

    /// Run a native call and on failure read the error it left behind, without letting any other
    /// call in between.
    pub(crate) fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where F: FnOnce(&dyn Backend) -> Status<T> {
        self.call_or_else(op, || Error::native(EZFS_UNKNOWN, format!("{} failed", op)), f)
    }

    /// Same as `call`, with the error to report if the library didn't set one.
    pub(crate) fn call_or_else<T, F, E>(&self, op: &'static str, fallback: E, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Backend) -> Status<T>,
        E: FnOnce() -> Error,
    {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let status = f(self.inner.backend.as_ref());
        self.finish(op, status, fallback)
    }

    /// For calls that run behind a deadline. The native call itself runs without the lock, so a
    /// stalled call can't hold up anyone else; only the error read is serialized. A failure racing
    /// with another failing call may report that call's error.
    pub(crate) fn call_unlocked<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where F: FnOnce(&dyn Backend) -> Status<T> {
        let status = f(self.inner.backend.as_ref());
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.finish(op, status, || Error::native(EZFS_UNKNOWN, format!("{} failed", op)))
    }

    /// Caller holds the lock.
    fn finish<T, E>(&self, op: &'static str, status: Status<T>, fallback: E) -> Result<T>
    where E: FnOnce() -> Error {
        match status {
            Ok(value) => Ok(value),
            Err(Failed) => {
                let err = self.read_error().unwrap_or_else(fallback);
                debug!(self.inner.logger, "native call failed"; "op" => op, "code" => err.code(), "error" => %err);
                Err(err)
            },
        }
    }

    /// Calls that can't fail or whose failure isn't reported through the error state.
    pub(crate) fn with<T, F>(&self, f: F) -> T
    where F: FnOnce(&dyn Backend) -> T {
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        f(self.inner.backend.as_ref())
    }

    /// Direct access for name/value list building, which doesn't touch the error state.
    pub(crate) fn backend(&self) -> &dyn Backend { self.inner.backend.as_ref() }
}

/// Lifecycle of a native handle owned by a pool or dataset.
pub(crate) enum Handle<T> {
    Unopened,
    Open { zfs: Libzfs, raw: T },
    Closed,
}

impl<T> Default for Handle<T> {
    fn default() -> Self { Handle::Unopened }
}

impl<T: Copy> Handle<T> {
    pub(crate) fn open(zfs: &Libzfs, raw: T) -> Self { Handle::Open { zfs: zfs.clone(), raw } }

    /// Context and raw handle, or `HandleClosed` with `msg`.
    pub(crate) fn get(&self, msg: &'static str) -> Result<(Libzfs, T)> {
        match self {
            Handle::Open { zfs, raw } => Ok((zfs.clone(), *raw)),
            Handle::Unopened | Handle::Closed => Err(Error::HandleClosed(msg)),
        }
    }

    /// Move to `Closed`, returning what has to be released. Only the first call gets anything back.
    pub(crate) fn take(&mut self) -> Option<(Libzfs, T)> {
        match std::mem::replace(self, Handle::Closed) {
            Handle::Open { zfs, raw } => Some((zfs, raw)),
            Handle::Unopened => {
                *self = Handle::Unopened;
                None
            },
            Handle::Closed => None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        match self {
            Handle::Open { .. } => true,
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Unopened => f.write_str("Unopened"),
            Handle::Open { raw, .. } => write!(f, "Open({:?})", raw),
            Handle::Closed => f.write_str("Closed"),
        }
    }
}
