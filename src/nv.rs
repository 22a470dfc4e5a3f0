//! Owned name/value lists handed to libzfs.
//!
//! [`NvListGuard`] owns one native list and frees it when dropped, so a list that is only partially
//! built when something fails is released on the way out.
use crate::{errors::{Error, Result},
            native::{Backend, NvHandle}};

/// Value that can be added to a list under a name.
pub trait NvTypeOp {
    fn add_to_list(&self, list: &mut NvListGuard<'_>, name: &str) -> Result<()>;
}

macro_rules! impl_list_op {
    ($type_:ty, $method:ident, false) => {
        impl NvTypeOp for $type_ {
            fn add_to_list(&self, list: &mut NvListGuard<'_>, name: &str) -> Result<()> {
                list.$method(name, *self)
            }
        }
    };
    ($type_:ty, $method:ident, true) => {
        impl NvTypeOp for $type_ {
            fn add_to_list(&self, list: &mut NvListGuard<'_>, name: &str) -> Result<()> {
                list.$method(name, &*self)
            }
        }
    };
}

impl_list_op! {u64, insert_u64, false}
impl_list_op! {str, insert_string, true}
impl_list_op! {String, insert_string, true}

pub struct NvListGuard<'a> {
    backend: &'a dyn Backend,
    handle: NvHandle,
}

impl<'a> NvListGuard<'a> {
    pub fn new(backend: &'a dyn Backend) -> Result<Self> {
        let handle = backend.nvlist_alloc().map_err(Error::NvOpError)?;
        Ok(NvListGuard { backend, handle })
    }

    /// Build a list of string properties. Nothing is left allocated if any insert fails.
    pub fn from_pairs<I, K, V>(backend: &'a dyn Backend, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut list = Self::new(backend)?;
        for (name, value) in pairs {
            list.insert_string(name.as_ref(), value.as_ref())?;
        }
        Ok(list)
    }

    /// Same as `from_pairs`, but `None` when there is nothing to put in.
    pub fn from_pairs_opt<I, K, V>(backend: &'a dyn Backend, pairs: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs = pairs.into_iter().peekable();
        if pairs.peek().is_none() {
            return Ok(None);
        }
        Self::from_pairs(backend, pairs).map(Some)
    }

    /// Take ownership of a list the library allocated for us.
    pub(crate) fn adopt(backend: &'a dyn Backend, handle: NvHandle) -> Self { NvListGuard { backend, handle } }

    pub fn handle(&self) -> NvHandle { self.handle }

    pub fn insert<T: NvTypeOp + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        value.add_to_list(self, name)
    }

    pub fn insert_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.backend.nvlist_add_string(self.handle, name, value).map_err(Error::NvOpError)
    }

    pub fn insert_u64(&mut self, name: &str, value: u64) -> Result<()> {
        self.backend.nvlist_add_u64(self.handle, name, value).map_err(Error::NvOpError)
    }

    pub fn insert_nvlist(&mut self, name: &str, value: &NvListGuard<'_>) -> Result<()> {
        self.backend.nvlist_add_nvlist(self.handle, name, value.handle).map_err(Error::NvOpError)
    }

    pub fn insert_nvlists(&mut self, name: &str, values: &[NvListGuard<'_>]) -> Result<()> {
        let handles: Vec<NvHandle> = values.iter().map(NvListGuard::handle).collect();
        self.backend.nvlist_add_nvlist_array(self.handle, name, &handles).map_err(Error::NvOpError)
    }
}

impl<'a> Drop for NvListGuard<'a> {
    fn drop(&mut self) { self.backend.nvlist_free(self.handle); }
}

/// Handle of an optional list, for calls that take `NULL` when there is nothing to pass.
pub(crate) fn opt_handle(list: &Option<NvListGuard<'_>>) -> Option<NvHandle> {
    list.as_ref().map(NvListGuard::handle)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::memory::MemoryBackend;

    #[test]
    fn guard_frees_on_drop() {
        let backend = MemoryBackend::new();
        {
            let mut list = NvListGuard::new(&backend).unwrap();
            list.insert("type", "root").unwrap();
            list.insert("ashift", &12u64).unwrap();
            assert_eq!(1, backend.live_nvlists());
        }
        assert_eq!(0, backend.live_nvlists());
    }

    #[test]
    fn partial_build_is_released() {
        let backend = MemoryBackend::new();
        backend.fail_nvlist_add_after(2);
        let err = NvListGuard::from_pairs(&backend, vec![("a", "1"), ("b", "2"), ("c", "3")]);
        assert!(err.is_err());
        assert_eq!(0, backend.live_nvlists());
    }

    #[test]
    fn empty_pairs_are_none() {
        let backend = MemoryBackend::new();
        let none = NvListGuard::from_pairs_opt(&backend, Vec::<(String, String)>::new()).unwrap();
        assert!(none.is_none());
        assert_eq!(0, backend.total_nvlist_allocations());
    }
}
