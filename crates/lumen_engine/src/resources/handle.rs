//! Borrowed-or-shared resource handles

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A resource that is either borrowed for the program's lifetime or shared
/// through reference counting. Both forms read identically through `Deref`.
pub enum ResourceHandle<T: ?Sized + 'static> {
    /// Resource owned elsewhere for the whole program
    Static(&'static T),
    /// Reference-counted resource
    Shared(Arc<T>),
}

impl<T: ?Sized> ResourceHandle<T> {
    /// Whether this handle keeps the resource alive
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Whether two handles refer to the same resource
    pub fn ptr_eq(&self, other: &Self) -> bool {
        let a: *const T = &**self;
        let b: *const T = &**other;
        std::ptr::eq(a.cast::<()>(), b.cast::<()>())
    }
}

impl<T: ?Sized> Deref for ResourceHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Static(resource) => resource,
            Self::Shared(resource) => resource,
        }
    }
}

impl<T: ?Sized> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(resource) => Self::Static(*resource),
            Self::Shared(resource) => Self::Shared(Arc::clone(resource)),
        }
    }
}

impl<T: ?Sized> From<Arc<T>> for ResourceHandle<T> {
    fn from(resource: Arc<T>) -> Self {
        Self::Shared(resource)
    }
}

impl<T: ?Sized> From<&'static T> for ResourceHandle<T> {
    fn from(resource: &'static T) -> Self {
        Self::Static(resource)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(resource) => f.debug_tuple("Static").field(&resource).finish(),
            Self::Shared(resource) => f.debug_tuple("Shared").field(&resource).finish(),
        }
    }
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for meshes and materials; 0 is never returned
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    static CONSTANT: u32 = 7;

    #[test]
    fn test_static_and_shared_read_the_same() {
        let borrowed: ResourceHandle<u32> = ResourceHandle::from(&CONSTANT);
        let shared: ResourceHandle<u32> = ResourceHandle::from(Arc::new(7));
        assert_eq!(*borrowed, *shared);
        assert!(!borrowed.is_shared());
        assert!(shared.is_shared());
    }

    #[test]
    fn test_ptr_eq_follows_identity() {
        let resource = Arc::new(String::from("mesh"));
        let a = ResourceHandle::Shared(Arc::clone(&resource));
        let b = a.clone();
        let c = ResourceHandle::Shared(Arc::new(String::from("mesh")));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = next_resource_id();
        let b = next_resource_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
