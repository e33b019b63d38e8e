//! Type-erased, hashable query identity.
//!
//! The engine never looks inside a [`Key`]; it only hashes, compares, and
//! displays it. Queries supply their own concrete key type (an integer, a
//! string, a small struct) and the engine wraps it behind `Arc<dyn KeyData>`
//! so that heterogeneous query families can share one task map.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub trait KeyData: Send + Sync + 'static {
    fn eq_erased(&self, other: &dyn KeyData) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn as_any(&self) -> &dyn Any;
}

impl<T> KeyData for T
where
    T: Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    fn eq_erased(&self, other: &dyn KeyData) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        T::hash(self, &mut state)
    }

    fn fmt_erased(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A hashable, displayable, type-erased query identity.
///
/// Cloning a `Key` is cheap (it is reference-counted); two `Key`s compare
/// equal iff their underlying concrete values compare equal, regardless of
/// which concrete type produced them (two keys built from unrelated types
/// never compare equal, since `eq_erased` downcasts to the left-hand side's
/// concrete type first).
#[derive(Clone)]
pub struct Key(Arc<dyn KeyData>);

impl Key {
    pub fn new<T>(value: T) -> Key
    where
        T: Eq + Hash + fmt::Display + Send + Sync + 'static,
    {
        Key(Arc::new(value))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(&*other.0)
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_erased(f)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}
