//! Type registry: positional type identifiers and pooled decode instances
//!
//! Every record kind that travels through a hub or a flow log implements
//! [`PersistentData`] and is registered once with a [`TypeRegistry`]. The
//! registry hands out a [`Tid`] equal to the registration count at the time
//! of first registration, so every process reading a log must register the
//! same kinds in the same order.
//!
//! Decode paths lease instances with [`TypeRegistry::new_instance`]. The
//! returned [`Pooled`] lease puts its instance back into a per-TID free list
//! when dropped.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock};

/// Default number of idle instances kept per registered type
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Upcast helper so trait objects can be downcast to their concrete type
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Capability set of every record kind: serialize to bytes and rebuild from bytes
pub trait PersistentData: AsAny + Send + Sync + fmt::Debug {
    /// Encode this record's state
    fn serialize(&self) -> Vec<u8>;

    /// Overwrite this record's state from an encoded payload
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;
}

impl dyn PersistentData {
    /// Check whether the record is of concrete type `T`
    pub fn is<T: PersistentData>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrow the record as concrete type `T`
    pub fn downcast_ref<T: PersistentData>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the record as concrete type `T`
    pub fn downcast_mut<T: PersistentData>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Positional type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn PersistentData> + Send + Sync>;

struct TypeEntry {
    name: &'static str,
    factory: Factory,
    pool: Mutex<Vec<Box<dyn PersistentData>>>,
    capacity: usize,
}

impl TypeEntry {
    fn take(&self) -> Box<dyn PersistentData> {
        let recycled = self.pool.lock().ok().and_then(|mut pool| pool.pop());
        recycled.unwrap_or_else(|| (self.factory)())
    }

    fn recycle(&self, value: Box<dyn PersistentData>) {
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.capacity {
                pool.push(value);
            }
        }
    }

    fn idle(&self) -> usize {
        self.pool.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

#[derive(Default)]
struct RegistryInner {
    by_type: HashMap<TypeId, Tid>,
    entries: Vec<Arc<TypeEntry>>,
}

/// Registry mapping record types to positional TIDs
///
/// Shared between hubs, flow stores and the remote bridge via `Arc`.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    pool_capacity: usize,
}

impl TypeRegistry {
    /// Create an empty registry with the default pool capacity
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create an empty registry keeping at most `capacity` idle instances per type
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            pool_capacity: capacity,
        }
    }

    /// Register a record type with its factory
    ///
    /// Idempotent per concrete type: registering `T` again returns the TID it
    /// already holds and ignores the new factory.
    pub fn register<T, F>(&self, factory: F) -> Result<Tid>
    where
        T: PersistentData,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let mut inner = self.inner.write().map_err(HubError::lock)?;

        if let Some(tid) = inner.by_type.get(&type_id) {
            return Ok(*tid);
        }

        let tid = Tid(inner.entries.len() as u32);
        let name = std::any::type_name::<T>();
        inner.entries.push(Arc::new(TypeEntry {
            name,
            factory: Box::new(move || Box::new(factory())),
            pool: Mutex::new(Vec::new()),
            capacity: self.pool_capacity,
        }));
        inner.by_type.insert(type_id, tid);

        tracing::info!(type_name = name, tid = tid.0, "Type registered");
        Ok(tid)
    }

    /// Register a record type constructed through `Default`
    pub fn register_default<T>(&self) -> Result<Tid>
    where
        T: PersistentData + Default,
    {
        self.register(T::default)
    }

    /// Lease an instance of the type registered under `tid`
    pub fn new_instance(&self, tid: Tid) -> Result<Pooled> {
        let entry = {
            let inner = self.inner.read().map_err(HubError::lock)?;
            inner
                .entries
                .get(tid.0 as usize)
                .cloned()
                .ok_or(HubError::OutOfRange(tid.0))?
        };

        Ok(Pooled {
            value: entry.take(),
            entry,
            tid,
        })
    }

    /// TID of a concrete type, if registered
    pub fn tid_of<T: PersistentData>(&self) -> Option<Tid> {
        self.tid_of_type_id(TypeId::of::<T>())
    }

    /// TID of a record's runtime type, if registered
    pub fn tid_of_value(&self, data: &dyn PersistentData) -> Option<Tid> {
        self.tid_of_type_id(data.as_any().type_id())
    }

    fn tid_of_type_id(&self, type_id: TypeId) -> Option<Tid> {
        let inner = self.inner.read().ok()?;
        inner.by_type.get(&type_id).copied()
    }

    /// Type names in TID order
    ///
    /// Written into flow log headers to detect registration-order drift.
    pub fn type_names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.entries.iter().map(|e| e.name.to_string()).collect())
            .unwrap_or_default()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Whether no type is registered yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idle pooled instances for `tid`
    pub fn idle_instances(&self, tid: Tid) -> usize {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.entries.get(tid.0 as usize).map(|e| e.idle()))
            .unwrap_or(0)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

/// Placeholder left behind when a lease gives up its instance
#[derive(Debug)]
struct Vacant;

impl PersistentData for Vacant {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Leased record instance; returns to its type's pool on drop
pub struct Pooled {
    value: Box<dyn PersistentData>,
    entry: Arc<TypeEntry>,
    tid: Tid,
}

impl Pooled {
    /// TID this instance was leased under
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Take the instance out of the pool discipline
    pub fn detach(mut self) -> Box<dyn PersistentData> {
        std::mem::replace(&mut self.value, Box::new(Vacant))
    }
}

impl Deref for Pooled {
    type Target = dyn PersistentData;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref()
    }
}

impl DerefMut for Pooled {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut()
    }
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("tid", &self.tid)
            .field("type", &self.entry.name)
            .field("value", &self.value)
            .finish()
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let value = std::mem::replace(&mut self.value, Box::new(Vacant));
        if !value.is::<Vacant>() {
            self.entry.recycle(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct A(u8);
    #[derive(Debug, Default, Clone, PartialEq)]
    struct B(u8);
    #[derive(Debug, Default, Clone, PartialEq)]
    struct C(u8);

    macro_rules! byte_record {
        ($t:ident) => {
            impl PersistentData for $t {
                fn serialize(&self) -> Vec<u8> {
                    vec![self.0]
                }

                fn deserialize(&mut self, data: &[u8]) -> Result<()> {
                    self.0 = *data
                        .first()
                        .ok_or_else(|| HubError::Decode("empty payload".to_string()))?;
                    Ok(())
                }
            }
        };
    }

    byte_record!(A);
    byte_record!(B);
    byte_record!(C);

    #[test]
    fn test_tids_follow_registration_order() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.register_default::<A>().unwrap(), Tid(0));
        assert_eq!(reg.register_default::<B>().unwrap(), Tid(1));
        assert_eq!(reg.register_default::<C>().unwrap(), Tid(2));

        // Re-registering keeps the original TID
        assert_eq!(reg.register(|| B(9)).unwrap(), Tid(1));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_new_instance_out_of_range() {
        let reg = TypeRegistry::new();
        reg.register_default::<A>().unwrap();

        let err = reg.new_instance(Tid(1)).unwrap_err();
        assert!(matches!(err, HubError::OutOfRange(1)));
    }

    #[test]
    fn test_new_instance_uses_factory() {
        let reg = TypeRegistry::new();
        let tid = reg.register(|| A(7)).unwrap();

        let inst = reg.new_instance(tid).unwrap();
        assert_eq!(inst.tid(), tid);
        assert_eq!(inst.downcast_ref::<A>(), Some(&A(7)));
        assert!(inst.downcast_ref::<B>().is_none());
    }

    #[test]
    fn test_lease_returns_to_pool() {
        let reg = TypeRegistry::new();
        let tid = reg.register_default::<A>().unwrap();
        assert_eq!(reg.idle_instances(tid), 0);

        let mut inst = reg.new_instance(tid).unwrap();
        inst.deserialize(&[42]).unwrap();
        drop(inst);
        assert_eq!(reg.idle_instances(tid), 1);

        // The recycled instance is handed out again
        let again = reg.new_instance(tid).unwrap();
        assert_eq!(again.downcast_ref::<A>(), Some(&A(42)));
        assert_eq!(reg.idle_instances(tid), 0);
    }

    #[test]
    fn test_detach_skips_pool() {
        let reg = TypeRegistry::new();
        let tid = reg.register_default::<A>().unwrap();

        let boxed = reg.new_instance(tid).unwrap().detach();
        assert!(boxed.is::<A>());
        assert_eq!(reg.idle_instances(tid), 0);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let reg = TypeRegistry::with_pool_capacity(1);
        let tid = reg.register_default::<A>().unwrap();

        let first = reg.new_instance(tid).unwrap();
        let second = reg.new_instance(tid).unwrap();
        drop(first);
        drop(second);
        assert_eq!(reg.idle_instances(tid), 1);
    }

    #[test]
    fn test_tid_lookup_by_value() {
        let reg = TypeRegistry::new();
        reg.register_default::<A>().unwrap();
        let tid_b = reg.register_default::<B>().unwrap();

        let value: Box<dyn PersistentData> = Box::new(B(3));
        assert_eq!(reg.tid_of_value(value.as_ref()), Some(tid_b));
        assert_eq!(reg.tid_of::<B>(), Some(tid_b));
        assert_eq!(reg.tid_of::<C>(), None);
    }

    #[test]
    fn test_type_names_manifest() {
        let reg = TypeRegistry::new();
        reg.register_default::<A>().unwrap();
        reg.register_default::<B>().unwrap();

        let names = reg.type_names();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("::A"));
        assert!(names[1].ends_with("::B"));
    }
}
