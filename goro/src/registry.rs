//! Process-wide function registry and the deferred module collector
//!
//! The registry is the trick that keeps closures off the wire: every
//! process runs the same registration code in the same order, so an index
//! plus a 32-bit signature is enough to name a function to the other side.
//! Entries are append-only for the process lifetime and indices are stable.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;

use goro_codec::{ErrorValue, Value};

/// Outcome of a registered callable
pub type CallOutcome = Result<Value, ErrorValue>;

/// Boxed async call as stored in the registry
pub type BoxedCall = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, CallOutcome> + Send + Sync>;

/// Wire handle to a registered function: the registry index plus the
/// signature the serving side verifies before invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoFunc {
    pub index: u32,
    pub signature: u32,
}

struct Entry {
    signature: u32,
    call: BoxedCall,
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<Entry>,
    // Dedup is by callable type, which is precise within one process; the
    // signature is only a cross-process checksum and may collide.
    by_type: HashMap<TypeId, u32>,
    by_name: HashMap<String, u32>,
    deferred: Vec<Vec<DeferredExport>>,
}

struct DeferredExport {
    name: String,
    type_id: TypeId,
    signature: u32,
    call: BoxedCall,
}

static REGISTRY: Lazy<Mutex<RegistryInner>> = Lazy::new(Default::default);

fn registry() -> MutexGuard<'static, RegistryInner> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

/// 32-bit FNV-1a over the callable's identity text
pub(crate) fn hash32(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// type_name is stable for a given binary, which gives the same
// cross-process drift detection the source hash did.
fn signature_of<F: 'static>(name: Option<&str>) -> u32 {
    match name {
        Some(name) => hash32(&format!("{}::{}", name, std::any::type_name::<F>())),
        None => hash32(std::any::type_name::<F>()),
    }
}

fn wrap_sync<F>(f: F) -> BoxedCall
where
    F: Fn(Vec<Value>) -> CallOutcome + Send + Sync + 'static,
{
    Arc::new(move |args| futures::future::ready(f(args)).boxed())
}

fn wrap_async<F, Fut>(f: F) -> BoxedCall
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallOutcome> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

fn insert(type_id: TypeId, signature: u32, name: Option<String>, call: BoxedCall) -> GoFunc {
    let mut reg = registry();
    if let Some(&index) = reg.by_type.get(&type_id) {
        let signature = reg.entries[index as usize].signature;
        return GoFunc { index, signature };
    }

    let index = reg.entries.len() as u32;
    reg.entries.push(Entry { signature, call });
    reg.by_type.insert(type_id, index);
    if let Some(name) = name {
        reg.by_name.entry(name).or_insert(index);
    }
    GoFunc { index, signature }
}

/// Append a synchronous function to the registry, if not already present,
/// and return its wire handle. Registering the same function twice returns
/// the original handle.
pub fn register<F>(f: F) -> GoFunc
where
    F: Fn(Vec<Value>) -> CallOutcome + Send + Sync + 'static,
{
    insert(
        TypeId::of::<F>(),
        signature_of::<F>(None),
        None,
        wrap_sync(f),
    )
}

/// Append an async function to the registry
pub fn register_async<F, Fut>(f: F) -> GoFunc
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallOutcome> + Send + 'static,
{
    insert(
        TypeId::of::<F>(),
        signature_of::<F>(None),
        None,
        wrap_async(f),
    )
}

/// An export bag for the deferred module collector: named functions a
/// module hands over in one go.
#[derive(Default)]
pub struct Exports {
    items: Vec<DeferredExport>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallOutcome + Send + Sync + 'static,
    {
        self.items.push(DeferredExport {
            name: name.to_string(),
            type_id: TypeId::of::<F>(),
            signature: signature_of::<F>(Some(name)),
            call: wrap_sync(f),
        });
        self
    }

    pub fn async_function<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallOutcome> + Send + 'static,
    {
        self.items.push(DeferredExport {
            name: name.to_string(),
            type_id: TypeId::of::<F>(),
            signature: signature_of::<F>(Some(name)),
            call: wrap_async(f),
        });
        self
    }
}

/// Record a deferred registration root. The collector drains recorded roots
/// in order at the next flush point (facade start, first call, or worker
/// boot), so a module may declare its exports before they all exist.
pub fn use_exports(exports: Exports) {
    registry().deferred.push(exports.items);
}

/// Drain deferred roots into the registry
pub(crate) fn flush_deferred() {
    let bags = std::mem::take(&mut registry().deferred);
    for bag in bags {
        for export in bag {
            insert(
                export.type_id,
                export.signature,
                Some(export.name),
                export.call,
            );
        }
    }
}

/// Look up an indexed entry, verifying the caller's signature against the
/// local one. A miss either way means the registries drifted.
pub(crate) fn entry_call(index: u32, signature: u32) -> Option<BoxedCall> {
    let reg = registry();
    let entry = reg.entries.get(index as usize)?;
    if entry.signature != signature {
        return None;
    }
    Some(entry.call.clone())
}

/// Look up a named entry
pub(crate) fn named_call(name: &str) -> Option<BoxedCall> {
    let reg = registry();
    let index = *reg.by_name.get(name)?;
    reg.entries.get(index as usize).map(|e| e.call.clone())
}

/// Number of registered entries
pub fn len() -> usize {
    registry().entries.len()
}

#[cfg(test)]
pub(crate) fn signatures() -> Vec<u32> {
    registry().entries.iter().map(|e| e.signature).collect()
}
