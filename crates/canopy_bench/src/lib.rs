//! Benchmark utilities.

use canopy_codec::Value;
use canopy_core::{Config, KindRegistry, PersistentObject, StrategyKind, TransactionManager};
use canopy_storage::InMemoryBackend;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Generate random text of the specified length.
pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// Generate an object state with `fields` text fields of `size` bytes each.
pub fn object_state(fields: usize, size: usize) -> Value {
    let map: BTreeMap<String, Value> = (0..fields)
        .map(|i| (format!("field_{i}"), Value::Text(random_text(size))))
        .collect();
    Value::Map(map)
}

/// Generate a new object of kind `item` with random fields.
pub fn random_object(fields: usize, size: usize) -> PersistentObject {
    let mut object = PersistentObject::new("item");
    for i in 0..fields {
        object.set(format!("field_{i}"), random_text(size));
    }
    object
}

/// Build a multi-thread runtime for driving async code from criterion.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// Create an initialized in-memory manager.
pub fn manager(rt: &tokio::runtime::Runtime, strategy: StrategyKind) -> Arc<TransactionManager> {
    let manager = TransactionManager::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(KindRegistry::new()),
        Config::default().strategy(strategy),
        None,
    );
    rt.block_on(manager.initialize())
        .expect("Failed to initialize manager");
    Arc::new(manager)
}
