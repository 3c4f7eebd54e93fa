// =============================================================================
// Worker status — operational state for the threads export
// =============================================================================
//
// Each worker owns one `WorkerStatus` and keeps a handful of counters in it.
// The system manager collects them into the `threads` section of the JSON
// state export. Workers export only operational state here — never session
// data, which lives in SessionData alone.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

pub struct WorkerStatus {
    name: String,
    inner: RwLock<Inner>,
}

struct Inner {
    running: bool,
    detail: serde_json::Map<String, Value>,
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                running: false,
                detail: serde_json::Map::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_running(&self, running: bool) {
        self.inner.write().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().running
    }

    /// Set one operational field.
    pub fn set(&self, key: &str, value: Value) {
        self.inner.write().detail.insert(key.to_string(), value);
    }

    /// Increment a numeric counter field.
    pub fn bump(&self, key: &str) {
        let mut inner = self.inner.write();
        let next = inner.detail.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
        inner.detail.insert(key.to_string(), json!(next));
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner.read().detail.get(key).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn export(&self) -> Value {
        let inner = self.inner.read();
        let mut out = serde_json::Map::new();
        out.insert(
            "thread_info".to_string(),
            json!({
                "name": self.name,
                "alive": inner.running,
                "daemon": true,
            }),
        );
        out.insert("running".to_string(), json!(inner.running));
        for (k, v) in &inner.detail {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}
