//! In-process object store used by publisher and worker tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ObjectMeta, ObjectStore, StoreError};

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub meta: ObjectMeta,
}

#[derive(Clone, Debug)]
enum Fault {
    /// Fail the next `remaining` uploads of the key with a transient error.
    Transient { remaining: u32 },
    Permanent,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<HashMap<String, Fault>>,
    put_calls: Mutex<HashMap<String, u32>>,
    delete_calls: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .insert(key.to_string(), Fault::Transient { remaining: times });
    }

    pub fn fail_permanently(&self, key: &str) {
        self.faults.lock().unwrap().insert(key.to_string(), Fault::Permanent);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn put_calls(&self, key: &str) -> u32 {
        self.put_calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn deleted_prefixes(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<(), StoreError> {
        *self.put_calls.lock().unwrap().entry(key.to_string()).or_default() += 1;

        {
            let mut faults = self.faults.lock().unwrap();
            match faults.get_mut(key) {
                Some(Fault::Permanent) => return Err(StoreError::permanent("403 AccessDenied")),
                Some(Fault::Transient { remaining }) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(StoreError::transient("500 InternalError"));
                }
                _ => {}
            }
        }

        let body = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject { body, meta: meta.clone() },
        );
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.delete_calls.lock().unwrap().push(prefix.clone());

        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - objects.len())
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://cdn.test/{}", key)
    }
}
