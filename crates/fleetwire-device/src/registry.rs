// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry mapping device ids to their durable queues.
//!
//! Queues live at `<dir>/<device_id>_queue.db`. The registry hands out one
//! shared handle per device, so every component of a device pipeline
//! works on the same queue and no two devices ever share one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::queue::{DurableQueue, QueueError};

#[derive(Debug, Clone)]
enum Storage {
    Directory(PathBuf),
    InMemory,
}

/// Device id -> queue handle.
#[derive(Debug)]
pub struct QueueRegistry {
    storage: Storage,
    capacity: usize,
    queues: Mutex<HashMap<String, Arc<DurableQueue>>>,
}

impl QueueRegistry {
    /// File-backed registry rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            storage: Storage::Directory(dir.into()),
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Registry whose queues do not survive the process.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            storage: Storage::InMemory,
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DurableQueue>>> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue file for `device_id`, or `None` for an in-memory registry.
    pub fn path_for(&self, device_id: &str) -> Option<PathBuf> {
        match &self.storage {
            Storage::Directory(dir) => Some(queue_path(dir, device_id)),
            Storage::InMemory => None,
        }
    }

    /// Get the queue for `device_id`, opening it on first use.
    pub fn open(&self, device_id: &str) -> Result<Arc<DurableQueue>, QueueError> {
        validate_device_id(device_id)?;
        let mut queues = self.lock();
        if let Some(queue) = queues.get(device_id) {
            return Ok(Arc::clone(queue));
        }
        let queue = match &self.storage {
            Storage::Directory(dir) => {
                DurableQueue::open(device_id, queue_path(dir, device_id), self.capacity)?
            }
            Storage::InMemory => DurableQueue::open_in_memory(device_id, self.capacity)?,
        };
        let queue = Arc::new(queue);
        queues.insert(device_id.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Already-opened queue, if any.
    pub fn get(&self, device_id: &str) -> Option<Arc<DurableQueue>> {
        self.lock().get(device_id).cloned()
    }

    /// Ids of every opened queue, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Device ids that have a queue file in the registry directory, sorted.
    pub fn discover(&self) -> Result<Vec<String>, QueueError> {
        let Storage::Directory(dir) = &self.storage else {
            return Ok(self.device_ids());
        };
        let read = match std::fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(QueueError::Io {
                    path: dir.clone(),
                    source,
                })
            }
        };
        let mut ids = Vec::new();
        for entry in read {
            let entry = entry.map_err(|source| QueueError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(QUEUE_SUFFIX)) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

const QUEUE_SUFFIX: &str = "_queue.db";

fn queue_path(dir: &Path, device_id: &str) -> PathBuf {
    dir.join(format!("{}{}", device_id, QUEUE_SUFFIX))
}

/// Device ids become file names, so path separators are refused.
fn validate_device_id(device_id: &str) -> Result<(), QueueError> {
    let ok = !device_id.is_empty()
        && device_id != "."
        && device_id != ".."
        && !device_id.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(QueueError::InvalidDeviceId(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwire_core::record::TelemetryRecord;
    use std::collections::BTreeMap;

    #[test]
    fn test_same_handle_per_device() {
        let registry = QueueRegistry::in_memory(10);
        let a = registry.open("vehicle_01").unwrap();
        let b = registry.open("vehicle_01").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.open("vehicle_02").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.device_ids(), vec!["vehicle_01", "vehicle_02"]);
    }

    #[test]
    fn test_devices_isolated() {
        let registry = QueueRegistry::in_memory(10);
        let a = registry.open("vehicle_01").unwrap();
        let b = registry.open("vehicle_02").unwrap();
        a.enqueue("t", &TelemetryRecord::new("vehicle_01", 1.0, BTreeMap::new()))
            .unwrap();
        assert_eq!(a.len().unwrap(), 1);
        assert_eq!(b.len().unwrap(), 0);
    }

    #[test]
    fn test_file_layout_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let registry = QueueRegistry::new(dir.path().join("queues"), 10);
        assert!(registry.discover().unwrap().is_empty());

        registry.open("vehicle_02").unwrap();
        registry.open("vehicle_01").unwrap();
        let path = registry.path_for("vehicle_01").unwrap();
        assert!(path.ends_with("queues/vehicle_01_queue.db"));
        assert!(path.exists());
        assert_eq!(registry.discover().unwrap(), vec!["vehicle_01", "vehicle_02"]);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let registry = QueueRegistry::in_memory(10);
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                registry.open(bad),
                Err(QueueError::InvalidDeviceId(_))
            ));
        }
    }
}
