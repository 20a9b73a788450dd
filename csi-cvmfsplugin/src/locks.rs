use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Volume ids with an operation in flight on this node.
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl VolumeLocks {
    /// Claim `volume_id`, or `None` when another operation holds it.
    pub fn try_acquire(&self, volume_id: &str) -> Option<VolumeGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(volume_id.to_string()) {
            return None;
        }
        Some(VolumeGuard {
            locks: self.clone(),
            volume_id: volume_id.to_string(),
        })
    }
}

/// Releases the volume id on drop.
#[derive(Debug)]
pub struct VolumeGuard {
    locks: VolumeLocks,
    volume_id: String,
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.volume_id);
    }
}
