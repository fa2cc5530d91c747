use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Tracks which named features are serving fallback results.
#[derive(Debug, Default)]
pub struct DegradationRegistry {
    features: RwLock<BTreeMap<String, Instant>>,
}

impl DegradationRegistry {
    /// Creates a registry with nothing degraded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `feature` degraded. Returns false if it already was.
    pub fn enable(&self, feature: &str) -> bool {
        let mut features = self.features.write();
        if features.contains_key(feature) {
            return false;
        }
        features.insert(feature.to_string(), Instant::now());
        drop(features);
        tracing::warn!(feature = feature, "Feature running in degraded mode");
        true
    }

    /// Clears the degraded flag. Returns false if it was not set.
    pub fn disable(&self, feature: &str) -> bool {
        let removed = self.features.write().remove(feature);
        match removed {
            Some(since) => {
                tracing::info!(
                    feature = feature,
                    degraded_ms = since.elapsed().as_millis() as u64,
                    "Feature recovered from degraded mode"
                );
                true
            }
            None => false,
        }
    }

    /// True while `feature` is serving fallback results.
    pub fn is_degraded(&self, feature: &str) -> bool {
        self.features.read().contains_key(feature)
    }

    /// Degraded features in name order.
    pub fn degraded_features(&self) -> Vec<String> {
        self.features.read().keys().cloned().collect()
    }

    /// Clears every flag without logging recoveries.
    pub fn clear(&self) {
        self.features.write().clear();
    }
}
