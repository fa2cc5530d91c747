use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Hex characters of each digest kept in a cache key.
const DIGEST_PREFIX_LEN: usize = 16;

/// Normalised description of a request, hashed into cache keys.
///
/// Categories and labels are sorted sets so insertion order never changes the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestFingerprint {
    /// Number of items the request covers
    pub item_count: usize,
    /// Lower bound of the price filter
    pub min_price: Option<f64>,
    /// Upper bound of the price filter
    pub max_price: Option<f64>,
    /// Category filter
    pub categories: BTreeSet<String>,
    /// Start of the date filter
    pub date_from: Option<DateTime<Utc>>,
    /// End of the date filter
    pub date_to: Option<DateTime<Utc>>,
    /// Free-form request attributes
    pub labels: BTreeMap<String, String>,
}

impl RequestFingerprint {
    /// Starts a fingerprint for `item_count` items.
    pub fn new(item_count: usize) -> Self {
        Self {
            item_count,
            ..Default::default()
        }
    }

    /// Sets an inclusive price filter.
    pub fn with_price_range(mut self, min: f64, max: f64) -> Self {
        self.min_price = Some(min);
        self.max_price = Some(max);
        self
    }

    /// Adds one category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    /// Adds several categories.
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories.extend(categories.into_iter().map(Into::into));
        self
    }

    /// Sets the date filter.
    pub fn with_date_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    /// Adds a free-form label, e.g. the request type.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// SHA-256 hex digest of the JSON form.
    pub fn digest(&self) -> String {
        sha256_hex(self)
    }
}

/// Builds `{namespace}:{fingerprint}:{config}` cache keys.
///
/// The configuration digest is computed once; a changed configuration yields
/// different keys, so stale entries are never read back.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    config_digest: String,
}

impl CacheKeyBuilder {
    /// Hashes `config` once; it should hold everything that changes the answer,
    /// such as model name and temperature.
    pub fn new<C: Serialize>(namespace: impl Into<String>, config: &C) -> Self {
        Self {
            namespace: namespace.into(),
            config_digest: sha256_hex(config),
        }
    }

    /// Prefix of every key this builder produces.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full hex digest of the configuration.
    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }

    /// Key for one request under this configuration.
    pub fn key(&self, fingerprint: &RequestFingerprint) -> String {
        format!(
            "{}:{}:{}",
            self.namespace,
            truncate(&fingerprint.digest()),
            truncate(&self.config_digest)
        )
    }
}

fn sha256_hex<T: Serialize + ?Sized>(value: &T) -> String {
    // serde_json only fails on maps with non-string keys, which none of our inputs have
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn truncate(digest: &str) -> &str {
    &digest[..DIGEST_PREFIX_LEN.min(digest.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::{assert_eq, assert_ne};
    use serde_json::json;

    #[test]
    fn test_key_shape() {
        let builder = CacheKeyBuilder::new("insights", &json!({"model": "a", "temperature": 0.2}));
        let key = builder.key(&RequestFingerprint::new(3));

        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "insights");
        assert_eq!(parts[1].len(), DIGEST_PREFIX_LEN);
        assert_eq!(parts[2], &builder.config_digest()[..DIGEST_PREFIX_LEN]);
        assert_eq!(builder.config_digest().len(), 64);
    }

    #[test]
    fn test_category_order_does_not_matter() {
        let a = RequestFingerprint::new(2).with_categories(["food", "travel"]);
        let b = RequestFingerprint::new(2)
            .with_category("travel")
            .with_category("food");
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_fingerprint_fields_change_the_key() {
        let builder = CacheKeyBuilder::new("insights", &json!({"model": "a"}));
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();

        let base = RequestFingerprint::new(10).with_price_range(1.0, 99.5);
        let keys = [
            builder.key(&base),
            builder.key(&RequestFingerprint::new(11).with_price_range(1.0, 99.5)),
            builder.key(&base.clone().with_price_range(1.0, 100.0)),
            builder.key(&base.clone().with_category("food")),
            builder.key(&base.clone().with_date_range(from, to)),
            builder.key(&base.clone().with_label("locale", "de")),
        ];
        let unique: BTreeSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_config_change_invalidates_keys() {
        let fingerprint = RequestFingerprint::new(5).with_category("food");
        let old = CacheKeyBuilder::new("insights", &json!({"model": "a"}));
        let new = CacheKeyBuilder::new("insights", &json!({"model": "b"}));

        assert_ne!(old.key(&fingerprint), new.key(&fingerprint));
        assert_eq!(
            old.key(&fingerprint),
            CacheKeyBuilder::new("insights", &json!({"model": "a"})).key(&fingerprint)
        );
    }
}
