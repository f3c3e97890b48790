//! Tree tuning parameters.

use serde::{Deserialize, Serialize};

/// Parameters a tree file is created with.
///
/// Larger node sizes shift work from the file system to the in-memory key
/// scans; around 200 is a reasonable middle ground for string keys. The key
/// length bounds every key in the file and claims that many bytes per key
/// slot in every node record, so oversizing it wastes space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfiguration {
    /// Branching factor and leaf capacity.
    pub nodesize: usize,
    /// Maximum key length in bytes.
    pub keylen: usize,
    /// Node cache capacity used by `enable_cache` callers that take the
    /// default.
    pub cache_capacity: usize,
}

impl Default for TreeConfiguration {
    fn default() -> Self {
        TreeConfiguration {
            nodesize: 212,
            keylen: 16,
            cache_capacity: 33,
        }
    }
}

#[cfg(feature = "figment_config")]
impl TreeConfiguration {
    /// Defaults overridable from `BPTREE_`-prefixed environment variables.
    pub fn figment() -> figment::Figment {
        use figment::providers::{Env, Serialized};

        figment::Figment::from(Serialized::defaults(TreeConfiguration::default()))
            .merge(Env::prefixed("BPTREE_"))
    }
}
