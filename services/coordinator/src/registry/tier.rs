//! Capability classification.
//!
//! A worker's tier is derived exactly once, at registration time, from its
//! declared capabilities. It is never recomputed for an existing id; a
//! worker whose hardware changes re-registers and receives a fresh id.

use serde::{Deserialize, Serialize};

/// Hardware capabilities declared at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// GPU memory in megabytes, if a GPU is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<u64>,

    /// GPU model string, if a GPU is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,

    /// Number of CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
}

/// Capability class, fixed for the lifetime of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// GPU-equipped workers.
    Gpu,
    /// General compute (4+ cores, no GPU).
    Compute,
    /// Storage/data-only workers.
    Storage,
}

impl Tier {
    /// Classify declared capabilities into a tier.
    ///
    /// Tier 1 if any GPU capability is declared, tier 2 if the worker has at
    /// least 4 CPU cores, tier 3 otherwise.
    pub fn classify(capabilities: &Capabilities) -> Self {
        if capabilities.gpu_memory.is_some() || capabilities.gpu_type.is_some() {
            return Tier::Gpu;
        }
        if capabilities.cpu_cores.is_some_and(|cores| cores >= 4) {
            return Tier::Compute;
        }
        Tier::Storage
    }

    /// Numeric rank used on the wire and in stats (1 = GPU .. 3 = storage).
    pub const fn rank(self) -> u8 {
        match self {
            Tier::Gpu => 1,
            Tier::Compute => 2,
            Tier::Storage => 3,
        }
    }
}

impl serde::Serialize for Tier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.rank())
    }
}

impl<'de> serde::Deserialize<'de> for Tier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            1 => Ok(Tier::Gpu),
            2 => Ok(Tier::Compute),
            3 => Ok(Tier::Storage),
            other => Err(serde::de::Error::custom(format!(
                "invalid tier: {other}, expected 1..=3"
            ))),
        }
    }
}
