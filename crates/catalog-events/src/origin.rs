use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the process (and a per-process random nonce) that published
/// an event, so a subscriber mirrored through a shared broker can drop its
/// own messages instead of re-delivering them (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub process_id: Uuid,
    pub nonce: u64,
}

static CURRENT: OnceLock<Origin> = OnceLock::new();

impl Origin {
    /// The origin for this process, generated once on first use and cached
    /// for the remainder of the process's lifetime.
    pub fn current() -> Origin {
        *CURRENT.get_or_init(|| Origin {
            process_id: Uuid::now_v7(),
            nonce: rand::random(),
        })
    }
}
