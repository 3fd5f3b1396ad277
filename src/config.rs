//! Engine-wide tunables. Mirrors the single environment-backed knob
//! pattern in `bpmn-lite-server/src/main.rs::parse_database_url` — CLI/env
//! override for the optional Postgres event store, plus the resource
//! limits spec §5 calls out explicitly.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Hard cap on parallel multi-instance fan-out (spec §5, default 1024).
    pub max_parallel_instances: usize,
    /// Default standard-loop iteration cap when `loopMaximum` is unset
    /// (spec §4.6, default 100).
    pub default_loop_maximum: u32,
    /// Default `MessageBus` retention: `None` means unbounded within the
    /// instance's lifetime, dropped at instance end (spec §9's resolved
    /// open question).
    pub default_message_ttl: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_instances: 1024,
            default_loop_maximum: 100,
            default_message_ttl: None,
        }
    }
}

impl EngineConfig {
    /// Reads `BPMN_CORE_DATABASE_URL` (falling back to `DATABASE_URL`),
    /// analogous to the teacher's `--database-url` / `DATABASE_URL`
    /// fallback for wiring an optional Postgres-backed store.
    pub fn database_url_from_env() -> Option<String> {
        std::env::var("BPMN_CORE_DATABASE_URL")
            .ok()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}
