//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Initial world edge length; must be a power of two.
    #[serde(default = "default_world_size")]
    pub world_size: i32,
    /// Ceiling for world enlargement.
    #[serde(default = "default_world_size_max")]
    pub world_size_max: i32,
    /// Minimum index radius for entities with no declared size.
    #[serde(default = "default_min_entity_radius")]
    pub min_entity_radius: f32,
    /// Maximum dynamic lights returned by a single cull.
    #[serde(default = "default_max_dynlights")]
    pub max_dynlights: usize,
    /// Scenario handshake retry interval in milliseconds; 0 disables retry.
    #[serde(default = "default_scenario_retry_ms")]
    pub scenario_retry_ms: u64,
    /// Map name the server starts with (empty = no scenario until pushed).
    #[serde(default)]
    pub start_map: String,
}

fn default_world_size() -> i32 {
    1024
}

fn default_world_size_max() -> i32 {
    1 << 16
}

fn default_min_entity_radius() -> f32 {
    2.0
}

fn default_max_dynlights() -> usize {
    8
}

fn default_scenario_retry_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            world_size: default_world_size(),
            world_size_max: default_world_size_max(),
            min_entity_radius: default_min_entity_radius(),
            max_dynlights: default_max_dynlights(),
            scenario_retry_ms: default_scenario_retry_ms(),
            start_map: String::new(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
