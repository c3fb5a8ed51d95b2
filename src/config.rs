/*
 * Channel Configuration
 *
 * Settings applied when a channel is opened:
 * - device:      path of the arbiter character device
 * - map_size:    bytes of receive region mapped from the device
 * - max_threads: looper threads the arbiter may ask this process to spawn
 *
 * Environment overrides (read once for the process-wide channel):
 * - LITEIPC_DEVICE
 * - LITEIPC_MAP_SIZE
 * - LITEIPC_MAX_THREADS
 *
 * Malformed values are logged and ignored.
 */

use lazy_static::lazy_static;

pub const DEFAULT_DEVICE: &str = "/dev/binder";
pub const DEFAULT_MAP_SIZE: usize = 128 * 1024;
pub const DEFAULT_MAX_THREADS: u32 = 4;

const ENV_DEVICE: &str = "LITEIPC_DEVICE";
const ENV_MAP_SIZE: &str = "LITEIPC_MAP_SIZE";
const ENV_MAX_THREADS: &str = "LITEIPC_MAX_THREADS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub device: String,
    pub map_size: usize,
    pub max_threads: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            map_size: DEFAULT_MAP_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

impl ChannelConfig {
    /// Defaults with a different receive region size
    pub fn with_map_size(map_size: usize) -> Self {
        Self { map_size, ..Self::default() }
    }

    /// Defaults overridden by LITEIPC_* environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(device) = lookup(ENV_DEVICE).filter(|d| !d.is_empty()) {
            config.device = device;
        }
        if let Some(size) = parse(&lookup, ENV_MAP_SIZE) {
            config.map_size = size;
        }
        if let Some(threads) = parse(&lookup, ENV_MAX_THREADS) {
            config.max_threads = threads;
        }
        config
    }
}

fn parse<T: core::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("config: ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}

lazy_static! {
    /// Configuration of the process-wide channel
    pub static ref DEFAULT_CONFIG: ChannelConfig = ChannelConfig::from_env();
}
