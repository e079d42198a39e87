use std::time::Duration;

const HOSTWATCH_DEFAULT_PORT: &str = "HOSTWATCH_DEFAULT_PORT";

const DEFAULT_PORT: u16 = 8765;

pub fn get_default_port() -> u16 {
    let port_from_env = std::env::var(HOSTWATCH_DEFAULT_PORT);
    port_from_env.map_or(DEFAULT_PORT, |res| res.parse().unwrap_or(DEFAULT_PORT))
}

const HOSTWATCH_RECONNECT_SECS: &str = "HOSTWATCH_RECONNECT_SECS";

const DEFAULT_RECONNECT_SECS: u64 = 5;

pub fn get_reconnect_delay() -> Duration {
    let secs_from_env = std::env::var(HOSTWATCH_RECONNECT_SECS);
    let secs = secs_from_env.map_or(DEFAULT_RECONNECT_SECS, |res| {
        res.parse().unwrap_or(DEFAULT_RECONNECT_SECS)
    });
    Duration::from_secs(secs)
}
