use std::{env, str::FromStr, time::Duration};

/// Tunables for operations that wait on the kernel.
#[derive(Debug, Clone, PartialEq, Builder, Getters)]
#[builder(setter(into), default)]
#[get = "pub"]
pub struct Config {
    /// How many more times to try opening a freshly created pool that isn't visible yet.
    create_open_attempts: u32,
    /// Pause between those attempts.
    create_open_backoff: Duration,
    /// Upper bound for a send size estimate.
    send_size_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            create_open_attempts: 3,
            create_open_backoff: Duration::from_millis(500),
            send_size_deadline: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder { ConfigBuilder::default() }

    /// Defaults overridden by `LIBZFS_CREATE_OPEN_ATTEMPTS`, `LIBZFS_CREATE_OPEN_BACKOFF_MS` and
    /// `LIBZFS_SEND_SIZE_DEADLINE_SECS`. Values that don't parse are ignored.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(attempts) = from_env_var("LIBZFS_CREATE_OPEN_ATTEMPTS") {
            config.create_open_attempts = attempts;
        }
        if let Some(ms) = from_env_var("LIBZFS_CREATE_OPEN_BACKOFF_MS") {
            config.create_open_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = from_env_var("LIBZFS_SEND_SIZE_DEADLINE_SECS") {
            config.send_size_deadline = Duration::from_secs(secs);
        }
        config
    }
}

fn from_env_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
