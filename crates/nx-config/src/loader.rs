//! Configuration loading
//!
//! Resolution order: an explicitly supplied path, then `NOTIFYX_CONFIG`,
//! then the conventional file locations; the first candidate that exists on
//! disk wins, and missing files everywhere just means defaults. Environment
//! variables are applied on top of whatever was loaded.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

pub struct ConfigLoader {
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { explicit: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            explicit: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.locate() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// First existing candidate, explicit path winning over discovery.
    fn locate(&self) -> Option<PathBuf> {
        self.explicit
            .iter()
            .cloned()
            .chain(candidate_paths())
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery candidates in priority order: the `NOTIFYX_CONFIG` variable,
/// then the conventional locations.
fn candidate_paths() -> impl Iterator<Item = PathBuf> {
    let from_env = env::var_os("NOTIFYX_CONFIG").map(PathBuf::from);
    let conventional = [
        "config.toml",
        "notifyx.toml",
        "./config/config.toml",
        "./config/notifyx.toml",
        "/etc/notifyx/config.toml",
    ]
    .into_iter()
    .map(PathBuf::from);

    from_env.into_iter().chain(conventional)
}

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_str(name)?.parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| v == "true" || v == "1")
}

/// Overlay `NOTIFYX__SECTION__FIELD` / `JWT__*` variables onto a loaded
/// configuration. Unset or unparseable values leave the field alone.
fn apply_env_overrides(config: &mut AppConfig) {
    // general
    if let Some(v) = env_str("NOTIFYX__DEFAULTTENANTID") {
        config.default_tenant_id = v;
    }
    if let Some(v) = env_bool("NOTIFYX__DEVMODE") {
        config.dev_mode = v;
    }

    // http
    if let Some(v) = env_parse("NOTIFYX__HTTP__PORT") {
        config.http.port = v;
    }
    if let Some(v) = env_str("NOTIFYX__HTTP__HOST") {
        config.http.host = v;
    }

    // queue
    if let Some(v) = env_parse("NOTIFYX__QUEUE__MAXDEPTH") {
        config.queue.max_depth = v;
    }
    if let Some(v) = env_parse("NOTIFYX__QUEUE__POLLINTERVALMS") {
        config.queue.poll_interval_ms = v;
    }
    if let Some(v) = env_parse("NOTIFYX__QUEUE__DLQMAXENTRIES") {
        config.queue.dlq_max_entries = v;
    }

    // worker
    if let Some(v) = env_parse("NOTIFYX__WORKER__MAXCONCURRENT") {
        config.worker.max_concurrent = v;
    }
    if let Some(v) = env_parse("NOTIFYX__WORKER__SHUTDOWNTIMEOUTSECS") {
        config.worker.shutdown_timeout_secs = v;
    }

    // retry
    if let Some(v) = env_parse("NOTIFYX__RETRY__MAXATTEMPTS") {
        config.retry.max_attempts = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RETRY__INITIALDELAYMS") {
        config.retry.initial_delay_ms = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RETRY__MULTIPLIER") {
        config.retry.multiplier = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RETRY__MAXDELAYMS") {
        config.retry.max_delay_ms = v;
    }
    if let Some(v) = env_bool("NOTIFYX__RETRY__JITTER") {
        config.retry.jitter = v;
    }

    // rate limits
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__TENANTPERMINUTE") {
        config.rate_limit.tenant_per_minute = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__TENANTPERHOUR") {
        config.rate_limit.tenant_per_hour = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__TENANTPERDAY") {
        config.rate_limit.tenant_per_day = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__RECIPIENTPERMINUTE") {
        config.rate_limit.recipient_per_minute = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__RECIPIENTPERHOUR") {
        config.rate_limit.recipient_per_hour = v;
    }
    if let Some(v) = env_parse("NOTIFYX__RATELIMIT__RECIPIENTPERDAY") {
        config.rate_limit.recipient_per_day = v;
    }
    if let Some(v) = env_bool("NOTIFYX__RATELIMIT__DEADLETTERONREJECT") {
        config.rate_limit.dead_letter_on_reject = v;
    }

    // jwt
    if let Some(v) = env_str("JWT__SECRETKEY") {
        config.jwt.secret_key = v;
    }
    if let Some(v) = env_str("JWT__ISSUER") {
        config.jwt.issuer = v;
    }
    if let Some(v) = env_str("JWT__AUDIENCE") {
        config.jwt.audience = v;
    }
    if let Some(v) = env_parse("JWT__EXPIRYMINUTES") {
        config.jwt.expiry_minutes = v;
    }

    // engine
    if let Some(v) = env_parse("NOTIFYX__ENGINE__RUNTIMEOUTSECS") {
        config.engine.run_timeout_secs = v;
    }
    if let Some(v) = env_parse("NOTIFYX__ENGINE__MAXLOOPITERATIONS") {
        config.engine.max_loop_iterations = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test execution.
    #[test]
    fn env_overrides_apply() {
        env::set_var("NOTIFYX__WORKER__MAXCONCURRENT", "12");
        env::set_var("NOTIFYX__RETRY__MAXATTEMPTS", "7");
        env::set_var("NOTIFYX__RETRY__INITIALDELAYMS", "not-a-number");
        env::set_var("JWT__ISSUER", "issuer-x");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);

        assert_eq!(config.worker.max_concurrent, 12);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.jwt.issuer, "issuer-x");
        // unparseable values leave the default in place
        assert_eq!(config.retry.initial_delay_ms, 1_000);

        env::remove_var("NOTIFYX__WORKER__MAXCONCURRENT");
        env::remove_var("NOTIFYX__RETRY__MAXATTEMPTS");
        env::remove_var("NOTIFYX__RETRY__INITIALDELAYMS");
        env::remove_var("JWT__ISSUER");
    }

    #[test]
    fn explicit_path_beats_discovery() {
        let loader = ConfigLoader::with_path("/definitely/not/here.toml");
        // the explicit path does not exist, so discovery (also empty in the
        // test environment) leaves us with defaults
        let config = loader.load().unwrap();
        assert_eq!(config.http.port, 8080);
    }
}
