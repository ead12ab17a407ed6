use std::env;
use std::path::PathBuf;
use std::sync::Once;

use dotenv::dotenv;

/// Explicit configuration file path.
pub const CONF_VAR: &str = "CONF";

/// Set to `false` to keep environment variable keys as written.
pub const LOWER_CASE_VAR: &str = "LOWER_CASE_ENV_VARS";

/// Separator between nested keys, e.g. `RABBITMQ__HOST`.
pub const SEPARATOR: &str = "__";

static DOTENV: Once = Once::new();

/// Loads `.env` into the process environment, once.
pub fn bootstrap() {
    DOTENV.call_once(|| {
        dotenv().ok();
    });
}

pub fn config_path() -> Option<PathBuf> {
    env::var(CONF_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

pub fn lower_case_keys() -> bool {
    parse_lower_case(env::var(LOWER_CASE_VAR).ok().as_deref())
}

fn parse_lower_case(value: Option<&str>) -> bool {
    value != Some("false")
}

/// The process environment as (key, value) pairs. Non-UTF-8 entries are skipped.
pub fn vars() -> Vec<(String, String)> {
    env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}
