use crate::error::ConfigError;

/// Crate-wide mutex for tests that mutate process environment variables.
///
/// The process environment is global state shared across all threads.
/// Every `unsafe { set_var / remove_var }` call in tests MUST hold this
/// single lock.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Read an env var. Unset and empty both come back as `None`, so a
/// blanked-out variable behaves the same as a missing one.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

/// Parse an env var that has no default: unset stays `None`, a set value
/// must parse.
pub(crate) fn parse_option_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = optional_env(key)? else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_option_env(key)?.unwrap_or(default))
}

/// Boolean env var with a default. Only "true"/"1" and "false"/"0" are
/// accepted (case-insensitive); anything else is a config error rather
/// than a silent fallback.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional_env(key)? else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be 'true' or 'false', got '{raw}'"),
        }),
    }
}

/// String env var with a fallback.
pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}
