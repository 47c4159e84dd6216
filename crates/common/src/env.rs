use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

/// Read a configuration value from the environment, falling back to the
/// given default when unset or unparseable.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Like [`env_config`] but for optional values with no meaningful default.
pub fn env_config_opt(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}
