//! Compile-time plugin registry.
//!
//! Extension flags have the form `name[:path-to-config.json]` and resolve
//! against the plugins built into this crate. Unknown names and unreadable
//! configs are errors; the caller logs and skips them so one bad flag does
//! not take the other plugins down.

use crate::cache::Cache;
use crate::httplog::HttpLog;
use crate::ratelimit::{RateLimit, RateLimitConfig};
use crate::rbac::Rbac;
use crate::PluginRef;
use portico_common::{GatewayError, Result};
use std::sync::Arc;

/// Resolve one `--plugin` flag into a plugin instance.
pub fn parse_extension(flag: &str) -> Result<PluginRef> {
    let parts: Vec<&str> = flag.split(':').collect();
    if parts.is_empty() || parts.len() > 2 || parts[0].is_empty() {
        return Err(GatewayError::PluginFlag(format!(
            "expected name[:path-to-config.json], got {flag:?}"
        )));
    }

    let name = parts[0];
    let config = match parts.get(1) {
        Some(path) => Some(std::fs::read(path).map_err(|err| {
            GatewayError::PluginFlag(format!("could not read config {path}: {err}"))
        })?),
        None => None,
    };

    build(name, config.as_deref())
}

fn build(name: &str, config: Option<&[u8]>) -> Result<PluginRef> {
    let plugin: PluginRef = match name {
        "ratelimit" => {
            let cfg = match config {
                Some(raw) => serde_json::from_slice::<RateLimitConfig>(raw)
                    .map_err(|err| GatewayError::PluginFlag(format!("ratelimit config: {err}")))?,
                None => RateLimitConfig::default(),
            };
            Arc::new(RateLimit::new(cfg))
        }
        "httplog" => Arc::new(HttpLog::new()),
        "cache" => Arc::new(Cache::new(None)),
        "rbac" => Arc::new(Rbac::new(None)),
        other => {
            return Err(GatewayError::PluginFlag(format!(
                "unknown plugin name: {other}"
            )))
        }
    };
    Ok(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_known_names_resolve() {
        for name in ["ratelimit", "httplog", "cache", "rbac"] {
            let plugin = parse_extension(name).unwrap();
            assert!(plugin.name().contains(name));
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = parse_extension("jwt").unwrap_err();
        assert!(matches!(err, GatewayError::PluginFlag(_)));
    }

    #[test]
    fn test_malformed_flag_is_rejected() {
        assert!(parse_extension("").is_err());
        assert!(parse_extension("a:b:c").is_err());
    }

    #[test]
    fn test_ratelimit_config_file_is_loaded() {
        let mut file = tempfile_path();
        file.1
            .write_all(br#"{"capacity": 5.0, "fill_rate": 2.0}"#)
            .unwrap();
        let flag = format!("ratelimit:{}", file.0.display());
        let plugin = parse_extension(&flag).unwrap();
        assert_eq!(plugin.name(), "plugin.ratelimit");
        std::fs::remove_file(&file.0).ok();
    }

    #[test]
    fn test_missing_config_file_is_rejected() {
        let err = parse_extension("ratelimit:/no/such/file.json").unwrap_err();
        assert!(matches!(err, GatewayError::PluginFlag(_)));
    }

    fn tempfile_path() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "portico-plugin-cfg-{}.json",
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
