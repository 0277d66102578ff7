//! HTTP path resolution: `/{pluginId}/v{version}/{subpath}` and virtual hosts.

use crate::message::{PluginId, PluginVersion};

/// A request path resolved to a plugin version.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRoute {
    pub plugin_id: PluginId,
    pub version: PluginVersion,
    /// Remainder of the path, always starting with `/`
    pub subpath: String,
}

impl ModuleRoute {
    /// First segment of the subpath, used to pick among web modules.
    pub fn mount(&self) -> Option<&str> {
        self.subpath
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
    }
}

/// Parse a direct module path. Returns `None` when the path is not of the
/// form `/{pluginId}/v{version}[/subpath]`.
pub fn parse_module_path(path: &str) -> Option<ModuleRoute> {
    let trimmed = path.trim_start_matches('/');
    let mut parts = trimmed.splitn(3, '/');

    let plugin_id = parts.next()?.parse::<i64>().ok().filter(|id| *id > 0)?;
    let version = parts.next()?;
    if !version.starts_with('v') {
        return None;
    }
    let version = version.parse::<PluginVersion>().ok()?;
    let rest = parts.next().unwrap_or("");

    Some(ModuleRoute {
        plugin_id: PluginId(plugin_id),
        version,
        subpath: normalize_subpath(rest),
    })
}

fn normalize_subpath(rest: &str) -> String {
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Host header without port, lowercased.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Join a virtual host's mapping with the request path.
pub fn join_mapping(mapping: &str, request_path: &str) -> String {
    let request_path = request_path.trim_matches('/');
    let mapping = mapping.trim_end_matches('/');
    if request_path.is_empty() {
        mapping.to_string()
    } else {
        format!("{}/{}", mapping, request_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_module_path() {
        let route = parse_module_path("/1/v1.0/test").unwrap();
        assert_eq!(route.plugin_id, PluginId(1));
        assert_eq!(route.version, PluginVersion(1.0));
        assert_eq!(route.subpath, "/test");
        assert_eq!(route.mount(), Some("test"));

        let root = parse_module_path("/101/v2.5").unwrap();
        assert_eq!(root.subpath, "/");
        assert_eq!(root.mount(), None);

        assert_eq!(parse_module_path("/1/v1.0/test/").unwrap().subpath, "/test");
        assert_eq!(parse_module_path("/1/v1.0/a/b").unwrap().subpath, "/a/b");
    }

    #[test]
    fn test_rejects_non_module_paths() {
        assert!(parse_module_path("/").is_none());
        assert!(parse_module_path("/health").is_none());
        assert!(parse_module_path("/1/1.0/x").is_none());
        assert!(parse_module_path("/0/v1.0").is_none());
        assert!(parse_module_path("/abc/v1.0").is_none());
    }

    #[test]
    fn test_vhost_join_matches_direct_path() {
        let joined = join_mapping("/1/v1.0/test", "/");
        assert_eq!(parse_module_path(&joined), parse_module_path("/1/v1.0/test"));
        assert_eq!(join_mapping("/1/v1.0/", "/orders/7"), "/1/v1.0/orders/7");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("WWW.Example.com:8443"), "www.example.com");
        assert_eq!(normalize_host("www.example.com."), "www.example.com");
    }
}
