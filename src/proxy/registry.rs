use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::config::RouteConfig;
use crate::error::{GatewayError, Result as GatewayResult};
use crate::guard::path_matches_prefix;

/// One upstream service reachable under a path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub name: String,
    pub prefix: String,
    pub target: String,
    pub strip_prefix: bool,
    pub health_path: String,
    /// Advisory only; resolution never consults it
    pub healthy: bool,
}

impl ServiceRoute {
    pub fn from_config(config: &RouteConfig) -> Self {
        Self {
            name: config.name.clone(),
            prefix: normalize_prefix(&config.prefix),
            target: config.target.trim_end_matches('/').to_string(),
            strip_prefix: config.strip_prefix,
            health_path: config.health_path.clone(),
            healthy: true,
        }
    }

    /// Path to request upstream for an inbound `path` under this route
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.strip_prefix || self.prefix == "/" {
            return path.to_string();
        }

        let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A route matched against a concrete inbound path
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route: Arc<ServiceRoute>,
    pub upstream_path: String,
}

impl ResolvedRoute {
    pub fn upstream_url(&self, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => {
                format!("{}{}?{}", self.route.target, self.upstream_path, query)
            }
            _ => format!("{}{}", self.route.target, self.upstream_path),
        }
    }
}

type RouteTable = Vec<Arc<ServiceRoute>>;

/// Longest-prefix route table. Reads take a lock-free snapshot; health
/// updates publish a whole new table.
pub struct ServiceRegistry {
    routes: ArcSwap<RouteTable>,
}

impl ServiceRegistry {
    pub fn new(routes: Vec<ServiceRoute>) -> Self {
        Self {
            routes: ArcSwap::from_pointee(Self::build_table(routes)),
        }
    }

    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let registry = Self::new(routes.iter().map(ServiceRoute::from_config).collect());
        for route in registry.routes().iter() {
            info!("Configured route {} -> {} ({})", route.prefix, route.target, route.name);
        }
        registry
    }

    // longest prefix first so the first match wins
    fn build_table(routes: Vec<ServiceRoute>) -> RouteTable {
        let mut table: RouteTable = routes.into_iter().map(Arc::new).collect();
        table.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        table
    }

    pub fn resolve(&self, path: &str) -> GatewayResult<ResolvedRoute> {
        let table = self.routes.load();
        table
            .iter()
            .find(|route| path_matches_prefix(path, &route.prefix))
            .map(|route| ResolvedRoute {
                route: Arc::clone(route),
                upstream_path: route.upstream_path(path),
            })
            .ok_or_else(|| GatewayError::NotFound(format!("no route matches {}", path)))
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Copy-on-write health update from the out-of-band checker
    pub fn set_health(&self, name: &str, healthy: bool) -> bool {
        let mut changed = false;
        self.routes.rcu(|table| {
            changed = false;
            let updated: RouteTable = table
                .iter()
                .map(|route| {
                    if route.name == name && route.healthy != healthy {
                        changed = true;
                        Arc::new(ServiceRoute {
                            healthy,
                            ..ServiceRoute::clone(route)
                        })
                    } else {
                        Arc::clone(route)
                    }
                })
                .collect();
            updated
        });

        if changed {
            if healthy {
                info!("Upstream {} is healthy again", name);
            } else {
                warn!("Upstream {} marked unhealthy", name);
            }
        }
        changed
    }
}
