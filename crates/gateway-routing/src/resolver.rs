//! Route resolution.
//!
//! Matching is exact on the normalized path and the method. Paths such as
//! `/users/:id` are matched literally; no parameter interpolation happens.
//! When several active routes share a (method, path), the highest priority
//! wins, then the most recently created.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use gateway_core::{normalize_path, GatewayError, HttpMethod, Route};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source of route definitions
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// All active routes
    async fn list_active_routes(&self) -> Result<Vec<Route>, GatewayError>;

    /// Best active route for an exact (path, method)
    async fn find_route(&self, path: &str, method: HttpMethod) -> Result<Option<Route>, GatewayError>;
}

/// Route store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryRouteStore {
    routes: RwLock<Vec<Route>>,
}

impl InMemoryRouteStore {
    /// Create a store seeded with routes
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: RwLock::new(routes),
        }
    }

    /// Insert or replace a route by id
    pub fn upsert(&self, route: Route) {
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.id == route.id) {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
    }

    /// Remove a route by id
    pub fn remove(&self, id: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.id != id);
        routes.len() < before
    }

    /// Number of stored routes, inactive ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[async_trait]
impl RouteStore for InMemoryRouteStore {
    async fn list_active_routes(&self) -> Result<Vec<Route>, GatewayError> {
        Ok(self
            .routes
            .read()
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn find_route(&self, path: &str, method: HttpMethod) -> Result<Option<Route>, GatewayError> {
        let path = normalize_path(path);
        let routes = self.routes.read();
        let mut candidates: Vec<&Route> = routes
            .iter()
            .filter(|r| r.active && r.method == method && r.normalized_path() == path)
            .collect();
        candidates.sort_by(|a, b| precedence(a, b));
        Ok(candidates.first().map(|r| (*r).clone()))
    }
}

fn precedence(a: &Route, b: &Route) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.created_at.cmp(&a.created_at))
}

#[derive(Debug, Default)]
struct RouteTable {
    by_key: HashMap<(HttpMethod, String), Arc<Route>>,
    all: Vec<Arc<Route>>,
}

impl RouteTable {
    fn build(routes: Vec<Route>) -> Self {
        let mut all: Vec<Arc<Route>> = routes
            .into_iter()
            .filter(|r| r.active)
            .filter(|r| match r.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(route = %r.id, error = %e, "Skipping invalid route");
                    false
                }
            })
            .map(Arc::new)
            .collect();
        all.sort_by(|a, b| precedence(a, b));

        let mut by_key = HashMap::new();
        for route in &all {
            by_key
                .entry((route.method, route.normalized_path()))
                .or_insert_with(|| Arc::clone(route));
        }
        Self { by_key, all }
    }
}

/// Maps (method, path) to a route using a snapshot of the store
pub struct RouteResolver {
    store: Arc<dyn RouteStore>,
    table: ArcSwap<RouteTable>,
}

impl RouteResolver {
    /// Create a resolver and load the initial snapshot
    ///
    /// # Errors
    /// Returns the store's error if routes cannot be listed
    pub async fn new(store: Arc<dyn RouteStore>) -> Result<Self, GatewayError> {
        let resolver = Self {
            store,
            table: ArcSwap::from_pointee(RouteTable::default()),
        };
        resolver.reload().await?;
        Ok(resolver)
    }

    /// Create a resolver over an in-memory store seeded with `routes`
    #[must_use]
    pub fn from_routes(routes: Vec<Route>) -> Self {
        let table = RouteTable::build(routes.clone());
        Self {
            store: Arc::new(InMemoryRouteStore::new(routes)),
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Resolve a request to its route
    ///
    /// # Errors
    /// Returns `RouteNotFound` when no active route matches
    pub fn resolve(&self, path: &str, method: &str) -> Result<Arc<Route>, GatewayError> {
        let not_found = || GatewayError::route_not_found(method.to_ascii_uppercase(), path);
        let method_parsed: HttpMethod = method.parse().map_err(|_| not_found())?;
        let normalized = normalize_path(path);

        let table = self.table.load();
        match table.by_key.get(&(method_parsed, normalized)) {
            Some(route) => {
                debug!(route = %route.id, method = %method_parsed, path = %path, "Resolved route");
                Ok(Arc::clone(route))
            }
            None => Err(not_found()),
        }
    }

    /// Refresh the snapshot from the store, returning the active route count
    ///
    /// # Errors
    /// Returns the store's error; the previous snapshot stays in place
    pub async fn reload(&self) -> Result<usize, GatewayError> {
        let routes = self.store.list_active_routes().await?;
        let table = RouteTable::build(routes);
        let count = table.all.len();
        self.table.store(Arc::new(table));
        info!(routes = count, "Route table loaded");
        Ok(count)
    }

    /// Active routes in precedence order
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.table.load().all.clone()
    }

    /// Number of active routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().all.len()
    }

    /// Whether no route is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.load().all.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn route(id: &str, path: &str, priority: i32) -> Route {
        Route::new(id, path, HttpMethod::Get, "svc").with_priority(priority)
    }

    #[test]
    fn test_highest_priority_wins() {
        let resolver = RouteResolver::from_routes(vec![route("low", "/x", 1), route("high", "/x", 2)]);
        for _ in 0..5 {
            assert_eq!(resolver.resolve("/x", "GET").expect("route").id, "high");
        }
    }

    #[test]
    fn test_newest_wins_on_equal_priority() {
        let now = Utc::now();
        let resolver = RouteResolver::from_routes(vec![
            route("new", "/x", 0).with_created_at(now),
            route("old", "/x", 0).with_created_at(now - ChronoDuration::hours(1)),
        ]);
        assert_eq!(resolver.resolve("/x", "GET").expect("route").id, "new");
    }

    #[test]
    fn test_inactive_route_never_matches() {
        let resolver = RouteResolver::from_routes(vec![
            route("inactive", "/x", 100).with_active(false),
            route("active", "/x", 1),
        ]);
        assert_eq!(resolver.resolve("/x", "GET").expect("route").id, "active");

        let only_inactive = RouteResolver::from_routes(vec![route("off", "/y", 9).with_active(false)]);
        assert!(matches!(
            only_inactive.resolve("/y", "GET"),
            Err(GatewayError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_method_and_path_normalization() {
        let resolver = RouteResolver::from_routes(vec![route("users", "/api/users/", 0)]);
        assert!(resolver.resolve("/api/users", "get").is_ok());
        assert!(resolver.resolve("//api/users/", "GET").is_ok());
        assert!(resolver.resolve("/api/users", "POST").is_err());
        assert!(resolver.resolve("/api/users", "BREW").is_err());
    }

    #[test]
    fn test_placeholders_match_literally() {
        let resolver = RouteResolver::from_routes(vec![route("user", "/users/:id", 0)]);
        assert!(resolver.resolve("/users/:id", "GET").is_ok());
        assert!(resolver.resolve("/users/42", "GET").is_err());
    }

    #[test]
    fn test_not_found_error() {
        let resolver = RouteResolver::from_routes(vec![]);
        let err = resolver.resolve("/missing", "get").expect_err("should fail");
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
        assert!(resolver.is_empty());
    }

    #[tokio::test]
    async fn test_reload_picks_up_store_changes() {
        let store = Arc::new(InMemoryRouteStore::new(vec![route("a", "/a", 0)]));
        let resolver = RouteResolver::new(store.clone()).await.expect("resolver");
        assert!(resolver.resolve("/b", "GET").is_err());

        store.upsert(route("b", "/b", 0));
        assert!(store.remove("a"));
        assert_eq!(resolver.reload().await.expect("reload"), 1);

        assert!(resolver.resolve("/b", "GET").is_ok());
        assert!(resolver.resolve("/a", "GET").is_err());
    }

    #[tokio::test]
    async fn test_store_find_route_uses_precedence() {
        let store = InMemoryRouteStore::new(vec![route("low", "/x", 1), route("high", "/x", 5)]);
        let found = store
            .find_route("/x/", HttpMethod::Get)
            .await
            .expect("lookup")
            .expect("route");
        assert_eq!(found.id, "high");
    }

    #[test]
    fn test_invalid_routes_are_skipped() {
        let broken = route("broken", "/bad", 0)
            .with_rewrite(gateway_core::PathRewrite::new("(", "/"));
        let resolver = RouteResolver::from_routes(vec![broken, route("ok", "/ok", 0)]);
        assert_eq!(resolver.len(), 1);
    }
}
