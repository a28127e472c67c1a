//! Route lookup.
//!
//! # Responsibilities
//! - Compile route configs (matchers, methods, statement templates)
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Ordered by priority, then exact paths, then longer prefixes, then config order
//! - Methods are checked after matching so a wrong method yields 405, not 404

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use thiserror::Error;

use crate::config::schema::{OutputFormat, RouteConfig, VariableConfig};
use crate::gateway::template::{Template, TemplateError};
use crate::routing::matcher::{AndMatcher, Condition, Matcher};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route \"{route}\": {source}")]
    Template {
        route: String,
        #[source]
        source: TemplateError,
    },
    #[error("route \"{route}\": invalid method \"{method}\"")]
    Method { route: String, method: String },
}

/// Where a route's statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRef {
    Static(String),
    /// Request variable holding the upstream name.
    Variable(String),
}

impl UpstreamRef {
    fn parse(value: &str) -> Self {
        match value.strip_prefix('$') {
            Some(var) => UpstreamRef::Variable(var.to_string()),
            None => UpstreamRef::Static(value.to_string()),
        }
    }
}

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    matcher: AndMatcher,
    methods: Vec<Method>,
    pub upstream: UpstreamRef,
    pub template: Template,
    pub output: OutputFormat,
    pub binary: bool,
    pub meta_headers: bool,
    pub variables: Vec<VariableConfig>,
    pub priority: u32,
}

impl Route {
    pub fn compile(config: &RouteConfig) -> Result<Self, RouteError> {
        let mut conditions = Vec::new();
        if let Some(host) = &config.host {
            conditions.push(Condition::host(host.as_str()));
        }
        if let Some(path) = &config.path {
            conditions.push(Condition::Path(path.clone()));
        }
        if let Some(prefix) = &config.prefix {
            conditions.push(Condition::Prefix(prefix.clone()));
        }

        let methods = config
            .methods
            .iter()
            .map(|m| {
                m.to_ascii_uppercase().parse::<Method>().map_err(|_| RouteError::Method {
                    route: config.name.clone(),
                    method: m.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let template = Template::load(&config.query).map_err(|source| RouteError::Template {
            route: config.name.clone(),
            source,
        })?;

        Ok(Self {
            name: config.name.clone(),
            matcher: AndMatcher::new(conditions),
            methods,
            upstream: UpstreamRef::parse(&config.upstream),
            template,
            output: config.output,
            binary: config.binary,
            meta_headers: config.meta_headers,
            variables: config.variables.clone(),
            priority: config.priority,
        })
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Value of the `Allow` header for a 405.
    pub fn allow_header(&self) -> String {
        self.methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ")
    }

    fn has_host(&self) -> bool {
        self.matcher.conditions().iter().any(|c| matches!(c, Condition::Host(_)))
    }

    fn specificity(&self) -> usize {
        self.matcher.conditions().iter().map(Condition::specificity).max().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn from_config(configs: &[RouteConfig]) -> Result<Self, RouteError> {
        let mut routes = configs.iter().map(Route::compile).collect::<Result<Vec<_>, _>>()?;
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.has_host().cmp(&a.has_host()))
                .then_with(|| b.specificity().cmp(&a.specificity()))
        });
        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn match_request(&self, req: &Request<Body>) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matcher.matches(req)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, path: Option<&str>, prefix: Option<&str>) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            host: None,
            path: path.map(str::to_string),
            prefix: prefix.map(str::to_string),
            methods: Vec::new(),
            upstream: "db".to_string(),
            query: "SELECT 1".to_string(),
            output: OutputFormat::Text,
            binary: false,
            meta_headers: false,
            priority: 0,
            variables: Vec::new(),
        }
    }

    fn request(method: Method, host: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Host", host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_most_specific_route_wins() {
        let router = Router::from_config(&[
            route("catch_all", None, Some("/")),
            route("api", None, Some("/api")),
            route("users", Some("/api/users"), None),
        ])
        .unwrap();

        let hit = |uri| router.match_request(&request(Method::GET, "h", uri)).map(|r| r.name.clone());
        assert_eq!(hit("/api/users").as_deref(), Some("users"));
        assert_eq!(hit("/api/users/1").as_deref(), Some("api"));
        assert_eq!(hit("/other").as_deref(), Some("catch_all"));
    }

    #[test]
    fn test_priority_and_host() {
        let mut low = route("low", None, Some("/q"));
        low.host = Some("db.local".into());
        let mut high = route("high", None, Some("/"));
        high.priority = 10;
        let router = Router::from_config(&[low, high, route("any", None, Some("/q"))]).unwrap();

        let r = router.match_request(&request(Method::GET, "db.local", "/q")).unwrap();
        assert_eq!(r.name, "high");
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_methods_and_upstream_ref() {
        let mut config = route("users", Some("/users"), None);
        config.methods = vec!["get".into(), "POST".into()];
        config.upstream = "$arg_db".into();
        let route = Route::compile(&config).unwrap();

        assert!(route.allows(&Method::GET));
        assert!(!route.allows(&Method::DELETE));
        assert_eq!(route.allow_header(), "GET, POST");
        assert_eq!(route.upstream, UpstreamRef::Variable("arg_db".into()));
    }

    #[test]
    fn test_no_match() {
        let router = Router::from_config(&[route("users", Some("/users"), None)]).unwrap();
        assert!(router.match_request(&request(Method::GET, "h", "/nope")).is_none());
    }

    #[test]
    fn test_bad_template() {
        let mut config = route("bad", Some("/x"), None);
        config.query = "SELECT $a::nosuchtype".into();
        assert!(matches!(Router::from_config(&[config]), Err(RouteError::Template { .. })));
    }
}
