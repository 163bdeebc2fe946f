//! Route patterns and the ordered route table.
//!
//! Pattern grammar: `/` separates segments, `:name` captures one path
//! segment, `:name<regex>` captures one segment that must match `regex`
//! anchored to the whole segment. Everything else is a literal matched
//! byte-for-byte. `/name/:name<[A-Za-z]+>` matches `/name/Tim` and binds
//! `name = "Tim"`, but not `/name/123`.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;

/// One compiled pattern segment.
#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Param(String),
    ParamRegex(String, Regex),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        let Some(rest) = raw.strip_prefix(':') else {
            return Self::Literal(raw.to_owned());
        };
        match rest.split_once('<') {
            Some((name, qualifier)) => {
                let pattern = qualifier
                    .strip_suffix('>')
                    .unwrap_or_else(|| panic!("unterminated regex qualifier in segment `{raw}`"));
                // Anchored so the qualifier must cover the whole segment.
                let re = Regex::new(&format!("^(?:{pattern})$"))
                    .unwrap_or_else(|e| panic!("invalid regex in segment `{raw}`: {e}"));
                Self::ParamRegex(name.to_owned(), re)
            }
            None => Self::Param(rest.to_owned()),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Literal(lit) => lit == candidate,
            Self::Param(_) => true,
            Self::ParamRegex(_, re) => re.is_match(candidate),
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::Param(name) | Self::ParamRegex(name, _) => Some(name),
        }
    }
}

/// A compiled route pattern.
///
/// Routes compare equal iff their original pattern strings compare equal;
/// the compiled form never participates in equality or hashing, so a route
/// can serve as a handler-map key component.
#[derive(Clone, Debug)]
pub struct Route {
    pattern: String,
    segments: Vec<Segment>,
}

impl Route {
    /// Compiles `pattern`.
    ///
    /// # Panics
    ///
    /// Panics on a malformed regex qualifier. Route registration happens in
    /// test setup code, where a bad pattern is a bug in the test itself.
    pub fn new(pattern: &str) -> Self {
        let segments = split(pattern).map(Segment::parse).collect();
        Self { pattern: pattern.to_owned(), segments }
    }

    /// The original pattern string.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Matches `path` against the pattern, returning the parameter bindings
    /// on success.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let candidates: Vec<&str> = split(path).collect();
        if candidates.len() != self.segments.len() {
            return None;
        }
        let mut bindings = HashMap::new();
        for (segment, candidate) in self.segments.iter().zip(&candidates) {
            if !segment.matches(candidate) {
                return None;
            }
            if let Some(name) = segment.name() {
                bindings.insert(name.to_owned(), (*candidate).to_owned());
            }
        }
        Some(bindings)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pattern())
    }
}

/// Insertion-ordered route table.
///
/// Resolution walks the table in registration order and returns the first
/// route that matches. Literal routes do not outrank parameterized ones;
/// ties go to whichever was registered first.
#[derive(Debug, Default)]
pub struct RouteMap {
    routes: Vec<Route>,
}

impl RouteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `route` unless an equal route is already present.
    pub fn add(&mut self, route: Route) {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    /// Returns the first registered route matching `path`.
    pub fn route_for(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_route_matches_exactly() {
        let route = Route::new("/users/all");
        assert!(route.matches("/users/all").is_some());
        assert!(route.matches("/users/one").is_none());
        assert!(route.matches("/users").is_none());
        assert!(route.matches("/users/all/x").is_none());
    }

    #[test]
    fn root_route_matches_root_only() {
        let route = Route::new("/");
        assert!(route.matches("/").is_some());
        assert!(route.matches("/x").is_none());
    }

    #[test]
    fn named_segment_binds_value() {
        let route = Route::new("/name/:name");
        let bindings = route.matches("/name/Tim").unwrap();
        assert_eq!(bindings.get("name").map(String::as_str), Some("Tim"));
    }

    #[test]
    fn one_binding_per_declared_parameter() {
        let route = Route::new("/say/:greeting/to/:name");
        let bindings = route.matches("/say/hello/to/Tim").unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings["greeting"], "hello");
        assert_eq!(bindings["name"], "Tim");
    }

    #[test]
    fn regex_qualifier_constrains_segment() {
        let route = Route::new("/name/:name<[A-Za-z]+>");
        assert!(route.matches("/name/Tim").is_some());
        assert!(route.matches("/name/123").is_none());
        assert!(route.matches("/name/Tim2").is_none());
    }

    #[test]
    fn regex_qualifier_is_anchored() {
        let route = Route::new("/id/:id<[0-9]{2}>");
        assert!(route.matches("/id/42").is_some());
        assert!(route.matches("/id/123").is_none());
    }

    #[test]
    fn matching_is_idempotent() {
        let route = Route::new("/name/:name");
        let first = route.matches("/name/Tim").unwrap();
        let second = route.matches("/name/Tim").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn routes_compare_by_pattern() {
        assert_eq!(Route::new("/a/:b"), Route::new("/a/:b"));
        assert_ne!(Route::new("/a/:b"), Route::new("/a/:c"));
    }

    #[test]
    fn first_registered_match_wins() {
        let mut map = RouteMap::new();
        map.add(Route::new("/:anything"));
        map.add(Route::new("/literal"));
        // Insertion order decides; the literal route never gets a look-in.
        let hit = map.route_for("/literal").unwrap();
        assert_eq!(hit.pattern(), "/:anything");
    }

    #[test]
    fn add_is_idempotent_by_pattern() {
        let mut map = RouteMap::new();
        map.add(Route::new("/a"));
        map.add(Route::new("/a"));
        assert!(map.route_for("/a").is_some());
        assert!(map.route_for("/b").is_none());
    }

    #[test]
    #[should_panic]
    fn malformed_qualifier_panics_at_compile() {
        Route::new("/name/:name<[A-Za-z+>");
    }
}
