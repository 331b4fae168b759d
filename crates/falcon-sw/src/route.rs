//! Request classification: an ordered rule table mapping each intercepted
//! request to a caching strategy. First matching rule wins.

use falcon_net::{Destination, Request, RequestMode};
use tracing::trace;
use url::Url;

/// Resolution policy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Serve from cache; go to the network only on a miss.
    CacheFirst,
    /// Go to the network; fall back to cache on failure.
    NetworkFirst,
    /// Serve from cache immediately and refresh in the background.
    StaleWhileRevalidate,
}

/// Pure test over a request's URL, destination, and mode.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Full URL contains any of the substrings.
    UrlContains(Vec<String>),
    /// Declared destination is one of these.
    DestinationIn(Vec<Destination>),
    /// Top-level navigation.
    Navigation,
    /// Custom test.
    Custom(fn(&Url, Destination, RequestMode) -> bool),
}

impl Predicate {
    /// Create a substring pattern list.
    pub fn url_contains<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::UrlContains(patterns.into_iter().map(Into::into).collect())
    }

    /// Check if a request matches.
    pub fn matches(&self, url: &Url, destination: Destination, mode: RequestMode) -> bool {
        match self {
            Predicate::UrlContains(patterns) => {
                let url_str = url.as_str();
                patterns.iter().any(|p| url_str.contains(p.as_str()))
            }
            Predicate::DestinationIn(destinations) => destinations.contains(&destination),
            Predicate::Navigation => mode == RequestMode::Navigate,
            Predicate::Custom(test) => test(url, destination, mode),
        }
    }
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub predicate: Predicate,
    pub strategy: Strategy,
}

/// Ordered rule table with a fallback strategy.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RouteRule>,
    fallback: Strategy,
}

impl Router {
    /// Create an empty router that sends everything to `fallback`.
    pub fn new(fallback: Strategy) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    /// The FalconTruck table:
    ///
    /// 1. always-fresh URL patterns → network-first
    /// 2. image / script / style / font → cache-first
    /// 3. navigation → stale-while-revalidate
    /// 4. anything else → cache-first
    pub fn with_network_first_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut router = Self::new(Strategy::CacheFirst);
        router.add_rule(Predicate::url_contains(patterns), Strategy::NetworkFirst);
        router.add_rule(
            Predicate::DestinationIn(vec![
                Destination::Image,
                Destination::Script,
                Destination::Style,
                Destination::Font,
            ]),
            Strategy::CacheFirst,
        );
        router.add_rule(Predicate::Navigation, Strategy::StaleWhileRevalidate);
        router
    }

    /// Append a rule after the existing ones.
    pub fn add_rule(&mut self, predicate: Predicate, strategy: Strategy) {
        self.rules.push(RouteRule {
            predicate,
            strategy,
        });
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Classify by parts.
    pub fn classify(&self, url: &Url, destination: Destination, mode: RequestMode) -> Strategy {
        let strategy = self
            .rules
            .iter()
            .find(|rule| rule.predicate.matches(url, destination, mode))
            .map(|rule| rule.strategy)
            .unwrap_or(self.fallback);
        trace!(url = %url, ?destination, ?mode, ?strategy, "Classified request");
        strategy
    }

    /// Classify a request.
    pub fn classify_request(&self, request: &Request) -> Strategy {
        self.classify(&request.url, request.destination, request.mode)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::with_network_first_patterns(["/api/", "supabase.co", "googleapis.com"])
    }
}
