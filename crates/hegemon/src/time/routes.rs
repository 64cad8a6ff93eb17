//! The courier route network.

use ahash::AHashMap;

/// Unordered location pair; routes are symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey(String, String);

impl RouteKey {
    fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    distance_km: f64,
    quality: f64,
}

/// Symmetric weighted graph of travel routes between named locations.
///
/// A missing edge means the locations are disconnected: the distance is
/// infinite. Each edge carries a quality factor, and the whole network
/// carries a single seasonal modifier; both scale courier speed.
#[derive(Debug)]
pub struct RouteNetwork {
    routes: AHashMap<RouteKey, Route>,
    seasonal_modifier: f64,
}

impl RouteNetwork {
    pub fn new() -> Self {
        Self {
            routes: AHashMap::new(),
            seasonal_modifier: 1.0,
        }
    }

    /// Adds or replaces a route with quality 1.0.
    pub fn add_route(&mut self, from: &str, to: &str, distance_km: f64) {
        self.routes.insert(
            RouteKey::new(from, to),
            Route {
                distance_km,
                quality: 1.0,
            },
        );
    }

    /// Removes a route; returns whether one existed.
    pub fn remove_route(&mut self, from: &str, to: &str) -> bool {
        self.routes.remove(&RouteKey::new(from, to)).is_some()
    }

    /// Distance in kilometers, or infinity when disconnected.
    pub fn distance(&self, from: &str, to: &str) -> f64 {
        self.routes
            .get(&RouteKey::new(from, to))
            .map_or(f64::INFINITY, |route| route.distance_km)
    }

    pub fn has_route(&self, from: &str, to: &str) -> bool {
        self.routes.contains_key(&RouteKey::new(from, to))
    }

    /// Quality factor of an edge; 1.0 for unknown edges.
    pub fn quality(&self, from: &str, to: &str) -> f64 {
        self.routes
            .get(&RouteKey::new(from, to))
            .map_or(1.0, |route| route.quality)
    }

    /// Sets an existing edge's quality factor; returns whether it existed.
    pub fn set_quality(&mut self, from: &str, to: &str, quality: f64) -> bool {
        match self.routes.get_mut(&RouteKey::new(from, to)) {
            Some(route) => {
                route.quality = quality;
                true
            }
            None => false,
        }
    }

    pub fn seasonal_modifier(&self) -> f64 {
        self.seasonal_modifier
    }

    pub fn set_seasonal_modifier(&mut self, modifier: f64) {
        self.seasonal_modifier = modifier;
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl Default for RouteNetwork {
    fn default() -> Self {
        Self::new()
    }
}
