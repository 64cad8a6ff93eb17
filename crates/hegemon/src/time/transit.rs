//! Components for scheduled events and messages in transit.
//!
//! Both live as ordinary entities in the [`World`](crate::world::World); the
//! time engine drains them on tick boundaries and despawns them exactly once
//! on their terminal delivery or execution.

use super::date::{GameDate, TickClass};
use super::routes::RouteNetwork;
use super::TimeConfig;
use serde::{Deserialize, Serialize};

/// A future event armed on the time engine's queue.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub event_id: String,
    /// Fires on the first qualifying tick at or after this date.
    pub when: GameDate,
    /// Smallest tick class allowed to fire it.
    pub class: TickClass,
    pub payload: String,
    /// `Some(h)` re-arms the event `h` hours after each firing.
    pub repeat_hours: Option<u32>,
}

impl ScheduledEvent {
    pub fn is_ready(&self, now: GameDate) -> bool {
        now >= self.when
    }
}

/// Category of an in-transit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CourierClass {
    Diplomatic,
    Trade,
    Military,
    Personal,
}

/// A message travelling between two locations.
#[derive(Debug, Clone)]
pub struct TransitMessage {
    pub message_id: String,
    pub from_location: String,
    pub to_location: String,
    pub payload: String,
    pub class: CourierClass,
    pub urgent: bool,
    pub sent: GameDate,
    pub expected_arrival: GameDate,
    pub distance_km: f64,
    pub speed_kmh: f64,
}

impl TransitMessage {
    pub fn is_delivered(&self, now: GameDate) -> bool {
        now >= self.expected_arrival
    }
}

/// Travel plan for one message: expected arrival plus the figures it was
/// computed from.
pub(super) struct TravelPlan {
    pub expected_arrival: GameDate,
    pub distance_km: f64,
    pub speed_kmh: f64,
}

/// Computes the delivery schedule for a message sent `from` → `to` at
/// `sent`. Effective speed is the base courier speed scaled by edge quality
/// and the seasonal modifier; disconnected locations fall back to a flat
/// delay but are still delivered.
pub(super) fn plan_travel(
    network: &RouteNetwork,
    config: &TimeConfig,
    from: &str,
    to: &str,
    urgent: bool,
    sent: GameDate,
) -> TravelPlan {
    let distance_km = network.distance(from, to);
    if !distance_km.is_finite() {
        let fallback_days = if urgent {
            config.urgent_fallback_days
        } else {
            config.routine_fallback_days
        };
        return TravelPlan {
            expected_arrival: sent.add_days(fallback_days),
            distance_km,
            speed_kmh: 0.0,
        };
    }

    let base_kmh = if urgent {
        config.urgent_speed_kmh
    } else {
        config.routine_speed_kmh
    };
    let speed_kmh = base_kmh * network.quality(from, to) * network.seasonal_modifier();
    let hours = (distance_km / speed_kmh).ceil() as i64;

    TravelPlan {
        expected_arrival: sent.add_hours(hours),
        distance_km,
        speed_kmh,
    }
}

#[cfg(test)]
mod tests {
    use super::super::date::GameDate;
    use super::super::routes::RouteNetwork;
    use super::super::TimeConfig;
    use super::plan_travel;

    fn sent() -> GameDate {
        GameDate::new(1066, 10, 14, 6)
    }

    #[test]
    fn routine_message_travels_at_two_kmh() {
        let mut network = RouteNetwork::new();
        network.add_route("London", "York", 300.0);

        let plan = plan_travel(&network, &TimeConfig::default(), "London", "York", false, sent());
        assert_eq!(plan.expected_arrival, sent().add_hours(150));
        assert_eq!(plan.speed_kmh, 2.0);
        assert_eq!(plan.distance_km, 300.0);
    }

    #[test]
    fn urgent_couriers_are_twice_as_fast_again() {
        let mut network = RouteNetwork::new();
        network.add_route("London", "York", 300.0);

        let plan = plan_travel(&network, &TimeConfig::default(), "London", "York", true, sent());
        assert_eq!(plan.expected_arrival, sent().add_hours(75));
    }

    #[test]
    fn quality_and_season_scale_the_speed() {
        let mut network = RouteNetwork::new();
        network.add_route("London", "York", 300.0);
        network.set_quality("London", "York", 0.5);
        network.set_seasonal_modifier(0.5);

        // 2 km/h * 0.5 * 0.5 = 0.5 km/h -> 600 hours.
        let plan = plan_travel(&network, &TimeConfig::default(), "London", "York", false, sent());
        assert_eq!(plan.expected_arrival, sent().add_hours(600));
    }

    #[test]
    fn disconnected_locations_use_the_fallback_delay() {
        let network = RouteNetwork::new();
        let config = TimeConfig::default();

        let routine = plan_travel(&network, &config, "London", "Atlantis", false, sent());
        assert_eq!(routine.expected_arrival, sent().add_days(3));
        assert!(routine.distance_km.is_infinite());

        let urgent = plan_travel(&network, &config, "London", "Atlantis", true, sent());
        assert_eq!(urgent.expected_arrival, sent().add_days(1));
    }
}
