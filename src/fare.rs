//! Fare calculation for ride requests.
//!
//! Prices are fixed when a request is created and never recomputed mid-trip.

use crate::entities::{Category, Pricing};

/// Price of a trip of `distance_km` in `category`, rounded to cents.
///
/// A non-positive distance yields `0.0`, which callers treat as "no route yet"
/// and must not submit.
pub fn calculate_fare(category: &Category, distance_km: f64) -> f64 {
    if !(distance_km > 0.0) {
        return 0.0;
    }

    let price = match &category.pricing {
        Pricing::Metered {
            base_fare,
            cost_per_km,
            min_fare,
        } => (base_fare + distance_km * cost_per_km).max(*min_fare),
        Pricing::Tiered { tiers } => tiers
            .iter()
            .find(|tier| tier.max_distance >= distance_km)
            .or_else(|| tiers.last())
            .map(|tier| tier.price)
            .unwrap_or(0.0),
    };

    round_to_cents(price)
}

/// Rounds half away from zero. The nudge keeps values like `2.675`, stored as
/// `2.67499…`, on the side a person would expect.
pub fn round_to_cents(value: f64) -> f64 {
    let scaled = value * 100.0;
    let nudged = scaled + scaled.signum() * 1e-7;

    nudged.round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Tier;

    fn metered() -> Category {
        Category::metered("standard", 5.0, 2.5, 8.0)
    }

    fn tiered() -> Category {
        Category::tiered(
            "airport",
            vec![
                Tier {
                    max_distance: 15.0,
                    price: 25.0,
                },
                Tier {
                    max_distance: 5.0,
                    price: 15.0,
                },
            ],
        )
    }

    #[test]
    fn metered_applies_minimum_fare() {
        assert_eq!(calculate_fare(&metered(), 1.0), 8.0);
    }

    #[test]
    fn metered_scales_with_distance() {
        assert_eq!(calculate_fare(&metered(), 10.0), 30.0);
        assert_eq!(calculate_fare(&metered(), 3.333), 13.33);
    }

    #[test]
    fn tiered_picks_first_covering_tier() {
        assert_eq!(calculate_fare(&tiered(), 2.0), 15.0);
        assert_eq!(calculate_fare(&tiered(), 5.0), 15.0);
        assert_eq!(calculate_fare(&tiered(), 5.1), 25.0);
    }

    #[test]
    fn tiered_falls_back_to_last_tier() {
        assert_eq!(calculate_fare(&tiered(), 20.0), 25.0);
    }

    #[test]
    fn tiered_without_tiers_is_free() {
        let category = Category::tiered("empty", vec![]);
        assert_eq!(calculate_fare(&category, 3.0), 0.0);
    }

    #[test]
    fn non_positive_distance_is_unpriced() {
        assert_eq!(calculate_fare(&metered(), 0.0), 0.0);
        assert_eq!(calculate_fare(&metered(), -4.0), 0.0);
        assert_eq!(calculate_fare(&tiered(), f64::NAN), 0.0);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_to_cents(2.675), 2.68);
        assert_eq!(round_to_cents(1.005), 1.01);
        assert_eq!(round_to_cents(-1.005), -1.01);
        assert_eq!(round_to_cents(7.994), 7.99);
    }
}
