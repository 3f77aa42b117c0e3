use serde::{Deserialize, Serialize};

/// A service tier a rider can pick, together with how it is priced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub pricing: Pricing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    Metered {
        base_fare: f64,
        cost_per_km: f64,
        min_fare: f64,
    },
    Tiered {
        tiers: Vec<Tier>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub max_distance: f64,
    pub price: f64,
}

impl Category {
    pub fn metered(id: impl Into<String>, base_fare: f64, cost_per_km: f64, min_fare: f64) -> Self {
        let id = id.into();

        Self {
            name: id.clone(),
            id,
            pricing: Pricing::Metered {
                base_fare,
                cost_per_km,
                min_fare,
            },
        }
    }

    /// Tiers are kept sorted by `max_distance` so lookups can take the first match.
    pub fn tiered(id: impl Into<String>, mut tiers: Vec<Tier>) -> Self {
        let id = id.into();
        tiers.sort_by(|a, b| a.max_distance.total_cmp(&b.max_distance));

        Self {
            name: id.clone(),
            id,
            pricing: Pricing::Tiered { tiers },
        }
    }
}
