use std::collections::HashMap;

use crate::entities::Category;
use crate::error::{validation_error, Error};
use crate::fare::calculate_fare;

/// Reference pricing data, read once per session and on every resync.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    categories: HashMap<String, Category>,
}

impl Catalog {
    pub fn replace(&mut self, categories: Vec<Category>) {
        self.categories = categories
            .into_iter()
            .map(|category| (category.id.clone(), category))
            .collect();
    }

    pub fn get(&self, id: &str) -> Result<&Category, Error> {
        self.categories
            .get(id)
            .ok_or_else(|| validation_error(format!("unknown category {}", id)))
    }

    pub fn quote(&self, id: &str, distance_km: f64) -> Result<f64, Error> {
        Ok(calculate_fare(self.get(id)?, distance_km))
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[test]
fn quotes_known_categories_only() {
    let mut catalog = Catalog::default();
    catalog.replace(vec![Category::metered("standard", 5.0, 2.5, 8.0)]);

    assert_eq!(catalog.quote("standard", 10.0).unwrap(), 30.0);
    assert!(catalog.quote("limo", 10.0).unwrap_err().is_validation_error());
}
