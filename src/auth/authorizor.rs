use oso::{Oso, PolarClass};

use crate::auth::{Platform, User};
use crate::entities::RideRequest;
use crate::error::Error;

pub fn new() -> Result<Oso, Error> {
    let mut o = Oso::new();

    o.register_class(Platform::get_polar_class())?;
    o.register_class(User::get_polar_class())?;
    o.register_class(RideRequest::get_polar_class())?;

    o.load_str(include_str!("rules.polar"))?;

    Ok(o)
}

#[cfg(test)]
fn searching_ride(customer_id: uuid::Uuid) -> RideRequest {
    use crate::entities::{Coordinates, PaymentMethod, Place};

    let place = Place::new("Harbour Rd", Coordinates { lat: 0.0, lng: 0.0 });

    RideRequest::new(
        customer_id,
        place.clone(),
        place,
        "standard".into(),
        PaymentMethod::Cash,
        3.0,
        10.0,
        chrono::Utc::now(),
    )
}

#[test]
fn platform_request_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let rider = User::rider(Uuid::new_v4());
    let driver = User::driver(Uuid::new_v4());

    let result = authorizor.is_allowed(rider, "request", Platform::default());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(driver, "request", Platform::default());
    assert_eq!(result.unwrap(), false);
}

#[test]
fn ride_customer_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let rider = User::rider(Uuid::new_v4());
    let stranger = User::rider(Uuid::new_v4());
    let ride = searching_ride(rider.id);

    let result = authorizor.is_allowed(rider.clone(), "read", ride.clone());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(rider.clone(), "cancel", ride.clone());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(rider.clone(), "accept", ride.clone());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(stranger.clone(), "read", ride.clone());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(stranger.clone(), "cancel", ride.clone());
    assert_eq!(result.unwrap(), false);
}

#[test]
fn ride_driver_before_and_after_accept_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let driver = User::driver(Uuid::new_v4());
    let mut ride = searching_ride(Uuid::new_v4());

    // before driver accepts

    let result = authorizor.is_allowed(driver.clone(), "accept", ride.clone());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(driver.clone(), "confirm_arrival", ride.clone());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(driver.clone(), "cancel", ride.clone());
    assert_eq!(result.unwrap(), false);

    ride.driver_id = Some(driver.id);

    // after driver accepts

    for action in ["read", "confirm_arrival", "start", "finish", "cancel"] {
        let result = authorizor.is_allowed(driver.clone(), action, ride.clone());
        assert_eq!(result.unwrap(), true, "{}", action);
    }

    let result = authorizor.is_allowed(driver.clone(), "rate", ride.clone());
    assert_eq!(result.unwrap(), false);

    // another driver

    let other = User::driver(Uuid::new_v4());

    for action in ["read", "confirm_arrival", "start", "finish", "cancel"] {
        let result = authorizor.is_allowed(other.clone(), action, ride.clone());
        assert_eq!(result.unwrap(), false, "{}", action);
    }
}

#[test]
fn ride_system_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let system = User::new_system_user();
    let ride = searching_ride(Uuid::new_v4());

    let result = authorizor.is_allowed(system.clone(), "cancel", ride.clone());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(system.clone(), "finish", ride.clone());
    assert_eq!(result.unwrap(), false);
}
