mod category;
mod location;
mod ride;

pub use category::{Category, Pricing, Tier};
pub use location::{Coordinates, Place};
pub use ride::{
    Change, PaymentMethod, Precondition, Rating, RideRequest, Status as RideStatus, Transition,
    Trigger,
};
