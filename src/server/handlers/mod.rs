pub mod offers;
pub mod quotes;
pub mod rides;
