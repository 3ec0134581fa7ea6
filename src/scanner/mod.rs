pub mod new_listings;

pub use new_listings::{ListingDiff, SeenSet};
