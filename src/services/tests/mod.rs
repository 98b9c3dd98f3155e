mod fetchers;
pub mod utils;
