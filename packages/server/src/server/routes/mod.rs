// HTTP routes
pub mod health;
pub mod record;

pub use health::*;
pub use record::*;
