pub mod messages;
pub mod payment;

pub use messages::*;
pub use payment::*;
