pub mod errors;
pub mod stage;

pub use errors::*;
pub use stage::*;
