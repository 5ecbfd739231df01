pub mod connector;
pub mod sync;

pub use connector::*;
pub use sync::*;
