mod handoff;
mod health;
mod lease;
mod primitives;

pub use handoff::*;
pub use health::*;
pub use lease::*;
pub use primitives::*;
