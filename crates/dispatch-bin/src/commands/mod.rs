//! Operator commands. Each runs against the store directly and exits; none
//! of them need the broker.

pub mod deliveries;
pub mod emit;
pub mod endpoints;
