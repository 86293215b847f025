//! Records, value types and the ports the application layer is written against.

pub mod clock;
pub mod customer;
pub mod invoice;
pub mod ports;
pub mod transaction;
