pub mod location;
pub mod messaging;
pub mod transport;
