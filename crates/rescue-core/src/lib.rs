pub mod capability;
pub mod envelope;
pub mod errors;
pub mod geo;
pub mod ids;

pub use capability::{Capabilities, Capability};
pub use envelope::{Inbound, Outbound, Payload};
pub use errors::RelayError;
pub use geo::Position;
pub use ids::ConnectionId;
