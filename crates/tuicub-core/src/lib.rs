pub mod errors;
pub mod ids;
pub mod messages;
pub mod security;
pub mod topic;

pub use errors::RelayError;
pub use ids::{ConnectionId, SessionId};
pub use messages::{Ack, ConnectRequest, DisconnectReason, Envelope, Event, PublisherMessage};
pub use security::SharedSecret;
pub use topic::Topic;
