pub mod auth;
pub mod client;
pub mod codec;
pub mod notifier;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod server;

pub use auth::{Authenticator, SessionDirectory, SessionGrant, SessionResolver};
pub use notifier::{
    CallbackError, CallbackTransport, DisconnectNotifier, HttpCallbackTransport, NotifyOutcome,
    RetryPolicy,
};
pub use registry::{ConnectionHandle, DisconnectNotice, Registration, Registry};
pub use router::{PublishOutcome, TopicRouter};
pub use server::{start, ServerConfig, ServerHandle};
