pub mod client;
pub mod collection;
pub mod config;
pub mod conversation;
pub mod failure;
pub mod message;
pub mod messenger;
pub mod mock_transport;
pub mod registry;
pub mod transport;

mod sequence;

pub use client::ConversationClient;
pub use client::LocalServer;
pub use client::RemoteServer;
pub use client::ResponseTransport;
pub use collection::ConversationCollection;
pub use collection::ConversationInfo;
pub use config::CollectionConfig;
pub use config::RetryConfig;
pub use failure::Failure;
pub use failure::ServiceError;
pub use message::ConversationId;
pub use message::MessageKind;
pub use message::Payload;
pub use message::ServiceMessage;
pub use messenger::ClientMessenger;
pub use messenger::ServiceMessenger;
pub use registry::Service;
pub use registry::ServiceFactory;
pub use transport::MessageSink;
