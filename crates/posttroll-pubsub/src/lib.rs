//! # posttroll-pubsub
//!
//! The Publisher (spec.md §4.F) and Subscriber (spec.md §4.G): the two
//! application-facing ends of the messaging substrate, built on top of
//! `posttroll-transport`'s sockets and `posttroll-discovery`'s
//! Broadcaster/Address Receiver.

pub mod publisher;
pub mod subscriber;

pub use publisher::{Publisher, PublisherOptions};
pub use subscriber::{Subscriber, SubscriberOptions};

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("transport error: {0}")]
    Transport(#[from] posttroll_transport::TransportError),
    #[error("discovery error: {0}")]
    Discovery(#[from] posttroll_discovery::DiscoveryError),
    #[error("message error: {0}")]
    Message(#[from] posttroll_types::MessageError),
    #[error("no live address found for service `{0}`")]
    AddressNotFound(String),
}

pub type Result<T> = std::result::Result<T, PubSubError>;
