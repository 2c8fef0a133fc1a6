//! Discovery plane: advertisement records, the periodic Broadcaster, and
//! the Address Receiver table a Name Service hosts (spec.md §4.C, §4.D).

pub mod address_receiver;
pub mod advertisement;
pub mod broadcaster;

pub use address_receiver::AddressReceiver;
pub use advertisement::AdvertisementRecord;
pub use broadcaster::Broadcaster;

/// Errors arising from the discovery plane.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("transport error: {0}")]
    Transport(#[from] posttroll_transport::TransportError),
    #[error("message error: {0}")]
    Message(#[from] posttroll_types::MessageError),
    #[error("malformed advertisement payload: {0}")]
    MalformedAdvertisement(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
