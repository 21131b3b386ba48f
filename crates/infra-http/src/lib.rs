// Bitvault Infrastructure - Bitbucket Cloud REST adapter
// Implements: MetadataClient

pub mod client;
pub mod convert;
pub mod transport;
pub mod types;

pub use client::BitbucketClient;
pub use transport::{HttpTransport, ReqwestTransport};
