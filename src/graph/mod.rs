//! Microsoft Graph API client

pub mod client;
pub mod errors;
pub mod types;

pub use client::{
    ByteStream, Download, DriveTransport, GraphClient, Grant, IssuedTokens, RemoteResponse,
    TokenExchange,
};
pub use errors::RemoteError;
pub use types::{DriveItems, Entry};
