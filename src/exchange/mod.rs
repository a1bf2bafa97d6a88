pub mod backoff;
pub mod client;

pub use client::ExchangeClient;
