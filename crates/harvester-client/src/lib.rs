//! Real network access for the harvesting pipeline, built on `reqwest`.

mod fetcher;

pub use fetcher::{FetcherConfig, ReqwestFetcher};
