//! Upstream fetchers

mod http_fetcher;

pub use http_fetcher::HttpJsonFetcher;
