//! HTTP access used to download metagenome reads.

use std::io::{self, Read};
use std::time::Duration;

/// Response of a GET request. The body is only meaningful for status 200.
pub struct FetchResponse {
    pub status: u16,
    pub body: Box<dyn Read>,
}

/// Issues GET requests. Implemented over HTTP for real runs and in memory in tests.
pub trait Fetcher {
    fn get(&self, url: &str) -> io::Result<FetchResponse>;
}

/// Blocking HTTP fetcher
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> io::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| io::Error::other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &str) -> io::Result<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| io::Error::other(format!("Request to {} failed: {}", url, e)))?;
        Ok(FetchResponse {
            status: response.status().as_u16(),
            body: Box::new(response),
        })
    }
}
