// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Tags
//!
//! Builds the broker-visible identifier of a subscription:
//! `{prefix}:{host_ip}:{hostname}:{pid}:{random}` right-padded with `0` to a fixed
//! minimum width. The random component is what makes tags unique; the other
//! parts only help operators find the process behind a consumer.
//!
//! Host details are looked up once per process. The lookup may block on DNS,
//! so [`resolve_host`] runs it on the blocking pool at startup.

use std::{net::ToSocketAddrs, sync::OnceLock};
use tracing::{debug, warn};

/// Minimum length of a generated consumer tag.
pub const CONSUMER_TAG_WIDTH: usize = 72;
/// Filler used to pad tags to [`CONSUMER_TAG_WIDTH`].
pub const CONSUMER_TAG_FILLER: char = '0';

const FALLBACK_HOST_IP: &str = "127.0.0.1";

#[derive(Debug)]
struct HostInfo {
    ip: String,
    hostname: String,
}

static HOST_INFO: OnceLock<HostInfo> = OnceLock::new();

fn host_info() -> &'static HostInfo {
    HOST_INFO.get_or_init(|| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();

        let ip = (hostname.as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()).or_else(|| addrs.next()))
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| {
                debug!(host = hostname.as_str(), "hostname does not resolve");
                FALLBACK_HOST_IP.to_owned()
            });

        HostInfo { ip, hostname }
    })
}

/// Resolves the host details used in consumer tags on the blocking pool.
pub async fn resolve_host() {
    if HOST_INFO.get().is_some() {
        return;
    }

    if let Err(err) = tokio::task::spawn_blocking(|| {
        let host = host_info();
        debug!(ip = host.ip.as_str(), hostname = host.hostname.as_str(), "host resolved");
    })
    .await
    {
        warn!(error = err.to_string(), "failure to resolve host");
    }
}

/// Generates a new consumer tag for `prefix`.
pub fn consumer_tag(prefix: &str) -> String {
    let host = host_info();

    let tag = format!(
        "{}:{}:{}:{}:{}",
        prefix,
        host.ip,
        host.hostname,
        std::process::id(),
        rand::random::<u64>()
    );

    pad(tag)
}

fn pad(mut tag: String) -> String {
    let len = tag.chars().count();
    if len < CONSUMER_TAG_WIDTH {
        tag.extend(std::iter::repeat(CONSUMER_TAG_FILLER).take(CONSUMER_TAG_WIDTH - len));
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tags_are_unique_for_same_prefix() {
        let tags: HashSet<String> = (0..10_000).map(|_| consumer_tag("orders")).collect();
        assert_eq!(tags.len(), 10_000);
    }

    #[test]
    fn tag_starts_with_prefix_and_process() {
        let tag = consumer_tag("zz");
        let parts: Vec<&str> = tag.split(':').collect();

        assert_eq!(parts[0], "zz");
        assert_eq!(parts[3], std::process::id().to_string());
        assert!(tag.chars().count() >= CONSUMER_TAG_WIDTH);
    }

    #[test]
    fn tag_carries_local_hostname() {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let tag = consumer_tag("zz");

        assert!(tag.contains(&format!(":{}:{}:", hostname, std::process::id())));
    }

    #[tokio::test]
    async fn host_is_resolved_before_first_tag() {
        resolve_host().await;

        let host = HOST_INFO.get().unwrap();
        assert!(!host.ip.is_empty());
        assert_eq!(
            host.hostname,
            gethostname::gethostname().to_string_lossy().into_owned()
        );
    }

    #[test]
    fn short_tags_are_padded_with_filler() {
        let padded = pad("a:b".to_owned());
        assert_eq!(padded.len(), CONSUMER_TAG_WIDTH);
        assert!(padded.starts_with("a:b0"));
        assert!(padded[3..].chars().all(|c| c == CONSUMER_TAG_FILLER));
    }

    #[test]
    fn long_tags_are_left_untouched() {
        let long = "x".repeat(CONSUMER_TAG_WIDTH + 5);
        assert_eq!(pad(long.clone()), long);
    }
}
