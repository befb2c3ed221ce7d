//! Egress validation for replay targets.
//!
//! A target passes only when its scheme is `http`/`https`, its host is not a
//! loopback name, and every address the host resolves to is public. Resolution
//! that yields nothing fails closed. The validated addresses are returned so
//! the outbound connection can be pinned to them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use url::{Host, Url};

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SsrfRejection(pub String);

impl From<SsrfRejection> for AppError {
    fn from(rejection: SsrfRejection) -> Self {
        AppError::SsrfRejected(rejection.0)
    }
}

/// A target that passed validation, with the addresses it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTarget {
    pub url: Url,
    /// Set for domain targets; the connection must use only these addresses.
    pub pinned: Option<(String, Vec<SocketAddr>)>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// System DNS through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Decides whether a replay may leave the host for a given URL.
#[async_trait]
pub trait EgressPolicy: Send + Sync {
    async fn check(&self, target: &str) -> Result<ValidatedTarget, SsrfRejection>;
}

pub struct SsrfValidator<R = DnsResolver> {
    resolver: R,
}

impl<R: Resolver> SsrfValidator<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub async fn validate(&self, target: &str) -> Result<ValidatedTarget, SsrfRejection> {
        let url = Url::parse(target)
            .map_err(|_| SsrfRejection("Invalid URL format".into()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(SsrfRejection(
                "Only HTTP and HTTPS protocols are allowed".into(),
            ));
        }

        let host = url
            .host()
            .ok_or_else(|| SsrfRejection("URL has no host".into()))?
            .to_owned();

        let (addrs, pinned_host) = match host {
            Host::Domain(domain) => {
                let lower = domain.to_ascii_lowercase();
                if lower == "localhost" || lower.ends_with(".localhost") {
                    return Err(SsrfRejection("Localhost hostnames are not allowed".into()));
                }
                let port = url.port_or_known_default().unwrap_or(80);
                let resolved = self.resolver.resolve(&lower, port).await.map_err(|err| {
                    SsrfRejection(format!("Could not resolve hostname {lower}: {err}"))
                })?;
                (resolved, Some(lower))
            }
            Host::Ipv4(ip) => (vec![literal(IpAddr::V4(ip), &url)], None),
            Host::Ipv6(ip) => (vec![literal(IpAddr::V6(ip), &url)], None),
        };

        if addrs.is_empty() {
            return Err(SsrfRejection(format!(
                "Could not resolve hostname: {}",
                url.host_str().unwrap_or_default()
            )));
        }

        if let Some(blocked) = addrs.iter().map(SocketAddr::ip).find(is_blocked) {
            if blocked.is_loopback() && pinned_host.is_none() {
                return Err(SsrfRejection("Localhost addresses are not allowed".into()));
            }
            return Err(SsrfRejection(format!(
                "Target IP {blocked} is in a private/local range"
            )));
        }

        Ok(ValidatedTarget {
            pinned: pinned_host.map(|host| (host, addrs)),
            url,
        })
    }
}

#[async_trait]
impl<R: Resolver> EgressPolicy for SsrfValidator<R> {
    async fn check(&self, target: &str) -> Result<ValidatedTarget, SsrfRejection> {
        self.validate(target).await
    }
}

fn literal(ip: IpAddr, url: &Url) -> SocketAddr {
    SocketAddr::new(ip, url.port_or_known_default().unwrap_or(80))
}

pub fn is_blocked(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: &Ipv4Addr) -> bool {
    // 127/8, 10/8, 172.16/12, 192.168/16, 169.254/16, 0.0.0.0
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(&v4);
    }
    let first = ip.segments()[0];
    (first & 0xfe00) == 0xfc00 // fc00::/7
        || (first & 0xffc0) == 0xfe80 // fe80::/10
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FixedResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
            Ok(self
                .0
                .get(host)
                .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
                .unwrap_or_default())
        }
    }

    fn validator() -> SsrfValidator<FixedResolver> {
        let mut hosts = HashMap::new();
        hosts.insert("public.example", vec!["93.184.216.34".parse().unwrap()]);
        hosts.insert("internal.example", vec!["10.1.2.3".parse().unwrap()]);
        hosts.insert(
            "mixed.example",
            vec!["93.184.216.34".parse().unwrap(), "fd00::1".parse().unwrap()],
        );
        SsrfValidator::new(FixedResolver(hosts))
    }

    async fn rejects(target: &str) -> String {
        validator()
            .validate(target)
            .await
            .expect_err(&format!("{target} should be rejected"))
            .0
    }

    #[tokio::test]
    async fn rejects_private_and_loopback_literals() {
        for target in [
            "http://127.0.0.1/x",
            "http://192.168.1.1/x",
            "http://10.0.0.8/x",
            "http://172.20.0.1/x",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/x",
            "http://[::1]/x",
            "http://[fc00::5]/x",
            "http://[fe80::1]/x",
            "http://[::ffff:127.0.0.1]/x",
        ] {
            rejects(target).await;
        }
    }

    #[tokio::test]
    async fn rejects_non_http_schemes_and_garbage() {
        assert!(rejects("file:///etc/passwd").await.contains("HTTP"));
        assert!(rejects("gopher://public.example/").await.contains("HTTP"));
        assert_eq!(rejects("not a url").await, "Invalid URL format");
    }

    #[tokio::test]
    async fn rejects_localhost_names_before_resolving() {
        assert!(rejects("http://localhost:3000/x").await.contains("Localhost"));
        assert!(rejects("http://api.LOCALHOST/x").await.contains("Localhost"));
    }

    #[tokio::test]
    async fn checks_every_resolved_address() {
        assert!(rejects("https://internal.example/hook").await.contains("10.1.2.3"));
        assert!(rejects("https://mixed.example/hook").await.contains("fd00::1"));
    }

    #[tokio::test]
    async fn unresolvable_hosts_fail_closed() {
        assert!(rejects("https://nowhere.example/").await.contains("resolve"));
    }

    #[tokio::test]
    async fn accepts_public_targets_and_pins_them() {
        let target = validator()
            .validate("https://public.example/ok")
            .await
            .expect("public host should pass");

        let (host, addrs) = target.pinned.expect("domain targets are pinned");
        assert_eq!(host, "public.example");
        assert_eq!(addrs, vec!["93.184.216.34:443".parse().unwrap()]);

        let literal = validator().validate("http://93.184.216.34/x").await.unwrap();
        assert!(literal.pinned.is_none());
    }
}
