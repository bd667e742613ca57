use std::net::IpAddr;

use async_trait::async_trait;
use url::Url;

/// Hostname resolution seam. The production resolver goes through tokio;
/// tests inject fixed answers.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

pub struct TokioResolver;

#[async_trait]
impl HostResolver for TokioResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        // Port is required by lookup_host; 0 keeps it out of the answer.
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// True when the URL matches at least one configured prefix by scheme,
/// host, effective port (scheme defaults applied) and segment-safe path
/// prefix. A bare scheme prefix like `https://` matches any host.
pub fn url_allowed_by_prefixes(raw_url: &str, prefixes: &[String]) -> bool {
    let raw_url = raw_url.trim();
    if raw_url.is_empty() || prefixes.is_empty() {
        return false;
    }
    let Ok(url) = Url::parse(raw_url) else {
        return false;
    };

    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return false;
        }
        // "https://" and "http://" allow the whole scheme.
        if let Some(scheme) = prefix.strip_suffix("://") {
            if !scheme.contains('/') {
                return url.scheme().eq_ignore_ascii_case(scheme);
            }
        }
        let Ok(allowed) = Url::parse(prefix) else {
            return false;
        };
        if !url.scheme().eq_ignore_ascii_case(allowed.scheme()) {
            return false;
        }
        let host_matches = match (url.host_str(), allowed.host_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        if !host_matches {
            return false;
        }
        if url.port_or_known_default() != allowed.port_or_known_default() {
            return false;
        }
        path_prefix_matches(url.path(), allowed.path())
    })
}

/// Segment-safe path prefix: `/v1` matches `/v1` and `/v1/data` but not
/// `/v1abc`.
fn path_prefix_matches(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Literal private-host check: loopback, RFC1918, link-local (including
/// the 169.254.0.0/16 metadata address), unspecified and `localhost`.
/// Non-IP hostnames are not denied at this level.
pub fn is_denied_private_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return true;
    }
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => is_denied_ip(ip),
        Err(_) => false,
    }
}

pub fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            // fe80::/10 link-local and v4-mapped private addresses.
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_denied_ip(IpAddr::V4(v4));
            }
            false
        }
    }
}

/// Check a host against the private-address classes. Literal IPs are
/// classified directly; hostnames are optionally resolved and denied when
/// any answer is private. Resolution failure passes through; the HTTP
/// layer will surface it.
pub async fn check_host(
    host: &str,
    resolve_dns: bool,
    resolver: &dyn HostResolver,
) -> Result<(), String> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err("empty host".to_string());
    }
    if is_denied_private_host(trimmed) {
        return Err(format!("host {trimmed} is a private or local address"));
    }
    if trimmed.parse::<IpAddr>().is_ok() || !resolve_dns {
        return Ok(());
    }
    match resolver.lookup(trimmed).await {
        Ok(addrs) => {
            for ip in addrs {
                if is_denied_ip(ip) {
                    return Err(format!("host {trimmed} resolves to private address {ip}"));
                }
            }
            Ok(())
        }
        Err(err) => {
            tracing::debug!(host = %trimmed, error = %err, "dns resolution failed, passing through");
            Ok(())
        }
    }
}
