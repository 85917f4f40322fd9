use actix_web::http::header::HeaderName;
use actix_web::HttpRequest;
use once_cell::sync::Lazy;
use std::net::{IpAddr, Ipv6Addr};

pub static X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

/// Marker used when no address can be found for the client.
pub const UNKNOWN: &str = "unknown";

/// Derives the key a request is counted under.
///
/// In order of preference:
///
/// 1. `user:<id>` for an authenticated user.
/// 2. `ip:<addr>` from the first entry of `X-Forwarded-For`.
/// 3. `ip:<addr>` from the connection peer address.
/// 4. `ip:unknown`.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    trust_forwarded_for: bool,
    group_ipv6: bool,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self {
            trust_forwarded_for: true,
            group_ipv6: false,
        }
    }
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore `X-Forwarded-For` and only use the connection peer address.
    ///
    /// # Security
    ///
    /// The forwarded header is set by the client unless a proxy you control overwrites it.
    /// Use this when clients connect directly to the application, otherwise any client can
    /// pick a fresh identifier on every request.
    pub fn ignore_forwarded_for(mut self) -> Self {
        self.trust_forwarded_for = false;
        self
    }

    /// Count IPv6 clients per /64 subnet rather than per address.
    ///
    /// A single IPv6 host usually controls a whole /64, so per-address counting is trivially
    /// bypassed.
    pub fn group_ipv6(mut self) -> Self {
        self.group_ipv6 = true;
        self
    }

    pub fn resolve(&self, req: &HttpRequest, user_id: Option<&str>) -> String {
        if let Some(user_id) = user_id.filter(|id| !id.is_empty()) {
            return format!("user:{user_id}");
        }
        format!("ip:{}", self.client_address(req))
    }

    fn client_address(&self, req: &HttpRequest) -> String {
        if self.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get(&*X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|first| !first.is_empty());
            if let Some(first) = forwarded {
                return match first.parse::<IpAddr>() {
                    Ok(ip) => self.ip_key(ip),
                    Err(_) => first.to_owned(),
                };
            }
        }
        match req.peer_addr() {
            Some(addr) => self.ip_key(addr.ip()),
            None => UNKNOWN.to_owned(),
        }
    }

    // Groups IPv6 addresses together, see:
    // https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
    fn ip_key(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return v4.to_string();
                }
                if !self.group_ipv6 {
                    return v6.to_string();
                }
                let s = v6.segments();
                let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
                format!("{subnet}/64")
            }
        }
    }
}
