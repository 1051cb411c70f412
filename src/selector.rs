use bytes::Bytes;
use http::{Request, Uri};

pub type SelectError = Box<dyn std::error::Error + Send + Sync>;

/// Picks the upstream proxy a request should be cascaded through.
///
/// `Ok(None)` means "connect to the requested target directly".
pub trait ProxySelector: Send + Sync {
    fn select(&self, req: &Request<Bytes>) -> Result<Option<Uri>, SelectError>;
}

impl<F> ProxySelector for F
where
    F: Fn(&Request<Bytes>) -> Result<Option<Uri>, SelectError> + Send + Sync,
{
    fn select(&self, req: &Request<Bytes>) -> Result<Option<Uri>, SelectError> {
        self(req)
    }
}

/// Sends everything to one upstream proxy, except bypassed hosts
#[derive(Debug, Clone)]
pub struct FixedUpstream {
    upstream: Uri,
    bypass: Vec<String>,
}

impl FixedUpstream {
    pub fn new(upstream: Uri) -> Self {
        Self {
            upstream,
            bypass: Vec::new(),
        }
    }

    /// Hosts that skip the upstream.
    ///
    /// `example.com` matches only that host, `.example.com` matches the
    /// apex and every subdomain. Matching ignores case and the port.
    pub fn with_bypass<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass = hosts
            .into_iter()
            .map(|h| h.into().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        self
    }

    fn is_bypassed(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        self.bypass.iter().any(|pattern| match pattern.strip_prefix('.') {
            Some(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            None => host == *pattern,
        })
    }
}

impl ProxySelector for FixedUpstream {
    fn select(&self, req: &Request<Bytes>) -> Result<Option<Uri>, SelectError> {
        match request_host(req) {
            Some(host) if self.is_bypassed(&host) => Ok(None),
            _ => Ok(Some(self.upstream.clone())),
        }
    }
}

/// Host the client asked for, without port
fn request_host(req: &Request<Bytes>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    let header = req.headers().get(http::header::HOST)?.to_str().ok()?;
    let authority: http::uri::Authority = header.parse().ok()?;
    Some(authority.host().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn connect(target: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(target)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn fixed_upstream_selects_upstream() {
        let selector = FixedUpstream::new(Uri::from_static("http://proxy.local:3128"));
        let picked = selector.select(&connect("example.com:443")).unwrap();
        assert_eq!(picked, Some(Uri::from_static("http://proxy.local:3128")));
    }

    #[test]
    fn bypass_exact_and_suffix() {
        let selector = FixedUpstream::new(Uri::from_static("http://proxy.local:3128"))
            .with_bypass(["localhost", ".corp.example", " "]);

        assert_eq!(selector.select(&connect("localhost:8080")).unwrap(), None);
        assert_eq!(selector.select(&connect("corp.example:443")).unwrap(), None);
        assert_eq!(selector.select(&connect("git.CORP.example:443")).unwrap(), None);
        assert!(selector.select(&connect("notcorp.example:443")).unwrap().is_some());
        assert!(selector.select(&connect("example.com:443")).unwrap().is_some());
    }

    #[test]
    fn bypass_uses_host_header_for_origin_form() {
        let selector =
            FixedUpstream::new(Uri::from_static("http://proxy.local:3128")).with_bypass(["intranet"]);
        let req = Request::builder()
            .uri("/index.html")
            .header(http::header::HOST, "intranet:8080")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(selector.select(&req).unwrap(), None);
    }

    #[test]
    fn closures_are_selectors() {
        let selector = |req: &Request<Bytes>| -> Result<Option<Uri>, SelectError> {
            if req.uri().port_u16() == Some(25) {
                Err("smtp is not proxied".into())
            } else {
                Ok(None)
            }
        };
        assert!(selector.select(&connect("mail.example:25")).is_err());
        assert_eq!(selector.select(&connect("example.com:443")).unwrap(), None);
    }
}
