use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Uri};

pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Common representation of an HTTP request after parsing the start line and
/// host information. Owned exclusively by the connection handler.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parse an HTTP/1.x request target into a normalized [`ParsedRequest`].
///
/// The target may be absolute-form (`http://host[:port]/path`) or origin-form
/// (`/path`), in which case the `Host` header supplies the authority.
pub fn parse_http1_request(
    method: Method,
    target: &str,
    host_header: Option<&str>,
) -> Result<ParsedRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    if uri.scheme().is_some() {
        return parse_absolute_target(method, &uri);
    }

    if !target.starts_with('/') {
        bail!("request target must be origin-form (start with '/')");
    }

    let host_header = host_header
        .ok_or_else(|| anyhow!("request missing Host header required for origin-form target"))?;
    let (host, port) = parse_host_header(host_header)?;
    let port = port.unwrap_or(DEFAULT_HTTP_PORT);
    let path = if target.is_empty() {
        "/".to_string()
    } else {
        target.to_string()
    };

    Ok(ParsedRequest {
        method,
        host,
        port,
        path,
    })
}

fn parse_absolute_target(method: Method, uri: &Uri) -> Result<ParsedRequest> {
    match uri.scheme_str() {
        Some("http") | Some("HTTP") => {}
        Some(other) => bail!("unsupported scheme '{other}'"),
        None => bail!("request target missing scheme"),
    }
    let authority = uri
        .authority()
        .map(|auth| auth.as_str())
        .ok_or_else(|| anyhow!("request target missing authority"))?;
    let (host, port) = parse_host_header(authority)?;
    let port = port.unwrap_or(DEFAULT_HTTP_PORT);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(ParsedRequest {
        method,
        host,
        port,
        path,
    })
}

/// Parse a Host header value into a normalized lowercase host plus optional port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains('/')
        || trimmed.contains('?')
        || trimmed.contains('#')
        || trimmed.contains('\\')
    {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}

/// Return a path with query parameters removed for logging purposes.
pub fn redacted_path(path: &str) -> String {
    path.split('?').next().unwrap_or("/").to_string()
}

impl ParsedRequest {
    /// True when the method makes the request eligible for caching.
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Host formatted for dialing, with IPv6 literals bracketed.
    pub fn connect_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn origin_form_fills_default_port() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/resource", Some("example.com"))?;
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/resource");
        Ok(())
    }

    #[test]
    fn absolute_form_resolves_host_port_path() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://Example.ORG:8080/data?q=1", None)?;
        assert_eq!(parsed.host, "example.org");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/data?q=1");
        Ok(())
    }

    #[test]
    fn absolute_form_without_path_defaults_to_root() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://example.org", None)?;
        assert_eq!(parsed.path, "/");
        Ok(())
    }

    #[test]
    fn absolute_form_normalizes_ipv6_host() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://[2001:db8::10]/resource", None)?;
        assert_eq!(parsed.host, "2001:db8::10");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.connect_host(), "[2001:db8::10]");
        Ok(())
    }

    #[test]
    fn origin_form_without_host_header_is_rejected() {
        let err = parse_http1_request(Method::GET, "/resource", None).unwrap_err();
        assert!(
            err.to_string().contains("missing Host header"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn https_targets_are_rejected() {
        let err = parse_http1_request(Method::GET, "https://example.com/", None).unwrap_err();
        assert!(
            err.to_string().contains("unsupported scheme"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn non_origin_form_target_is_rejected() {
        let err =
            parse_http1_request(Method::GET, "example.com:443", Some("example.com")).unwrap_err();
        assert!(
            err.to_string().contains("origin-form"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn host_header_rejects_userinfo() {
        let err = parse_host_header("user@example.com").unwrap_err();
        assert!(
            err.to_string().contains("userinfo"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn host_header_rejects_path() {
        let err = parse_host_header("example.com/path").unwrap_err();
        assert!(
            err.to_string().contains("path or query"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn host_header_lowercases() -> Result<()> {
        let (host, port) = parse_host_header("Example.COM:8080")?;
        assert_eq!(host, "example.com");
        assert_eq!(port, Some(8080));
        Ok(())
    }

    #[test]
    fn cacheable_methods() -> Result<()> {
        let get = parse_http1_request(Method::GET, "/", Some("example.com"))?;
        let head = parse_http1_request(Method::HEAD, "/", Some("example.com"))?;
        let post = parse_http1_request(Method::POST, "/", Some("example.com"))?;
        assert!(get.is_cacheable_method());
        assert!(head.is_cacheable_method());
        assert!(!post.is_cacheable_method());
        Ok(())
    }

    #[test]
    fn redacted_path_strips_query() {
        assert_eq!(redacted_path("/a/b?token=secret"), "/a/b");
        assert_eq!(redacted_path("/plain"), "/plain");
    }
}
