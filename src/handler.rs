use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{ALLOW, CONTENT_LENGTH, HOST, HeaderName, HeaderValue, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use log::debug;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::hashutil::is_hex_hash;
use crate::sign::check_query_sign;
use crate::{APP_USER_AGENT, NodeBody, quick_response, warn_once_or_info};

pub(crate) const HEADER_X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

/// Redirects clients that reached the node under a hostname outside the
/// public allowlist to the canonical public host. Disabled via config or an
/// empty allowlist.
#[must_use]
pub(crate) fn check_host_redirect<B>(config: &Config, req: &Request<B>) -> Option<Response<NodeBody>> {
    if config.do_not_redirect_to_public_host || config.public_hosts.is_empty() {
        return None;
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let host = strip_port(host).to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    /* public_hosts entries are lowercased at config load */
    if config.public_hosts.iter().any(|h| *h == host) {
        return None;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let location = format!(
        "https://{}:{}{}",
        config.public_hosts[0], config.public_port, path_and_query
    );
    Some(redirect(&location))
}

/// Host header without the port. Bracketed IPv6 hosts lose the brackets;
/// bare IPv6 addresses pass through unchanged.
#[must_use]
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if host.bytes().filter(|&b| b == b':').count() != 1 {
        return host;
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

#[must_use]
fn redirect(location: &str) -> Response<NodeBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(
            LOCATION,
            HeaderValue::try_from(location).expect("redirect target is ASCII"),
        )
        .header(CONTENT_LENGTH, HeaderValue::from_static("0"))
        .body(crate::empty())
        .expect("response is valid")
}

fn check_method<B>(req: &Request<B>) -> Option<Response<NodeBody>> {
    if req.method() == Method::GET || req.method() == Method::HEAD {
        return None;
    }
    let mut response = quick_response(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed");
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
    Some(response)
}

/// Prefix dispatch over the node's HTTP surface. Every response carries the
/// node's identification header.
pub(crate) async fn route(cluster: &Arc<Cluster>, req: Request<Incoming>) -> Response<NodeBody> {
    let mut response = route_inner(cluster, req).await;
    response.headers_mut().insert(
        HEADER_X_POWERED_BY,
        HeaderValue::from_static(APP_USER_AGENT),
    );
    response
}

async fn route_inner(cluster: &Arc<Cluster>, req: Request<Incoming>) -> Response<NodeBody> {
    let config = cluster.config();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if let Some(hash) = path.strip_prefix("/download/") {
        if let Some(response) = check_method(&req) {
            return response;
        }
        if !is_hex_hash(hash) {
            return quick_response(StatusCode::NOT_FOUND, format!("{hash} is not a valid hash"));
        }
        if !check_query_sign(hash, &config.cluster_secret, &query) {
            return quick_response(StatusCode::FORBIDDEN, "Cannot verify signature");
        }

        debug!("Handling download {hash}");
        let hash = hash.to_string();
        return cluster.handle_download(&req, &hash).await;
    }

    if let Some(size) = path.strip_prefix("/measure/") {
        if let Some(response) = check_method(&req) {
            return response;
        }
        /* The measurement signature covers the full path, not just the size. */
        if !check_query_sign(&path, &config.cluster_secret, &query) {
            return quick_response(StatusCode::FORBIDDEN, "Cannot verify signature");
        }

        let n = match size.parse::<i64>() {
            Ok(n) => n,
            Err(err) => return quick_response(StatusCode::BAD_REQUEST, err.to_string()),
        };
        if !(0..=200).contains(&n) {
            return quick_response(
                StatusCode::BAD_REQUEST,
                format!("measure size {n} out of range (0, 200]"),
            );
        }
        return cluster.handle_measure(&req, n).await;
    }

    if let Some(rest) = path.strip_prefix("/api/") {
        let version = match rest.split_once('/') {
            Some((version, _)) => version,
            None => rest,
        };
        if version == "v0" {
            let sub = rest.strip_prefix("v0/").unwrap_or("");
            return crate::api::serve(cluster, &req, sub).await;
        }
        warn_once_or_info!("Unsupported api version `{version}` requested");
    } else if let Some(rest) = path.strip_prefix("/dashboard/") {
        if !config.dashboard_enable {
            return quick_response(StatusCode::NOT_FOUND, "404 page not found");
        }
        return crate::dashboard::serve(cluster, rest).await;
    } else if path == "/" || path == "/dashboard" {
        return redirect("/dashboard/");
    } else if path.strip_prefix("/bmclapi/").is_some() {
        /* Seam for the upstream hijack proxy; not part of the node core. */
        return quick_response(StatusCode::NOT_FOUND, "hijack proxy is not enabled");
    }

    quick_response(StatusCode::NOT_FOUND, "404 page not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.public_hosts = vec!["cdn.example.com".to_string(), "alt.example.com".to_string()];
        config.public_port = crate::nonzero!(8443);
        config
    }

    fn request(host: &str, uri: &str) -> Request<()> {
        Request::builder()
            .uri(uri)
            .header(HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("example.com:"), "example.com:");
        assert_eq!(strip_port(""), "");
    }

    #[test]
    fn unknown_host_redirects_to_public_host() {
        let config = test_config();
        let req = request("other.example.net:8443", "/download/abc?s=x&e=y");

        let resp = check_host_redirect(&config, &req).unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap().to_str().unwrap(),
            "https://cdn.example.com:8443/download/abc?s=x&e=y"
        );
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "0");
    }

    #[test]
    fn listed_host_passes_through() {
        let config = test_config();

        /* case-insensitive, port ignored */
        assert!(check_host_redirect(&config, &request("CDN.example.com:80", "/")).is_none());
        assert!(check_host_redirect(&config, &request("alt.example.com", "/")).is_none());
    }

    #[test]
    fn redirect_disabled_by_flag_or_empty_list() {
        let mut config = test_config();
        config.do_not_redirect_to_public_host = true;
        assert!(check_host_redirect(&config, &request("other.example.net", "/")).is_none());

        let mut config = test_config();
        config.public_hosts.clear();
        assert!(check_host_redirect(&config, &request("other.example.net", "/")).is_none());
    }

    #[test]
    fn missing_host_header_passes_through() {
        let config = test_config();
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(check_host_redirect(&config, &req).is_none());
    }
}
