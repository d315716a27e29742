use std::{convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Caller identity for quota bookkeeping, extracted from the request: the
/// forwarded address set by the reverse proxy when present, otherwise the
/// raw peer address.
pub struct ClientFingerprint(pub String);

impl<S> FromRequestParts<S> for ClientFingerprint
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self(caller_fingerprint(&parts.headers, peer)))
    }
}

pub fn caller_fingerprint(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| match peer {
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        })
}
