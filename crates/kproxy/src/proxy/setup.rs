//! The operator-hostname surface: the certificate-installation page, the
//! root certificate download, and the embedded logo.

use std::sync::OnceLock;

use http::{HeaderValue, Method, Response, StatusCode, header};
use sha1::{Digest, Sha1};

use super::{Body, empty, full};
use crate::ca::Authority;

pub const LOGO_PNG: &[u8] = include_bytes!("assets/logo.png");
const SETUP_HTML: &str = include_str!("assets/setup.html");

const CA_CERT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";
const CA_CERT_DISPOSITION: &str = "attachment; filename=kproxy-root-ca.crt";

pub fn logo_etag() -> &'static str {
	static ETAG: OnceLock<String> = OnceLock::new();
	ETAG.get_or_init(|| {
		let digest = Sha1::digest(LOGO_PNG);
		format!("\"{}\"", hex::encode(digest))
	})
}

pub fn serve_logo(if_none_match: Option<&HeaderValue>) -> Response<Body> {
	let etag = logo_etag();
	if if_none_match.is_some_and(|v| v.to_str().is_ok_and(|v| v == etag)) {
		return Response::builder()
			.status(StatusCode::NOT_MODIFIED)
			.header(header::ETAG, etag)
			.body(empty())
			.expect("static response");
	}
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "image/png")
		.header(header::CACHE_CONTROL, "public, max-age=86400")
		.header(header::ETAG, etag)
		.body(full(LOGO_PNG))
		.expect("static response")
}

/// Route a request addressed to the operator hostname. Only GETs exist here.
pub fn route(authority: &Authority, method: &Method, path: &str) -> Response<Body> {
	if method != Method::GET {
		return Response::builder()
			.status(StatusCode::METHOD_NOT_ALLOWED)
			.body(empty())
			.expect("static response");
	}
	match path {
		"/" | "/setup" => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/html; charset=utf-8")
			.body(full(SETUP_HTML.as_bytes()))
			.expect("static response"),
		"/ca.crt" | "/setup/ca.crt" => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, CA_CERT_CONTENT_TYPE)
			.header(header::CONTENT_DISPOSITION, CA_CERT_DISPOSITION)
			.body(full(authority.root_ca_pem().to_vec()))
			.expect("static response"),
		"/.kproxy/logo.png" => serve_logo(None),
		_ => Response::builder()
			.status(StatusCode::NOT_FOUND)
			.header(header::CONTENT_TYPE, "text/html; charset=utf-8")
			.body(full(
				"<!doctype html><title>Not found</title><h1>Not found</h1>".as_bytes(),
			))
			.expect("static response"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn logo_is_a_png() {
		assert_eq!(&LOGO_PNG[..8], b"\x89PNG\r\n\x1a\n");
	}

	#[test]
	fn etag_round_trip_yields_304() {
		let first = serve_logo(None);
		assert_eq!(first.status(), StatusCode::OK);
		let etag = first.headers().get(header::ETAG).unwrap().clone();
		assert_eq!(
			first.headers().get(header::CACHE_CONTROL).unwrap(),
			"public, max-age=86400"
		);

		let second = serve_logo(Some(&etag));
		assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
	}
}
