//! Dispatcher (spec §4.3): classifies each incoming request by path/form
//! and selects a strategy — one of the debug endpoints, the synthesized
//! login, the Maindata Aggregator, a full `/torrents/info` fan-out-merge,
//! Least-Busy for `/torrents/add`, Try-All for single/multi-hash requests,
//! or round-robin passthrough.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::{self, FanOutOutcome, FanOutResponse};
use crate::instance::OutboundRequest;
use crate::merge::{self, MergeMode};
use crate::writer::write_response;

/// Upper bound the proxy buffers an inbound request body to before
/// forwarding (large uploads like `/torrents/add` torrent files still
/// travel in full; only form parsing for multipart is further capped).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
/// Multipart form fields are only parsed from the first slice of the body
/// (spec §4.3 "parse form (including multipart up to 128 KiB)").
const MULTIPART_FORM_LIMIT: usize = 128 * 1024;

pub enum Route {
    DebugLeastBusy,
    DebugExpireLogins,
    DebugPerInstance,
    SynthesizedLogin,
    Maindata,
    TorrentsInfo,
    TorrentsAdd,
    TryAll { hashes: Vec<String> },
    Passthrough,
}

/// Classifies a request by path prefix, first match wins, falling back to
/// the `hash`/`hashes` form fields and finally round-robin passthrough
/// (spec §4.3).
pub fn classify(path: &str, form: &HashMap<String, String>) -> Route {
    if path == "/debug/leastbusy" {
        return Route::DebugLeastBusy;
    }
    if path == "/debug/expirelogins" {
        return Route::DebugExpireLogins;
    }
    if path == "/debug/torrents/perinstance" {
        return Route::DebugPerInstance;
    }
    if path.starts_with("/api/v2/auth/login") {
        return Route::SynthesizedLogin;
    }
    if path.starts_with("/api/v2/sync/maindata") {
        return Route::Maindata;
    }
    if path.starts_with("/api/v2/torrents/info") {
        return Route::TorrentsInfo;
    }
    if path.starts_with("/api/v2/torrents/add") {
        return Route::TorrentsAdd;
    }
    if let Some(hash) = form.get("hash") {
        if !hash.is_empty() {
            return Route::TryAll { hashes: vec![hash.clone()] };
        }
    }
    if let Some(hashes) = form.get("hashes") {
        let list: Vec<String> = hashes.split('|').filter(|h| !h.is_empty()).map(str::to_string).collect();
        if !list.is_empty() {
            return Route::TryAll { hashes: list };
        }
    }
    Route::Passthrough
}

/// Axum fallback handler: every inbound request, whatever its path, lands
/// here and is routed by [`classify`].
pub async fn handle(State(engine): State<Arc<Engine>>, request: Request<Body>) -> Response {
    match handle_inner(&engine, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_inner(engine: &Engine, request: Request<Body>) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let body_bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read request body: {e}")))?;

    let form = parse_form(&parts.headers, query.as_deref(), &body_bytes).await;

    let outbound = OutboundRequest {
        method: parts.method.clone(),
        path: path.clone(),
        query: query.clone(),
        headers: parts.headers.clone(),
        body: body_bytes,
    };

    let route = classify(&path, &form);

    let (status, headers, body) = match route {
        Route::DebugLeastBusy => debug_least_busy(engine),
        Route::DebugExpireLogins => debug_expire_logins(engine),
        Route::DebugPerInstance => debug_per_instance(engine),
        Route::SynthesizedLogin => synthesized_login(),
        Route::Maindata => crate::maindata::aggregate(engine, &outbound).await?,
        Route::TorrentsInfo => {
            torrents_info(engine, &outbound, &engine.config.multiplexer.format.info.remove_fields).await?
        }
        Route::TorrentsAdd => least_busy(engine, &outbound).await?,
        Route::TryAll { hashes } => {
            if hashes.len() == 1 {
                try_all(engine, &outbound, &hashes[0]).await?
            } else {
                try_all_multi(engine, &outbound, &form, &hashes).await?
            }
        }
        Route::Passthrough => passthrough(engine, &outbound).await?,
    };

    Ok(write_response(status, headers, body))
}

/// Parses query-string and body form fields (urlencoded, or multipart up
/// to `MULTIPART_FORM_LIMIT`) into a flat map.
async fn parse_form(headers: &HeaderMap, query: Option<&str>, body: &Bytes) -> HashMap<String, String> {
    let mut form = HashMap::new();

    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            form.insert(k.into_owned(), v.into_owned());
        }
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/x-www-form-urlencoded") {
        for (k, v) in url::form_urlencoded::parse(body) {
            form.insert(k.into_owned(), v.into_owned());
        }
    } else if content_type.starts_with("multipart/form-data") {
        if let Ok(boundary) = multer::parse_boundary(content_type) {
            let slice = body.slice(0..body.len().min(MULTIPART_FORM_LIMIT));
            let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(slice) });
            let mut multipart = multer::Multipart::new(stream, boundary);
            while let Ok(Some(field)) = multipart.next_field().await {
                let Some(name) = field.name().map(str::to_string) else { continue };
                if let Ok(text) = field.text().await {
                    form.insert(name, text);
                }
            }
        }
    }

    form
}

fn debug_least_busy(engine: &Engine) -> (StatusCode, HeaderMap, Bytes) {
    let instance = engine.registry.least_busy(&engine.hash_index);
    (StatusCode::OK, HeaderMap::new(), Bytes::from(instance.host()))
}

fn debug_expire_logins(engine: &Engine) -> (StatusCode, HeaderMap, Bytes) {
    for instance in engine.registry.instances() {
        instance.expire_login();
    }
    (StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"all backend logins expired"))
}

fn debug_per_instance(engine: &Engine) -> (StatusCode, HeaderMap, Bytes) {
    let counts = engine.hash_index.counts_per_instance(engine.registry.len());
    let lines: Vec<String> = engine
        .registry
        .instances()
        .iter()
        .zip(counts.iter())
        .map(|(instance, count)| format!("{} - {count}", instance.base_url))
        .collect();
    (StatusCode::OK, HeaderMap::new(), Bytes::from(lines.join("\n")))
}

/// The multiplexer authenticates backends itself; clients need not
/// participate, so no backend is contacted here (spec §4.3 variant 4).
fn synthesized_login() -> (StatusCode, HeaderMap, Bytes) {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        HeaderValue::from_static("SID=torrent-mux; Path=/; HttpOnly"),
    );
    (StatusCode::OK, headers, Bytes::from_static(b"Ok."))
}

async fn passthrough(engine: &Engine, request: &OutboundRequest) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let instance = engine.registry.next_round_robin();
    instance.login().await?;
    let builder = instance.prepare_request(request)?;
    let response = instance.do_request(builder).await?;
    to_parts(response).await
}

async fn least_busy(engine: &Engine, request: &OutboundRequest) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let instance = engine.registry.least_busy(&engine.hash_index);
    instance.login().await?;
    let builder = instance.prepare_request(request)?;
    let response = instance.do_request(builder).await?;
    to_parts(response).await
}

async fn to_parts(response: reqwest::Response) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok((status, headers, body))
}

/// Try-All (spec §4.7): if the hash is known, only the owning backend is
/// contacted; otherwise every backend is tried and whichever responds 200
/// is assumed the owner. Exactly one success is required; zero or more
/// than one is an ambiguity error.
async fn try_all(engine: &Engine, request: &OutboundRequest, hash: &str) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let known_owner = engine.hash_index.get(hash);
    let filter = move |idx: usize| known_owner.map(|owner| owner == idx).unwrap_or(true);

    let outcomes = executor::parallel_responses(
        &engine.registry,
        request,
        Some(filter),
        None::<fn(usize, &FanOutResponse) -> std::result::Result<(), String>>,
    )
    .await;

    let successes: Vec<&FanOutOutcome> = outcomes
        .iter()
        .filter(|o| {
            o.errors.is_empty() && o.response.as_ref().map(|r| r.status == StatusCode::OK).unwrap_or(false)
        })
        .collect();

    match successes.len() {
        0 => Err(Error::TryAllAmbiguity(format!("no successful responses for hash {hash}"))),
        1 => {
            let outcome = successes[0];
            engine.hash_index.set(hash, outcome.instance_index);
            let response = outcome.response.as_ref().expect("checked Some above");
            Ok((response.status, response.headers.clone(), response.body.clone()))
        }
        _ => {
            tracing::error!(hash, count = successes.len(), "more than one successful response for hash");
            Err(Error::TryAllAmbiguity(format!("more than one successful response for hash {hash}")))
        }
    }
}

/// Splits a pipe-delimited `hashes` form value into one Try-All dispatch
/// per hash, merging the bodies concatenatively (spec §4.3 variant 8).
async fn try_all_multi(
    engine: &Engine,
    request: &OutboundRequest,
    form: &HashMap<String, String>,
    hashes: &[String],
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let mut first: Option<(StatusCode, HeaderMap)> = None;
    let mut combined = bytes::BytesMut::new();

    for hash in hashes {
        let per_hash_request = single_hash_request(request, form, hash);
        let (status, headers, body) = try_all(engine, &per_hash_request, hash).await?;
        if first.is_none() {
            first = Some((status, headers));
        }
        combined.extend_from_slice(&body);
    }

    let (status, headers) = first.unwrap_or((StatusCode::OK, HeaderMap::new()));
    Ok((status, headers, combined.freeze()))
}

/// Rebuilds `base` with its `hashes` field replaced by a single `hash`
/// value so each element of a multi-hash request becomes an ordinary
/// single-hash Try-All dispatch.
fn single_hash_request(base: &OutboundRequest, form: &HashMap<String, String>, hash: &str) -> OutboundRequest {
    let mut new_form = form.clone();
    new_form.remove("hashes");
    new_form.insert("hash".to_string(), hash.to_string());

    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(new_form.iter())
        .finish();

    let mut request = base.clone();
    if base.method == Method::GET {
        request.query = Some(encoded);
        request.body = Bytes::new();
    } else {
        request.body = Bytes::from(encoded);
    }
    request
}

/// `/api/v2/torrents/info` (spec §4.3 variant 6): fan out, array-merge
/// sorted by `added_on`, strip configured fields, and fully refresh the
/// Hash Index from the union of hashes this call observed.
pub async fn torrents_info(
    engine: &Engine,
    request: &OutboundRequest,
    remove_fields: &[String],
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let outcomes = executor::parallel_responses(
        &engine.registry,
        request,
        None::<fn(usize) -> bool>,
        None::<fn(usize, &FanOutResponse) -> std::result::Result<(), String>>,
    )
    .await;

    let errors = executor::collect_errors(&outcomes);
    if !errors.is_empty() {
        return Err(Error::FanOut(errors.join("; ")));
    }

    let mut bodies = Vec::new();
    let mut new_map: HashMap<String, usize> = HashMap::new();
    let mut first_headers: Option<HeaderMap> = None;

    for outcome in &outcomes {
        let Some(response) = &outcome.response else { continue };
        if first_headers.is_none() {
            first_headers = Some(response.headers.clone());
        }
        let parsed: Value = serde_json::from_slice(&response.body)?;
        if let Value::Array(items) = &parsed {
            for item in items {
                if let Some(hash) = item.get("hash").and_then(Value::as_str) {
                    new_map.insert(hash.to_string(), outcome.instance_index);
                }
            }
        }
        bodies.push(parsed);
    }

    engine.hash_index.replace_all(new_map);

    let merged = merge::merge(bodies, MergeMode::Array { sort_by: Some("added_on"), remove_fields });

    let body = if engine.config.multiplexer.format.pretty_print {
        serde_json::to_vec_pretty(&merged)?
    } else {
        serde_json::to_vec(&merged)?
    };

    Ok((StatusCode::OK, first_headers.unwrap_or_default(), Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn classifies_debug_endpoints() {
        assert!(matches!(classify("/debug/leastbusy", &form(&[])), Route::DebugLeastBusy));
        assert!(matches!(classify("/debug/expirelogins", &form(&[])), Route::DebugExpireLogins));
        assert!(matches!(classify("/debug/torrents/perinstance", &form(&[])), Route::DebugPerInstance));
    }

    #[test]
    fn classifies_synthesized_login_before_hash_check() {
        assert!(matches!(
            classify("/api/v2/auth/login", &form(&[("hash", "aa")])),
            Route::SynthesizedLogin
        ));
    }

    #[test]
    fn classifies_maindata_and_torrents_info_and_add() {
        assert!(matches!(classify("/api/v2/sync/maindata", &form(&[])), Route::Maindata));
        assert!(matches!(classify("/api/v2/torrents/info", &form(&[])), Route::TorrentsInfo));
        assert!(matches!(classify("/api/v2/torrents/add", &form(&[])), Route::TorrentsAdd));
    }

    #[test]
    fn classifies_single_hash_try_all() {
        match classify("/api/v2/torrents/pause", &form(&[("hash", "aa")])) {
            Route::TryAll { hashes } => assert_eq!(hashes, vec!["aa".to_string()]),
            _ => panic!("expected TryAll"),
        }
    }

    #[test]
    fn classifies_pipe_delimited_hashes_into_multiple_try_all_targets() {
        match classify("/api/v2/torrents/pause", &form(&[("hashes", "aa|bb|cc")])) {
            Route::TryAll { hashes } => assert_eq!(hashes, vec!["aa", "bb", "cc"]),
            _ => panic!("expected TryAll"),
        }
    }

    #[test]
    fn falls_back_to_passthrough() {
        assert!(matches!(classify("/api/v2/app/version", &form(&[])), Route::Passthrough));
    }

    #[test]
    fn single_hash_request_rewrites_get_query() {
        let base = OutboundRequest {
            method: Method::GET,
            path: "/api/v2/torrents/pause".to_string(),
            query: Some("hashes=aa%7Cbb".to_string()),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let form = form(&[("hashes", "aa|bb")]);
        let rewritten = single_hash_request(&base, &form, "aa");
        assert_eq!(rewritten.query.as_deref(), Some("hash=aa"));
    }
}
