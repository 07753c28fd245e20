//! Parallel Executor (spec §4.4): runs a request against every backend
//! concurrently, collects responses, then runs per-response callbacks
//! sequentially so Hash Index mutations stay serialized without widening
//! the hot lock.

use futures::future::join_all;

use crate::instance::OutboundRequest;
use crate::registry::InstanceRegistry;

/// One backend's response body, buffered in full (unlike the original's
/// deferred body read, `reqwest::Response` must be consumed to be reused
/// by the merger/maindata/try-all callers anyway).
pub struct FanOutResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
}

pub struct FanOutOutcome {
    pub instance_index: usize,
    pub response: Option<FanOutResponse>,
    pub errors: Vec<String>,
}

/// Issues `request` against every backend in parallel.
///
/// `filter(idx)` is evaluated before the HTTP call (after login); if it
/// returns `false` the backend is skipped silently — no entry appears in
/// the result. `callback(idx, response)` runs sequentially over every
/// collected result once the fan-out completes; an `Err` is appended to
/// that result's error list.
pub async fn parallel_responses<F, C>(
    registry: &InstanceRegistry,
    request: &OutboundRequest,
    filter: Option<F>,
    callback: Option<C>,
) -> Vec<FanOutOutcome>
where
    F: Fn(usize) -> bool,
    C: Fn(usize, &FanOutResponse) -> Result<(), String>,
{
    let tasks = registry.instances().iter().enumerate().map(|(idx, instance)| {
        let instance = instance.clone();
        let request = request.clone();
        let skip = filter.as_ref().map(|f| !f(idx)).unwrap_or(false);
        async move {
            if skip {
                return None;
            }

            let mut errors = Vec::new();

            if let Err(e) = instance.login().await {
                errors.push(e.to_string());
                return Some(FanOutOutcome { instance_index: idx, response: None, errors });
            }

            let builder = match instance.prepare_request(&request) {
                Ok(builder) => builder,
                Err(e) => {
                    errors.push(e.to_string());
                    return Some(FanOutOutcome { instance_index: idx, response: None, errors });
                }
            };

            match instance.do_request(builder).await {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    match resp.bytes().await {
                        Ok(body) => Some(FanOutOutcome {
                            instance_index: idx,
                            response: Some(FanOutResponse { status, headers, body }),
                            errors,
                        }),
                        Err(e) => {
                            errors.push(e.to_string());
                            Some(FanOutOutcome { instance_index: idx, response: None, errors })
                        }
                    }
                }
                Err(e) => {
                    errors.push(e.to_string());
                    Some(FanOutOutcome { instance_index: idx, response: None, errors })
                }
            }
        }
    });

    let mut outcomes: Vec<FanOutOutcome> = join_all(tasks).await.into_iter().flatten().collect();

    if let Some(cb) = callback {
        for outcome in outcomes.iter_mut() {
            if let Some(response) = &outcome.response {
                if let Err(e) = cb(outcome.instance_index, response) {
                    outcome.errors.push(e);
                }
            }
        }
    }

    outcomes
}

/// Joins every outcome's error list; empty if the fan-out was clean.
pub fn collect_errors(outcomes: &[FanOutOutcome]) -> Vec<String> {
    outcomes.iter().flat_map(|o| o.errors.iter().cloned()).collect()
}
