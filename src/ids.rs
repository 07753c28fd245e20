//! Type-safe request identifiers
//!
//! Request IDs are TypeID-style strings (`req_<uuidv7>`) so that logs and the
//! `x-request-id` response header stay correlated and sortable by creation
//! time, matching `acton-service`'s `ids.rs`.

use mti::prelude::*;
use std::fmt;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};

/// A type-safe request identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(MagicTypeId);

impl RequestId {
    pub const PREFIX: &'static str = "req";

    /// Generate a new request id from a fresh, time-sortable UUIDv7.
    #[must_use]
    pub fn new() -> Self {
        Self(Self::PREFIX.create_type_id::<V7>())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generator plugged into `tower_http::request_id::SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<TowerRequestId> {
        let id = RequestId::new();
        let header_value = http::HeaderValue::from_str(id.as_str()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_has_expected_prefix() {
        let id = RequestId::new();
        assert!(id.as_str().starts_with("req_"));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn make_request_id_produces_header_value() {
        let mut maker = MakeTypedRequestId;
        let req = http::Request::builder().body(()).unwrap();
        let id = maker.make_request_id(&req);
        assert!(id.is_some());
    }
}
