//! Join request rewriting
//!
//! Rules are a static table of path fragments and a JSON transform. The
//! rewriter holds no mutable state, so one instance is shared by every
//! connection task.

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Uri};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const TELEPORT_FLAG: &str = "isTeleport";
pub const JOIN_ATTEMPT_ID: &str = "gameJoinAttemptId";

/// A request captured by the proxy, with its body fully buffered
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InterceptedRequest {
    /// True when the declared content type is JSON
    pub fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
            .unwrap_or(false)
    }
}

/// Mutates a parsed JSON object body, returning true if anything changed
pub type JsonTransform = fn(&mut Map<String, Value>) -> bool;

/// A watched endpoint set and the transform applied to matching bodies
#[derive(Clone)]
pub struct InterceptRule {
    patterns: Vec<String>,
    transform: JsonTransform,
}

impl InterceptRule {
    pub fn new<S: AsRef<str>>(patterns: &[S], transform: JsonTransform) -> Self {
        Self {
            // A blank fragment would match every path
            patterns: patterns
                .iter()
                .map(|p| p.as_ref().trim())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            transform,
        }
    }

    /// Check whether a request path contains any watched fragment
    pub fn matches_path(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| path.contains(p.as_str()))
    }
}

impl std::fmt::Debug for InterceptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRule")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

/// What the rewriter did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// Path matched no rule
    NotWatched,
    /// Path matched but the body is not declared as JSON
    NotJson,
    /// Path matched but the body is not a JSON object; left as-is
    Malformed,
    /// Body already carried every field the rule adds
    Unchanged,
    /// Body was transformed and re-serialized
    Rewritten,
}

/// Applies the first matching rule to an intercepted request
#[derive(Debug, Clone, Default)]
pub struct RequestRewriter {
    rules: Vec<InterceptRule>,
}

impl RequestRewriter {
    pub fn new(rules: Vec<InterceptRule>) -> Self {
        Self { rules }
    }

    /// The standard table: one teleport-join rule over the given endpoints
    pub fn teleport_join<S: AsRef<str>>(endpoints: &[S]) -> Self {
        Self::new(vec![InterceptRule::new(endpoints, teleport_join)])
    }

    /// Rewrite a request in place
    ///
    /// Never fails: a body that cannot be parsed is forwarded untouched.
    pub fn rewrite(&self, request: &mut InterceptedRequest) -> RewriteOutcome {
        let path = request.uri.path();
        let Some(rule) = self.rules.iter().find(|r| r.matches_path(path)) else {
            return RewriteOutcome::NotWatched;
        };

        if !request.is_json() {
            return RewriteOutcome::NotJson;
        }

        let mut body = match serde_json::from_slice::<Value>(&request.body) {
            Ok(Value::Object(map)) => map,
            _ => return RewriteOutcome::Malformed,
        };

        if !(rule.transform)(&mut body) {
            return RewriteOutcome::Unchanged;
        }

        match serde_json::to_vec(&Value::Object(body)) {
            Ok(bytes) => {
                request
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                request.body = Bytes::from(bytes);
                RewriteOutcome::Rewritten
            }
            Err(_) => RewriteOutcome::Malformed,
        }
    }
}

/// Mark a join as a teleport and give it a join-attempt id when missing
pub fn teleport_join(body: &mut Map<String, Value>) -> bool {
    let mut changed = false;

    if !body.contains_key(TELEPORT_FLAG) {
        body.insert(TELEPORT_FLAG.to_string(), Value::Bool(true));
        changed = true;
    }

    if !body.contains_key(JOIN_ATTEMPT_ID) {
        body.insert(
            JOIN_ATTEMPT_ID.to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );
        changed = true;
    }

    changed
}
