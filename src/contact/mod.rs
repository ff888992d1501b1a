pub mod retry;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ContactsConfig;
use crate::dimension::key::KeyBuilder;
use crate::interaction::event::MessageEventKind;

use self::retry::{with_retry, RetryPolicy};

/// Per-contact record of which event was the first occurrence of each
/// message/instance/kind combination, as computed by the contact store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyBehaviorFacet {
    /// Canonical event id keyed by [`KeyBehaviorFacet::unique_event_key`].
    #[serde(default)]
    pub unique_events: Option<HashMap<String, Uuid>>,
}

impl KeyBehaviorFacet {
    /// Dictionary key the contact store uses for a combination.
    pub fn unique_event_key(message_id: Uuid, instance_id: Uuid, kind: MessageEventKind) -> String {
        KeyBuilder::with_capacity(80)
            .add(message_id)
            .add(instance_id)
            .add(kind.ordinal())
            .build()
    }

    /// Returns the event recorded as the first occurrence, if any.
    pub fn first_occurrence(
        &self,
        message_id: Uuid,
        instance_id: Uuid,
        kind: MessageEventKind,
    ) -> Option<Uuid> {
        let events = self.unique_events.as_ref()?;
        events
            .get(&Self::unique_event_key(message_id, instance_id, kind))
            .copied()
    }
}

/// A contact as returned by the contact store, with the requested facet.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: Uuid,
    pub key_behavior: Option<KeyBehaviorFacet>,
}

/// Errors from a single contact store request.
#[derive(Error, Debug)]
pub enum LookupError {
    /// Worth retrying: connection problems, timeouts, overload.
    #[error("transient failure fetching contact {contact_id}: {reason}")]
    Transient { contact_id: Uuid, reason: String },

    #[error("fetching contact {contact_id} failed: {reason}")]
    Permanent { contact_id: Uuid, reason: String },
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Contact store client.
pub trait ContactSource: Send + Sync {
    /// Fetch a contact expanded with the named facet.
    /// A contact the store does not know is `Ok(None)`.
    fn fetch_contact(
        &self,
        contact_id: Uuid,
        facet: &str,
    ) -> impl std::future::Future<Output = Result<Option<Contact>, LookupError>> + Send;
}

impl<S: ContactSource> ContactSource for std::sync::Arc<S> {
    fn fetch_contact(
        &self,
        contact_id: Uuid,
        facet: &str,
    ) -> impl std::future::Future<Output = Result<Option<Contact>, LookupError>> + Send {
        (**self).fetch_contact(contact_id, facet)
    }
}

/// HTTP-based contact store client.
pub struct HttpContactSource {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpContactSource {
    /// Create a new contact store client.
    pub fn new(cfg: &ContactsConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct ContactApiResponse {
    id: Uuid,
    #[serde(default)]
    facets: HashMap<String, serde_json::Value>,
}

impl ContactSource for HttpContactSource {
    async fn fetch_contact(
        &self,
        contact_id: Uuid,
        facet: &str,
    ) -> Result<Option<Contact>, LookupError> {
        let url = format!("{}/contacts/{}", self.endpoint, contact_id);
        debug!(%contact_id, facet, "fetching contact");

        let response = self
            .http
            .get(&url)
            .query(&[("expand", facet)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| classify_request_error(contact_id, &e))?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("unexpected status {status}: {body}");
            return Err(
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    LookupError::Transient { contact_id, reason }
                } else {
                    LookupError::Permanent { contact_id, reason }
                },
            );
        }

        let resp: ContactApiResponse =
            response
                .json()
                .await
                .map_err(|e| LookupError::Permanent {
                    contact_id,
                    reason: format!("decoding response: {e}"),
                })?;

        contact_from_response(resp, facet).map(Some)
    }
}

fn classify_request_error(contact_id: Uuid, e: &reqwest::Error) -> LookupError {
    let reason = e.to_string();
    if e.is_timeout() || e.is_connect() {
        LookupError::Transient { contact_id, reason }
    } else {
        LookupError::Permanent { contact_id, reason }
    }
}

fn contact_from_response(
    mut resp: ContactApiResponse,
    facet: &str,
) -> Result<Contact, LookupError> {
    let key_behavior = match resp.facets.remove(facet) {
        None | Some(serde_json::Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<KeyBehaviorFacet>(raw).map_err(|e| {
            LookupError::Permanent {
                contact_id: resp.id,
                reason: format!("decoding facet {facet:?}: {e}"),
            }
        })?),
    };

    Ok(Contact {
        id: resp.id,
        key_behavior,
    })
}

/// Callback type for recording lookup outcomes.
/// Receives (status, duration) where status is found/not_found/error.
pub type LookupMetricsFn = Box<dyn Fn(&'static str, Duration) + Send + Sync>;

/// Retrying front of a [`ContactSource`].
///
/// Lookups never fail from the caller's point of view: exhausted retries
/// and permanent errors are logged and reported as an absent contact.
pub struct ContactResolver<S> {
    source: S,
    facet: String,
    retry: RetryPolicy,
    metrics: Option<LookupMetricsFn>,
}

impl<S: ContactSource> ContactResolver<S> {
    pub fn new(source: S, facet: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            source,
            facet: facet.into(),
            retry,
            metrics: None,
        }
    }

    /// Set a metrics callback for recording lookup outcomes.
    pub fn with_metrics(mut self, cb: LookupMetricsFn) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolve a contact with the configured facet expanded.
    pub async fn resolve(&self, contact_id: Uuid) -> Option<Contact> {
        let start = Instant::now();

        let result = with_retry(
            &self.retry,
            LookupError::is_transient,
            |attempt, e| debug!(%contact_id, attempt, error = %e, "contact lookup attempt failed"),
            || self.source.fetch_contact(contact_id, &self.facet),
        )
        .await;

        match result {
            Ok(Some(contact)) => {
                self.record("found", start.elapsed());
                Some(contact)
            }
            Ok(None) => {
                self.record("not_found", start.elapsed());
                None
            }
            Err(e) => {
                warn!(%contact_id, error = %e, "contact lookup failed, treating contact as absent");
                self.record("error", start.elapsed());
                None
            }
        }
    }

    fn record(&self, status: &'static str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(status, duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn facet_with(message: u128, instance: u128, kind: MessageEventKind, event: u128) -> KeyBehaviorFacet {
        let mut events = HashMap::new();
        events.insert(
            KeyBehaviorFacet::unique_event_key(
                Uuid::from_u128(message),
                Uuid::from_u128(instance),
                kind,
            ),
            Uuid::from_u128(event),
        );
        KeyBehaviorFacet {
            unique_events: Some(events),
        }
    }

    #[test]
    fn test_unique_event_key_format() {
        let key = KeyBehaviorFacet::unique_event_key(
            Uuid::from_u128(1),
            Uuid::from_u128(2),
            MessageEventKind::Click,
        );
        assert_eq!(
            key,
            "00000000-0000-0000-0000-000000000001_00000000-0000-0000-0000-000000000002_1"
        );
    }

    #[test]
    fn test_first_occurrence_lookup() {
        let facet = facet_with(1, 2, MessageEventKind::Open, 9);
        assert_eq!(
            facet.first_occurrence(Uuid::from_u128(1), Uuid::from_u128(2), MessageEventKind::Open),
            Some(Uuid::from_u128(9))
        );
        assert_eq!(
            facet.first_occurrence(Uuid::from_u128(1), Uuid::from_u128(2), MessageEventKind::Click),
            None
        );
        assert_eq!(
            KeyBehaviorFacet::default().first_occurrence(
                Uuid::from_u128(1),
                Uuid::from_u128(2),
                MessageEventKind::Open
            ),
            None
        );
    }

    #[test]
    fn test_contact_from_response_extracts_facet() {
        let resp: ContactApiResponse = serde_json::from_value(serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000005",
            "facets": {
                "key_behavior_cache": {
                    "unique_events": {"a_b_0": "00000000-0000-0000-0000-000000000009"}
                },
                "personal": {"first_name": "Sam"}
            }
        }))
        .expect("valid response");

        let contact = contact_from_response(resp, "key_behavior_cache").expect("should decode");
        assert_eq!(contact.id, Uuid::from_u128(5));
        let facet = contact.key_behavior.expect("facet present");
        assert_eq!(
            facet.unique_events.and_then(|m| m.get("a_b_0").copied()),
            Some(Uuid::from_u128(9))
        );
    }

    #[test]
    fn test_contact_from_response_missing_facet() {
        let resp: ContactApiResponse = serde_json::from_value(serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000005"
        }))
        .expect("valid response");

        let contact = contact_from_response(resp, "key_behavior_cache").expect("should decode");
        assert!(contact.key_behavior.is_none());
    }

    #[test]
    fn test_contact_from_response_malformed_facet() {
        let resp: ContactApiResponse = serde_json::from_value(serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000005",
            "facets": {"key_behavior_cache": {"unique_events": ["not", "a", "map"]}}
        }))
        .expect("valid response");

        let err = contact_from_response(resp, "key_behavior_cache").expect_err("should fail");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("decoding facet"));
    }

    /// Fails with the given errors in order, then returns the contact.
    struct ScriptedSource {
        failures: parking_lot::Mutex<Vec<LookupError>>,
        contact: Option<Contact>,
        calls: AtomicUsize,
    }

    impl ContactSource for ScriptedSource {
        async fn fetch_contact(
            &self,
            _contact_id: Uuid,
            _facet: &str,
        ) -> Result<Option<Contact>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut failures = self.failures.lock();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next {
                Some(e) => Err(e),
                None => Ok(self.contact.clone()),
            }
        }
    }

    fn transient() -> LookupError {
        LookupError::Transient {
            contact_id: Uuid::from_u128(1),
            reason: "503".to_string(),
        }
    }

    fn permanent() -> LookupError {
        LookupError::Permanent {
            contact_id: Uuid::from_u128(1),
            reason: "400".to_string(),
        }
    }

    fn scripted(failures: Vec<LookupError>, contact: Option<Contact>) -> ScriptedSource {
        ScriptedSource {
            failures: parking_lot::Mutex::new(failures),
            contact,
            calls: AtomicUsize::new(0),
        }
    }

    fn sample_contact() -> Contact {
        Contact {
            id: Uuid::from_u128(1),
            key_behavior: Some(facet_with(1, 2, MessageEventKind::Open, 3)),
        }
    }

    #[tokio::test]
    async fn test_resolver_retries_transient_errors() {
        let resolver = ContactResolver::new(
            scripted(vec![transient(), transient()], Some(sample_contact())),
            "key_behavior_cache",
            RetryPolicy::fixed(3, Duration::ZERO),
        );

        let contact = resolver.resolve(Uuid::from_u128(1)).await;
        assert_eq!(contact, Some(sample_contact()));
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resolver_degrades_to_absent_after_budget() {
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&statuses);

        let resolver = ContactResolver::new(
            scripted(
                vec![transient(), transient(), transient()],
                Some(sample_contact()),
            ),
            "key_behavior_cache",
            RetryPolicy::fixed(2, Duration::ZERO),
        )
        .with_metrics(Box::new(move |status, _| recorded.lock().push(status)));

        assert!(resolver.resolve(Uuid::from_u128(1)).await.is_none());
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*statuses.lock(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_resolver_does_not_retry_permanent_errors() {
        let resolver = ContactResolver::new(
            scripted(vec![permanent()], Some(sample_contact())),
            "key_behavior_cache",
            RetryPolicy::fixed(5, Duration::ZERO),
        );

        assert!(resolver.resolve(Uuid::from_u128(1)).await.is_none());
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolver_not_found() {
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&statuses);

        let resolver = ContactResolver::new(
            scripted(Vec::new(), None),
            "key_behavior_cache",
            RetryPolicy::none(),
        )
        .with_metrics(Box::new(move |status, _| recorded.lock().push(status)));

        assert!(resolver.resolve(Uuid::from_u128(1)).await.is_none());
        assert_eq!(*statuses.lock(), vec!["not_found"]);
    }

    mod http {
        use super::*;
        use axum::extract::Path;
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::{Json, Router};

        async fn contact_handler(Path(id): Path<Uuid>) -> Result<Json<serde_json::Value>, StatusCode> {
            match id.as_u128() {
                1 => Ok(Json(serde_json::json!({
                    "id": id,
                    "facets": {
                        "key_behavior_cache": {
                            "unique_events": {"k": "00000000-0000-0000-0000-000000000009"}
                        }
                    }
                }))),
                2 => Err(StatusCode::NOT_FOUND),
                3 => Err(StatusCode::SERVICE_UNAVAILABLE),
                _ => Err(StatusCode::BAD_REQUEST),
            }
        }

        async fn serve() -> String {
            let app = Router::new().route("/contacts/:id", get(contact_handler));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind test listener");
            let addr = listener.local_addr().expect("local addr");
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            format!("http://{addr}/")
        }

        fn source(endpoint: String) -> HttpContactSource {
            HttpContactSource::new(&ContactsConfig {
                endpoint,
                timeout: Duration::from_secs(5),
                ..Default::default()
            })
            .expect("build client")
        }

        #[tokio::test]
        async fn test_http_source_found() {
            let src = source(serve().await);
            let contact = src
                .fetch_contact(Uuid::from_u128(1), "key_behavior_cache")
                .await
                .expect("lookup ok")
                .expect("contact present");
            assert_eq!(contact.id, Uuid::from_u128(1));
            assert!(contact.key_behavior.is_some());
        }

        #[tokio::test]
        async fn test_http_source_not_found() {
            let src = source(serve().await);
            let contact = src
                .fetch_contact(Uuid::from_u128(2), "key_behavior_cache")
                .await
                .expect("lookup ok");
            assert!(contact.is_none());
        }

        #[tokio::test]
        async fn test_http_source_classifies_status() {
            let src = source(serve().await);

            let unavailable = src
                .fetch_contact(Uuid::from_u128(3), "key_behavior_cache")
                .await
                .expect_err("503 should fail");
            assert!(unavailable.is_transient());

            let bad_request = src
                .fetch_contact(Uuid::from_u128(4), "key_behavior_cache")
                .await
                .expect_err("400 should fail");
            assert!(!bad_request.is_transient());
        }

        #[tokio::test]
        async fn test_http_source_classifies_request_errors() {
            let malformed = source("not a url".to_string())
                .fetch_contact(Uuid::from_u128(1), "key_behavior_cache")
                .await
                .expect_err("malformed endpoint should fail");
            assert!(!malformed.is_transient());

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind test listener");
            let addr = listener.local_addr().expect("local addr");
            drop(listener);

            let refused = source(format!("http://{addr}"))
                .fetch_contact(Uuid::from_u128(1), "key_behavior_cache")
                .await
                .expect_err("closed port should fail");
            assert!(refused.is_transient());
        }
    }
}
