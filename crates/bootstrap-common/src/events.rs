//! Cluster-visible bootstrap markers backed by core/v1 Events.
//!
//! The bootstrap announces success by creating a well-known Event, and can
//! wait for another well-known Event before tearing down. Both sides go
//! through the [`ClusterEvents`] trait so the orchestration can be exercised
//! without an API server.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Namespace holding the bootstrap success marker
pub const BOOTSTRAP_SUCCESS_NAMESPACE: &str = "kube-system";
/// Name of the bootstrap success marker
pub const BOOTSTRAP_SUCCESS_NAME: &str = "bootstrap-success";
/// Message carried by the bootstrap success marker
pub const BOOTSTRAP_SUCCESS_MESSAGE: &str = "Required control plane pods have been created";

/// Identifies an Event by namespace and name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRef {
    /// Namespace of the Event
    pub namespace: String,
    /// Name of the Event
    pub name: String,
}

impl EventRef {
    /// Create a reference from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The bootstrap success marker
    pub fn bootstrap_success() -> Self {
        Self::new(BOOTSTRAP_SUCCESS_NAMESPACE, BOOTSTRAP_SUCCESS_NAME)
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for EventRef {
    type Err = Error;

    /// Parse `<namespace>/<event-name>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(Error::config(format!(
                "tear down event name of format <namespace>/<event-name> expected, got: {:?}",
                s
            ))),
        }
    }
}

/// Outcome of creating an Event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCreation {
    /// The Event was created
    Created,
    /// An Event with the same name already existed
    AlreadyExists,
}

/// Creating and looking up marker Events on the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterEvents: Send + Sync {
    /// Create an Event carrying `message`
    async fn create_event(&self, event: &EventRef, message: &str) -> Result<EventCreation, Error>;

    /// Whether the Event exists
    async fn event_exists(&self, event: &EventRef) -> Result<bool, Error>;
}

/// Production implementation using the core/v1 Events API
pub struct KubeClusterEvents {
    client: Client,
}

impl KubeClusterEvents {
    /// Create a new instance using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Build the Event object for a marker
pub fn marker_event(event: &EventRef, message: &str) -> Event {
    let now = Time(Utc::now());
    Event {
        metadata: ObjectMeta {
            name: Some(event.name.clone()),
            namespace: Some(event.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            namespace: Some(event.namespace.clone()),
            ..Default::default()
        },
        message: Some(message.to_string()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterEvents for KubeClusterEvents {
    async fn create_event(&self, event: &EventRef, message: &str) -> Result<EventCreation, Error> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &event.namespace);
        match api
            .create(&PostParams::default(), &marker_event(event, message))
            .await
        {
            Ok(_) => Ok(EventCreation::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(EventCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn event_exists(&self, event: &EventRef) -> Result<bool, Error> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &event.namespace);
        match api.get(&event.name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ref_parses_namespace_and_name() {
        let parsed: EventRef = "kube-system/bootstrap-teardown".parse().unwrap();
        assert_eq!(parsed, EventRef::new("kube-system", "bootstrap-teardown"));
        assert_eq!(parsed.to_string(), "kube-system/bootstrap-teardown");
    }

    #[test]
    fn event_ref_rejects_other_shapes() {
        for bad in ["bootstrap-teardown", "a/b/c", "/name", "ns/", ""] {
            let err = bad.parse::<EventRef>().unwrap_err();
            assert!(
                err.to_string().contains("<namespace>/<event-name>"),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn success_marker_event_shape() {
        let event = marker_event(&EventRef::bootstrap_success(), BOOTSTRAP_SUCCESS_MESSAGE);
        assert_eq!(event.metadata.name.as_deref(), Some("bootstrap-success"));
        assert_eq!(event.metadata.namespace.as_deref(), Some("kube-system"));
        assert_eq!(event.involved_object.namespace.as_deref(), Some("kube-system"));
        assert_eq!(event.count, Some(1));
        assert_eq!(event.first_timestamp, event.last_timestamp);
        assert_eq!(event.message.as_deref(), Some(BOOTSTRAP_SUCCESS_MESSAGE));
    }

    #[tokio::test]
    async fn mock_events_can_report_already_exists() {
        let mut events = MockClusterEvents::new();
        events
            .expect_create_event()
            .times(1)
            .returning(|_, _| Ok(EventCreation::AlreadyExists));

        let created = events
            .create_event(&EventRef::bootstrap_success(), "done")
            .await
            .unwrap();
        assert_eq!(created, EventCreation::AlreadyExists);
    }
}
