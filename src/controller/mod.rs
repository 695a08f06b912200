//! Controllers for the DevServer operator's custom resources.
//!
//! - [`reconcile_devserver`]: drives a DevServer toward its desired state
//! - [`reconcile_user`]: provisions namespace and RBAC for a DevServerUser
//! - [`reconcile_flavor`]: validates a DevServerFlavor
//!
//! Each reconcile function pairs with an error policy that classifies the
//! failure per the operator's retry taxonomy.

mod devserver;
mod devserverflavor;
mod devserveruser;

pub use devserver::{error_policy as devserver_error_policy, reconcile_devserver, FINALIZER};
pub use devserverflavor::{error_policy as flavor_error_policy, reconcile_flavor};
pub use devserveruser::{error_policy as user_error_policy, reconcile_user};

use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;

use crate::config::OperatorConfig;
use crate::error::{OperatorError, Retry};

/// Shared context for all controllers.
pub struct Context {
    /// Kubernetes client.
    pub client: kube::Client,
    /// Kubernetes event recorder.
    pub recorder: Recorder,
    /// Operator configuration.
    pub config: OperatorConfig,
}

impl Context {
    /// Create a new controller context.
    pub fn new(client: kube::Client, config: OperatorConfig) -> Self {
        let recorder = Recorder::new(client.clone(), "devserver-operator".into());
        Self {
            client,
            recorder,
            config,
        }
    }

    /// Publish an event against a root object. Failures to record events
    /// never fail a reconcile.
    pub async fn publish<K>(&self, obj: &K, type_: EventType, reason: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            tracing::warn!(error = %err, reason, "Failed to publish event");
        }
    }
}

/// Map an error classification onto a requeue action.
pub(crate) fn action_for(error: &OperatorError) -> Action {
    match error.retry() {
        Retry::Backoff => Action::requeue(std::time::Duration::from_secs(5)),
        Retry::After(delay) => Action::requeue(delay),
        Retry::AwaitChange => Action::await_change(),
        // Fatal errors abort the controller streams in main; if one
        // reaches an error policy, back off rather than spin.
        Retry::Fatal => Action::requeue(std::time::Duration::from_secs(60)),
    }
}
