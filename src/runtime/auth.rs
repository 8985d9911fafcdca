/// Identity an attempt runs as
///
/// Read from `kwargs.config.configurable.{auth_user, auth_permissions}` and made
/// available to code running inside the attempt through a task-local. The
/// task-local ends with the scoped future, so it cannot leak into the next
/// attempt executed on the same worker thread.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub identity: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Full user object as submitted, when one was
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub profile: Value,
}

impl AuthUser {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            permissions: Vec::new(),
            profile: Value::Null,
        }
    }

    /// Resolve the identity for a run.
    ///
    /// The structured fields count only when both `auth_user` and
    /// `auth_permissions` are present; otherwise `backup_user_id` applies. An
    /// explicit `null` user means the run is anonymous.
    pub fn from_kwargs(kwargs: &Map<String, Value>, backup_user_id: Option<&str>) -> Option<Self> {
        let configurable = kwargs
            .get("config")
            .and_then(|config| config.get("configurable"))
            .and_then(Value::as_object);

        let structured = configurable.and_then(|configurable| {
            Some((configurable.get("auth_user")?, configurable.get("auth_permissions")?))
        });
        let Some((user, permissions)) = structured else {
            if let Some(user_id) = backup_user_id {
                tracing::info!(user_id, "Setting auth to backup user_id");
            }
            return backup_user_id.map(AuthUser::new);
        };

        let permissions: Vec<String> = permissions
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let (identity, profile) = match user {
            Value::Null => return None,
            Value::String(identity) => (identity.clone(), Value::Null),
            Value::Object(fields) => {
                let identity = fields
                    .get("identity")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (identity, user.clone())
            }
            other => (other.to_string(), Value::Null),
        };

        Some(Self {
            identity,
            permissions,
            profile,
        })
    }
}

tokio::task_local! {
    static CURRENT_USER: Option<AuthUser>;
}

/// Run `fut` with `user` as the current identity
pub async fn scope<F: Future>(user: Option<AuthUser>, fut: F) -> F::Output {
    CURRENT_USER.scope(user, fut).await
}

/// Identity of the attempt the caller runs in, if any
pub fn current_user() -> Option<AuthUser> {
    CURRENT_USER.try_with(|user| user.clone()).ok().flatten()
}
