// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core data model: identifiers, action and resource kinds, statuses and records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Correlation key between a dispatched action and its eventual callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh request id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Generates `as_str`, `Display` and `FromStr` for a closed, lowercase-named enum.
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable lowercase name used in storage and on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::ValidationError {
                        field: $label.to_string(),
                        message: format!("unknown value '{}'", other),
                    }),
                }
            }
        }
    };
}

/// Lifecycle operation requested from the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Provision a new resource.
    Create,
    /// Start a stopped resource.
    Start,
    /// Stop a running resource.
    Stop,
    /// Tear the resource down for good.
    Terminate,
    /// Post-create configuration of a freshly provisioned resource.
    Configure,
    /// Re-apply configuration to a running resource.
    Reconfigure,
}

string_enum!(ActionKind, "action", {
    Create => "create",
    Start => "start",
    Stop => "stop",
    Terminate => "terminate",
    Configure => "configure",
    Reconfigure => "reconfigure",
});

/// Category of managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Primary notebook resource.
    Exploratory,
    /// Cluster attached to an exploratory resource.
    Computational,
}

string_enum!(ResourceKind, "resource_kind", {
    Exploratory => "exploratory",
    Computational => "computational",
});

impl ResourceKind {
    /// Result field carrying the host identifier for this kind.
    pub fn host_id_field(&self) -> &'static str {
        match self {
            Self::Exploratory => "notebook_name",
            Self::Computational => "hostname",
        }
    }

    /// Result field carrying the exposed URL list for this kind.
    pub fn url_field(&self) -> &'static str {
        match self {
            Self::Exploratory => "exploratory_url",
            Self::Computational => "computational_url",
        }
    }
}

/// Persisted status of a user resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserInstanceStatus {
    Creating,
    Starting,
    Configuring,
    Running,
    Reconfiguring,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Failed,
}

string_enum!(UserInstanceStatus, "status", {
    Creating => "creating",
    Starting => "starting",
    Configuring => "configuring",
    Running => "running",
    Reconfiguring => "reconfiguring",
    Stopping => "stopping",
    Stopped => "stopped",
    Terminating => "terminating",
    Terminated => "terminated",
    Failed => "failed",
});

impl UserInstanceStatus {
    /// True while an action is outstanding against the resource.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Creating
                | Self::Starting
                | Self::Configuring
                | Self::Reconfiguring
                | Self::Stopping
                | Self::Terminating
        )
    }
}

/// Owning key of a resource status record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Owning user.
    pub owner: String,
    /// Exploratory (notebook) name.
    pub exploratory_name: String,
    /// Computational name, only for computational resources.
    pub computational_name: Option<String>,
}

impl ResourceKey {
    /// Key of an exploratory resource.
    pub fn exploratory(owner: impl Into<String>, exploratory_name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            exploratory_name: exploratory_name.into(),
            computational_name: None,
        }
    }

    /// Key of a computational resource attached to an exploratory.
    pub fn computational(
        owner: impl Into<String>,
        exploratory_name: impl Into<String>,
        computational_name: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            exploratory_name: exploratory_name.into(),
            computational_name: Some(computational_name.into()),
        }
    }

    /// Storage form of the computational name; exploratory rows use the empty string.
    pub(crate) fn computational_column(&self) -> &str {
        self.computational_name.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.exploratory_name)?;
        if let Some(name) = &self.computational_name {
            write!(f, "/{}", name)?;
        }
        Ok(())
    }
}

/// A URL exposed by a provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUrl {
    /// Human-readable label (e.g. "Jupyter", "Spark UI").
    pub description: String,
    /// The URL itself.
    pub url: String,
}

/// Durable record of an outstanding request awaiting its callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHandler {
    pub request_id: RequestId,
    pub action: ActionKind,
    pub resource_kind: ResourceKind,
    pub owner: String,
    pub exploratory_name: String,
    pub computational_name: Option<String>,
    /// Route the execution layer posts the callback to.
    pub callback_uri: String,
    /// Dispatch context, passed on to follow-up actions.
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Process token holding the resolve claim, if any.
    pub claimed_by: Option<String>,
}

impl PendingHandler {
    /// Key of the resource this handler will update.
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            owner: self.owner.clone(),
            exploratory_name: self.exploratory_name.clone(),
            computational_name: self.computational_name.clone(),
        }
    }

    /// Descriptor handed to follow-up triggers.
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            resource_kind: self.resource_kind,
            key: self.resource_key(),
            context: self.context.clone(),
        }
    }
}

/// Resource identity plus dispatch context, as seen by follow-up triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_kind: ResourceKind,
    pub key: ResourceKey,
    pub context: serde_json::Value,
}

/// Durable current state of a managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatusRecord {
    pub key: ResourceKey,
    pub resource_kind: ResourceKind,
    pub status: UserInstanceStatus,
    /// Instance identifier(s); multiple hosts are joined with `;`.
    pub instance_id: Option<String>,
    /// Host identifier (notebook name or cluster hostname).
    pub host_id: Option<String>,
    pub urls: Vec<ResourceUrl>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceStatusRecord {
    /// Fresh record with no identifiers.
    pub fn new(key: ResourceKey, resource_kind: ResourceKind, status: UserInstanceStatus) -> Self {
        Self {
            key,
            resource_kind,
            status,
            instance_id: None,
            host_id: None,
            urls: Vec::new(),
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Copy of this record moved to `status`, touching `updated_at`.
    pub fn with_status(&self, status: UserInstanceStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_names() {
        for action in [
            ActionKind::Create,
            ActionKind::Start,
            ActionKind::Stop,
            ActionKind::Terminate,
            ActionKind::Configure,
            ActionKind::Reconfigure,
        ] {
            assert_eq!(action.as_str().parse::<ActionKind>().unwrap(), action);
        }
        assert_eq!(
            "RUNNING".parse::<UserInstanceStatus>().unwrap(),
            UserInstanceStatus::Running
        );
        assert_eq!(
            serde_json::to_value(ResourceKind::Computational).unwrap(),
            serde_json::json!("computational")
        );
    }

    #[test]
    fn test_unknown_enum_value() {
        let err = "bogus".parse::<ResourceKind>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("resource_kind"));
    }

    #[test]
    fn test_in_progress_statuses() {
        assert!(UserInstanceStatus::Creating.is_in_progress());
        assert!(UserInstanceStatus::Configuring.is_in_progress());
        assert!(!UserInstanceStatus::Running.is_in_progress());
        assert!(!UserInstanceStatus::Failed.is_in_progress());
    }

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::exploratory("alice", "nb").to_string(), "alice/nb");
        assert_eq!(
            ResourceKey::computational("alice", "nb", "spark").to_string(),
            "alice/nb/spark"
        );
        assert_eq!(ResourceKey::exploratory("a", "b").computational_column(), "");
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
