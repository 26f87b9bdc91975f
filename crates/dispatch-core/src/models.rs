//! Domain model: outbox events, webhook endpoints and deliveries.
//!
//! A [`Delivery`] carries its lifecycle as a [`DeliveryState`] tagged union, so
//! fields that only make sense in one state (a retry time, a response status)
//! live on that variant. Transitions are methods on `Delivery` and are the only
//! way the worker moves a delivery through its state machine:
//!
//! ```text
//! pending  --attempt--> delivered | retrying | failed | dead
//! retrying --attempt--> delivered | retrying | failed | dead
//! delivered | failed | dead --replay--> pending
//! ```

use crate::backoff::compute_backoff;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Attempt count at which a retryable delivery is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 5;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates a new random ID.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Creates an ID from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a staged outbox event (UUID string).
    EventId
);
string_id!(
    /// Identifier of a tenant. Every endpoint and delivery belongs to exactly one.
    TenantId
);
string_id!(
    /// Identifier of a webhook endpoint (UUID string).
    EndpointId
);
string_id!(
    /// Identifier of a delivery (UUID string).
    DeliveryId
);

// ============================================================================
// Outbox
// ============================================================================

/// Publication status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            other => Err(CoreError::InvalidData(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// A domain event staged in the outbox.
///
/// Written in the same transaction as the state change that produced it and
/// only ever mutated by the drain worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Input for staging a new outbox event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: Value,
}

impl NewOutboxEvent {
    pub fn new(tenant_id: impl Into<TenantId>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// A tenant-configured webhook receiver.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub tenant_id: TenantId,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    /// Creates a new enabled endpoint.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: EndpointId::new(),
            tenant_id: tenant_id.into(),
            url: url.into(),
            secret: secret.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("url", &self.url)
            .field("secret", &"[redacted]")
            .field("enabled", &self.enabled)
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Flat delivery status, used for storage and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Delivered, failed and dead deliveries only move again on replay.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Dead)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(CoreError::InvalidData(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a delivery, with the data each state carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DeliveryState {
    /// Waiting for its first attempt (or first attempt after a replay).
    Pending { next_attempt_at: DateTime<Utc> },
    /// A retryable attempt failed; the next one is due at `next_attempt_at`.
    Retrying {
        next_attempt_at: DateTime<Utc>,
        last_error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_status: Option<u16>,
    },
    /// The endpoint answered 2xx.
    Delivered { response_status: u16 },
    /// The endpoint answered with a non-retryable status.
    Failed {
        response_status: u16,
        last_error: String,
    },
    /// Retry budget exhausted, or the endpoint is disabled.
    Dead {
        last_error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_status: Option<u16>,
    },
}

impl DeliveryState {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Pending { .. } => DeliveryStatus::Pending,
            Self::Retrying { .. } => DeliveryStatus::Retrying,
            Self::Delivered { .. } => DeliveryStatus::Delivered,
            Self::Failed { .. } => DeliveryStatus::Failed,
            Self::Dead { .. } => DeliveryStatus::Dead,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending { next_attempt_at } | Self::Retrying { next_attempt_at, .. } => {
                Some(*next_attempt_at)
            }
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Retrying { last_error, .. }
            | Self::Failed { last_error, .. }
            | Self::Dead { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    pub fn response_status(&self) -> Option<u16> {
        match self {
            Self::Delivered { response_status } | Self::Failed { response_status, .. } => {
                Some(*response_status)
            }
            Self::Retrying {
                response_status, ..
            }
            | Self::Dead {
                response_status, ..
            } => *response_status,
            Self::Pending { .. } => None,
        }
    }

    /// Rebuilds a state from flat storage columns.
    ///
    /// Columns that must be set for `status` are required; columns that cannot
    /// exist in `status` must be `None`.
    pub fn from_parts(
        status: DeliveryStatus,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        response_status: Option<u16>,
    ) -> CoreResult<Self> {
        let missing = |column: &str| {
            CoreError::InvalidData(format!("{status} delivery is missing {column}"))
        };
        let unexpected = |column: &str| {
            CoreError::InvalidData(format!("{status} delivery cannot have {column}"))
        };

        match status {
            DeliveryStatus::Pending => {
                if last_error.is_some() {
                    return Err(unexpected("last_error"));
                }
                if response_status.is_some() {
                    return Err(unexpected("response_status"));
                }
                Ok(Self::Pending {
                    next_attempt_at: next_attempt_at.ok_or_else(|| missing("next_attempt_at"))?,
                })
            }
            DeliveryStatus::Retrying => Ok(Self::Retrying {
                next_attempt_at: next_attempt_at.ok_or_else(|| missing("next_attempt_at"))?,
                last_error: last_error.ok_or_else(|| missing("last_error"))?,
                response_status,
            }),
            DeliveryStatus::Delivered => {
                if next_attempt_at.is_some() {
                    return Err(unexpected("next_attempt_at"));
                }
                if last_error.is_some() {
                    return Err(unexpected("last_error"));
                }
                Ok(Self::Delivered {
                    response_status: response_status.ok_or_else(|| missing("response_status"))?,
                })
            }
            DeliveryStatus::Failed => {
                if next_attempt_at.is_some() {
                    return Err(unexpected("next_attempt_at"));
                }
                Ok(Self::Failed {
                    response_status: response_status.ok_or_else(|| missing("response_status"))?,
                    last_error: last_error.ok_or_else(|| missing("last_error"))?,
                })
            }
            DeliveryStatus::Dead => {
                if next_attempt_at.is_some() {
                    return Err(unexpected("next_attempt_at"));
                }
                Ok(Self::Dead {
                    last_error: last_error.ok_or_else(|| missing("last_error"))?,
                    response_status,
                })
            }
        }
    }
}

/// One attempt-tracked copy of an event bound for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: DeliveryId,
    pub tenant_id: TenantId,
    pub endpoint_id: EndpointId,
    pub event_id: EventId,
    pub event_type: String,
    pub payload: Value,
    pub attempts: u32,
    #[serde(flatten)]
    pub state: DeliveryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery of `event_type` for `endpoint`, due immediately.
    pub fn pending(
        event_id: EventId,
        event_type: impl Into<String>,
        payload: Value,
        endpoint: &Endpoint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            tenant_id: endpoint.tenant_id.clone(),
            endpoint_id: endpoint.id.clone(),
            event_id,
            event_type: event_type.into(),
            payload,
            attempts: 0,
            state: DeliveryState::Pending {
                next_attempt_at: now,
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.state.status()
    }

    /// Whether an attempt message for this delivery should be acted on at `now`.
    ///
    /// Retrying deliveries are due once `next_attempt_at` is within `tolerance`
    /// of `now`; terminal deliveries are never due.
    pub fn is_due(&self, now: DateTime<Utc>, tolerance: chrono::Duration) -> bool {
        match &self.state {
            DeliveryState::Pending { .. } => true,
            DeliveryState::Retrying {
                next_attempt_at, ..
            } => *next_attempt_at <= now + tolerance,
            _ => false,
        }
    }

    /// The endpoint answered 2xx.
    pub fn record_success(&self, response_status: u16, now: DateTime<Utc>) -> CoreResult<Self> {
        self.attempted("record success on", now, DeliveryState::Delivered { response_status })
    }

    /// The attempt failed in a retryable way.
    ///
    /// Moves to `Retrying` with the next backoff, or to `Dead` once the attempt
    /// count reaches [`MAX_ATTEMPTS`].
    pub fn record_retryable(
        &self,
        last_error: impl Into<String>,
        response_status: Option<u16>,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let attempts = self.attempts + 1;
        let last_error = last_error.into();
        let state = if attempts >= MAX_ATTEMPTS {
            DeliveryState::Dead {
                last_error,
                response_status,
            }
        } else {
            DeliveryState::Retrying {
                next_attempt_at: now + compute_backoff(attempts),
                last_error,
                response_status,
            }
        };
        self.attempted("retry", now, state)
    }

    /// The endpoint answered with a status that will not succeed on retry.
    pub fn record_terminal(
        &self,
        response_status: u16,
        last_error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        self.attempted(
            "fail",
            now,
            DeliveryState::Failed {
                response_status,
                last_error: last_error.into(),
            },
        )
    }

    /// Dead-letters without making an HTTP call (disabled endpoint).
    pub fn dead_letter(&self, reason: impl Into<String>, now: DateTime<Utc>) -> CoreResult<Self> {
        self.attempted(
            "dead-letter",
            now,
            DeliveryState::Dead {
                last_error: reason.into(),
                response_status: None,
            },
        )
    }

    /// Resets to `Pending` with zero attempts, due at `now`.
    ///
    /// Allowed from pending (a no-op reset) and from any terminal state.
    pub fn replay(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        if self.status() == DeliveryStatus::Retrying {
            return Err(CoreError::InvalidTransition {
                from: self.status(),
                action: "replay",
            });
        }
        Ok(Self {
            attempts: 0,
            state: DeliveryState::Pending {
                next_attempt_at: now,
            },
            updated_at: now,
            ..self.clone()
        })
    }

    fn attempted(
        &self,
        action: &'static str,
        now: DateTime<Utc>,
        state: DeliveryState,
    ) -> CoreResult<Self> {
        if self.state.is_terminal() {
            return Err(CoreError::InvalidTransition {
                from: self.status(),
                action,
            });
        }
        Ok(Self {
            attempts: self.attempts + 1,
            state,
            updated_at: now,
            ..self.clone()
        })
    }
}
