use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::retry::ErrorKind;
use crate::retry::KindPolicy;
use crate::retry::RetryKey;
use crate::retry::Severity;

/// One handled failure, as shown to notification surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Technical message from the failure itself.
    pub message: String,
    pub user_message: String,
    pub context: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    pub auto_retry: bool,
}

impl ErrorRecord {
    pub(crate) fn new(
        policy: &KindPolicy,
        message: String,
        user_message: Option<String>,
        key: &RetryKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: policy.kind,
            severity: policy.severity,
            message,
            user_message: user_message.unwrap_or_else(|| policy.user_message.to_string()),
            context: key.context.clone(),
            operation: key.operation.clone(),
            timestamp: Utc::now(),
            retryable: policy.retryable,
            auto_retry: policy.auto_retry,
        }
    }

    pub fn retry_key(&self) -> RetryKey {
        RetryKey::new(self.context.clone(), self.operation.clone())
    }
}
