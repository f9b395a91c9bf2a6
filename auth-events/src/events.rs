//! Payloads the auth service consumes and produces.
//!
//! Auth and Google payloads use snake_case keys; billing payloads use
//! camelCase. All of them travel inside the flat event envelope, so the
//! structs here carry payload fields only.

use std::collections::{BTreeMap, HashMap};

use event_backbone::rpc::Correlated;
use serde::{Deserialize, Serialize};

pub mod exchanges {
    pub const PROFILE_EVENTS: &str = "profile-events";
    pub const GOOGLE_EVENTS: &str = "google.events";
    pub const BILLING_EVENTS: &str = "billing.events";
    pub const AUTH_EVENTS: &str = "auth-events";
    pub const USER_EVENTS: &str = "user-events";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileUpdated {
    #[serde(default)]
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDeleted {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleLogin {
    pub email: String,
    pub name: String,
    pub avatar: String,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleLoginRequest {
    pub request_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub google_id: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub profile: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleLoginResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl GoogleLoginResponse {
    pub fn success(request_id: impl Into<String>, session_token: String, user_id: String) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            session_token: Some(session_token),
            error: None,
            user_id: Some(user_id),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>, user_id: Option<String>) -> Self {
        Self { request_id: request_id.into(), success: false, session_token: None, error: Some(error.into()), user_id }
    }
}

impl Correlated for GoogleLoginResponse {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub profile_data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailVerificationSuccess {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleCreationMetadata {
    pub suggested_role_name: String,
    pub all_permissions: Vec<String>,
    pub feature_permission_map: BTreeMap<String, Vec<String>>,
    pub role_description: String,
}

/// `plan.created`, `plan.updated` and `plan.deleted`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanEvent {
    pub plan_id: String,
    pub plan_name: String,
    pub is_active: bool,
    pub changed_fields: Vec<String>,
    pub role_metadata: Option<RoleCreationMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRoleMetadata {
    pub should_assign_role: bool,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub previous_roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub status: String,
    pub user_role_metadata: Option<UserRoleMetadata>,
}

impl SubscriptionEvent {
    /// Role to grant, when the subscription just became active and billing
    /// asked for an assignment.
    pub fn role_to_assign(&self) -> Option<&str> {
        match &self.user_role_metadata {
            Some(meta) if self.status == "active" && meta.should_assign_role => Some(meta.role_name.as_str()),
            _ => None,
        }
    }
}
