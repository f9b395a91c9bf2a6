//! Auth service reactions to profile, Google and billing events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_backbone::envelope::time_prefixed_id;
use event_backbone::{decode_payload, event_types, with_deadline, EventBusError, EventPublisher, HandlerRegistry};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuthEventError, Result};
use crate::events::{
    exchanges, EmailVerificationSuccess, GoogleLogin, GoogleLoginRequest, GoogleLoginResponse, PlanEvent,
    ProfileDeleted, ProfileUpdated, SubscriptionEvent, UserRegistered,
};
use crate::memory::InMemoryAuthStore;
use crate::models::{Role, RoleScope, Session, UserAuth, UserRole};
use crate::repository::{
    CacheRepository, PermissionRepository, RoleRepository, SessionRepository, UserRepository, UserRoleRepository,
};

/// Role every new federated user receives, when it exists.
pub const DEFAULT_ROLE: &str = "user";

pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_TOKEN_SUFFIX_LEN: usize = 32;
const CACHE_DEADLINE: Duration = Duration::from_secs(5);
const STORE_DEADLINE: Duration = Duration::from_secs(30);

pub fn profile_cache_key(username: &str) -> String {
    format!("user-profile:{username}")
}

pub fn user_cache_key(username: &str) -> String {
    format!("auth-service-auth-user-{username}")
}

/// `alice@example.com` → `a***@example.com`, for logs.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Repositories the handlers write to.
#[derive(Clone)]
pub struct AuthStores {
    pub users: Arc<dyn UserRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub user_roles: Arc<dyn UserRoleRepository>,
    pub permissions: Arc<dyn PermissionRepository>,
    pub cache: Arc<dyn CacheRepository>,
    pub sessions: Arc<dyn SessionRepository>,
}

impl AuthStores {
    pub fn in_memory(store: Arc<InMemoryAuthStore>) -> Self {
        Self {
            users: store.clone(),
            roles: store.clone(),
            user_roles: store.clone(),
            permissions: store.clone(),
            cache: store.clone(),
            sessions: store,
        }
    }
}

pub struct AuthEventHandlers {
    stores: AuthStores,
    publisher: EventPublisher,
}

impl AuthEventHandlers {
    pub fn new(stores: AuthStores, publisher: EventPublisher) -> Self {
        Self { stores, publisher }
    }

    pub async fn profile_updated(&self, event: ProfileUpdated) -> Result<()> {
        let key = profile_cache_key(&event.username);
        if self.stores.cache.delete_key(&key).await? {
            info!(username = %event.username, "Invalidated profile cache");
        } else {
            debug!(username = %event.username, "No cached profile to invalidate");
        }
        Ok(())
    }

    pub async fn profile_deleted(&self, event: ProfileDeleted) -> Result<()> {
        debug!(user_id = %event.user_id, "Profile deleted, nothing to do");
        Ok(())
    }

    /// Fire-and-forget notification from the Google service. Accounts are
    /// created through `google.login.request` only.
    pub async fn google_login(&self, event: GoogleLogin) -> Result<()> {
        debug!(email = %mask_email(&event.email), "Google login notice received");
        Ok(())
    }

    /// Find or create the user, open a session and answer on
    /// `auth-events` with the same `request_id`.
    pub async fn google_login_request(&self, request: GoogleLoginRequest) -> Result<()> {
        let email = mask_email(&request.email);
        info!(request_id = %request.request_id, email = %email, "Google login request received");

        let existing = match self.stores.users.find_by_email(&request.email).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, email = %email, "User lookup failed, treating as new user");
                None
            }
        };

        let user = match existing {
            Some(user) => {
                debug!(user_id = %user.id, "Existing user for Google login");
                user
            }
            None => match self.register_federated_user(&request).await {
                Ok(user) => user,
                Err(err) => {
                    warn!(error = %err, email = %email, "Failed to create user");
                    self.respond(GoogleLoginResponse::failure(&request.request_id, "Failed to create user", None))
                        .await;
                    return Err(err);
                }
            },
        };

        let token = match self.open_session(&user).await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, user_id = %user.id, "Failed to create session");
                self.respond(GoogleLoginResponse::failure(
                    &request.request_id,
                    "Failed to create session",
                    Some(user.id.to_string()),
                ))
                .await;
                return Err(err);
            }
        };

        self.respond(GoogleLoginResponse::success(&request.request_id, token, user.id.to_string())).await;
        info!(request_id = %request.request_id, user_id = %user.id, "Google login completed");
        Ok(())
    }

    pub async fn email_verification_success(&self, event: EmailVerificationSuccess) -> Result<()> {
        let user_id = parse_user_id(&event.user_id)?;
        let mut user = self
            .stores
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthEventError::UserNotFound(event.user_id.clone()))?;

        if user.is_email_verified {
            debug!(user_id = %user_id, "Email already verified");
            return Ok(());
        }

        user.is_email_verified = true;
        user.updated_at = Utc::now();
        self.stores.users.update_user(&user).await?;
        info!(user_id = %user_id, email = %mask_email(&event.email), "Email verified");

        if let Err(err) = self.stores.cache.delete_key(&user_cache_key(&user.username)).await {
            warn!(error = %err, username = %user.username, "Failed to invalidate user cache");
        }
        Ok(())
    }

    pub async fn plan_created(&self, event: PlanEvent) -> Result<()> {
        let Some(meta) = &event.role_metadata else {
            debug!(plan_id = %event.plan_id, "Plan has no role metadata, skipping role creation");
            return Ok(());
        };

        if self.stores.roles.find_by_name(&meta.suggested_role_name).await?.is_some() {
            info!(role = %meta.suggested_role_name, "Role already exists, skipping creation");
            return Ok(());
        }

        let permissions = self.known_permissions(&meta.all_permissions).await?;
        if permissions.is_empty() {
            warn!(plan_id = %event.plan_id, "No valid permissions for plan, skipping role creation");
            return Ok(());
        }

        let role = Role::new(&meta.suggested_role_name, &meta.role_description, permissions);
        let role = self.stores.roles.create_role(&role).await?;
        info!(
            role = %role.name,
            role_id = %role.id,
            plan_id = %event.plan_id,
            permissions = role.permissions.len(),
            "Created plan role"
        );
        for (feature, permissions) in &meta.feature_permission_map {
            debug!(plan_id = %event.plan_id, feature = %feature, ?permissions, "Feature permissions");
        }
        Ok(())
    }

    pub async fn plan_updated(&self, event: PlanEvent) -> Result<()> {
        let Some(meta) = &event.role_metadata else {
            debug!(plan_id = %event.plan_id, "Plan has no role metadata, skipping role update");
            return Ok(());
        };
        let Some(mut role) = self.stores.roles.find_by_name(&meta.suggested_role_name).await? else {
            info!(role = %meta.suggested_role_name, plan_id = %event.plan_id, "Role not found, skipping update");
            return Ok(());
        };

        let permissions = self.known_permissions(&meta.all_permissions).await?;
        if same_permissions(&role.permissions, &permissions) {
            debug!(role = %role.name, "Permissions unchanged");
            return Ok(());
        }

        info!(
            role = %role.name,
            plan_id = %event.plan_id,
            before = role.permissions.len(),
            after = permissions.len(),
            "Updating plan role permissions"
        );
        role.permissions = permissions;
        role.updated_at = Utc::now();
        self.stores.roles.update_role(&role).await
    }

    pub async fn plan_deleted(&self, event: PlanEvent) -> Result<()> {
        let Some(meta) = &event.role_metadata else {
            debug!(plan_id = %event.plan_id, "Plan has no role metadata, skipping role deletion");
            return Ok(());
        };
        let Some(role) = self.stores.roles.find_by_name(&meta.suggested_role_name).await? else {
            info!(role = %meta.suggested_role_name, "Role already gone");
            return Ok(());
        };

        if role.is_system {
            warn!(role = %role.name, plan_id = %event.plan_id, "Refusing to delete system role");
            return Err(AuthEventError::SystemRole(role.name));
        }

        self.stores.roles.delete_role(role.id).await?;
        info!(role = %role.name, plan_id = %event.plan_id, plan_name = %event.plan_name, "Deleted plan role");
        Ok(())
    }

    pub async fn subscription_updated(&self, event: SubscriptionEvent) -> Result<()> {
        let Some(role_name) = event.role_to_assign() else {
            debug!(
                subscription_id = %event.subscription_id,
                status = %event.status,
                "No role assignment needed"
            );
            return Ok(());
        };

        let user_id = parse_user_id(&event.user_id)?;
        if self.stores.users.find_by_id(user_id).await?.is_none() {
            return Err(AuthEventError::UserNotFound(event.user_id.clone()));
        }
        let role = self
            .stores
            .roles
            .find_by_name(role_name)
            .await?
            .ok_or_else(|| AuthEventError::RoleNotFound(role_name.to_string()))?;

        let grants = self.stores.user_roles.find_by_user(user_id).await?;
        if grants.iter().any(|grant| grant.role_id == role.id && grant.is_active) {
            debug!(user_id = %user_id, role = %role.name, "Role already assigned");
            return Ok(());
        }

        self.stores
            .user_roles
            .assign(&UserRole::system_grant(user_id, role.id, RoleScope::Subscription))
            .await?;
        info!(
            user_id = %user_id,
            role = %role.name,
            subscription_id = %event.subscription_id,
            "Assigned subscription role"
        );
        Ok(())
    }

    async fn register_federated_user(&self, request: &GoogleLoginRequest) -> Result<UserAuth> {
        let user = self.stores.users.create_user(&UserAuth::federated(&request.email)).await?;
        info!(user_id = %user.id, "Created user for Google login");

        if let Err(err) = self.assign_default_role(user.id).await {
            warn!(error = %err, user_id = %user.id, "Failed to assign default role");
        }
        self.announce_registration(&user, &request.profile).await;
        Ok(user)
    }

    async fn assign_default_role(&self, user_id: Uuid) -> Result<()> {
        let Some(role) = self.stores.roles.find_by_name(DEFAULT_ROLE).await? else {
            debug!("No default role defined, skipping assignment");
            return Ok(());
        };
        self.stores
            .user_roles
            .assign(&UserRole::system_grant(user_id, role.id, RoleScope::Global))
            .await
    }

    async fn announce_registration(&self, user: &UserAuth, profile: &HashMap<String, String>) {
        let event = UserRegistered {
            user_id: user.id.to_string(),
            username: user.username.clone(),
            email: user.email.clone(),
            profile_data: profile.clone(),
        };
        if let Err(err) = self
            .publisher
            .publish_event(exchanges::USER_EVENTS, event_types::USER_REGISTERED, event)
            .await
        {
            warn!(error = %err, user_id = %user.id, "Failed to publish user registration");
        }
    }

    async fn open_session(&self, user: &UserAuth) -> Result<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(SESSION_TTL).map_err(|err| AuthEventError::Internal(err.into()))?;
        let session = Session {
            token: time_prefixed_id(SESSION_TOKEN_SUFFIX_LEN),
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            permissions: Vec::new(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.stores.sessions.save_session(&session, SESSION_TTL).await?;
        Ok(session.token)
    }

    async fn respond(&self, response: GoogleLoginResponse) {
        let request_id = response.request_id.clone();
        match self
            .publisher
            .publish_event(exchanges::AUTH_EVENTS, event_types::GOOGLE_LOGIN_RESPONSE, response)
            .await
        {
            Ok(()) => debug!(request_id = %request_id, "Published Google login response"),
            Err(err) => warn!(error = %err, request_id = %request_id, "Failed to publish Google login response"),
        }
    }

    async fn known_permissions(&self, requested: &[String]) -> Result<Vec<String>> {
        let mut known = Vec::with_capacity(requested.len());
        for permission in requested {
            if self.stores.permissions.is_available(permission).await? {
                known.push(permission.clone());
            } else {
                warn!(permission = %permission, "Unknown permission, skipping");
            }
        }
        Ok(known)
    }
}

impl AuthEventHandlers {
    /// One handler per routing key, each decoding its own payload under the
    /// deadline of the store it touches.
    pub fn registry(self: Arc<Self>) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        let registry = keyed(registry, &self, event_types::PROFILE_UPDATED, CACHE_DEADLINE, |h, e: ProfileUpdated| async move {
            h.profile_updated(e).await
        });
        let registry = keyed(registry, &self, event_types::PROFILE_DELETED, STORE_DEADLINE, |h, e: ProfileDeleted| async move {
            h.profile_deleted(e).await
        });
        let registry = keyed(registry, &self, event_types::GOOGLE_LOGIN, STORE_DEADLINE, |h, e: GoogleLogin| async move {
            h.google_login(e).await
        });
        let registry = keyed(registry, &self, event_types::GOOGLE_LOGIN_REQUEST, STORE_DEADLINE, |h, e: GoogleLoginRequest| async move {
            h.google_login_request(e).await
        });
        let registry = keyed(
            registry,
            &self,
            event_types::EMAIL_VERIFICATION_SUCCESS,
            STORE_DEADLINE,
            |h, e: EmailVerificationSuccess| async move { h.email_verification_success(e).await },
        );
        let registry = keyed(registry, &self, event_types::PLAN_CREATED, STORE_DEADLINE, |h, e: PlanEvent| async move {
            h.plan_created(e).await
        });
        let registry = keyed(registry, &self, event_types::PLAN_UPDATED, STORE_DEADLINE, |h, e: PlanEvent| async move {
            h.plan_updated(e).await
        });
        let registry = keyed(registry, &self, event_types::PLAN_DELETED, STORE_DEADLINE, |h, e: PlanEvent| async move {
            h.plan_deleted(e).await
        });
        keyed(registry, &self, event_types::SUBSCRIPTION_UPDATED, STORE_DEADLINE, |h, e: SubscriptionEvent| async move {
            h.subscription_updated(e).await
        })
    }
}

/// Register `call` under `routing_key`: decode the payload as `P`, then run
/// the method within `deadline`.
fn keyed<P, F, Fut>(
    registry: HandlerRegistry,
    handlers: &Arc<AuthEventHandlers>,
    routing_key: &str,
    deadline: Duration,
    call: F,
) -> HandlerRegistry
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(Arc<AuthEventHandlers>, P) -> Fut + Copy + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handlers = Arc::clone(handlers);
    registry.register_fn(routing_key, move |body: Vec<u8>| {
        let handlers = Arc::clone(&handlers);
        async move {
            with_deadline(deadline, async move {
                let event: P = decode_payload(&body)?;
                call(handlers, event).await.map_err(EventBusError::from)
            })
            .await
        }
    })
}

fn parse_user_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AuthEventError::InvalidUserId(raw.to_string()))
}

/// Set equality; order and duplicates are ignored.
fn same_permissions(current: &[String], next: &[String]) -> bool {
    let current: HashSet<&String> = current.iter().collect();
    let next: HashSet<&String> = next.iter().collect();
    current == next
}
