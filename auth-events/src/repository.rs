use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Role, Session, UserAuth, UserRole};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAuth>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<UserAuth>>;
    async fn create_user(&self, user: &UserAuth) -> Result<UserAuth>;
    async fn update_user(&self, user: &UserAuth) -> Result<()>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<Role>>;
    async fn create_role(&self, role: &Role) -> Result<Role>;
    async fn update_role(&self, role: &Role) -> Result<()>;
    async fn delete_role(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait UserRoleRepository: Send + Sync {
    async fn assign(&self, grant: &UserRole) -> Result<()>;
    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<UserRole>>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    /// Whether `name` is a permission the system knows about.
    async fn is_available(&self, name: &str) -> Result<bool>;
}

/// Key/value cache shared with the request path (profiles, user records).
#[async_trait]
pub trait CacheRepository: Send + Sync {
    /// Returns whether a key was present.
    async fn delete_key(&self, key: &str) -> Result<bool>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save_session(&self, session: &Session, ttl: Duration) -> Result<()>;
}
