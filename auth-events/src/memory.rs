//! In-memory stores for development and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{AuthEventError, Result};
use crate::models::{Permission, Role, Session, UserAuth, UserRole};
use crate::repository::{
    CacheRepository, PermissionRepository, RoleRepository, SessionRepository, UserRepository, UserRoleRepository,
};

/// Every auth repository over one set of maps.
///
/// `fail_user_creation`, `fail_session_writes` and `fail_cache_deletes` make
/// the matching writes return [`AuthEventError::Repository`].
#[derive(Default)]
pub struct InMemoryAuthStore {
    users: RwLock<HashMap<Uuid, UserAuth>>,
    roles: RwLock<HashMap<Uuid, Role>>,
    grants: RwLock<Vec<UserRole>>,
    permissions: RwLock<HashMap<String, Permission>>,
    cache: RwLock<HashSet<String>>,
    sessions: RwLock<HashMap<String, (Session, Duration)>>,
    fail_user_creation: AtomicBool,
    fail_session_writes: AtomicBool,
    fail_cache_deletes: AtomicBool,
    cache_deletes: AtomicUsize,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permissions<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut permissions = self.permissions.write();
            for name in names {
                let name = name.into();
                permissions.insert(name.clone(), Permission::new(name, "billing"));
            }
        }
        self
    }

    pub fn insert_user(&self, user: UserAuth) {
        self.users.write().insert(user.id, user);
    }

    pub fn insert_role(&self, role: Role) {
        self.roles.write().insert(role.id, role);
    }

    pub fn cache_key(&self, key: impl Into<String>) {
        self.cache.write().insert(key.into());
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.read().contains(key)
    }

    pub fn user(&self, id: Uuid) -> Option<UserAuth> {
        self.users.read().get(&id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn role_named(&self, name: &str) -> Option<Role> {
        self.roles.read().values().find(|role| role.name == name).cloned()
    }

    pub fn grants_for(&self, user_id: Uuid) -> Vec<UserRole> {
        self.grants.read().iter().filter(|grant| grant.user_id == user_id).cloned().collect()
    }

    /// Stored session and its TTL.
    pub fn session(&self, token: &str) -> Option<(Session, Duration)> {
        self.sessions.read().get(token).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn fail_user_creation(&self, fail: bool) {
        self.fail_user_creation.store(fail, Ordering::SeqCst);
    }

    pub fn fail_session_writes(&self, fail: bool) {
        self.fail_session_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cache_deletes(&self, fail: bool) {
        self.fail_cache_deletes.store(fail, Ordering::SeqCst);
    }

    /// Cache deletions attempted so far, failed ones included.
    pub fn cache_delete_attempts(&self) -> usize {
        self.cache_deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserRepository for InMemoryAuthStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAuth>> {
        Ok(self.user(id))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserAuth>> {
        Ok(self.users.read().values().find(|user| user.email == email).cloned())
    }

    async fn create_user(&self, user: &UserAuth) -> Result<UserAuth> {
        if self.fail_user_creation.load(Ordering::SeqCst) {
            return Err(AuthEventError::Repository("user store rejected insert".into()));
        }
        let mut users = self.users.write();
        if users.values().any(|existing| existing.email == user.email) {
            return Err(AuthEventError::Repository(format!("duplicate email {}", user.email)));
        }
        users.insert(user.id, user.clone());
        Ok(user.clone())
    }

    async fn update_user(&self, user: &UserAuth) -> Result<()> {
        match self.users.write().get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(AuthEventError::UserNotFound(user.id.to_string())),
        }
    }
}

#[async_trait]
impl RoleRepository for InMemoryAuthStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(self.role_named(name))
    }

    async fn create_role(&self, role: &Role) -> Result<Role> {
        let mut roles = self.roles.write();
        if roles.values().any(|existing| existing.name == role.name) {
            return Err(AuthEventError::Repository(format!("duplicate role {}", role.name)));
        }
        roles.insert(role.id, role.clone());
        Ok(role.clone())
    }

    async fn update_role(&self, role: &Role) -> Result<()> {
        match self.roles.write().get_mut(&role.id) {
            Some(existing) => {
                *existing = role.clone();
                Ok(())
            }
            None => Err(AuthEventError::RoleNotFound(role.name.clone())),
        }
    }

    async fn delete_role(&self, id: Uuid) -> Result<()> {
        self.roles
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AuthEventError::RoleNotFound(id.to_string()))
    }
}

#[async_trait]
impl UserRoleRepository for InMemoryAuthStore {
    async fn assign(&self, grant: &UserRole) -> Result<()> {
        self.grants.write().push(grant.clone());
        Ok(())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        Ok(self.grants_for(user_id))
    }
}

#[async_trait]
impl PermissionRepository for InMemoryAuthStore {
    async fn is_available(&self, name: &str) -> Result<bool> {
        Ok(self.permissions.read().contains_key(name))
    }
}

#[async_trait]
impl CacheRepository for InMemoryAuthStore {
    async fn delete_key(&self, key: &str) -> Result<bool> {
        self.cache_deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_cache_deletes.load(Ordering::SeqCst) {
            return Err(AuthEventError::Repository("cache unavailable".into()));
        }
        Ok(self.cache.write().remove(key))
    }
}

#[async_trait]
impl SessionRepository for InMemoryAuthStore {
    async fn save_session(&self, session: &Session, ttl: Duration) -> Result<()> {
        if self.fail_session_writes.load(Ordering::SeqCst) {
            return Err(AuthEventError::Repository("session store unavailable".into()));
        }
        self.sessions.write().insert(session.token.clone(), (session.clone(), ttl));
        Ok(())
    }
}
