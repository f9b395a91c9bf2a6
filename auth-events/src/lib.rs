//! # Auth Events
//!
//! Event handlers for the auth service on top of [`event_backbone`]:
//! profile cache invalidation, Google login request/response, email
//! verification and billing-driven role management.
//!
//! Repositories are traits ([`repository`]); [`memory`] provides in-process
//! implementations for development and tests.

pub mod error;
pub mod events;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod repository;
pub mod requester;
pub mod worker;

pub use error::{AuthEventError, Result};
pub use handlers::{mask_email, AuthEventHandlers, AuthStores};
pub use memory::InMemoryAuthStore;
pub use requester::{GoogleIdentity, GoogleLoginClient};
pub use worker::{auth_registry, auth_topology, AuthEventWorker};
