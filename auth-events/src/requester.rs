//! Google service side of the login exchange: publish `google.login.request`
//! and wait for the auth service's `google.login.response`.

use std::collections::HashMap;
use std::time::Duration;

use event_backbone::envelope::new_request_id;
use event_backbone::rpc::DEFAULT_RESPONSE_TIMEOUT;
use event_backbone::{event_types, BackboneConfig, EventPublisher, HandlerRegistry, PendingResponses, Result, Topology};
use tracing::{debug, info};

use crate::events::{exchanges, GoogleLoginRequest, GoogleLoginResponse};
use crate::handlers::mask_email;

/// Verified identity returned by Google's userinfo endpoint.
#[derive(Debug, Clone, Default)]
pub struct GoogleIdentity {
    pub google_id: String,
    pub email: String,
    pub verified_email: bool,
    pub name: String,
    pub given_name: String,
    pub family_name: String,
    pub picture: String,
    pub locale: String,
}

impl GoogleIdentity {
    fn profile(&self) -> HashMap<String, String> {
        [
            ("fullname", self.name.clone()),
            ("given_name", self.given_name.clone()),
            ("family_name", self.family_name.clone()),
            ("avatar", self.picture.clone()),
            ("locale", self.locale.clone()),
            ("provider", "google".to_string()),
            ("google_id", self.google_id.clone()),
            ("verified", self.verified_email.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }

    fn into_request(self, request_id: String) -> GoogleLoginRequest {
        let profile = self.profile();
        GoogleLoginRequest {
            request_id,
            email: self.email,
            name: self.name,
            picture: self.picture,
            google_id: self.google_id,
            locale: self.locale,
            profile,
        }
    }
}

/// Topology for the requesting service: its queue receives login responses.
pub fn google_topology(config: &BackboneConfig) -> Result<Topology> {
    config
        .topology_builder()
        .topic_exchange(exchanges::GOOGLE_EVENTS)
        .topic_exchange(exchanges::AUTH_EVENTS)
        .bind(exchanges::AUTH_EVENTS, event_types::GOOGLE_LOGIN_RESPONSE)
        .build()
}

#[derive(Clone)]
pub struct GoogleLoginClient {
    publisher: EventPublisher,
    pending: PendingResponses<GoogleLoginResponse>,
    timeout: Duration,
}

impl GoogleLoginClient {
    pub fn new(publisher: EventPublisher) -> Self {
        Self::with_timeout(publisher, DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(publisher: EventPublisher, timeout: Duration) -> Self {
        Self { publisher, pending: PendingResponses::new(), timeout }
    }

    /// Route `google.login.response` deliveries to waiting logins.
    pub fn install(&self, registry: HandlerRegistry) -> HandlerRegistry {
        self.pending.install(registry, event_types::GOOGLE_LOGIN_RESPONSE)
    }

    pub fn pending(&self) -> usize {
        self.pending.pending()
    }

    /// Ask the auth service to sign `identity` in. Fails with
    /// `ResponseTimeout` when no response arrives in time; a response with
    /// `success == false` is returned as-is.
    pub async fn login(&self, identity: GoogleIdentity) -> Result<GoogleLoginResponse> {
        let request_id = new_request_id();
        debug!(request_id = %request_id, email = %mask_email(&identity.email), "Requesting Google login");
        let request = identity.into_request(request_id.clone());
        let response = self
            .pending
            .call(
                &self.publisher,
                exchanges::GOOGLE_EVENTS,
                event_types::GOOGLE_LOGIN_REQUEST,
                &request_id,
                request,
                self.timeout,
            )
            .await?;
        info!(request_id = %request_id, success = response.success, "Google login response received");
        Ok(response)
    }
}
