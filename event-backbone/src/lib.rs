//! # Event Backbone
//!
//! Reconnect-safe AMQP 0-9-1 messaging for services that exchange domain
//! events over topic exchanges.
//!
//! ## Features
//!
//! - **Connection supervision**: one connection and channel per process,
//!   exponential reconnect backoff (1s doubling to 30s), channel-only reopen
//!   when the connection survives, topology redeclared on every new channel.
//! - **Topology**: durable topic exchanges, one durable service queue and its
//!   bindings, optional dead-letter exchange.
//! - **Publishing**: flat JSON envelopes (`id`, `type`, `timestamp`,
//!   `version` plus payload fields), persistent delivery, fail-fast while
//!   disconnected, no-op when no broker is configured.
//! - **Dispatch**: prefetch-bounded consumption, routing-key handler
//!   registry, explicit failure policy (ack-and-drop or bounded requeue with
//!   dead-lettering), optional worker pool.
//! - **Request/response**: `request_id` correlation with requester timeouts.
//!
//! The broker client sits behind the traits in [`broker`]; [`amqp`] talks to
//! RabbitMQ and [`memory`] runs in-process for tests.

pub mod amqp;
pub mod backbone;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod memory;
pub mod publisher;
pub mod rpc;
pub mod supervisor;
pub mod topic;
pub mod topology;

pub use backbone::EventBackbone;
pub use backoff::{Backoff, BackoffPolicy};
pub use broker::Delivery;
pub use config::BackboneConfig;
pub use consumer::{ConsumerOptions, EventConsumer, FailurePolicy};
pub use envelope::{decode_payload, event_types, Envelope, EnvelopeHeader};
pub use error::{EventBusError, Result};
pub use handlers::{with_deadline, EventHandler, HandlerRegistry};
pub use publisher::EventPublisher;
pub use rpc::{Correlated, PendingResponses};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use topology::{Binding, ExchangeSpec, QueueSpec, Topology};
