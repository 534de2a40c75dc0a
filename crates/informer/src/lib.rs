//! Reflector and shared indexed informer.
//!
//! A [`Reflector`] Lists and Watches one collection through a
//! [`tern_core::ListerWatcher`] and feeds a [`tern_store::DeltaQueue`]. A
//! [`SharedIndexInformer`] drains that queue into an [`tern_store::Indexer`]
//! and fans every applied change out to registered handlers.

#![forbid(unsafe_code)]

mod backoff;
mod config;
mod factory;
mod handler;
mod informer;
mod reflector;

pub use backoff::Backoff;
pub use config::{BackoffConfig, InformerConfig};
pub use factory::InformerFactory;
pub use handler::{HandlerFns, HandlerId, HandlerRegistration, ResourceEventHandler};
pub use informer::SharedIndexInformer;
pub use reflector::{Reflector, ReflectorState};

pub use tern_store::DeltaCompression;
pub use tokio_util::sync::CancellationToken;
