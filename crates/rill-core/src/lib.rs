//! # Rill Core
//!
//! Core reactive-stream engine: cold composable pipelines with strict
//! pull-based backpressure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Assembly (cold)                      │
//! │   Flow::from_iter(..).map(..).filter(..).retry(..)      │
//! └────────────────────────┬────────────────────────────────┘
//!                          │ subscribe
//! ┌────────────────────────▼────────────────────────────────┐
//! │                  Subscription (live)                    │
//! │   on_subscribe → request(n) → on_next × n → terminal    │
//! │        Demand ledger · serialized drain loops           │
//! └────────────────────────┬────────────────────────────────┘
//!                          │ optional relocation
//! ┌────────────────────────▼────────────────────────────────┐
//! │     Schedulers: immediate / parallel / bounded-elastic  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Contract
//!
//! - Nothing runs until `subscribe`; every subscription re-runs the
//!   pipeline from scratch (unless multicast via [`Flow::publish`])
//! - A producer never emits beyond requested demand
//! - Exactly one terminal signal (`on_error` or `on_complete`), then silence
//! - Cancellation stops emission within one scheduling step
//!
//! ## Example
//!
//! ```
//! use rill_core::{Flow, testkit::TestSubscriber};
//!
//! let probe = TestSubscriber::unbounded();
//! Flow::from_iter(vec!["alex", "ben", "chloe"])
//!     .filter(|name| name.len() > 3)
//!     .map(str::to_uppercase)
//!     .subscribe(probe.clone());
//!
//! assert_eq!(probe.values(), vec!["ALEX", "CHLOE"]);
//! assert!(probe.is_completed());
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod backpressure;
mod combine;
mod error;
mod flow;
mod hot;
mod operator;
mod parallel;
pub mod scheduler;
mod signal;
mod single;
mod source;
mod subscriber;
mod subscription;
pub mod testkit;

pub use backpressure::OverflowStrategy;
pub use error::{FlowError, MapFailure, MessageError, Result};
pub use flow::Flow;
pub use hot::ConnectableFlow;
pub use operator::retry::RetrySpec;
pub use parallel::ParallelFlow;
pub use scheduler::{Scheduler, Schedulers, Worker};
pub use signal::Signal;
pub use single::Single;
pub use subscriber::{CallbackSubscriber, ContinueHandler, Subscriber, SubscriberContext};
pub use subscription::{Demand, RelaySubscription, Subscription, UNBOUNDED};
