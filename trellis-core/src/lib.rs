//! Trellis Core
//!
//! This crate provides a fine-grained reactive runtime. It implements:
//!
//! - Reactive primitives (signals, memos, effects, reactions)
//! - Ownership-based disposal with cleanups, context and error handlers
//! - A two-phase batched update engine that never exposes a glitch
//! - A cooperative task scheduler that yields to its host
//! - Transitions, resources and suspense counting
//! - Keyed and indexed list mapping with one owner per entry
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives, ownership and the update engine
//! - `graph`: Node storage for the dependency and ownership graph
//! - `scheduler`: Priority queue of deferred work with host-yield detection
//! - `config`: Runtime and scheduler settings
//! - `error`: The error type handed to error handlers
//!
//! Everything reactive is single-threaded: each thread has its own runtime,
//! and handles are plain IDs into it.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::reactive::{create_root, Effect, Memo, Signal};
//!
//! let (count, dispose) = create_root(|root| {
//!     // Create a signal
//!     let count = Signal::new(0);
//!
//!     // Create a derived value
//!     let doubled = Memo::new(move || count.get() * 2);
//!
//!     // Create an effect
//!     Effect::new(move || {
//!         println!("Count: {}, Doubled: {}", count.get(), doubled.get());
//!     });
//!     (count, root)
//! });
//!
//! // Update the signal
//! count.set(5);
//! // Effect automatically runs, prints: "Count: 5, Doubled: 10"
//! dispose.dispose();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod scheduler;

pub use error::{ReactiveError, Result};
