// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Stacked connection decorators for an encrypted tunneling proxy
//!
//! An accepted transport is wrapped in a [cipher::CipherConn], then in any
//! ordered selection of rate limiting, HTTP camouflage logging, compression
//! and debug logging. Closes may be deferred by a [lifecycle::LifecyclePool].

pub mod camouflage;
pub mod cipher;
pub mod compress;
pub mod config;
pub mod conn;
pub mod debug;
pub mod decorate;
pub mod lifecycle;
pub mod limit;
pub mod relay;
pub mod util;

pub use config::{Config, Layer};
pub use conn::{BoxedConn, Conn, StreamTransport};
pub use decorate::ConnDecorator;
pub use lifecycle::{LifecycleHandle, LifecyclePool};
