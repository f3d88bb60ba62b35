// Copyright (c) 2023 Contributors to the Eclipse Foundation
//
// See the NOTICE file(s) distributed with this work for additional
// information regarding copyright ownership.
//
// This program and the accompanying materials are made available under the
// terms of the Apache Software License 2.0 which is available at
// https://www.apache.org/licenses/LICENSE-2.0, or the MIT license
// which is available at https://opensource.org/licenses/MIT.
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logging front-end for `shmfabric`. Provides `trace!`/`debug!`/`info!`/`warn!`/`error!`
//! convenience macros that accept an optional `from <origin>` clause, and the two
//! error-handling macros used throughout the workspace:
//!
//! - [`fail!`] builds an error value, logs it, and returns it from the current function.
//! - [`fatal_panic!`] logs and panics; used only for violated internal invariants.
//!
//! Both are backed by the [`log`] crate so any application linking `shmfabric` chooses its own
//! logging backend (env_logger, tracing-log, ...) the usual way.
//!
//! # Example
//!
//! ```
//! use shmfabric_log::{fail, warn};
//!
//! #[derive(Debug)]
//! struct Thing;
//!
//! #[derive(Debug, Clone, Copy)]
//! enum ThingError { Bad }
//!
//! impl Thing {
//!     fn might_fail(&self, ok: bool) -> Result<(), ThingError> {
//!         if !ok {
//!             fail!(from self, with ThingError::Bad, "could not do the thing");
//!         }
//!         Ok(())
//!     }
//! }
//! ```

#[doc(hidden)]
pub use log;

/// Logs at `trace` level, optionally attributing the message to an origin object via `from`.
#[macro_export]
macro_rules! trace {
    (from $origin:expr, $($arg:tt)*) => {
        $crate::log::trace!("[{:?}] {}", $origin, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::log::trace!($($arg)*)
    };
}

/// Logs at `debug` level, optionally attributing the message to an origin object via `from`.
#[macro_export]
macro_rules! debug {
    (from $origin:expr, $($arg:tt)*) => {
        $crate::log::debug!("[{:?}] {}", $origin, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::log::debug!($($arg)*)
    };
}

/// Logs at `warn` level, optionally attributing the message to an origin object via `from`.
#[macro_export]
macro_rules! warn {
    (from $origin:expr, $($arg:tt)*) => {
        $crate::log::warn!("[{:?}] {}", $origin, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::log::warn!($($arg)*)
    };
}

/// Logs at `error` level, optionally attributing the message to an origin object via `from`.
#[macro_export]
macro_rules! error {
    (from $origin:expr, $($arg:tt)*) => {
        $crate::log::error!("[{:?}] {}", $origin, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::log::error!($($arg)*)
    };
}

/// Logs the provided message at `error` level and returns `Err` of the given value from the
/// enclosing function.
///
/// ```ignore
/// fail!(from self, with MyError::Bad, "operation {} failed", 42);
/// fail!(from self, when some_result, "forwarding failure");
/// fail!(from self, when some_result, with MyError::Bad, "forwarding failure as MyError");
/// ```
#[macro_export]
macro_rules! fail {
    (from $origin:expr, with $err:expr, $($arg:tt)*) => {{
        $crate::error!(from $origin, $($arg)*);
        return Err($err.into());
    }};
    (from $origin:expr, when $result:expr, with $err:expr, $($arg:tt)*) => {{
        match $result {
            Ok(v) => v,
            Err(_) => {
                $crate::error!(from $origin, $($arg)*);
                return Err($err.into());
            }
        }
    }};
    (from $origin:expr, when $result:expr, $($arg:tt)*) => {{
        match $result {
            Ok(v) => v,
            Err(e) => {
                $crate::error!(from $origin, $($arg)*);
                return Err(e.into());
            }
        }
    }};
}

/// Logs the provided message at `error` level and panics. Reserved for violated internal
/// invariants (programming bugs), never for operational failures.
#[macro_export]
macro_rules! fatal_panic {
    (from $origin:expr, $($arg:tt)*) => {{
        $crate::error!(from $origin, $($arg)*);
        panic!($($arg)*);
    }};
    ($($arg:tt)*) => {{
        $crate::error!($($arg)*);
        panic!($($arg)*);
    }};
}
