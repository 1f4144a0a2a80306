use std::fmt::Debug;
use std::panic::Location;

use tracing::warn;

#[macro_export]
macro_rules! ensure {
    ($cond:expr) => {
        if !($cond) {
            return None;
        }
    };
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err.into());
        }
    };
    ($cond:expr, $err:expr, $($arg:tt)+) => {
        if !($cond) {
            tracing::warn!($($arg)+);
            return Err($err.into());
        }
    };
}

#[macro_export]
macro_rules! log_assert {
    ($cond:expr) => {
        if !($cond) {
            tracing::warn!("Assertion failed: {}", stringify!($cond));
        }
    };
}

pub trait LoggableResult<T, E> {
    fn log_err(self) -> Result<T, E>;
}

impl<T, E: Debug> LoggableResult<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Result<T, E> {
        if let Err(err) = &self {
            warn!("{:?} at {}", err, Location::caller());
        }
        self
    }
}
