//! Helper macros for logging (console printing).

use crate::utils::MemberId;

use env_logger::Env;

/// Prefix a log line is tagged with: a member ID renders as `m<id>`, while
/// a string (conventionally `"-"`, for no member known) renders verbatim.
pub trait LogPrefix {
    fn log_prefix(&self) -> String;
}

impl LogPrefix for MemberId {
    fn log_prefix(&self) -> String {
        format!("m{}", self)
    }
}

impl LogPrefix for &str {
    fn log_prefix(&self) -> String {
        self.to_string()
    }
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::trace!("({}) {}", $crate::LogPrefix::log_prefix(&$prefix), format!($($fmt_args)*))
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::debug!("({}) {}", $crate::LogPrefix::log_prefix(&$prefix), format!($($fmt_args)*))
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::info!("({}) {}", $crate::LogPrefix::log_prefix(&$prefix), format!($($fmt_args)*))
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::warn!("({}) {}", $crate::LogPrefix::log_prefix(&$prefix), format!($($fmt_args)*))
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($fmt_args:tt)*) => {
        log::error!("({}) {}", $crate::LogPrefix::log_prefix(&$prefix), format!($($fmt_args)*))
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a `GridError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $($fmt_args:tt)*) => {
        {
            $crate::pf_error!($prefix; $($fmt_args)*);
            Err($crate::GridError::msg(format!($($fmt_args)*)))
        }
    };
}
