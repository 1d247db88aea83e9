//! Helper macros for logging (console printing).

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use stagefs::pf_trace;
/// let rank = 0;
/// let msg = "hello";
/// pf_trace!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use stagefs::pf_debug;
/// let rank = 0;
/// let msg = "hello";
/// pf_debug!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use stagefs::pf_info;
/// let rank = 0;
/// let msg = "hello";
/// pf_info!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use stagefs::pf_warn;
/// let rank = 0;
/// let msg = "hello";
/// pf_warn!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// use stagefs::pf_error;
/// let rank = 0;
/// let msg = "hello";
/// pf_error!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `StagefsError`
/// containing the string.
///
/// Example:
/// ```no_run
/// use stagefs::{logged_err, pf_error, StagefsError};
/// let rank = 0;
/// let msg = "hello";
/// let e: Result<(), StagefsError> = logged_err!(rank; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            pf_error!($prefix; $fmt_str);
            Err(StagefsError(format!(concat!("({}) ", $fmt_str), $prefix)))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err(StagefsError(format!(
                concat!("({}) ", $fmt_str),
                $prefix, $($fmt_arg)*
            )))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use crate::utils::StagefsError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!(0; "interesting message"),
            Err::<(), StagefsError>(StagefsError(
                "(0) interesting message".into()
            ))
        );
        assert_eq!(
            logged_err!("desk"; "interesting message"),
            Err::<(), StagefsError>(StagefsError(
                "(desk) interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!(0; "got {} to print", 777),
            Err::<(), StagefsError>(StagefsError("(0) got 777 to print".into()))
        );
    }
}
