//! Logging shims.
//!
//! With the `log` feature enabled, the proxy logs credit movements, channel lifecycle
//! transitions and protocol violations through the `log` crate's macros. Without it, the shims
//! still expand their arguments through `format_args!`, so log statements stay type-checked but
//! compile to nothing.

/// Generates one shim per log level, dispatching on the `log` feature. The leading `$d` takes a
/// literal `$` so the generated macros can declare their own `$t` repetition.
macro_rules! define_log_shims {
    ($d:tt $($name:ident),*) => {
        $(
            #[cfg(feature = "log")]
            macro_rules! $name {
                ($d($d t:tt)*) => {{ log::$name!($d($d t)*); }};
            }

            #[cfg(not(feature = "log"))]
            macro_rules! $name {
                ($d($d t:tt)*) => {{ format_args!($d($d t)*); }};
            }
        )*
    };
}

define_log_shims!($ error, warn, info, debug);
