#![allow(unused_macros)]

macro_rules! cfg_tls {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "tls")]
            #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
            $item
        )*
    }
}

/// Logging wrappers that compile away when the `log` feature is disabled.
#[cfg(feature = "log")]
macro_rules! trace_log {
    ($($t:tt)*) => { log::trace!($($t)*) }
}
#[cfg(not(feature = "log"))]
macro_rules! trace_log {
    ($($t:tt)*) => {{}}
}

#[cfg(feature = "log")]
macro_rules! error_log {
    ($($t:tt)*) => { log::error!($($t)*) }
}
#[cfg(not(feature = "log"))]
macro_rules! error_log {
    ($($t:tt)*) => {{}}
}
