macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return std::result::Result::Err($err.into());
        }
    };
}

macro_rules! bail {
    ($err:expr $(,)?) => {{
        return std::result::Result::Err($err.into());
    }};
}

/// A wrapper around `&[u8]` that implements [`std::fmt::Display`] in a more intelligent way.
pub struct DisplayBytes<'a>(pub &'a [u8]);

impl std::fmt::Display for DisplayBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = match std::str::from_utf8(self.0) {
            Ok(string) => string,
            Err(_) => {
                return f.write_fmt(format_args!("<{} bytes>", self.0.len()));
            },
        };

        match string.parse::<serde_json::Value>() {
            Ok(serde_json::Value::Object(map)) => {
                if map.len() == 1 {
                    return f.write_fmt(format_args!(
                        "<JSON dict with key '{}'>",
                        map.keys().next().unwrap()
                    ));
                } else {
                    return f.write_fmt(format_args!("<JSON dict with {} keys>", map.len()));
                }
            },
            Ok(serde_json::Value::Array(list)) => {
                return f.write_fmt(format_args!("<JSON array with {} entry/ies>", list.len()));
            },
            _ => (),
        }

        if string.len() > 20 {
            f.write_fmt(format_args!("\"{:.15}…\"", string.replace('"', "\\\"")))
        } else {
            f.write_fmt(format_args!("\"{}\"", string.replace('"', "\\\"")))
        }
    }
}

/**
 * Increment a counter stored as little-endian bytes: add one to byte zero and
 * carry upwards. Native reimplementation of libsodium's `increment_le`.
 */
pub fn sodium_increment_le(n: &mut [u8]) {
    let mut c = 1u16;
    for b in n {
        c += *b as u16;
        *b = c as u8;
        c >>= 8;
    }
}

pub async fn timeout<F, T>(
    duration: std::time::Duration,
    future: F,
) -> Result<T, async_std::future::TimeoutError>
where
    F: futures::Future<Output = T>,
{
    async_std::future::timeout(duration, future).await
}

/// Run a future and a cancellation trigger concurrently.
///
/// At its core, it is an [`futures::future::Abortable`], but instead of an
/// `AbortHandle` we use a future that resolves as trigger. Under the hood it is
/// a `select` that maps one of the outcomes to an error type.
pub async fn cancellable<T>(
    future: impl futures::Future<Output = T>,
    cancel: impl futures::Future<Output = ()>,
) -> Result<T, Cancelled> {
    use futures::future::Either;
    futures::pin_mut!(future);
    futures::pin_mut!(cancel);
    match futures::future::select(future, cancel).await {
        Either::Left((val, _)) => Ok(val),
        Either::Right(((), _)) => Err(Cancelled),
    }
}

/// Indicator that a task was cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task has been cancelled")
    }
}
