use std::{
    fmt::{self, Debug},
    future::Future,
    panic::Location,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

pub trait ResultExt<E> {
    type Ok;

    fn log_err(self) -> Option<Self::Ok>;
    /// Like `log_err`, but logs at warn level instead of error.
    fn warn_on_err(self) -> Option<Self::Ok>;
}

impl<T, E> ResultExt<E> for Result<T, E>
where
    E: Debug,
{
    type Ok = T;

    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                log_error_with_caller(*Location::caller(), error, log::Level::Error);
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                log_error_with_caller(*Location::caller(), error, log::Level::Warn);
                None
            }
        }
    }
}

fn log_error_with_caller<E>(caller: Location<'static>, error: E, level: log::Level)
where
    E: Debug,
{
    let file = caller.file();
    log::log!(level, "{}:{}: {:?}", file, caller.line(), error);
}

pub trait TryFutureExt {
    fn log_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized;

    fn warn_on_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized;
}

impl<F, T, E> TryFutureExt for F
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    #[track_caller]
    fn log_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized,
    {
        LogErrorFuture(self, log::Level::Error, *Location::caller())
    }

    #[track_caller]
    fn warn_on_err(self) -> LogErrorFuture<Self>
    where
        Self: Sized,
    {
        LogErrorFuture(self, log::Level::Warn, *Location::caller())
    }
}

#[must_use]
pub struct LogErrorFuture<F>(F, log::Level, Location<'static>);

impl<F, T, E> Future for LogErrorFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let level = self.1;
        let location = self.2;
        let inner = unsafe { Pin::new_unchecked(&mut self.get_unchecked_mut().0) };
        match inner.poll(cx) {
            Poll::Ready(output) => Poll::Ready(match output {
                Ok(output) => Some(output),
                Err(error) => {
                    log_error_with_caller(location, error, level);
                    None
                }
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimedOut(pub Duration);

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out after {:?}", self.0)
    }
}

impl std::error::Error for TimedOut {}

/// Resolves to the output of `future`, or to `TimedOut` once `duration` has
/// elapsed. The future is dropped on timeout.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    let timer = async {
        smol::Timer::after(duration).await;
        Err(TimedOut(duration))
    };
    smol::future::or(async { Ok(future.await) }, timer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[ctor::ctor]
    fn init_logger() {
        if std::env::var("RUST_LOG").is_ok() {
            env_logger::init();
        }
    }

    #[test]
    fn test_log_err() {
        assert_eq!(Ok::<_, anyhow::Error>(3).log_err(), Some(3));
        assert_eq!(Err::<u32, _>(anyhow!("boom")).log_err(), None);
        assert_eq!(Err::<u32, _>("soft").warn_on_err(), None);
    }

    #[test]
    fn test_future_log_err() {
        smol::block_on(async {
            assert_eq!(async { Ok::<_, anyhow::Error>(1) }.log_err().await, Some(1));
            assert_eq!(
                async { Err::<u8, _>(anyhow!("failed")) }.log_err().await,
                None
            );
        });
    }

    #[test]
    fn test_timeout() {
        smol::block_on(async {
            let fast = timeout(Duration::from_millis(200), async { 7 }).await;
            assert_eq!(fast, Ok(7));

            let slow = timeout(
                Duration::from_millis(10),
                smol::Timer::after(Duration::from_millis(500)),
            )
            .await;
            assert_eq!(slow.unwrap_err(), TimedOut(Duration::from_millis(10)));
        });
    }
}
