//! The single dispatch path for session actions.
//!
//! Inline sessions run the action on a spawned task so a panicking action
//! cannot take the worker down. Isolated sessions run it on a blocking thread
//! that owns a private current-thread runtime and are bounded by a hard
//! timeout. On timeout the action is cancelled on its own thread and the
//! session closed there before control returns, so no work on the session
//! outlives the call. A session that panicked or timed out is not handed back.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tokio::task::JoinError;

use super::{BrowserSession, ExecutionMode, SessionError};

/// Future returned by a session action borrowing the session for `'a`.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// How long a cancelled isolated action gets to unwind and close its session.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Result of a dispatched action together with the session, if it survived.
#[derive(Debug)]
pub struct ActionOutcome<T> {
    pub session: Option<Box<dyn BrowserSession>>,
    pub result: Result<T, SessionError>,
}

/// Runs `action` against `session`, honouring the session's execution mode.
pub async fn run_session_action<T, F>(
    session: Box<dyn BrowserSession>,
    action: F,
    isolated_timeout: Duration,
) -> ActionOutcome<T>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, T> + Send + 'static,
{
    match session.execution_mode() {
        ExecutionMode::Inline => run_inline(session, action).await,
        ExecutionMode::Isolated => run_isolated(session, action, isolated_timeout).await,
    }
}

async fn run_inline<T, F>(mut session: Box<dyn BrowserSession>, action: F) -> ActionOutcome<T>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, T> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let result = action(session.as_mut()).await;
        (session, result)
    });

    match task.await {
        Ok((session, result)) => ActionOutcome {
            session: Some(session),
            result,
        },
        Err(err) => crashed(err),
    }
}

async fn run_isolated<T, F>(
    mut session: Box<dyn BrowserSession>,
    action: F,
    limit: Duration,
) -> ActionOutcome<T>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, T> + Send + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let mut task = tokio::task::spawn_blocking(move || {
        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                let err = SessionError::Crashed(format!("isolated runtime unavailable: {err}"));
                return (session, Some(Err(err)));
            }
        };
        let result = runtime.block_on(async {
            tokio::select! {
                result = action(session.as_mut()) => Some(result),
                _ = cancel_rx => None,
            }
        });
        if result.is_none()
            && let Err(err) = runtime.block_on(session.close())
        {
            log::warn!("failed to close cancelled isolated session: {err}");
        }
        (session, result)
    });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok((session, Some(result)))) => ActionOutcome {
            session: Some(session),
            result,
        },
        Ok(Ok((_, None))) => timed_out(limit),
        Ok(Err(err)) => crashed(err),
        Err(_) => {
            log::warn!("isolated session action exceeded {limit:?}, tearing session down");
            // A send error means the action already finished; its session is
            // dropped with the task either way.
            let _ = cancel_tx.send(());
            match tokio::time::timeout(TEARDOWN_GRACE, task).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log::error!("isolated session crashed during teardown: {err}"),
                Err(_) => log::error!(
                    "isolated session still busy {TEARDOWN_GRACE:?} after cancellation, abandoning its thread"
                ),
            }
            timed_out(limit)
        }
    }
}

fn timed_out<T>(limit: Duration) -> ActionOutcome<T> {
    ActionOutcome {
        session: None,
        result: Err(SessionError::Timeout(limit)),
    }
}

fn crashed<T>(err: JoinError) -> ActionOutcome<T> {
    let message = if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "session task cancelled".to_string()
    };
    log::error!("session action crashed: {message}");
    ActionOutcome {
        session: None,
        result: Err(SessionError::Crashed(message)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "action panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::Proxy;
    use crate::session::{BrowserFamily, IdentityGenerator, SessionIdentity, SessionVariant};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counters {
        navigations: AtomicUsize,
        closes: AtomicUsize,
    }

    #[derive(Debug)]
    struct FakeSession {
        mode: ExecutionMode,
        identity: SessionIdentity,
        visits: Vec<String>,
        counters: Arc<Counters>,
    }

    impl FakeSession {
        fn boxed(mode: ExecutionMode) -> Box<dyn BrowserSession> {
            Self::counted(mode, Arc::default())
        }

        fn counted(mode: ExecutionMode, counters: Arc<Counters>) -> Box<dyn BrowserSession> {
            Box::new(Self {
                mode,
                identity: IdentityGenerator::new().identity_for("fake", BrowserFamily::Chrome),
                visits: Vec::new(),
                counters,
            })
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        fn variant(&self) -> SessionVariant {
            SessionVariant::Standard
        }

        fn execution_mode(&self) -> ExecutionMode {
            self.mode
        }

        fn identity(&self) -> &SessionIdentity {
            &self.identity
        }

        fn proxy(&self) -> Option<&Proxy> {
            None
        }

        async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
            if url.contains("slow") {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if url.contains("boom") {
                panic!("renderer died");
            }
            self.visits.push(url.to_string());
            self.counters.navigations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn content(&self) -> Result<String, SessionError> {
            Ok(self.visits.join(","))
        }

        async fn execute(&mut self, _script: &str) -> Result<String, SessionError> {
            Err(SessionError::Unsupported("script"))
        }

        async fn close(&mut self) -> Result<(), SessionError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn visit(
        url: &'static str,
    ) -> impl for<'a> FnOnce(&'a mut dyn BrowserSession) -> SessionFuture<'a, String> + Send + 'static
    {
        move |session| {
            Box::pin(async move {
                session.navigate(url).await?;
                session.content().await
            })
        }
    }

    #[tokio::test]
    async fn inline_and_isolated_return_the_session() {
        for mode in [ExecutionMode::Inline, ExecutionMode::Isolated] {
            let outcome = run_session_action(
                FakeSession::boxed(mode),
                visit("https://a.example"),
                Duration::from_secs(2),
            )
            .await;
            assert_eq!(outcome.result.unwrap(), "https://a.example");
            assert!(outcome.session.is_some());
        }
    }

    #[tokio::test]
    async fn panics_become_crash_errors() {
        for mode in [ExecutionMode::Inline, ExecutionMode::Isolated] {
            let outcome = run_session_action(
                FakeSession::boxed(mode),
                visit("https://boom.example"),
                Duration::from_secs(2),
            )
            .await;
            assert!(matches!(
                outcome.result,
                Err(SessionError::Crashed(ref msg)) if msg.contains("renderer died")
            ));
            assert!(outcome.session.is_none());
        }
    }

    #[tokio::test]
    async fn isolated_actions_are_hard_timed_out() {
        let outcome = run_session_action(
            FakeSession::boxed(ExecutionMode::Isolated),
            visit("https://slow.example"),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(outcome.result, Err(SessionError::Timeout(_))));
        assert!(outcome.session.is_none());
    }

    #[tokio::test]
    async fn timed_out_actions_stop_before_control_returns() {
        let counters = Arc::new(Counters::default());
        let outcome = run_session_action(
            FakeSession::counted(ExecutionMode::Isolated, counters.clone()),
            visit("https://slow.example"),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(outcome.result, Err(SessionError::Timeout(_))));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(counters.navigations.load(Ordering::SeqCst), 0);
    }
}
