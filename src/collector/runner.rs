use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::{
    collector::{
        CollectContext, Flavor, Source,
        session::{SessionLease, SessionProvider},
    },
    error::CollectError,
    metrics::{METRICS, RuntimeMetrics},
    schema::RateObservation,
    util,
};

/// Longest wait for an orderly session close once collection is over.
pub const RELEASE_GRACE: Duration = Duration::from_secs(10);

/// Runs one collector invocation to completion or failure.
///
/// This function is the per-collector boundary:
/// - Missing endpoint -> `ConfigurationMissing`, collector never called
/// - Bounded by `budget` (session startup included for stateful sources)
/// - `cancel` ends the invocation early with `Cancelled`
/// - Panics inside the collector become `Panicked`
/// - Non-positive values become `ValueUnparsable`
///
/// GUARANTEES:
/// - A stateful source's session is closed and awaited on every exit
///   path, timeout and interrupt included, within `RELEASE_GRACE`.
///   Only if the close itself stalls, or this future is dropped, does
///   the lease fall back to abandoning the session from `Drop`.
///
/// This function does NOT:
/// - Touch the status board (caller's job)
/// - Retry
///
pub async fn collect_once(
    source: &Source,
    http: &reqwest::Client,
    sessions: &dyn SessionProvider,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<RateObservation, CollectError> {
    let Some(endpoint) = source.endpoint.as_deref() else {
        warn!("[{}] no endpoint configured", source.id);
        return Err(CollectError::ConfigurationMissing(source.id.clone()));
    };

    RuntimeMetrics::incr(&METRICS.collectors_started);
    debug!("[{}] collecting from {endpoint}", source.id);

    let deadline = Instant::now() + budget;
    let value = match source.flavor() {
        Flavor::Stateless => {
            let ctx = CollectContext::new(&source.id, endpoint, http);
            bounded(guarded(source.collector.collect(ctx)), deadline, budget, cancel).await
        }
        Flavor::Stateful => {
            let acquire = SessionLease::acquire(sessions, &source.id);
            match bounded(acquire, deadline, budget, cancel).await {
                Ok(mut lease) => {
                    let result = match lease.session() {
                        Ok(session) => {
                            let ctx = CollectContext::new(&source.id, endpoint, http)
                                .with_session(session);
                            let attempt = guarded(source.collector.collect(ctx));
                            bounded(attempt, deadline, budget, cancel).await
                        }
                        Err(e) => Err(e),
                    };
                    if timeout(RELEASE_GRACE, lease.release()).await.is_err() {
                        warn!("[{}] session close stalled, abandoning it", source.id);
                    }
                    result
                }
                Err(e) => Err(e),
            }
        }
    };

    let outcome = value.and_then(|rate| {
        RateObservation::new(source.bank_name(), rate, util::now())
            .ok_or_else(|| CollectError::ValueUnparsable(rate.to_string()))
    });

    match &outcome {
        Ok(obs) => {
            RuntimeMetrics::incr(&METRICS.collectors_completed);
            info!("[{}] {} TT buy = {}", source.id, obs.bank(), obs.tt_buy_rate());
        }
        Err(e) => {
            if matches!(e, CollectError::Timeout(_)) {
                RuntimeMetrics::incr(&METRICS.collectors_timed_out);
            }
            RuntimeMetrics::incr(&METRICS.collectors_failed);
            warn!("[{}] failed: {e}", source.id);
        }
    }

    outcome
}

/// Races `fut` against the invocation deadline and the interrupt.
async fn bounded<F, T>(
    fut: F,
    deadline: Instant,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<T, CollectError>
where
    F: Future<Output = Result<T, CollectError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollectError::Cancelled),
        res = timeout_at(deadline, fut) => res.unwrap_or(Err(CollectError::Timeout(budget))),
    }
}

/// Converts a panic inside a collector into an error.
async fn guarded<F>(fut: F) -> Result<Decimal, CollectError>
where
    F: Future<Output = Result<Decimal, CollectError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CollectError::Panicked(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::RateCollector;
    use crate::collector::session::{RenderRequest, RenderSession};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Decimal, Flavor);

    #[async_trait::async_trait]
    impl RateCollector for Fixed {
        fn bank_name(&self) -> &'static str {
            "Fixed Bank"
        }
        fn flavor(&self) -> Flavor {
            self.1
        }
        async fn collect(&self, mut ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
            if self.1 == Flavor::Stateful {
                ctx.session()?;
            }
            Ok(self.0)
        }
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl RateCollector for Panicky {
        fn bank_name(&self) -> &'static str {
            "Panicky"
        }
        fn flavor(&self) -> Flavor {
            Flavor::Stateless
        }
        async fn collect(&self, _ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
            panic!("table layout changed");
        }
    }

    #[derive(Default)]
    struct Counting {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct CountingSession(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl RenderSession for CountingSession {
        async fn render(&mut self, _req: RenderRequest<'_>) -> Result<String, CollectError> {
            Ok(String::new())
        }
        async fn close(&mut self) -> Result<(), CollectError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn abandon(&mut self) {}
    }

    #[async_trait::async_trait]
    impl SessionProvider for Counting {
        async fn open(&self) -> Result<Box<dyn RenderSession>, CollectError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession(self.closed.clone())))
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl RateCollector for Stuck {
        fn bank_name(&self) -> &'static str {
            "Stuck"
        }
        fn flavor(&self) -> Flavor {
            Flavor::Stateful
        }
        async fn collect(&self, mut ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
            ctx.session()?;
            std::future::pending().await
        }
    }

    fn source(c: impl RateCollector + 'static, endpoint: Option<&str>) -> Source {
        Source::new("test", endpoint.map(str::to_string), Arc::new(c))
    }

    async fn run(src: &Source, sessions: &Counting) -> Result<RateObservation, CollectError> {
        let http = reqwest::Client::new();
        collect_once(src, &http, sessions, Duration::from_secs(1), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn missing_endpoint_is_configuration_missing() {
        let sessions = Counting::default();
        let src = source(Fixed(dec!(83), Flavor::Stateless), None);
        let err = run(&src, &sessions).await.unwrap_err();
        assert!(matches!(err, CollectError::ConfigurationMissing(_)));
    }

    #[tokio::test]
    async fn zero_rate_is_unparsable() {
        let sessions = Counting::default();
        let src = source(Fixed(dec!(0), Flavor::Stateless), Some("http://x"));
        let err = run(&src, &sessions).await.unwrap_err();
        assert!(matches!(err, CollectError::ValueUnparsable(_)));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let sessions = Counting::default();
        let src = source(Panicky, Some("http://x"));
        match run(&src, &sessions).await.unwrap_err() {
            CollectError::Panicked(msg) => assert!(msg.contains("table layout changed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stateful_session_is_opened_and_closed_once() {
        let sessions = Counting::default();
        let src = source(Fixed(dec!(83.5), Flavor::Stateful), Some("http://x"));
        let obs = run(&src, &sessions).await.unwrap();
        assert_eq!(obs.bank(), "Fixed Bank");
        assert_eq!(obs.tt_buy_rate(), dec!(83.5));
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stateless_sources_never_open_sessions() {
        let sessions = Counting::default();
        let src = source(Fixed(dec!(83.5), Flavor::Stateless), Some("http://x"));
        run(&src, &sessions).await.unwrap();
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_session_is_closed_before_returning() {
        let sessions = Counting::default();
        let src = source(Stuck, Some("http://x"));
        let err = run(&src, &sessions).await.unwrap_err();
        assert!(matches!(err, CollectError::Timeout(_)));
        assert_eq!(sessions.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_closes_session_before_returning() {
        let http = reqwest::Client::new();
        let sessions = Counting::default();
        let src = source(Stuck, Some("http://x"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let budget = Duration::from_secs(90);
        let err = collect_once(&src, &http, &sessions, budget, &cancel).await.unwrap_err();

        assert!(matches!(err, CollectError::Cancelled));
        assert_eq!(started.elapsed().as_secs(), 5);
        assert_eq!(sessions.opened.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.closed.load(Ordering::SeqCst), 1);
    }
}
