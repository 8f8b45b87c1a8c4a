//! Collector contract.
//!
//! A collector turns one configured source into one TT buy rate.
//! The orchestration layer (`runner`, `crate::orchestrator`) owns
//! timeouts, session lifetime, panics and status reporting; a
//! collector only fetches and extracts.
//!
//! Two execution flavors exist:
//! - `Stateless`: plain request/response calls, safe to run concurrently
//! - `Stateful`: needs an exclusive rendering session, run one at a time

pub mod runner;
pub mod session;

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::CollectError;
use session::RenderSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Stateless,
    Stateful,
}

/// Everything a collector may touch during one invocation.
///
/// Built by the runner per call; nothing is shared through globals.
pub struct CollectContext<'a> {
    /// Source id, for log lines
    pub source_id: &'a str,

    /// Resolved endpoint. A source without one never reaches a collector.
    pub endpoint: &'a str,

    /// Shared HTTP client carrying the identification header
    pub http: &'a reqwest::Client,

    session: Option<&'a mut dyn RenderSession>,
}

impl<'a> CollectContext<'a> {
    pub fn new(source_id: &'a str, endpoint: &'a str, http: &'a reqwest::Client) -> Self {
        Self {
            source_id,
            endpoint,
            http,
            session: None,
        }
    }

    pub fn with_session(mut self, session: &'a mut dyn RenderSession) -> Self {
        self.session = Some(session);
        self
    }

    /// The exclusive rendering session. Only stateful invocations get one.
    pub fn session(&mut self) -> Result<&mut (dyn RenderSession + 'a), CollectError> {
        match self.session.as_deref_mut() {
            Some(s) => Ok(s),
            None => Err(CollectError::SessionResource(format!(
                "no rendering session provided to '{}'",
                self.source_id
            ))),
        }
    }
}

/// One bank's extraction strategy.
///
/// IMPLEMENTATIONS MUST:
/// - Return `StructureNotRecognized` when the parse target is absent
/// - Return `ValueUnparsable` when text is found but is not a rate
/// - Never hold the session beyond `collect`
///
/// The returned value is checked for positivity by the runner.
#[async_trait::async_trait]
pub trait RateCollector: Send + Sync {
    /// Bank name stored with each observation (e.g. "Kotak Bank").
    fn bank_name(&self) -> &'static str;

    fn flavor(&self) -> Flavor;

    async fn collect(&self, ctx: CollectContext<'_>) -> Result<Decimal, CollectError>;
}

/// A configured source: immutable for the duration of a run.
#[derive(Clone)]
pub struct Source {
    pub id: String,
    pub endpoint: Option<String>,
    pub collector: Arc<dyn RateCollector>,
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        endpoint: Option<String>,
        collector: Arc<dyn RateCollector>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint,
            collector,
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.collector.flavor()
    }

    pub fn bank_name(&self) -> &'static str {
        self.collector.bank_name()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("bank", &self.bank_name())
            .field("flavor", &self.flavor())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
