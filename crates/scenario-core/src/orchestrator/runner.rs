//! Runs test definitions: setup, concurrent scenario actors, cleanup

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{stream, FutureExt, StreamExt};
use sipdrill_infra_common::LogContext;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Level};

use super::definition::{StepFuture, TestBuilder, TestDefinition};
use super::report::{ActorFailure, SuiteReport, TestOutcome, TestReport};
use crate::config::HarnessConfig;
use crate::errors::{ScenarioError, ScenarioResult};
use crate::transport::SipNetwork;

/// Executes tests against one network
pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    network: Arc<dyn SipNetwork>,
    numbers: Arc<AtomicU32>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `step` bounded by `limit`, turning a panic into an error
async fn bounded(label: &str, step: StepFuture, limit: Duration) -> ScenarioResult<()> {
    match tokio::time::timeout(limit, AssertUnwindSafe(step).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(ScenarioError::assertion(format!(
            "{} panicked: {}",
            label,
            panic_message(payload)
        ))),
        Err(_) => Err(ScenarioError::receive_timeout(
            format!("{} to finish", label),
            limit,
        )),
    }
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, network: Arc<dyn SipNetwork>) -> ScenarioResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            network,
            numbers: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one test to completion. Never fails: every problem ends up in the
    /// report.
    pub async fn run_test(&self, definition: &TestDefinition) -> TestReport {
        let span = LogContext::with_operation("orchestrator", "test")
            .with_field("test", definition.name())
            .span(Level::INFO);
        self.run_test_inner(definition).instrument(span).await
    }

    async fn run_test_inner(&self, definition: &TestDefinition) -> TestReport {
        let name = definition.name().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut report = TestReport {
            name: name.clone(),
            outcome: TestOutcome::Passed,
            cancelled: Vec::new(),
            cleanup_errors: Vec::new(),
            started_at,
            duration_ms: 0,
        };

        let mut builder = TestBuilder::new(
            &name,
            self.config.clone(),
            self.network.clone(),
            self.numbers.clone(),
        );
        if let Err(e) = definition
            .build(&mut builder)
            .and_then(|_| builder.check_runnable())
        {
            error!(test = %name, error = %e, "test definition failed");
            report.outcome = TestOutcome::Failed {
                failures: vec![ActorFailure {
                    actor: "definition".to_string(),
                    error: e,
                }],
            };
            detach_all(&builder);
            report.duration_ms = clock.elapsed().as_millis() as u64;
            return report;
        }

        if let Some(reason) = builder.skip_reason.clone() {
            info!(test = %name, %reason, "test skipped");
            report.outcome = TestOutcome::Skipped { reason };
            detach_all(&builder);
            return report;
        }

        info!(
            test = %name,
            endpoints = builder.endpoints.len(),
            actors = builder.scenarios.len(),
            "test started"
        );
        let limit = self.config.scenario_timeout();
        let mut failures = Vec::new();

        let mut setup_ok = true;
        for (i, step) in std::mem::take(&mut builder.setup).into_iter().enumerate() {
            if let Err(e) = bounded(&format!("setup step {}", i + 1), step, limit).await {
                error!(test = %name, step = i + 1, error = %e, "setup failed");
                failures.push(ActorFailure {
                    actor: "setup".to_string(),
                    error: e,
                });
                setup_ok = false;
                break;
            }
        }

        if setup_ok {
            let (actor_failures, cancelled) = self.run_actors(&name, &mut builder).await;
            failures.extend(actor_failures);
            report.cancelled = cancelled;
        } else {
            report.cancelled = builder.scenarios.drain(..).map(|a| a.name).collect();
        }

        if let Err(e) = builder.validation_result() {
            warn!(test = %name, error = %e, "message bodies failed validation");
            failures.push(ActorFailure {
                actor: "validation".to_string(),
                error: e,
            });
        }

        for (i, step) in std::mem::take(&mut builder.cleanup).into_iter().enumerate() {
            if let Err(e) = bounded(&format!("cleanup step {}", i + 1), step, limit).await {
                warn!(test = %name, step = i + 1, error = %e, "cleanup failed");
                report.cleanup_errors.push(e.to_string());
            }
        }
        detach_all(&builder);

        report.duration_ms = clock.elapsed().as_millis() as u64;
        if !failures.is_empty() {
            report.outcome = TestOutcome::Failed { failures };
        }
        info!(test = %name, passed = report.passed(), duration_ms = report.duration_ms, "test finished");
        report
    }

    /// Spawn every scenario actor and join them. Returns the failures and the
    /// actors cancelled after a sibling failed.
    async fn run_actors(
        &self,
        test: &str,
        builder: &mut TestBuilder,
    ) -> (Vec<ActorFailure>, Vec<String>) {
        let limit = self.config.scenario_timeout();
        let mut pending: Vec<String> = Vec::new();
        let mut tasks = JoinSet::new();

        for actor in builder.scenarios.drain(..) {
            let span = LogContext::actor(test, actor.name.as_str()).span(Level::INFO);
            let name = actor.name.clone();
            pending.push(name.clone());
            tasks.spawn(
                async move {
                    debug!("actor started");
                    let label = format!("scenario '{}'", name);
                    let result = bounded(&label, actor.future, limit).await;
                    (name, result)
                }
                .instrument(span),
            );
        }

        let mut failures = Vec::new();
        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!(test, error = %e, "actor task failed to join");
                    continue;
                }
            };
            if let Some(pos) = pending.iter().position(|p| *p == name) {
                pending.remove(pos);
            }

            match result {
                Ok(()) => debug!(test, actor = %name, "actor finished"),
                Err(ScenarioError::Cancelled { reason }) if aborted => {
                    debug!(test, actor = %name, %reason, "actor cancelled");
                    pending.push(name);
                }
                Err(e) => {
                    error!(test, actor = %name, error = %e, "actor failed");
                    failures.push(ActorFailure { actor: name, error: e });
                    if self.config.abort_on_first_failure && !aborted {
                        aborted = true;
                        tasks.abort_all();
                    }
                }
            }
        }

        if aborted && !pending.is_empty() {
            info!(test, cancelled = ?pending, "cancelled remaining actors");
        }
        let cancelled = if aborted { pending } else { Vec::new() };
        (failures, cancelled)
    }

    /// Run `definitions`, up to `max_parallel_tests` at a time. Reports keep
    /// definition order.
    pub async fn run_suite(&self, definitions: &[TestDefinition]) -> SuiteReport {
        let parallel = self.config.max_parallel_tests.max(1);
        let reports = stream::iter(definitions)
            .map(|definition| self.run_test(definition))
            .buffered(parallel)
            .collect::<Vec<_>>()
            .await;
        let suite = SuiteReport::new(reports);
        info!(
            passed = suite.passed,
            failed = suite.failed,
            skipped = suite.skipped,
            "suite finished"
        );
        suite
    }
}

fn detach_all(builder: &TestBuilder) {
    for endpoint in &builder.endpoints {
        endpoint.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Inbox;
    use crate::orchestrator::Capability;
    use crate::sip::SipMessage;
    use crate::transport::SipTransport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct NullNetwork {
        detached: Mutex<Vec<String>>,
    }

    struct NullTransport;

    #[async_trait]
    impl SipTransport for NullTransport {
        async fn send(&self, _message: SipMessage) -> ScenarioResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SipNetwork for NullNetwork {
        fn attach(&self, _contact: &str, _inbox: Arc<Inbox>) -> ScenarioResult<Arc<dyn SipTransport>> {
            Ok(Arc::new(NullTransport))
        }

        fn detach(&self, contact: &str) {
            self.detached.lock().push(contact.to_string());
        }

        async fn provision_services(&self, _aor: &str, _simservs_xml: String) -> ScenarioResult<()> {
            Ok(())
        }
    }

    fn orchestrator(network: Arc<NullNetwork>) -> Orchestrator {
        Orchestrator::new(HarnessConfig::default(), network).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_passing_test_runs_all_phases() {
        let network = Arc::new(NullNetwork::default());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let definition = TestDefinition::new("phases", move |t| {
            t.add_endpoint()?;
            let barrier = t.barrier("meet", 2)?;
            let b1 = barrier.clone();
            t.add_setup(async { Ok(()) });
            t.add_scenario("a", async move { b1.wait().await.map(|_| ()) });
            t.add_scenario("b", async move { barrier.wait().await.map(|_| ()) });
            let flag = flag.clone();
            t.add_cleanup(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        let report = orchestrator(network.clone()).run_test(&definition).await;
        assert!(report.passed(), "{}", report);
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(network.detached.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_siblings_and_cleanup_still_runs() {
        let network = Arc::new(NullNetwork::default());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let definition = TestDefinition::new("abort", move |t| {
            let barrier = t.barrier("never", 2)?;
            t.add_scenario("failing", async { Err(ScenarioError::assertion("boom")) });
            t.add_scenario("waiting", async move { barrier.wait().await.map(|_| ()) });
            let flag = flag.clone();
            t.add_cleanup(async move {
                flag.store(true, Ordering::SeqCst);
                Err(ScenarioError::transport("cleanup hiccup"))
            });
            Ok(())
        });

        let report = orchestrator(network).run_test(&definition).await;
        assert!(report.outcome.is_failed());
        assert!(report.failure_of("failing").is_some());
        assert_eq!(report.cancelled, vec!["waiting".to_string()]);
        assert_eq!(report.cleanup_errors.len(), 1);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_skips_scenarios() {
        let network = Arc::new(NullNetwork::default());
        let definition = TestDefinition::new("setup", |t| {
            t.add_setup(async { Err(ScenarioError::protocol("registrar down")) });
            t.add_scenario("never", async { panic!("must not run") });
            Ok(())
        });

        let report = orchestrator(network).run_test(&definition).await;
        assert!(report.failure_of("setup").is_some());
        assert_eq!(report.cancelled, vec!["never".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_actor_is_a_failure() {
        let definition = TestDefinition::new("panic", |t| {
            t.add_scenario("wild", async { panic!("unexpected state") });
            Ok(())
        });
        let report = orchestrator(Arc::new(NullNetwork::default()))
            .run_test(&definition)
            .await;
        let error = report.failure_of("wild").unwrap();
        assert!(error.to_string().contains("unexpected state"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_actor_times_out() {
        let definition = TestDefinition::new("hang", |t| {
            t.add_scenario("stuck", std::future::pending());
            Ok(())
        });
        let report = orchestrator(Arc::new(NullNetwork::default()))
            .run_test(&definition)
            .await;
        assert!(report.failure_of("stuck").unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_skip_and_definition_errors() {
        let network = Arc::new(NullNetwork::default());
        let config = HarnessConfig::default().with_capabilities(Default::default());
        let orchestrator = Orchestrator::new(config, network).unwrap();

        let skipped = TestDefinition::new("mmtel only", |t| {
            t.skip_unless(Capability::Mmtel);
            t.add_scenario("a", async { Ok(()) });
            Ok(())
        });
        let empty = TestDefinition::new("empty", |_| Ok(()));

        let suite = orchestrator.run_suite(&[skipped, empty]).await;
        assert_eq!(suite.tests[0].name, "mmtel only");
        assert_eq!(
            suite.tests[0].outcome,
            TestOutcome::Skipped { reason: "requires mmtel".into() }
        );
        assert!(suite.tests[1].failure_of("definition").is_some());
        assert_eq!((suite.skipped, suite.failed), (1, 1));
    }
}
