//! Test definitions and the builder their setup code runs against

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::barrier::Barrier;
use crate::config::HarnessConfig;
use crate::endpoint::{Endpoint, EndpointIdentity};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::subscription::ValidationCollector;
use crate::transport::SipNetwork;

/// A boxed step of a test: setup, scenario actor or cleanup
pub type StepFuture = Pin<Box<dyn Future<Output = ScenarioResult<()>> + Send + 'static>>;

type BuildFn = dyn Fn(&mut TestBuilder) -> ScenarioResult<()> + Send + Sync;

/// Device features a test may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Mmtel,
    ShortRegistration,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Mmtel => write!(f, "mmtel"),
            Capability::ShortRegistration => write!(f, "short_registration"),
        }
    }
}

/// A named test. The build function declares endpoints, barriers and the
/// setup, scenario and cleanup steps; it runs once per execution of the test.
#[derive(Clone)]
pub struct TestDefinition {
    name: String,
    build: Arc<BuildFn>,
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition").field("name", &self.name).finish()
    }
}

impl TestDefinition {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&mut TestBuilder) -> ScenarioResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            build: Arc::new(build),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(&self, builder: &mut TestBuilder) -> ScenarioResult<()> {
        (self.build)(builder)
    }
}

/// A scenario actor waiting to be spawned
pub(crate) struct Actor {
    pub(crate) name: String,
    pub(crate) future: StepFuture,
}

/// Collects everything one test needs while its build function runs
pub struct TestBuilder {
    test_name: String,
    config: Arc<HarnessConfig>,
    network: Arc<dyn SipNetwork>,
    numbers: Arc<AtomicU32>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) skip_reason: Option<String>,
    pub(crate) setup: Vec<StepFuture>,
    pub(crate) scenarios: Vec<Actor>,
    pub(crate) cleanup: Vec<StepFuture>,
    validator: Arc<ValidationCollector>,
}

impl TestBuilder {
    pub(crate) fn new(
        test_name: &str,
        config: Arc<HarnessConfig>,
        network: Arc<dyn SipNetwork>,
        numbers: Arc<AtomicU32>,
    ) -> Self {
        Self {
            test_name: test_name.to_string(),
            config,
            network,
            numbers,
            endpoints: Vec::new(),
            skip_reason: None,
            setup: Vec::new(),
            scenarios: Vec::new(),
            cleanup: Vec::new(),
            validator: Arc::new(ValidationCollector::new()),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn next_user(&self) -> String {
        let n = self.numbers.fetch_add(1, Ordering::Relaxed);
        format!("65055{:05}", n % 100_000)
    }

    fn attach(&mut self, identity: EndpointIdentity) -> ScenarioResult<Endpoint> {
        let endpoint = Endpoint::new(identity, self.config.clone(), self.network.clone())?;
        debug!(test = %self.test_name, uri = %endpoint.uri(), "endpoint added");
        self.endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    /// A new endpoint with its own number in the home domain
    pub fn add_endpoint(&mut self) -> ScenarioResult<Endpoint> {
        let identity = EndpointIdentity::new(&self.next_user(), &self.config.home_domain);
        self.attach(identity)
    }

    /// A second public identity of the subscriber behind `endpoint`
    pub fn add_public_identity(&mut self, endpoint: &Endpoint) -> ScenarioResult<Endpoint> {
        let identity = endpoint.identity().public_identity(&self.next_user());
        self.attach(identity)
    }

    /// Skip the test unless the device under test has `capability`
    pub fn skip_unless(&mut self, capability: Capability) {
        let enabled = match capability {
            Capability::Mmtel => self.config.capabilities.mmtel,
            Capability::ShortRegistration => self.config.capabilities.short_registration,
        };
        if !enabled && self.skip_reason.is_none() {
            self.skip_reason = Some(format!("requires {}", capability));
        }
    }

    /// A barrier for `parties` actors, bounded by the barrier timeout
    pub fn barrier(&self, name: &str, parties: usize) -> ScenarioResult<Arc<Barrier>> {
        Ok(Arc::new(Barrier::new(name, parties, self.config.barrier_timeout())?))
    }

    /// A step run before the scenarios, in declaration order
    pub fn add_setup<F>(&mut self, step: F)
    where
        F: Future<Output = ScenarioResult<()>> + Send + 'static,
    {
        self.setup.push(Box::pin(step));
    }

    /// A scenario actor, run concurrently with the other actors
    pub fn add_scenario<F>(&mut self, actor: impl Into<String>, scenario: F)
    where
        F: Future<Output = ScenarioResult<()>> + Send + 'static,
    {
        self.scenarios.push(Actor {
            name: actor.into(),
            future: Box::pin(scenario),
        });
    }

    /// A step run after the scenarios whatever their outcome
    pub fn add_cleanup<F>(&mut self, step: F)
    where
        F: Future<Output = ScenarioResult<()>> + Send + 'static,
    {
        self.cleanup.push(Box::pin(step));
    }

    /// The collector for body validation issues of this test
    pub fn validator(&self) -> Arc<ValidationCollector> {
        self.validator.clone()
    }

    pub(crate) fn validation_result(&self) -> ScenarioResult<()> {
        self.validator.to_result()
    }

    pub(crate) fn check_runnable(&self) -> ScenarioResult<()> {
        if self.skip_reason.is_none() && self.scenarios.is_empty() {
            return Err(ScenarioError::config(format!(
                "test '{}' declares no scenarios",
                self.test_name
            )));
        }
        Ok(())
    }
}
