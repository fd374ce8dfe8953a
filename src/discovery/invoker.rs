//! Invocation decorators over service discovery
//!
//! Optional wrappers around "choose an instance, then call it": a plain
//! invoker, a retry decorator and a consecutive-failure circuit breaker.
//! The core routing fabric does not depend on any of these.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::discovery::ServiceInstance;

/// Outcome of one invocation attempt.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub success: bool,
    /// Business / RPC status, negative for invoker-level failures.
    pub status_code: i32,
    pub body: String,
}

impl InvokeResult {
    fn failure(status_code: i32, body: &str) -> Self {
        InvokeResult {
            success: false,
            status_code,
            body: body.to_string(),
        }
    }
}

/// Caller-side hints for instance selection (zone affinity and the like).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub zone: Option<String>,
}

/// Picks an instance for a service name, or `None` when none is available.
pub type ChooseInstanceFn =
    Arc<dyn Fn(&str, &RequestContext) -> Option<ServiceInstance> + Send + Sync>;

/// Performs the actual call against a chosen instance.
pub type DoCallFn = Arc<dyn Fn(&ServiceInstance, Duration) -> InvokeResult + Send + Sync>;

/// Generic invocation interface, decoupled from any RPC framework.
pub trait Invoker: Send + Sync {
    fn invoke(&self, service_name: &str, ctx: &RequestContext, timeout: Duration) -> InvokeResult;
}

/// One discovery lookup plus one call; no retry, no breaking.
pub struct SimpleInvoker {
    choose: ChooseInstanceFn,
    do_call: DoCallFn,
}

impl SimpleInvoker {
    pub fn new(choose: ChooseInstanceFn, do_call: DoCallFn) -> Arc<Self> {
        Arc::new(SimpleInvoker { choose, do_call })
    }
}

impl Invoker for SimpleInvoker {
    fn invoke(&self, service_name: &str, ctx: &RequestContext, timeout: Duration) -> InvokeResult {
        match (self.choose)(service_name, ctx) {
            Some(instance) => (self.do_call)(&instance, timeout),
            None => InvokeResult::failure(-2, "no available instance"),
        }
    }
}

/// Retries the inner invoker up to `max_retries` additional times.
pub struct RetryInvoker {
    inner: Arc<dyn Invoker>,
    max_retries: u32,
}

impl RetryInvoker {
    pub fn new(inner: Arc<dyn Invoker>, max_retries: u32) -> Arc<Self> {
        Arc::new(RetryInvoker { inner, max_retries })
    }
}

impl Invoker for RetryInvoker {
    fn invoke(&self, service_name: &str, ctx: &RequestContext, timeout: Duration) -> InvokeResult {
        let mut last = InvokeResult::failure(-1, "not attempted");
        for _ in 0..=self.max_retries {
            last = self.inner.invoke(service_name, ctx, timeout);
            if last.success {
                break;
            }
        }
        last
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `failure_threshold` consecutive failures and rejects calls
/// for `open_interval` before allowing another attempt.
pub struct CircuitBreakerInvoker {
    inner: Arc<dyn Invoker>,
    failure_threshold: u32,
    open_interval: Duration,
    breaker: Mutex<Breaker>,
}

impl CircuitBreakerInvoker {
    pub fn new(
        inner: Arc<dyn Invoker>,
        failure_threshold: u32,
        open_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(CircuitBreakerInvoker {
            inner,
            failure_threshold,
            open_interval,
            breaker: Mutex::new(Breaker {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        })
    }
}

impl Invoker for CircuitBreakerInvoker {
    fn invoke(&self, service_name: &str, ctx: &RequestContext, timeout: Duration) -> InvokeResult {
        {
            let breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            if breaker.state == BreakerState::Open {
                if let Some(opened_at) = breaker.opened_at {
                    if opened_at.elapsed() < self.open_interval {
                        return InvokeResult::failure(-3, "circuit open");
                    }
                }
            }
        }

        let result = self.inner.invoke(service_name, ctx, timeout);

        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        if result.success {
            breaker.consecutive_failures = 0;
            breaker.state = BreakerState::Closed;
            breaker.opened_at = None;
        } else {
            breaker.consecutive_failures += 1;
            if breaker.consecutive_failures >= self.failure_threshold {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
            }
        }
        result
    }
}
