//! Interceptor pipeline: priority-ordered, fault-isolated request and
//! response transforms.

pub mod builtins;

use crate::codec::{Request, Response};
use crate::flow::Flow;
use std::fmt;

/// Context passed to every interceptor alongside the message it transforms.
/// Read-only: interceptors observe the in-flight flow but cannot mutate it
/// directly — they return a (possibly new) message instead. Carries the
/// request's method and target so a response-direction interceptor (e.g.
/// the response logger) can report them without the request itself.
pub struct FlowContext<'a> {
    pub client_addr: &'a str,
    pub flow_id: uuid::Uuid,
    pub method: &'a http::Method,
    pub target: &'a str,
}

impl<'a> FlowContext<'a> {
    pub fn for_flow(flow: &'a Flow) -> Self {
        FlowContext {
            client_addr: &flow.client_addr,
            flow_id: flow.id,
            method: &flow.request.method,
            target: &flow.request.target,
        }
    }
}

/// A request transform. Implementors must be re-entrant across connections
/// — the pipeline is a shared singleton — though they may carry their own
/// internal state (e.g. a counter behind a `Mutex`/atomic).
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn intercept(&self, request: Request, ctx: &FlowContext<'_>) -> Result<Request, String>;
}

pub trait ResponseInterceptor: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn intercept(&self, response: Response, ctx: &FlowContext<'_>) -> Result<Response, String>;
}

impl fmt::Debug for dyn RequestInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestInterceptor({})", self.name())
    }
}

impl fmt::Debug for dyn ResponseInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseInterceptor({})", self.name())
    }
}

/// The pre-sorted, pre-built pipeline for both directions: registration is
/// a sort done once at construction, not on every request.
pub struct Pipeline {
    requests: Vec<Box<dyn RequestInterceptor>>,
    responses: Vec<Box<dyn ResponseInterceptor>>,
}

impl Pipeline {
    pub fn new(
        mut requests: Vec<Box<dyn RequestInterceptor>>,
        mut responses: Vec<Box<dyn ResponseInterceptor>>,
    ) -> Self {
        // Stable sort by priority ascending; ties keep insertion order.
        requests.sort_by_key(|i| i.priority());
        responses.sort_by_key(|i| i.priority());
        Pipeline { requests, responses }
    }

    pub fn empty() -> Self {
        Pipeline {
            requests: Vec::new(),
            responses: Vec::new(),
        }
    }

    /// Run the request pipeline. A single interceptor failure never aborts
    /// the chain: it is logged with the interceptor's name and the previous
    /// `current` is carried forward unchanged.
    pub fn run_request(&self, mut current: Request, ctx: &FlowContext<'_>) -> Request {
        for interceptor in &self.requests {
            match interceptor.intercept(current.clone(), ctx) {
                Ok(next) => current = next,
                Err(err) => {
                    metrics::counter!("snitcher_interceptor_failure_total", "direction" => "request")
                        .increment(1);
                    tracing::warn!(
                        interceptor = interceptor.name(),
                        flow_id = %ctx.flow_id,
                        error = %err,
                        "request interceptor failed, continuing with prior message"
                    );
                }
            }
        }
        current
    }

    pub fn run_response(&self, mut current: Response, ctx: &FlowContext<'_>) -> Response {
        for interceptor in &self.responses {
            match interceptor.intercept(current.clone(), ctx) {
                Ok(next) => current = next,
                Err(err) => {
                    metrics::counter!("snitcher_interceptor_failure_total", "direction" => "response")
                        .increment(1);
                    tracing::warn!(
                        interceptor = interceptor.name(),
                        flow_id = %ctx.flow_id,
                        error = %err,
                        "response interceptor failed, continuing with prior message"
                    );
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Method, Version};
    use std::sync::Arc;

    fn req() -> Request {
        Request {
            method: Method::GET,
            target: "/".to_string(),
            version: Version::HTTP_11,
            headers: Default::default(),
            body: Bytes::new(),
        }
    }

    struct Tagger {
        name: String,
        priority: i32,
        order: Arc<std::sync::Mutex<Vec<i32>>>,
        fail: bool,
    }

    impl RequestInterceptor for Tagger {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn intercept(&self, mut request: Request, _ctx: &FlowContext<'_>) -> Result<Request, String> {
            self.order.lock().unwrap().push(self.priority);
            if self.fail {
                return Err("boom".to_string());
            }
            request.headers.push("X-Order", self.priority.to_string());
            Ok(request)
        }
    }

    #[test]
    fn applies_in_priority_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                Box::new(Tagger { name: "a".into(), priority: 200, order: order.clone(), fail: false }),
                Box::new(Tagger { name: "b".into(), priority: 50, order: order.clone(), fail: false }),
                Box::new(Tagger { name: "c".into(), priority: 100, order: order.clone(), fail: false }),
            ],
            vec![],
        );
        let flow = Flow::pending("a".to_string(), req());
        let ctx = FlowContext::for_flow(&flow);
        let result = pipeline.run_request(req(), &ctx);
        assert_eq!(*order.lock().unwrap(), vec![50, 100, 200]);
        assert_eq!(result.headers.get_all("X-Order"), vec!["50", "100", "200"]);
    }

    #[test]
    fn failing_interceptor_does_not_abort_pipeline() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                Box::new(Tagger { name: "p50".into(), priority: 50, order: order.clone(), fail: false }),
                Box::new(Tagger { name: "p100".into(), priority: 100, order: order.clone(), fail: true }),
                Box::new(Tagger { name: "p200".into(), priority: 200, order: order.clone(), fail: false }),
            ],
            vec![],
        );
        let flow = Flow::pending("a".to_string(), req());
        let ctx = FlowContext::for_flow(&flow);
        let result = pipeline.run_request(req(), &ctx);
        // p100 failed, so its header never lands; p200 still ran on p50's output.
        assert_eq!(result.headers.get_all("X-Order"), vec!["50", "200"]);
    }
}
