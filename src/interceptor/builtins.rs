use crate::interceptor::{FlowContext, RequestInterceptor, ResponseInterceptor};
use crate::codec::{Request, Response};

/// Adds each configured `(name, value)` pair to the message, but only when
/// the name (case-insensitive) is not already present.
pub struct HeaderInjector {
    headers: Vec<(String, String)>,
}

impl HeaderInjector {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        HeaderInjector { headers }
    }
}

impl RequestInterceptor for HeaderInjector {
    fn name(&self) -> &str {
        "header_injector"
    }

    fn priority(&self) -> i32 {
        200
    }

    fn intercept(&self, mut request: Request, _ctx: &FlowContext<'_>) -> Result<Request, String> {
        for (name, value) in &self.headers {
            if !request.headers.contains(name) {
                request.headers.push(name.clone(), value.clone());
            }
        }
        Ok(request)
    }
}

/// Logs method, target, status, content type, and content length for every
/// response; logs the body text too when the content type looks textual and
/// the body is small enough to be worth printing.
pub struct ResponseLogger {
    /// Threshold below which a textual body is logged in full (10 KiB).
    max_logged_body: usize,
}

impl ResponseLogger {
    pub fn new() -> Self {
        ResponseLogger {
            max_logged_body: 10 * 1024,
        }
    }

    fn is_loggable_text(content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        ct.starts_with("text/") || ct.contains("json") || ct.contains("xml")
    }
}

impl Default for ResponseLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseInterceptor for ResponseLogger {
    fn name(&self) -> &str {
        "response_logger"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn intercept(&self, response: Response, ctx: &FlowContext<'_>) -> Result<Response, String> {
        let content_type = response.headers.get("content-type").unwrap_or("");
        tracing::info!(
            flow_id = %ctx.flow_id,
            method = %ctx.method,
            target = ctx.target,
            status = response.status,
            content_type = content_type,
            content_length = response.body.len(),
            "response captured"
        );

        if Self::is_loggable_text(content_type) && response.body.len() <= self.max_logged_body {
            if let Ok(text) = std::str::from_utf8(&response.body) {
                tracing::debug!(flow_id = %ctx.flow_id, body = text, "response body");
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use bytes::Bytes;
    use http::{Method, Version};

    fn req() -> Request {
        Request {
            method: Method::GET,
            target: "/".to_string(),
            version: Version::HTTP_11,
            headers: Default::default(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn header_injector_skips_existing_header() {
        let mut request = req();
        request.headers.push("X-Existing", "keep-me");
        let injector = HeaderInjector::new(vec![
            ("X-Existing".to_string(), "overwritten".to_string()),
            ("X-New".to_string(), "added".to_string()),
        ]);
        let flow = Flow::pending("a".to_string(), req());
        let ctx = FlowContext::for_flow(&flow);
        let result = injector.intercept(request, &ctx).unwrap();
        assert_eq!(result.headers.get("X-Existing"), Some("keep-me"));
        assert_eq!(result.headers.get("X-New"), Some("added"));
    }

    #[test]
    fn response_logger_passes_through_unchanged() {
        let logger = ResponseLogger::new();
        let flow = Flow::pending("a".to_string(), req());
        let ctx = FlowContext::for_flow(&flow);
        let resp = Response::new(200, "OK");
        let result = logger.intercept(resp.clone(), &ctx).unwrap();
        assert_eq!(result.status, resp.status);
    }
}
