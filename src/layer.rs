// axum integration
// Middleware that wraps a routed action in begin/end instrumentation calls.
//
// Attach per route with `axum::middleware::from_fn_with_state`:
//
//     get(index).layer(from_fn_with_state(
//         TrackedAction::new(context.clone(), ActionDescriptor::mvc("Home", "Index")),
//         track_action,
//     ))

use crate::context::InstrumentationContext;
use crate::identity::ActionDescriptor;
use axum::{
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Middleware state for one routed action. A `None` context means
/// instrumentation is disabled for the process and requests pass straight through.
#[derive(Clone)]
pub struct TrackedAction {
    context: Option<InstrumentationContext>,
    descriptor: Arc<ActionDescriptor>,
}

impl TrackedAction {
    pub fn new(context: Option<InstrumentationContext>, descriptor: ActionDescriptor) -> Self {
        Self {
            context,
            descriptor: Arc::new(descriptor),
        }
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    fn active_context(&self) -> Option<&InstrumentationContext> {
        if self.descriptor.is_tracked() {
            self.context.as_ref()
        } else {
            None
        }
    }
}

pub async fn track_action(
    State(action): State<TrackedAction>,
    request: Request,
    next: Next,
) -> Response {
    let Some(context) = action.active_context() else {
        return next.run(request).await;
    };

    let tracker = context.begin_operation(
        action.descriptor(),
        request.method().as_str(),
        content_length(request.headers()),
    );
    let response = next.run(request).await;
    context.end_operation(tracker, response.status().is_server_error());
    response
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PrometheusBackend;
    use crate::config::InstrumentationSettings;
    use crate::dispatch::DispatchMode;
    use axum::http::HeaderValue;

    #[test]
    fn content_length_defaults_to_zero() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), 0);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("not-a-number"));
        assert_eq!(content_length(&headers), 0);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));
        assert_eq!(content_length(&headers), 2048);
    }

    fn context() -> InstrumentationContext {
        let settings = InstrumentationSettings::new("Shop").with_dispatch(DispatchMode::Inline);
        let backend = Arc::new(PrometheusBackend::new("Shop").expect("backend"));
        InstrumentationContext::new(&settings, backend).expect("context")
    }

    #[test]
    fn opted_out_actions_have_no_context() {
        let context = context();
        let tracked = TrackedAction::new(Some(context.clone()), ActionDescriptor::mvc("Home", "Index"));
        assert!(tracked.active_context().is_some());

        let action = TrackedAction::new(
            Some(context.clone()),
            ActionDescriptor::mvc("Health", "Check").untracked(),
        );
        assert!(action.active_context().is_none());
        let group = TrackedAction::new(
            Some(context),
            ActionDescriptor::mvc("Admin", "Stats").group_untracked(),
        );
        assert!(group.active_context().is_none());
    }

    #[test]
    fn disabled_instrumentation_has_no_context() {
        let disabled = TrackedAction::new(None, ActionDescriptor::mvc("Home", "Index"));
        assert!(disabled.active_context().is_none());
    }
}
