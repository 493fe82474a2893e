//! Tower middleware running the admission pipeline in front of an HTTP service.
//!
//! Requests are routed by exact path against the pipeline's [`RouteTable`](crate::RouteTable).
//! Rejections short-circuit with [`AdmissionError::Rejected`]; hosts turn them into responses
//! with [`rejection_response`]. Admitted requests reach the inner service and get the
//! decision's headers added to the response: `x-remaining-requests` after an algorithm check,
//! or `x-service-degraded` when the store was down and the allow fallback let the request in.

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::identity::ClientId;
use crate::pipeline::{AdmissionPipeline, Decision};

/// Error returned by [`AdmissionService`].
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The pipeline refused the request.
    Rejected(Box<Decision>),
    /// The inner service failed.
    Inner(E),
}

impl<E> AdmissionError<E> {
    /// The refusing decision, if this is a rejection.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(d) => Some(d.as_ref()),
            Self::Inner(_) => None,
        }
    }

    /// Check if the pipeline refused the request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(d) => match d.status {
                Some(status) => write!(f, "request rejected ({:?}, {})", d.reason, status),
                None => write!(f, "request rejected ({:?})", d.reason),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

/// Render a refusing decision as a response.
///
/// Decisions without a status (silent route blacklist, unconfigured route) become `403` with an
/// empty body.
pub fn rejection_response(decision: &Decision) -> Response<String> {
    let mut response = Response::new(decision.body().unwrap_or_default());
    *response.status_mut() = decision.status.unwrap_or(StatusCode::FORBIDDEN);
    response.headers_mut().extend(decision.headers.clone());
    if decision.message.is_some() {
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    response
}

/// Layer that puts an [`AdmissionPipeline`] in front of a service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    pipeline: AdmissionPipeline,
}

impl AdmissionLayer {
    /// Layer sharing `pipeline`.
    pub fn new(pipeline: AdmissionPipeline) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, pipeline: self.pipeline.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: AdmissionPipeline,
}

impl<S, B, ResBody> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let client = ClientId::from_request(&req);
            let path = req.uri().path().to_string();
            let decision = pipeline.decide_route(client.as_str(), &path).await;
            if !decision.admit {
                return Err(AdmissionError::Rejected(Box::new(decision)));
            }
            let mut response = inner.call(req).await.map_err(AdmissionError::Inner)?;
            response.headers_mut().extend(decision.headers);
            Ok(response)
        })
    }
}
