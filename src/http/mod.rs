// Copyright 2025 The systemk authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The kubelet API surface the API server talks to: `GET /pods`,
//! `GET /containerLogs/{namespace}/{pod}/{container}` and the (unsupported)
//! exec endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::provider::logs::{spawn_journal_reader, LogOptions};
use crate::provider::Provider;
use crate::domain::unit::name as unitname;
use crate::shared::error::{Result, SystemkError};

pub mod server;

pub type Body = BoxBody<Bytes, Infallible>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Method handlers the external server routes to.
pub struct KubeletApi {
    provider: Arc<Provider>,
}

impl KubeletApi {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Route a request; errors map onto the HTTP status taxonomy
    /// (not-found: 404, invalid input: 400, everything else: 500).
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body> {
        match self.route(&req).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    async fn route<B>(&self, req: &Request<B>) -> Result<Response<Body>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["pods"] if method == Method::GET => self.get_pods().await,
            ["containerLogs", namespace, pod, container] if method == Method::GET => {
                self.container_logs(
                    namespace,
                    pod,
                    container,
                    req.uri().query().unwrap_or_default(),
                )
                .await
            }
            ["exec", ..] if method == Method::GET || method == Method::POST => Ok(
                text_response(StatusCode::NOT_IMPLEMENTED, "exec is not supported\n"),
            ),
            _ => Ok(text_response(StatusCode::NOT_FOUND, "not found\n")),
        }
    }

    async fn get_pods(&self) -> Result<Response<Body>> {
        let pods = self.provider.get_pods().await?;
        let body = serde_json::to_vec(&pods)?;
        let mut response = Response::new(full(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        query: &str,
    ) -> Result<Response<Body>> {
        // Options are validated before any subprocess is launched.
        let opts = LogOptions::from_query(query)?;

        let found = self
            .provider
            .get_pod(namespace, pod)
            .await?
            .ok_or_else(|| SystemkError::not_found("Pod", pod, namespace))?;
        let has_container = found
            .spec
            .iter()
            .flat_map(|s| s.init_containers.iter().flatten().chain(s.containers.iter()))
            .any(|c| c.name == container);
        if !has_container {
            return Err(SystemkError::not_found("Container", container, namespace));
        }

        let unit = unitname::compose(namespace, pod, container)
            .map_err(|err| SystemkError::invalid_input(err.to_string()))?;
        let receiver = spawn_journal_reader(unit, opts)?;
        let stream =
            ReceiverStream::new(receiver).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
        let mut response = Response::new(BodyExt::boxed(StreamBody::new(stream)));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Ok(response)
    }
}

fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(full(body.as_bytes()));
    *response.status_mut() = status;
    response
}

fn error_response(err: &SystemkError) -> Response<Body> {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_invalid_input() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = serde_json::to_vec(&ErrorBody {
        error: err.to_string(),
    })
    .unwrap_or_default();
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
