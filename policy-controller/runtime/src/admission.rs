use crate::{
    core::{Quantity, ResourceList, Validator},
    index::{SharedQuotaIndex, SharedTreeIndex},
    k8s::{
        self,
        api::core::v1::{Container, ResourceRequirements},
        DynamicObject, PolicyNode, Pod, Resource,
    },
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::admission::Operation;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};


/// Validates policy tree changes and enforces hierarchical quota on object
/// creation.
#[derive(Clone)]
pub struct Admission {
    tree: SharedTreeIndex,
    quota: SharedQuotaIndex,
    allow_multiple_roots: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

/// Core resources that are also counted under their legacy quota names.
const LEGACY_OBJECT_COUNTS: &[&str] = &[
    "configmaps",
    "persistentvolumeclaims",
    "replicationcontrollers",
    "resourcequotas",
    "secrets",
    "services",
];

/// Compute resources whose requests are also counted under the bare resource
/// name.
const BARE_REQUESTS: &[&str] = &["cpu", "memory", "ephemeral-storage"];

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ready(empty_response(http::StatusCode::NOT_FOUND)));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(tree: SharedTreeIndex, quota: SharedQuotaIndex, allow_multiple_roots: bool) -> Self {
        Self {
            tree,
            quota,
            allow_multiple_roots,
        }
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<PolicyNode>(&req) {
            return self.admit_policy_node(req);
        }

        if req.operation != Operation::Create {
            return AdmissionResponse::from(&req);
        }

        if is_kind::<Pod>(&req) {
            return self.admit_pod(req);
        }

        self.admit_object(req)
    }

    /// Applies the requested change to a copy of the current tree and checks
    /// the resulting tree as a whole.
    fn admit_policy_node(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let mut validator = Validator::new(self.tree.read().snapshot(), self.allow_multiple_roots);

        let result = match req.operation {
            Operation::Create => {
                parse::<PolicyNode>(req.object).and_then(|node| Ok(validator.add(node)?))
            }
            Operation::Update => {
                parse::<PolicyNode>(req.object).and_then(|node| Ok(validator.update(node)?))
            }
            Operation::Delete => match validator.remove(&req.name) {
                Err(error) if error.is_not_found() => {
                    debug!(name = %req.name, "Deleting an unknown policy node");
                    return rsp;
                }
                result => result.map_err(Into::into),
            },
            Operation::Connect => return rsp,
        };

        if let Err(error) = result.and_then(|()| Ok(validator.validate()?)) {
            info!(%error, name = %req.name, op = ?req.operation, "Denied");
            return rsp.deny(error);
        }
        rsp
    }

    fn admit_pod(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let Some(namespace) = req.namespace.clone() else {
            return rsp;
        };
        let pod = match parse::<Pod>(req.object) {
            Ok(pod) => pod,
            Err(error) => {
                info!(%error, "Failed to parse pod");
                return rsp.deny(error);
            }
        };

        self.admit_usage(rsp, &namespace, &pod_usage(&pod))
    }

    /// Admits any other namespaced object against its object count quota.
    fn admit_object(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let Some(namespace) = req.namespace.as_deref() else {
            return rsp;
        };

        let resource = &req.resource;
        let mut usage = ResourceList::default();
        if resource.group.is_empty() {
            usage.insert(format!("count/{}", resource.resource), Quantity::ONE);
            if LEGACY_OBJECT_COUNTS.contains(&resource.resource.as_str()) {
                usage.insert(resource.resource.clone(), Quantity::ONE);
            }
        } else {
            usage.insert(
                format!("count/{}.{}", resource.resource, resource.group),
                Quantity::ONE,
            );
        }

        self.admit_usage(rsp, namespace, &usage)
    }

    fn admit_usage(
        &self,
        rsp: AdmissionResponse,
        namespace: &str,
        usage: &ResourceList,
    ) -> AdmissionResponse {
        match self.quota.read().admit(namespace, usage) {
            Ok(()) => rsp,
            Err(violation) => {
                info!(%namespace, %violation, "Denied");
                rsp.deny(violation)
            }
        }
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn parse<T: DeserializeOwned>(obj: Option<DynamicObject>) -> Result<T> {
    let obj = obj.ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Computes the quota a pod consumes.
///
/// As with pod scheduling, each resource is the larger of the sum over the
/// pod's containers and the largest single init container.
fn pod_usage(pod: &Pod) -> ResourceList {
    let mut usage = ResourceList::default();
    usage.insert("pods", Quantity::ONE);
    usage.insert("count/pods", Quantity::ONE);

    let Some(spec) = pod.spec.as_ref() else {
        return usage;
    };
    let init = spec.init_containers.as_deref().unwrap_or_default();
    let requests = effective(&spec.containers, init, |r| r.requests.as_ref());
    let limits = effective(&spec.containers, init, |r| r.limits.as_ref());

    for (resource, q) in requests.iter() {
        usage.insert(format!("requests.{resource}"), q);
        if BARE_REQUESTS.contains(&resource) {
            usage.insert(resource, q);
        }
    }
    for (resource, q) in limits.iter() {
        usage.insert(format!("limits.{resource}"), q);
    }
    usage
}

fn effective(
    containers: &[Container],
    init_containers: &[Container],
    get: impl Fn(&ResourceRequirements) -> Option<&BTreeMap<String, k8s::Quantity>>,
) -> ResourceList {
    let list = |c: &Container| {
        c.resources
            .as_ref()
            .and_then(&get)
            .map(ResourceList::from_k8s_lossy)
            .unwrap_or_default()
    };

    let mut total = ResourceList::default();
    for container in containers {
        total.add(&list(container));
    }
    for container in init_containers {
        for (resource, q) in list(container).iter() {
            if total.get(resource).map_or(true, |t| q > t) {
                total.insert(resource, q);
            }
        }
    }
    total
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn empty_response(status: http::StatusCode) -> Result<Response<Body>, Error> {
    let mut response = Response::new(Body::default());
    *response.status_mut() = status;
    Ok(response)
}
