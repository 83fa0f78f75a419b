// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the update agent control API.

use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::RequestContext;
use dropshot::TypedBody;
use update_agent_common::{PrepareRequest, StatusSnapshot};

use crate::context::ServerContext;
use crate::errors::Error;

type AgentApiDescription = ApiDescription<ServerContext>;

/// Returns a description of the update agent API.
pub fn api() -> AgentApiDescription {
    fn register_endpoints(
        api: &mut AgentApiDescription,
    ) -> Result<(), dropshot::ApiDescriptionRegisterError> {
        api.register(get_status)?;
        api.register(put_prepare)?;
        api.register(post_update)?;
        api.register(post_apply)?;
        api.register(post_revert)?;
        Ok(())
    }

    let mut api = AgentApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

fn event_error(err: Error) -> HttpError {
    match err {
        Error::WrongState { .. } | Error::UnknownComponent(_) => {
            HttpError::for_bad_request(None, err.to_string())
        }
        other => HttpError::for_internal_error(other.to_string()),
    }
}

/// The current aggregated update status.
///
/// This is the same snapshot that is pushed on the status stream; polling it
/// after an accepted event observes the transition settling.
#[endpoint {
    method = GET,
    path = "/status",
}]
async fn get_status(
    rqctx: RequestContext<ServerContext>,
) -> Result<HttpResponseOk<StatusSnapshot>, HttpError> {
    let status = rqctx.context().coordinator.status().await;
    Ok(HttpResponseOk(status))
}

/// Stages an update set: downloads and verifies every image and runs module
/// `prepare`. Accepted only in the idle state.
#[endpoint {
    method = PUT,
    path = "/update/prepare",
}]
async fn put_prepare(
    rqctx: RequestContext<ServerContext>,
    body: TypedBody<PrepareRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let request = body.into_inner();
    rqctx
        .context()
        .coordinator
        .prepare(request.components)
        .await
        .map_err(event_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Runs the update phase over the prepared set.
#[endpoint {
    method = POST,
    path = "/update/update",
}]
async fn post_update(
    rqctx: RequestContext<ServerContext>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx.context().coordinator.update().await.map_err(event_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Commits the updated set, discarding fallback state.
#[endpoint {
    method = POST,
    path = "/update/apply",
}]
async fn post_apply(
    rqctx: RequestContext<ServerContext>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx.context().coordinator.apply().await.map_err(event_error)?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Discards prepared or updated state; also the only way out of a failed
/// update.
#[endpoint {
    method = POST,
    path = "/update/revert",
}]
async fn post_revert(
    rqctx: RequestContext<ServerContext>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx.context().coordinator.revert().await.map_err(event_error)?;
    Ok(HttpResponseUpdatedNoContent())
}
