//! `/services/network/`: identity of this instance and its peers.

use serde_json::json;
#[cfg(test)]
use serde_json::Value;

use crate::routing::{MethodSpec, Service, ServiceError};

pub const SIGNATURE: &str = "/services/network/";

pub fn service() -> Service {
    Service::new(
        SIGNATURE,
        "network",
        vec![
            MethodSpec::new("GetDetails", |ctx, _| {
                serde_json::to_value(ctx.server.details())
                    .map(Some)
                    .map_err(|e| ServiceError::Failed(e.to_string()))
            })
            .returns("details"),
            MethodSpec::new("GetUuid", |ctx, _| Ok(Some(json!(ctx.server.identity().uuid)))),
            MethodSpec::new("GetName", |ctx, _| Ok(Some(json!(ctx.server.identity().name)))),
            MethodSpec::new("GetPriority", |ctx, _| Ok(Some(json!(ctx.server.identity().priority)))),
            MethodSpec::new("GetStartTime", |ctx, _| {
                Ok(Some(json!(ctx.server.identity().start_time)))
            }),
            MethodSpec::new("GetApiVersion", |ctx, _| {
                Ok(Some(json!(ctx.server.identity().api_version)))
            }),
            MethodSpec::new("GetPeers", |ctx, _| {
                let peers = ctx.server.peers().map(|p| p.peers()).unwrap_or_default();
                serde_json::to_value(peers)
                    .map(Some)
                    .map_err(|e| ServiceError::Failed(e.to_string()))
            }),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplaneConfig;
    use crate::context::ServerContext;
    use crate::http::request::test_request;
    use crate::http::StatusCode;
    use crate::routing::{CallContext, Handler};

    #[test]
    fn details_are_wrapped_under_details() {
        let context = ServerContext::new(NetplaneConfig::default());
        context.set_port(4841);
        let mut req = test_request("GET /services/network/GetDetails HTTP/1.1", &[]);
        service().process(&context, &mut req);
        assert_eq!(req.status(), StatusCode::Ok);
        let body: Value = serde_json::from_slice(req.response_body()).unwrap();
        assert_eq!(body["details"]["uuid"], json!(context.identity().uuid));
        assert_eq!(body["details"]["port"], json!(4841));
        assert_eq!(body["details"]["apiversion"], json!("1.0.0"));
    }

    #[test]
    fn rpc_values_are_bare() {
        let context = ServerContext::new(NetplaneConfig::default());
        let ctx = CallContext {
            server: &context,
            principal: None,
            remote: None,
        };
        let service = service();
        assert_eq!(
            service.call_rpc(&ctx, "GetUuid", &Value::Null).unwrap(),
            json!(context.identity().uuid)
        );
        // No directory attached: an empty list, not an error.
        assert_eq!(service.call_rpc(&ctx, "GetPeers", &Value::Null).unwrap(), json!([]));
    }
}
