//! Landing pages: `/` and the `/services/` listing.

use serde_json::{json, Value};

use crate::context::ServerContext;
use crate::http::response::{escape, serialise, SERVER_NAME};
use crate::http::{ContentType, Request, StatusCode, Verb};
use crate::routing::{Handler, HandlerMeta};

fn accepts_read(request: &mut Request) -> bool {
    if matches!(request.verb(), Verb::Get | Verb::Head) {
        return true;
    }
    request.reject(StatusCode::BadRequest, "Only GET and HEAD are supported here");
    request.set_response_header("Allow", "GET, HEAD");
    false
}

/// The page served at `/`.
pub struct RootPage {
    meta: HandlerMeta,
}

impl RootPage {
    pub fn new() -> Self {
        Self {
            meta: HandlerMeta::new("/", "root"),
        }
    }
}

impl Default for RootPage {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for RootPage {
    fn meta(&self) -> &HandlerMeta {
        &self.meta
    }

    fn process(&self, context: &ServerContext, request: &mut Request) {
        if !request.method().is_empty() {
            request.reject(StatusCode::NotFound, "Not found");
            return;
        }
        if !accepts_read(request) {
            return;
        }
        let identity = context.identity();
        let body = format!(
            "<!DOCTYPE html><html><head><title>{name}</title></head><body>\
             <h1>{name}</h1><p>{server} instance {uuid}</p>\
             <p><a href=\"/services/\">Services</a></p></body></html>",
            name = escape(&identity.name),
            server = SERVER_NAME,
            uuid = escape(&identity.uuid),
        );
        request.set_tagged_response(ContentType::Html, body.into_bytes());
    }
}

/// Lists every registered handler, linking services to their `help` page.
pub struct ServicesIndex {
    meta: HandlerMeta,
}

impl ServicesIndex {
    pub fn new() -> Self {
        Self {
            meta: HandlerMeta::new("/services/", "services").recursive(),
        }
    }

    fn listing(context: &ServerContext) -> Vec<Value> {
        context
            .registry()
            .snapshot()
            .iter()
            .map(|h| {
                json!({
                    "name": h.meta().name(),
                    "signature": h.meta().signature(),
                    "methods": h
                        .as_service()
                        .map(|s| s.methods().map(|m| m.name().to_string()).collect::<Vec<_>>())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

impl Default for ServicesIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ServicesIndex {
    fn meta(&self) -> &HandlerMeta {
        &self.meta
    }

    fn process(&self, context: &ServerContext, request: &mut Request) {
        // Anything below us that reached here has no handler of its own.
        if request.signature() != self.meta.signature() || !request.method().is_empty() {
            request.reject(StatusCode::NotFound, &format!("No service at {}", request.path()));
            return;
        }
        if !accepts_read(request) {
            return;
        }

        let content_type = request.content_type();
        let body = match content_type {
            ContentType::Html => {
                let mut rows = String::new();
                for handler in context.registry().snapshot() {
                    let meta = handler.meta();
                    let link = if handler.as_service().is_some() {
                        format!("<a href=\"{0}help\">{0}</a>", escape(meta.signature()))
                    } else {
                        escape(meta.signature())
                    };
                    rows.push_str(&format!("<tr><td>{}</td><td>{link}</td></tr>", escape(meta.name())));
                }
                format!(
                    "<!DOCTYPE html><html><head><title>Services</title></head><body>\
                     <h1>Services</h1><table><tr><th>Name</th><th>Signature</th></tr>{rows}</table>\
                     </body></html>"
                )
                .into_bytes()
            }
            other => serialise(other, "services", &Value::Array(Self::listing(context))),
        };
        request.set_tagged_response(content_type, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplaneConfig;
    use crate::http::request::test_request;
    use std::sync::Arc;

    fn context() -> Arc<ServerContext> {
        let context = ServerContext::new(NetplaneConfig::default());
        crate::services::register_builtin(&context);
        context
    }

    #[test]
    fn root_serves_only_itself() {
        let context = context();
        let mut req = test_request("GET / HTTP/1.1", &[]);
        RootPage::new().process(&context, &mut req);
        assert_eq!(req.status(), StatusCode::Ok);
        assert_eq!(req.response_type(), Some(ContentType::Html));

        let mut req = test_request("GET /favicon.ico HTTP/1.1", &[]);
        RootPage::new().process(&context, &mut req);
        assert_eq!(req.status(), StatusCode::NotFound);
    }

    #[test]
    fn index_lists_services_with_help_links() {
        let context = context();
        let mut req = test_request("GET /services/ HTTP/1.1", &[("Accept", "text/html")]);
        ServicesIndex::new().process(&context, &mut req);
        let html = String::from_utf8(req.response_body().to_vec()).unwrap();
        assert!(html.contains("<a href=\"/services/network/help\">"));
        assert!(html.contains("<a href=\"/services/auth/help\">"));

        let mut req = test_request("GET /services/ HTTP/1.1", &[]);
        ServicesIndex::new().process(&context, &mut req);
        let value: Value = serde_json::from_slice(req.response_body()).unwrap();
        let names: Vec<&str> = value["services"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["signature"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"/services/network/"));
    }

    #[test]
    fn unknown_service_is_not_found() {
        let context = context();
        let mut req = test_request("GET /services/missing/Thing HTTP/1.1", &[]);
        ServicesIndex::new().process(&context, &mut req);
        assert_eq!(req.status(), StatusCode::NotFound);
    }
}
