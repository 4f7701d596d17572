//! The interactive flow: open a script, pick a route, resolve, preview, run.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::http_request::HttpRequest;
use crate::http_request_executor::{HttpResponse, Transport};
use crate::parameter::Parameter;
use crate::route::Route;
use crate::script_loader::ScriptLoader;
use crate::storage::Storage;

pub const LAST_SCRIPT_SETTING: &str = "last_script";

/// Loads `path` and remembers it as the last opened script.
pub fn open_script(loader: &ScriptLoader, path: &Path, storage: &Storage) -> Result<Vec<Route>> {
    let routes = loader.load_file(path)?;
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    storage.save_setting(LAST_SCRIPT_SETTING, &canonical.to_string_lossy());
    Ok(routes)
}

pub fn find_route<'a>(routes: &'a [Route], name: &str) -> Result<&'a Route> {
    routes
        .iter()
        .find(|route| route.name() == name)
        .ok_or_else(|| Error::UnknownRoute(name.to_string()))
}

/// Where a parameter of a route lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterScope {
    Route,
    Group,
}

/// Finds `name` among the route's own parameters, then its group's, and
/// returns the storage prefix to use with it. `scope` restricts the search.
pub fn locate_parameter<'a>(
    route: &'a Route,
    name: &str,
    scope: Option<ParameterScope>,
) -> Result<(String, &'a Parameter)> {
    if scope != Some(ParameterScope::Group) {
        if let Some(param) = route.parameters().iter().find(|p| p.name() == name) {
            return Ok((route.storage_prefix(), param));
        }
    }
    if scope != Some(ParameterScope::Route) {
        if let Some(group) = route.group() {
            if let Some(param) = group.parameters().iter().find(|p| p.name() == name) {
                return Ok((group.storage_prefix(), param));
            }
        }
    }
    Err(Error::UnknownParameter {
        route: route.name().to_string(),
        name: name.to_string(),
    })
}

/// Runs the parameter's generator and stores the produced value.
pub fn generate_value(storage: &Storage, prefix: &str, parameter: &Parameter) -> Result<String> {
    let value = parameter.generate()?;
    storage.save_parameter(prefix, parameter, &value);
    debug!(parameter = parameter.name(), prefix, "stored generated value");
    Ok(value)
}

pub fn build_request(route: &Route, storage: &Storage) -> Result<HttpRequest> {
    let (group_values, route_values) = storage.get_parameter_values_for_route(route)?;
    route.get_request(&group_values, &route_values)
}

/// Text preview of a request: request line, headers, blank line, JSON body.
pub fn render_request(request: &HttpRequest) -> String {
    let url = match request.uri() {
        Ok(uri) => uri.to_string(),
        Err(_) => request.url.clone(),
    };
    let mut text = format!("{} {}\n", request.method, url);
    for (name, value) in request.headers.iter().flatten() {
        let _ = writeln!(text, "{}: {}", name, value);
    }
    text.push('\n');
    if let Some(json) = &request.json {
        let body = serde_json::to_string_pretty(json).unwrap_or_else(|_| format!("{:?}", json));
        text.push_str(&body);
        text.push('\n');
    }
    text
}

/// Text form of a response; JSON bodies are pretty printed.
pub fn render_response(response: &HttpResponse) -> String {
    let mut text = format!(
        "HTTP {} ({} ms, {})\n",
        response.status_code,
        response.elapsed.as_millis(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    for (name, value) in &response.headers {
        let _ = writeln!(text, "{}: {}", name, value);
    }
    text.push('\n');
    match serde_json::from_str::<serde_json::Value>(&response.body_text) {
        Ok(json) if json.is_object() || json.is_array() => {
            text.push_str(&serde_json::to_string_pretty(&json).unwrap_or_else(|_| response.body_text.clone()))
        }
        _ => text.push_str(&response.body_text),
    }
    text
}

/// Builds, issues and records the result of `route`.
pub fn execute_route(route: &Route, storage: &Storage, transport: &dyn Transport) -> Result<HttpResponse> {
    let request = build_request(route, storage)?;
    let response = match transport.send(&request) {
        Ok(response) => response,
        Err(e) => {
            warn!(route = route.name(), error = %e, "request failed");
            storage.save_request_result(route, &format!("error: {}", e));
            return Err(e);
        }
    };
    storage.save_request_result(route, &render_response(&response));
    Ok(response)
}

/// Same as [`execute_route`] on a worker thread, so the caller is not blocked.
pub fn spawn_execute(
    route: Route,
    storage: Arc<Storage>,
    transport: Arc<dyn Transport>,
) -> JoinHandle<Result<HttpResponse>> {
    thread::spawn(move || execute_route(&route, &storage, transport.as_ref()))
}
