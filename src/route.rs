use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::errors::{Error, Result};
use crate::http_request::HttpRequest;
use crate::parameter::{Parameter, ParameterValues};

/// Shared state a group hands to its routes.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// The callable behind a group or a route.
///
/// A group's handler populates the context and its return value is ignored.
/// A route's handler reads the context and must return a request. `values`
/// maps the names of the declared `parameters` to their resolved values; its
/// own ordering carries no meaning.
pub trait Handler: Send + Sync {
    fn identity(&self) -> &str;

    fn invoke(
        &self,
        ctx: &mut Context,
        parameters: &[Parameter],
        values: &ParameterValues,
    ) -> Result<Option<HttpRequest>>;
}

/// A handler backed by a Rust closure.
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut Context, &ParameterValues) -> Result<Option<HttpRequest>> + Send + Sync,
{
    pub fn new(name: &str, func: F) -> Arc<FnHandler<F>> {
        return Arc::new(FnHandler {
            name: name.to_string(),
            func,
        });
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Context, &ParameterValues) -> Result<Option<HttpRequest>> + Send + Sync,
{
    fn identity(&self) -> &str {
        return &self.name;
    }

    fn invoke(
        &self,
        ctx: &mut Context,
        _parameters: &[Parameter],
        values: &ParameterValues,
    ) -> Result<Option<HttpRequest>> {
        return (self.func)(ctx, values);
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    return RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));
}

fn shared_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    return RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("shared id pattern"));
}

fn check_identifier(kind: &'static str, value: &str) -> Result<()> {
    if identifier_regex().is_match(value) {
        return Ok(());
    }
    return Err(Error::InvalidIdentifier {
        kind,
        value: value.to_string(),
    });
}

// Storage keys are dotted paths, so names and ids must not contain dots.
fn check_parameters(scope: &str, parameters: &[Parameter]) -> Result<()> {
    let mut seen = HashSet::new();
    for param in parameters {
        check_identifier("parameter name", param.name())?;
        if let Some(id) = param.id() {
            if !shared_id_regex().is_match(id) {
                return Err(Error::InvalidIdentifier {
                    kind: "shared parameter id",
                    value: id.to_string(),
                });
            }
        }
        if !seen.insert(param.name()) {
            return Err(Error::DuplicateParameter {
                scope: scope.to_string(),
                name: param.name().to_string(),
            });
        }
    }
    return Ok(());
}

/// A named scope providing context and parameters to its routes.
pub struct Group {
    name: String,
    handler: Arc<dyn Handler>,
    parameters: Vec<Parameter>,
}

impl Group {
    pub fn new(name: &str, handler: Arc<dyn Handler>, parameters: Vec<Parameter>) -> Result<Group> {
        check_identifier("group function", handler.identity())?;
        let group = Group {
            name: name.to_string(),
            handler,
            parameters,
        };
        check_parameters(&group.storage_prefix(), &group.parameters)?;
        return Ok(group);
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn identity(&self) -> &str {
        return self.handler.identity();
    }

    pub fn parameters(&self) -> &[Parameter] {
        return &self.parameters;
    }

    pub fn storage_prefix(&self) -> String {
        return format!("groups.{}", self.handler.identity());
    }

    pub fn build_context(&self, ctx: &mut Context, values: &ParameterValues) -> Result<()> {
        self.handler.invoke(ctx, &self.parameters, values)?;
        return Ok(());
    }

    /// Declares a route bound to this group.
    pub fn route(self: &Arc<Self>, handler: Arc<dyn Handler>, parameters: Vec<Parameter>) -> Result<Route> {
        return Route::new(handler, Some(Arc::clone(self)), parameters);
    }
}

impl Debug for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Group")
            .field("name", &self.name)
            .field("identity", &self.identity())
            .field("parameters", &self.parameters)
            .finish();
    }
}

const METHOD_KEYWORDS: &[&str] = &["get", "post", "put", "patch", "delete", "head", "options"];

/// One `_`-separated piece of a route name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameToken {
    pub text: String,
    pub method: bool,
}

impl NameToken {
    pub fn color(&self) -> &'static str {
        if !self.method {
            return "#FFFFFF";
        }
        return match self.text.as_str() {
            "GET" => "#25A86B",
            "POST" => "#FDA60A",
            "PUT" | "PATCH" => "#3B82F6",
            "DELETE" => "#E5484D",
            _ => "#8B949E",
        };
    }
}

/// A single declared API call.
#[derive(Clone)]
pub struct Route {
    group: Option<Arc<Group>>,
    handler: Arc<dyn Handler>,
    parameters: Vec<Parameter>,
}

impl Route {
    pub fn new(handler: Arc<dyn Handler>, group: Option<Arc<Group>>, parameters: Vec<Parameter>) -> Result<Route> {
        check_identifier("route function", handler.identity())?;
        let route = Route {
            group,
            handler,
            parameters,
        };
        check_parameters(&route.storage_prefix(), &route.parameters)?;
        return Ok(route);
    }

    pub fn group(&self) -> Option<&Arc<Group>> {
        return self.group.as_ref();
    }

    pub fn parameters(&self) -> &[Parameter] {
        return &self.parameters;
    }

    pub fn name(&self) -> &str {
        return self.handler.identity();
    }

    pub fn storage_prefix(&self) -> String {
        return format!("routes.{}", self.handler.identity());
    }

    /// Leading method keywords are uppercased and flagged, the rest is kept as is.
    pub fn name_tokens(&self) -> Vec<NameToken> {
        let mut leading = true;
        return self
            .name()
            .split('_')
            .map(|part| {
                leading = leading && METHOD_KEYWORDS.contains(&part);
                if leading {
                    NameToken {
                        text: part.to_uppercase(),
                        method: true,
                    }
                } else {
                    NameToken {
                        text: part.to_string(),
                        method: false,
                    }
                }
            })
            .collect();
    }

    pub fn raw_display_name(&self) -> String {
        return self
            .name_tokens()
            .into_iter()
            .map(|token| token.text)
            .collect::<Vec<String>>()
            .join(" ");
    }

    pub fn display_name(&self) -> String {
        return self
            .name_tokens()
            .iter()
            .map(|token| format!("<span style=\"color:{}\">{}</span>", token.color(), token.text))
            .collect::<Vec<String>>()
            .join(" ");
    }

    /// Runs the group handler (if any) on a fresh context, then the route handler.
    pub fn get_request(&self, group_values: &ParameterValues, route_values: &ParameterValues) -> Result<HttpRequest> {
        let mut ctx = Context::new();
        if let Some(group) = &self.group {
            group.build_context(&mut ctx, group_values)?;
        }
        return match self.handler.invoke(&mut ctx, &self.parameters, route_values)? {
            Some(request) => Ok(request),
            None => Err(Error::NotARequest(self.name().to_string())),
        };
    }
}

impl Debug for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Route")
            .field("name", &self.name())
            .field("group", &self.group)
            .field("parameters", &self.parameters)
            .finish();
    }
}
