//! The functions a route script can call.
//!
//! Scripts get a fresh engine per load with module imports disabled. Besides
//! Rhai's standard library they can only declare parameters, groups and
//! routes, build requests and produce random values.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{
    Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Module,
    Position, Scope, AST,
};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::http_request::{HttpRequest, QueryValue};
use crate::parameter::{
    random_digits, BuiltinGenerator, Generator, ParamValue, Parameter, ParameterType,
    ParameterValues,
};
use crate::registration_hook::RegistrationHook;
use crate::route::{Context, Group, Handler, Route};

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

const MAX_RANDOM_DIGITS: rhai::INT = 1024;

/// Engine and compiled script, available once the top-level code has run.
pub(crate) struct ScriptRuntime {
    engine: Engine,
    ast: AST,
}

pub(crate) type SharedRuntime = Arc<OnceLock<ScriptRuntime>>;

impl ScriptRuntime {
    pub(crate) fn new(engine: Engine, ast: AST) -> ScriptRuntime {
        ScriptRuntime { engine, ast }
    }
}

fn runtime_of<'a>(runtime: &'a SharedRuntime, name: &str) -> Result<&'a ScriptRuntime> {
    runtime
        .get()
        .ok_or_else(|| Error::callable(name, "script has not finished loading"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Group,
    Route,
}

/// A group or route function defined in the script.
///
/// The context is bound to `this` and the resolved values are passed as
/// positional arguments, one per declared parameter and looked up by name.
/// A parameter without a value is passed as `()`.
struct ScriptHandler {
    name: String,
    kind: HandlerKind,
    runtime: SharedRuntime,
}

impl Handler for ScriptHandler {
    fn identity(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        ctx: &mut Context,
        parameters: &[Parameter],
        values: &ParameterValues,
    ) -> Result<Option<HttpRequest>> {
        let runtime = runtime_of(&self.runtime, &self.name)?;
        let mut this = rhai::serde::to_dynamic(&*ctx)?;
        let args: Vec<Dynamic> = parameters
            .iter()
            .map(|param| value_to_dynamic(values.get(param.name())))
            .collect();

        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut this);
        let result: Dynamic = runtime.engine.call_fn_with_options(
            options,
            &mut Scope::new(),
            &runtime.ast,
            &self.name,
            args,
        )?;
        *ctx = rhai::serde::from_dynamic(&this)?;

        match self.kind {
            HandlerKind::Group => Ok(None),
            HandlerKind::Route => Ok(request_from_dynamic(result)?),
        }
    }
}

/// A generator given as `Fn("name")`, called with no arguments.
struct ScriptGenerator {
    func: FnPtr,
    runtime: SharedRuntime,
}

impl Generator for ScriptGenerator {
    fn generate(&self) -> Result<String> {
        let runtime = runtime_of(&self.runtime, self.func.fn_name())?;
        let value: Dynamic = self.func.call(&runtime.engine, &runtime.ast, ())?;
        Ok(value.to_string())
    }
}

fn value_to_dynamic(value: Option<&ParamValue>) -> Dynamic {
    match value {
        None => Dynamic::UNIT,
        Some(ParamValue::Text(text)) => Dynamic::from(text.clone()),
        Some(ParamValue::List(items)) => {
            Dynamic::from_array(items.iter().map(|item| Dynamic::from(item.clone())).collect())
        }
    }
}

fn error(message: String) -> Box<EvalAltResult> {
    message.into()
}

fn expect_string(value: Dynamic, what: &str) -> RhaiResult<String> {
    if value.is_string() {
        return Ok(value.to_string());
    }
    Err(error(format!("{} must be a string, got {}", what, value.type_name())))
}

fn scalar_to_string(value: &Dynamic) -> Option<String> {
    if value.is_unit() || value.is_array() || value.is_map() || value.is::<FnPtr>() {
        return None;
    }
    Some(value.to_string())
}

fn query_value(name: &str, value: Dynamic) -> RhaiResult<Option<QueryValue>> {
    if value.is_unit() {
        return Ok(None);
    }
    if value.is_array() {
        let items = value.cast::<Array>();
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match scalar_to_string(&item) {
                Some(text) => values.push(text),
                None => {
                    return Err(error(format!(
                        "query parameter '{}' holds a {}",
                        name,
                        item.type_name()
                    )))
                }
            }
        }
        return Ok(Some(QueryValue::Multiple(values)));
    }
    match scalar_to_string(&value) {
        Some(text) => Ok(Some(QueryValue::Single(text))),
        None => Err(error(format!("query parameter '{}' holds a {}", name, value.type_name()))),
    }
}

fn header_value(name: &str, value: Dynamic) -> RhaiResult<Option<String>> {
    if value.is_unit() {
        return Ok(None);
    }
    match scalar_to_string(&value) {
        Some(text) => Ok(Some(text)),
        None => Err(error(format!("header '{}' holds a {}", name, value.type_name()))),
    }
}

// Absent entries (`()`) are dropped so that optional parameters can be passed straight through.
fn string_keyed<T>(
    value: Dynamic,
    what: &str,
    convert: fn(&str, Dynamic) -> RhaiResult<Option<T>>,
) -> RhaiResult<Option<BTreeMap<String, T>>> {
    if value.is_unit() {
        return Ok(None);
    }
    if !value.is_map() {
        return Err(error(format!("request {} must be a map, got {}", what, value.type_name())));
    }
    let mut entries = BTreeMap::new();
    for (key, item) in value.cast::<Map>() {
        if let Some(converted) = convert(key.as_str(), item)? {
            entries.insert(key.to_string(), converted);
        }
    }
    Ok(Some(entries))
}

fn json_body(value: Dynamic) -> RhaiResult<Option<serde_json::Map<String, serde_json::Value>>> {
    if value.is_unit() {
        return Ok(None);
    }
    if !value.is_map() {
        return Err(error(format!("request json must be a map, got {}", value.type_name())));
    }
    Ok(Some(rhai::serde::from_dynamic(&value)?))
}

fn build_request(method: &str, url: &str, options: Map) -> RhaiResult<HttpRequest> {
    let mut request = HttpRequest::new(method, url);
    for (key, value) in options {
        match key.as_str() {
            "params" => request.params = string_keyed(value, "params", query_value)?,
            "headers" => request.headers = string_keyed(value, "headers", header_value)?,
            "json" => request.json = json_body(value)?,
            other => return Err(error(format!("unknown request option '{}'", other))),
        }
    }
    Ok(request)
}

fn request_from_dynamic(result: Dynamic) -> RhaiResult<Option<HttpRequest>> {
    if result.is_unit() {
        return Ok(None);
    }
    if result.is::<HttpRequest>() {
        return Ok(Some(result.cast::<HttpRequest>()));
    }
    if !result.is_map() {
        return Err(error(format!("expected a request, got {}", result.type_name())));
    }
    let mut map = result.cast::<Map>();
    let method = map
        .remove("method")
        .map(|m| expect_string(m, "request method"))
        .transpose()?
        .ok_or_else(|| error("request map has no method".to_string()))?;
    let url = map
        .remove("url")
        .map(|u| expect_string(u, "request url"))
        .transpose()?
        .ok_or_else(|| error("request map has no url".to_string()))?;
    Ok(Some(build_request(&method, &url, map)?))
}

fn choice(options: Array) -> RhaiResult<ParameterType> {
    let options = options
        .into_iter()
        .map(|option| expect_string(option, "choice option"))
        .collect::<RhaiResult<Vec<String>>>()?;
    Ok(ParameterType::choice(options))
}

fn generator_from(value: Dynamic, runtime: &Weak<OnceLock<ScriptRuntime>>) -> RhaiResult<Arc<dyn Generator>> {
    if value.is::<FnPtr>() {
        let func = value.cast::<FnPtr>();
        return Ok(Arc::new(ScriptGenerator {
            func,
            runtime: upgrade(runtime)?,
        }));
    }
    let name = expect_string(value, "generator")?;
    match BuiltinGenerator::from_name(&name) {
        Some(builtin) => Ok(Arc::new(builtin)),
        None => Err(error(format!("unknown generator '{}'", name))),
    }
}

fn make_parameter(name: &str, options: Map, runtime: &Weak<OnceLock<ScriptRuntime>>) -> RhaiResult<Parameter> {
    let mut param = Parameter::new(name);
    for (key, value) in options {
        param = match key.as_str() {
            "default" => match scalar_to_string(&value) {
                Some(default) => param.with_default(&default),
                None if value.is_unit() => param,
                None => return Err(error(format!("default of '{}' must be a scalar", name))),
            },
            "required" => {
                let required = value
                    .as_bool()
                    .map_err(|t| error(format!("required of '{}' must be a bool, got {}", name, t)))?;
                param.required(required)
            }
            "type" => match value.try_cast::<ParameterType>() {
                Some(param_type) => param.with_type(param_type),
                None => return Err(error(format!("type of '{}' must be choice(), list() or text_field()", name))),
            },
            "id" => param.shared(&expect_string(value, "id")?),
            "generator" => param.with_generator(generator_from(value, runtime)?),
            other => return Err(error(format!("unknown parameter option '{}'", other))),
        };
    }
    Ok(param)
}

fn parameters_from(params: Array) -> RhaiResult<Vec<Parameter>> {
    params
        .into_iter()
        .map(|item| {
            if item.is_string() {
                return Ok(Parameter::new(&item.to_string()));
            }
            let type_name = item.type_name();
            item.try_cast::<Parameter>()
                .ok_or_else(|| error(format!("expected a parameter, got {}", type_name)))
        })
        .collect()
}

// The runtime is only set once the load has finished.
fn upgrade(runtime: &Weak<OnceLock<ScriptRuntime>>) -> RhaiResult<SharedRuntime> {
    match runtime.upgrade() {
        Some(shared) if shared.get().is_none() => Ok(shared),
        _ => Err(error("declarations are only allowed while the script loads".to_string())),
    }
}

fn script_handler(func: &FnPtr, kind: HandlerKind, runtime: &Weak<OnceLock<ScriptRuntime>>) -> RhaiResult<Arc<dyn Handler>> {
    if func.is_anonymous() || func.is_curried() {
        return Err(error(format!(
            "'{}' must be a plain named function, e.g. Fn(\"get_items\")",
            func.fn_name()
        )));
    }
    Ok(Arc::new(ScriptHandler {
        name: func.fn_name().to_string(),
        kind,
        runtime: upgrade(runtime)?,
    }))
}

fn declare_group(name: &str, func: &FnPtr, params: Array, runtime: &Weak<OnceLock<ScriptRuntime>>) -> RhaiResult<Arc<Group>> {
    let handler = script_handler(func, HandlerKind::Group, runtime)?;
    let group = Group::new(name, handler, parameters_from(params)?).map_err(|e| error(e.to_string()))?;
    Ok(Arc::new(group))
}

fn declare_route(
    func: &FnPtr,
    group: Option<Arc<Group>>,
    params: Array,
    runtime: &Weak<OnceLock<ScriptRuntime>>,
    hook: &RegistrationHook,
) -> RhaiResult<Route> {
    let handler = script_handler(func, HandlerKind::Route, runtime)?;
    let route = Route::new(handler, group, parameters_from(params)?).map_err(|e| error(e.to_string()))?;
    hook.register(route.clone());
    Ok(route)
}

fn request_module() -> Module {
    let mut module = Module::new();
    for method in ["GET", "POST", "PUT", "PATCH", "DELETE"] {
        let name = method.to_lowercase();
        module.set_native_fn(name.as_str(), move |url: ImmutableString| -> RhaiResult<HttpRequest> {
            Ok(HttpRequest::new(method, &url))
        });
        module.set_native_fn(name.as_str(), move |url: ImmutableString, options: Map| {
            build_request(method, &url, options)
        });
    }
    module.set_native_fn("new", |method: ImmutableString, url: ImmutableString| -> RhaiResult<HttpRequest> {
        Ok(HttpRequest::new(&method, &url))
    });
    module.set_native_fn("new", |method: ImmutableString, url: ImmutableString, options: Map| {
        build_request(&method, &url, options)
    });
    module
}

/// Builds the engine for one load. Routes declared through it are registered into `hook`.
pub(crate) fn build_engine(runtime: Weak<OnceLock<ScriptRuntime>>, hook: Arc<RegistrationHook>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.on_print(|text| info!(target: "script", "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(target: "script", source = source.unwrap_or_default(), position = ?pos, "{}", text)
    });

    engine
        .register_type_with_name::<Parameter>("Parameter")
        .register_type_with_name::<ParameterType>("ParameterType")
        .register_type_with_name::<Arc<Group>>("Group")
        .register_type_with_name::<Route>("Route")
        .register_type_with_name::<HttpRequest>("Request");

    engine
        .register_get("name", |group: &mut Arc<Group>| group.name().to_string())
        .register_get("name", |route: &mut Route| route.name().to_string())
        .register_get("url", |request: &mut HttpRequest| request.url.clone())
        .register_get("method", |request: &mut HttpRequest| request.method.clone());

    engine
        .register_fn("choice", choice)
        .register_fn("list", ParameterType::list)
        .register_fn("list", |separator: ImmutableString| ParameterType::list_with_separator(&separator))
        .register_fn("text_field", || ParameterType::TextField);

    engine.register_fn("param", |name: ImmutableString| Parameter::new(&name));
    let rt = runtime.clone();
    engine.register_fn("param", move |name: ImmutableString, options: Map| {
        make_parameter(&name, options, &rt)
    });

    let rt = runtime.clone();
    engine.register_fn("group", move |name: ImmutableString, func: FnPtr| {
        declare_group(&name, &func, Array::new(), &rt)
    });
    let rt = runtime.clone();
    engine.register_fn("group", move |name: ImmutableString, func: FnPtr, params: Array| {
        declare_group(&name, &func, params, &rt)
    });

    let (rt, h) = (runtime.clone(), Arc::clone(&hook));
    engine.register_fn("route", move |func: FnPtr| declare_route(&func, None, Array::new(), &rt, &h));
    let (rt, h) = (runtime.clone(), Arc::clone(&hook));
    engine.register_fn("route", move |func: FnPtr, params: Array| {
        declare_route(&func, None, params, &rt, &h)
    });
    let (rt, h) = (runtime.clone(), Arc::clone(&hook));
    engine.register_fn("route", move |func: FnPtr, group: Arc<Group>, params: Array| {
        declare_route(&func, Some(group), params, &rt, &h)
    });
    let (rt, h) = (runtime.clone(), Arc::clone(&hook));
    engine.register_fn("route", move |group: &mut Arc<Group>, func: FnPtr| {
        declare_route(&func, Some(Arc::clone(group)), Array::new(), &rt, &h)
    });
    let (rt, h) = (runtime, hook);
    engine.register_fn("route", move |group: &mut Arc<Group>, func: FnPtr, params: Array| {
        declare_route(&func, Some(Arc::clone(group)), params, &rt, &h)
    });

    engine
        .register_fn("uuid", || uuid::Uuid::new_v4().to_string())
        .register_fn("timestamp", || chrono::Utc::now().to_rfc3339())
        .register_fn("random_digits", |len: rhai::INT| -> RhaiResult<String> {
            if !(0..=MAX_RANDOM_DIGITS).contains(&len) {
                return Err(error(format!(
                    "random_digits length must be between 0 and {}, got {}",
                    MAX_RANDOM_DIGITS, len
                )));
            }
            Ok(random_digits(len as usize))
        });

    engine.register_static_module("request", request_module().into());
    engine
}

/// Checks that every declared function exists with one argument per parameter.
pub(crate) fn check_signatures(ast: &AST, routes: &[Route]) -> RhaiResult<()> {
    let defined = |name: &str, arity: usize| {
        ast.iter_functions()
            .any(|f| f.name == name && f.params.len() == arity)
    };
    for route in routes {
        let mut declared = vec![(route.name(), route.parameters())];
        if let Some(group) = route.group() {
            declared.push((group.identity(), group.parameters()));
        }
        for (name, parameters) in declared {
            if !defined(name, parameters.len()) {
                let signature = format!(
                    "{}({})",
                    name,
                    parameters.iter().map(Parameter::name).collect::<Vec<&str>>().join(", ")
                );
                return Err(Box::new(EvalAltResult::ErrorFunctionNotFound(signature, Position::NONE)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Dynamic)>) -> Map {
        entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
    }

    #[test]
    fn build_request_normalises_options() {
        let params = map(vec![
            ("limit", Dynamic::from(10 as rhai::INT)),
            ("skip", Dynamic::UNIT),
            ("tag", Dynamic::from_array(vec!["a".into(), "b".into()])),
        ]);
        let headers = map(vec![("Accept", "application/json".into())]);
        let json = map(vec![("name", "rex".into())]);
        let options = map(vec![
            ("params", Dynamic::from_map(params)),
            ("headers", Dynamic::from_map(headers)),
            ("json", Dynamic::from_map(json)),
        ]);

        let request = build_request("post", "https://example.com/pet", options).unwrap();
        let expected = HttpRequest::post("https://example.com/pet")
            .with_param("limit", "10")
            .with_param("tag", vec!["a".to_string(), "b".to_string()])
            .with_header("Accept", "application/json")
            .with_json(serde_json::json!({"name": "rex"}).as_object().unwrap().clone());
        assert_eq!(request, expected);
    }

    #[test]
    fn build_request_rejects_unknown_options_and_shapes() {
        let options = map(vec![("body", "x".into())]);
        assert!(build_request("GET", "https://example.com", options).is_err());

        let options = map(vec![("headers", "x".into())]);
        assert!(build_request("GET", "https://example.com", options).is_err());

        let nested = map(vec![("inner", Dynamic::from_map(Map::new()))]);
        let options = map(vec![("params", Dynamic::from_map(nested))]);
        assert!(build_request("GET", "https://example.com", options).is_err());
    }

    #[test]
    fn request_from_map_result() {
        let result = Dynamic::from_map(map(vec![
            ("method", "get".into()),
            ("url", "https://example.com/pet/1".into()),
        ]));
        let request = request_from_dynamic(result).unwrap().unwrap();
        assert_eq!(request, HttpRequest::get("https://example.com/pet/1"));

        let missing_url = Dynamic::from_map(map(vec![("method", "get".into())]));
        assert!(request_from_dynamic(missing_url).is_err());
        assert!(request_from_dynamic(Dynamic::from(42 as rhai::INT)).is_err());
        assert_eq!(request_from_dynamic(Dynamic::UNIT).unwrap(), None);
    }

    #[test]
    fn make_parameter_reads_options() {
        let options = map(vec![
            ("default", Dynamic::from(12 as rhai::INT)),
            ("required", false.into()),
            ("type", Dynamic::from(ParameterType::list())),
            ("id", "shared_id".into()),
            ("generator", "uuid".into()),
        ]);
        let param = make_parameter("ids", options, &Weak::new()).unwrap();
        assert_eq!(param.default(), Some("12"));
        assert!(!param.is_required());
        assert_eq!(param.param_type(), Some(&ParameterType::list()));
        assert_eq!(param.id(), Some("shared_id"));
        assert!(param.has_generator());

        let bad = map(vec![("requried", true.into())]);
        assert!(make_parameter("x", bad, &Weak::new()).is_err());
        let bad = map(vec![("generator", "nope".into())]);
        assert!(make_parameter("x", bad, &Weak::new()).is_err());
    }
}
