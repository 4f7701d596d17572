use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use rhai::EvalAltResult;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::registration_hook::RegistrationHook;
use crate::route::Route;
use crate::script_api::{self, ScriptRuntime, SharedRuntime};

/// Loads route scripts, collecting their declarations through a registration hook.
pub struct ScriptLoader {
    hook: Arc<RegistrationHook>,
}

impl Default for ScriptLoader {
    fn default() -> Self {
        ScriptLoader::new()
    }
}

impl ScriptLoader {
    /// A loader bound to the process-wide hook.
    pub fn new() -> ScriptLoader {
        ScriptLoader::with_hook(RegistrationHook::global())
    }

    pub fn with_hook(hook: Arc<RegistrationHook>) -> ScriptLoader {
        ScriptLoader { hook }
    }

    /// Runs the script at `path` and returns its routes in declaration order.
    ///
    /// Concurrent loads on the same hook run one after the other. Any error
    /// raised by the script aborts the load and discards what it registered.
    pub fn load_file(&self, path: &Path) -> Result<Vec<Route>> {
        if !path.is_file() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let load_error = |source: Box<EvalAltResult>| Error::Load {
            path: path.to_path_buf(),
            source,
        };

        let runtime: SharedRuntime = Arc::new(OnceLock::new());
        let engine = script_api::build_engine(Arc::downgrade(&runtime), Arc::clone(&self.hook));
        let ast = engine.compile_file(path.to_path_buf()).map_err(load_error)?;

        let session = self.hook.open_session();
        debug!(path = %path.display(), "running route script");
        engine.run_ast(&ast).map_err(load_error)?;
        let routes = session.finish();

        check_unique(&routes)?;
        script_api::check_signatures(&ast, &routes).map_err(load_error)?;
        runtime.get_or_init(|| ScriptRuntime::new(engine, ast));

        info!(path = %path.display(), routes = routes.len(), "loaded route script");
        Ok(routes)
    }
}

// Routes are stored and looked up by function name.
fn check_unique(routes: &[Route]) -> Result<()> {
    let mut seen = HashSet::new();
    for route in routes {
        if !seen.insert(route.name()) {
            return Err(Error::DuplicateRoute(route.name().to_string()));
        }
    }
    return Ok(());
}

/// Loads `path` through the process-wide hook.
pub fn load_file(path: &Path) -> Result<Vec<Route>> {
    ScriptLoader::new().load_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{ParamValue, ParameterType, ParameterValues};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn script(source: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".rhai").tempfile().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    fn loader() -> ScriptLoader {
        ScriptLoader::with_hook(Arc::new(RegistrationHook::new()))
    }

    fn text(value: &str) -> Option<ParamValue> {
        Some(ParamValue::Text(value.to_string()))
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = loader().load_file(Path::new("/definitely/not/here.rhai")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn routes_come_back_in_declaration_order() {
        let file = script(
            r#"
            fn post_item(name) { request::post("https://example.com/items", #{ json: #{ name: name } }) }
            fn get_items() { request::get("https://example.com/items") }

            route(Fn("post_item"), ["name"]);
            route(Fn("get_items"));
            "#,
        );
        let routes = loader().load_file(file.path()).unwrap();
        let names: Vec<&str> = routes.iter().map(Route::name).collect();
        assert_eq!(names, vec!["post_item", "get_items"]);
    }

    #[test]
    fn parameters_keep_declared_metadata() {
        let file = script(
            r#"
            fn make_id() { "generated" }
            fn get_things(kind, ids, token) { request::get("https://example.com") }

            route(Fn("get_things"), [
                param("kind", #{ "type": choice(["a", "b"]), "default": "a" }),
                param("ids", #{ "type": list(), "required": false }),
                param("token", #{ "id": "auth_token", "generator": Fn("make_id") }),
            ]);
            "#,
        );
        let routes = loader().load_file(file.path()).unwrap();
        let params = routes[0].parameters();

        assert_eq!(params[0].param_type(), Some(&ParameterType::choice(["a", "b"])));
        assert_eq!(params[0].default(), Some("a"));
        assert!(!params[1].is_required());
        assert_eq!(params[2].id(), Some("auth_token"));
        assert_eq!(params[2].generate().unwrap(), "generated");
    }

    #[test]
    fn group_context_is_bound_to_this() {
        let file = script(
            r#"
            fn api(target) {
                this.base_url = if target == "prod" { "https://prod.example.com" } else { "http://localhost" };
            }
            fn get_pet(pet_id) { request::get(this.base_url + "/pet/" + pet_id) }

            let api = group("pets", Fn("api"), ["target"]);
            api.route(Fn("get_pet"), ["pet_id"]);
            "#,
        );
        let routes = loader().load_file(file.path()).unwrap();
        let group_values: ParameterValues = [("target".to_string(), text("prod"))].into_iter().collect();
        let route_values: ParameterValues = [("pet_id".to_string(), text("7"))].into_iter().collect();

        let request = routes[0].get_request(&group_values, &route_values).unwrap();
        assert_eq!(request.url, "https://prod.example.com/pet/7");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn script_error_aborts_load_and_releases_hook() {
        let hook = Arc::new(RegistrationHook::new());
        let loader = ScriptLoader::with_hook(Arc::clone(&hook));
        let broken = script(
            r#"
            fn get_a() { request::get("https://example.com") }
            route(Fn("get_a"));
            throw "boom";
            "#,
        );
        let err = loader.load_file(broken.path()).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(!hook.is_active());

        let fine = script(r#"fn get_b() { request::get("https://example.com") } route(Fn("get_b"));"#);
        let routes = loader.load_file(fine.path()).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name(), "get_b");
    }

    #[test]
    fn syntax_error_is_a_load_error() {
        let file = script("fn get_a( { ");
        assert!(matches!(loader().load_file(file.path()), Err(Error::Load { .. })));
    }

    #[test]
    fn arity_mismatch_is_reported_at_load() {
        let file = script(
            r#"
            fn get_pet() { request::get("https://example.com") }
            route(Fn("get_pet"), ["pet_id"]);
            "#,
        );
        let err = loader().load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("get_pet(pet_id)"), "{}", err);
    }

    #[test]
    fn imports_are_disabled() {
        let file = script(r#"import "other" as other;"#);
        assert!(loader().load_file(file.path()).is_err());
    }

    #[test]
    fn values_are_matched_to_arguments_by_name() {
        let file = script(
            r#"
            fn get_x(a, b) { request::get("https://e.com/" + a + "/" + b) }
            route(Fn("get_x"), ["a", "b"]);
            "#,
        );
        let routes = loader().load_file(file.path()).unwrap();
        let mut values = ParameterValues::new();
        values.insert("b", text("B"));
        values.insert("a", text("A"));

        let request = routes[0].get_request(&ParameterValues::new(), &values).unwrap();
        assert_eq!(request.url, "https://e.com/A/B");
    }

    #[test]
    fn values_missing_from_the_mapping_are_unit() {
        let file = script(
            r#"
            fn get_x(a, b) { request::get("https://e.com/" + a + "/" + type_of(b)) }
            route(Fn("get_x"), ["a", "b"]);
            "#,
        );
        let routes = loader().load_file(file.path()).unwrap();
        let values: ParameterValues = [("a".to_string(), text("A"))].into_iter().collect();

        let request = routes[0].get_request(&ParameterValues::new(), &values).unwrap();
        assert_eq!(request.url, "https://e.com/A/()");
    }

    #[test]
    fn declarations_after_load_are_rejected() {
        let hook = Arc::new(RegistrationHook::new());
        let file = script(
            r#"
            fn get_leak() { request::get("https://example.com/leak") }
            fn get_a() {
                route(Fn("get_leak"));
                request::get("https://example.com/a")
            }
            route(Fn("get_a"));
            "#,
        );
        let routes = ScriptLoader::with_hook(Arc::clone(&hook)).load_file(file.path()).unwrap();

        let session = hook.open_session();
        let err = routes[0]
            .get_request(&ParameterValues::new(), &ParameterValues::new())
            .unwrap_err();
        assert!(err.to_string().contains("only allowed while the script loads"), "{}", err);
        assert!(session.finish().is_empty());
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let file = script(
            r#"
            fn get_a() { request::get("https://example.com") }
            route(Fn("get_a"));
            route(Fn("get_a"));
            "#,
        );
        let err = loader().load_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute(name) if name == "get_a"));
    }

    #[test]
    fn random_digits_length_is_bounded() {
        let file = script(
            r#"
            let nonce = random_digits(6);
            if nonce.len != 6 { throw "wrong length"; }
            random_digits(100000000);
            "#,
        );
        let err = loader().load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("random_digits length"), "{}", err);
    }
}
