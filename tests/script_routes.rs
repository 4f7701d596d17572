use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use httpdeck::execute::{build_request, find_route, generate_value, locate_parameter, open_script};
use httpdeck::{load_file, Error, HttpRequest, QueryValue, Route, ScriptLoader, Storage};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

fn petstore() -> Vec<Route> {
    load_file(&fixture("petstore.rhai")).unwrap()
}

fn set(storage: &Storage, route: &Route, name: &str, value: &str) {
    let (prefix, parameter) = locate_parameter(route, name, None).unwrap();
    storage.save_parameter(&prefix, parameter, value);
}

#[test]
fn loads_routes_in_declaration_order() {
    let routes = petstore();
    let names: Vec<&str> = routes.iter().map(Route::name).collect();
    assert_eq!(names, vec!["get_pet", "get_pets", "post_pet"]);
    assert_eq!(routes[0].raw_display_name(), "GET pet");
    assert_eq!(routes[0].group().unwrap().name(), "pet store");
    assert_eq!(routes[0].group().unwrap().storage_prefix(), "groups.api");
}

#[test]
fn resolves_group_and_route_values_into_a_request() {
    let routes = petstore();
    let get_pet = find_route(&routes, "get_pet").unwrap();
    let storage = Storage::in_memory();
    set(&storage, get_pet, "target", "prod");
    set(&storage, get_pet, "pet_id", "42");

    let request = build_request(get_pet, &storage).unwrap();
    assert_eq!(request, HttpRequest::get("https://prod.example.com/pet/42"));
}

#[test]
fn unset_required_parameter_is_missing() {
    let routes = petstore();
    let get_pet = find_route(&routes, "get_pet").unwrap();
    let storage = Storage::in_memory();
    set(&storage, get_pet, "target", "prod");

    let err = build_request(get_pet, &storage).unwrap_err();
    assert!(matches!(&err, Error::MissingParameter { name } if name == "pet_id"));
    assert_eq!(err.to_string(), "missing parameter: pet_id");
}

#[test]
fn list_and_default_values_reach_the_script() {
    let routes = petstore();
    let get_pets = find_route(&routes, "get_pets").unwrap();
    let storage = Storage::in_memory();
    set(&storage, get_pets, "target", "local");

    let request = build_request(get_pets, &storage).unwrap();
    assert_eq!(request.url, "http://localhost:8080/pet");
    let params = request.params.unwrap();
    assert_eq!(params.get("limit"), Some(&QueryValue::Single("20".into())));
    assert!(!params.contains_key("tags"));

    set(&storage, get_pets, "tags", "cat,dog");
    let request = build_request(get_pets, &storage).unwrap();
    assert_eq!(
        request.params.unwrap().get("tags"),
        Some(&QueryValue::Multiple(vec!["cat".into(), "dog".into()]))
    );
}

#[test]
fn map_result_becomes_request_with_json_body() {
    let routes = petstore();
    let post_pet = find_route(&routes, "post_pet").unwrap();
    let storage = Storage::in_memory();
    set(&storage, post_pet, "target", "prod");
    set(&storage, post_pet, "name", "rex");

    let request = build_request(post_pet, &storage).unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.headers, Some(Default::default()));
    assert_eq!(request.json.unwrap()["name"], "rex");

    let (prefix, nonce) = locate_parameter(post_pet, "nonce", None).unwrap();
    let value = generate_value(&storage, &prefix, nonce).unwrap();
    let request = build_request(post_pet, &storage).unwrap();
    assert_eq!(request.headers.unwrap().get("X-Nonce"), Some(&value));
}

#[test]
fn script_errors_surface_from_group_function() {
    let routes = petstore();
    let get_pet = find_route(&routes, "get_pet").unwrap();
    let storage = Storage::in_memory();
    set(&storage, get_pet, "target", "staging");
    set(&storage, get_pet, "pet_id", "1");

    let err = build_request(get_pet, &storage).unwrap_err();
    assert!(matches!(err, Error::Script(_)));
    assert!(err.to_string().contains("unknown target: staging"), "{}", err);
}

#[test]
fn shared_parameters_alias_between_routes() {
    let routes = load_file(&fixture("shared.rhai")).unwrap();
    let profile = find_route(&routes, "get_profile").unwrap();
    let orders = find_route(&routes, "get_orders").unwrap();
    assert_ne!(profile.storage_prefix(), orders.storage_prefix());

    let storage = Storage::in_memory();
    let (prefix, token) = locate_parameter(profile, "token", None).unwrap();
    let value = generate_value(&storage, &prefix, token).unwrap();
    assert!(value.starts_with("tok-"));

    let request = build_request(orders, &storage).unwrap();
    assert_eq!(
        request.headers.unwrap().get("Authorization"),
        Some(&format!("Bearer {}", value))
    );
}

#[test]
fn failing_script_returns_nothing_and_next_load_works() {
    let err = load_file(&fixture("broken.rhai")).unwrap_err();
    assert!(matches!(err, Error::Load { .. }));
    assert!(err.to_string().contains("top-level failure"), "{}", err);

    assert_eq!(petstore().len(), 3);
}

#[test]
fn missing_script_is_not_found() {
    assert!(matches!(
        load_file(&fixture("nope.rhai")),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn concurrent_loads_keep_their_own_routes() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let name = if i % 2 == 0 { "petstore.rhai" } else { "shared.rhai" };
            thread::spawn(move || {
                let routes = ScriptLoader::new().load_file(&fixture(name)).unwrap();
                (name, routes.iter().map(|r| r.name().to_string()).collect::<Vec<_>>())
            })
        })
        .collect();

    for handle in handles {
        let (name, routes) = handle.join().unwrap();
        match name {
            "petstore.rhai" => assert_eq!(routes, vec!["get_pet", "get_pets", "post_pet"]),
            _ => assert_eq!(routes, vec!["get_profile", "get_orders"]),
        }
    }
}

#[test]
fn routes_can_be_used_from_other_threads() {
    let routes = petstore();
    let storage = Arc::new(Storage::in_memory());
    let get_pet = find_route(&routes, "get_pet").unwrap().clone();
    set(&storage, &get_pet, "target", "local");
    set(&storage, &get_pet, "pet_id", "9");

    let shared = Arc::clone(&storage);
    let request = thread::spawn(move || build_request(&get_pet, &shared).unwrap())
        .join()
        .unwrap();
    assert_eq!(request.url, "http://localhost:8080/pet/9");
}

#[test]
fn stored_values_survive_restart_and_reload() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state.json");
    let script = fixture("petstore.rhai");

    let storage = Storage::load(&state).unwrap();
    let routes = open_script(&ScriptLoader::new(), &script, &storage).unwrap();
    let get_pet = find_route(&routes, "get_pet").unwrap();
    set(&storage, get_pet, "target", "prod");
    set(&storage, get_pet, "pet_id", "42");
    storage.persist().unwrap();

    let restored = Storage::load(&state).unwrap();
    assert_eq!(restored.durable_snapshot(), storage.durable_snapshot());
    let last = restored.load_setting("last_script").unwrap();
    let routes = load_file(Path::new(&last)).unwrap();
    let request = build_request(find_route(&routes, "get_pet").unwrap(), &restored).unwrap();
    assert_eq!(request.url, "https://prod.example.com/pet/42");
}
