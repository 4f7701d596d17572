use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{arg, command, value_parser, ArgAction, ArgMatches, Command};
use httpdeck::execute::{
    build_request, execute_route, find_route, generate_value, locate_parameter, open_script,
    render_request, render_response, ParameterScope, LAST_SCRIPT_SETTING,
};
use httpdeck::storage::default_storage_path;
use httpdeck::{Parameter, ReqwestTransport, Route, ScriptLoader, Storage};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn route_arg() -> clap::Arg {
    arg!(<ROUTE> "route name, as listed by `routes`")
}

fn param_args(cmd: Command) -> Command {
    cmd.arg(route_arg())
        .arg(arg!(<PARAM> "parameter name"))
        .arg(
            arg!(-g --group "address the parameter of the route's group")
                .action(ArgAction::SetTrue),
        )
}

fn cli() -> Command {
    Command::new("httpdeck")
        .author(clap::crate_authors!())
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .after_help("ENVIRONMENT:\n    RUST_LOG=debug    Enable debug logging")
        .arg(
            arg!(-s --script <FILE> "route script; defaults to the last one opened")
                .value_parser(value_parser!(PathBuf))
                .env("HTTPDECK_SCRIPT")
                .global(true),
        )
        .arg(
            arg!(--storage <FILE> "state file")
                .value_parser(value_parser!(PathBuf))
                .env("HTTPDECK_STORAGE")
                .global(true),
        )
        .subcommand(command!("routes").about("list the routes of the script"))
        .subcommand(
            command!("params")
                .about("show the parameters of a route and their stored values")
                .arg(route_arg()),
        )
        .subcommand(param_args(command!("set").about("store a parameter value")).arg(arg!(<VALUE> "value")))
        .subcommand(param_args(command!("unset").about("forget a stored parameter value")))
        .subcommand(param_args(
            command!("generate").about("store a fresh value from the parameter's generator"),
        ))
        .subcommand(
            command!("preview")
                .about("show the request a route would send")
                .arg(route_arg()),
        )
        .subcommand(
            command!("run")
                .about("send the request of a route")
                .arg(route_arg()),
        )
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(id)
        .ok_or_else(|| anyhow!("missing argument {}", id))
}

fn scope_of(matches: &ArgMatches) -> Option<ParameterScope> {
    if matches.get_flag("group") {
        Some(ParameterScope::Group)
    } else {
        None
    }
}

fn script_path(matches: &ArgMatches, storage: &Storage) -> Result<PathBuf> {
    if let Some(path) = matches.get_one::<PathBuf>("script") {
        return Ok(path.clone());
    }
    match storage.load_setting(LAST_SCRIPT_SETTING) {
        Some(path) => Ok(PathBuf::from(path)),
        None => bail!("no script given and none opened before, pass --script <FILE>"),
    }
}

fn list_routes(routes: &[Route]) {
    for route in routes {
        match route.group() {
            Some(group) => println!("{:<32} {} [{}]", route.name(), route.raw_display_name(), group.name()),
            None => println!("{:<32} {}", route.name(), route.raw_display_name()),
        }
    }
}

fn describe(parameter: &Parameter, stored: Option<String>) -> String {
    let mut parts = vec![parameter.name().to_string()];
    if let Some(param_type) = parameter.param_type() {
        match param_type.options() {
            Some(options) => parts.push(format!("{}[{}]", param_type.type_name(), options.join("|"))),
            None => parts.push(param_type.type_name().to_string()),
        }
    }
    parts.push(if parameter.is_required() { "required" } else { "optional" }.to_string());
    if let Some(default) = parameter.default() {
        parts.push(format!("default={:?}", default));
    }
    if let Some(id) = parameter.id() {
        parts.push(format!("shared={}", id));
    }
    if parameter.has_generator() {
        parts.push("generated".to_string());
    }
    let value = stored.map_or_else(|| "<unset>".to_string(), |v| format!("{:?}", v));
    format!("  {}  = {}", parts.join("  "), value)
}

fn show_params(route: &Route, storage: &Storage) {
    if let Some(group) = route.group() {
        println!("group {} ({})", group.identity(), group.name());
        for param in group.parameters() {
            println!("{}", describe(param, storage.load_parameter(&group.storage_prefix(), param)));
        }
    }
    println!("route {}", route.name());
    for param in route.parameters() {
        println!("{}", describe(param, storage.load_parameter(&route.storage_prefix(), param)));
    }
}

fn set_param(route: &Route, matches: &ArgMatches, storage: &Storage) -> Result<()> {
    let name = required(matches, "PARAM")?;
    let value = required(matches, "VALUE")?;
    let (prefix, parameter) = locate_parameter(route, name, scope_of(matches))?;
    if let Some(options) = parameter.param_type().and_then(|t| t.options()) {
        if !options.iter().any(|option| option == value) {
            bail!("'{}' is not one of {}", value, options.join(", "));
        }
    }
    storage.save_parameter(&prefix, parameter, value);
    return Ok(());
}

fn dispatch(matches: &ArgMatches, routes: &[Route], storage: &Storage) -> Result<()> {
    match matches.subcommand() {
        Some(("routes", _)) => {
            list_routes(routes);
            Ok(())
        }
        Some(("params", sub)) => {
            show_params(find_route(routes, required(sub, "ROUTE")?)?, storage);
            Ok(())
        }
        Some(("set", sub)) => set_param(find_route(routes, required(sub, "ROUTE")?)?, sub, storage),
        Some(("unset", sub)) => {
            let route = find_route(routes, required(sub, "ROUTE")?)?;
            let (prefix, parameter) = locate_parameter(route, required(sub, "PARAM")?, scope_of(sub))?;
            storage.remove_parameter(&prefix, parameter);
            Ok(())
        }
        Some(("generate", sub)) => {
            let route = find_route(routes, required(sub, "ROUTE")?)?;
            let (prefix, parameter) = locate_parameter(route, required(sub, "PARAM")?, scope_of(sub))?;
            println!("{}", generate_value(storage, &prefix, parameter)?);
            Ok(())
        }
        Some(("preview", sub)) => {
            let route = find_route(routes, required(sub, "ROUTE")?)?;
            print!("{}", render_request(&build_request(route, storage)?));
            Ok(())
        }
        Some(("run", sub)) => {
            let route = find_route(routes, required(sub, "ROUTE")?)?;
            let transport = ReqwestTransport::new()?;
            let response = execute_route(route, storage, &transport)
                .with_context(|| format!("while running {}", route.raw_display_name()))?;
            match storage.load_request_result(route) {
                Some(result) => println!("{}", result),
                None => println!("{}", render_response(&response)),
            }
            Ok(())
        }
        _ => unreachable!("this should've been prevented"),
    }
}

fn main() -> Result<()> {
    init_logging();
    let matches = cli().get_matches();

    let storage_path = matches
        .get_one::<PathBuf>("storage")
        .cloned()
        .unwrap_or_else(default_storage_path);
    let storage = Storage::load(&storage_path)
        .with_context(|| format!("while reading state from {}", storage_path.display()))?;

    let script = script_path(&matches, &storage)?;
    let routes = open_script(&ScriptLoader::new(), &script, &storage)
        .with_context(|| format!("while loading {}", script.display()))?;

    let result = dispatch(&matches, &routes, &storage);
    storage.persist().context("while saving state")?;
    return result;
}
