//! Declarative HTTP routes with persistent, typed parameters.
//!
//! A route script declares groups and routes with their parameters. Loading it
//! yields [`Route`]s; parameter values are resolved from [`Storage`] and turned
//! into an [`HttpRequest`] by the route, which a [`Transport`] may then issue.

pub mod errors;
pub mod execute;
pub mod http_request;
pub mod http_request_executor;
pub mod parameter;
pub mod registration_hook;
pub mod route;
mod script_api;
pub mod script_loader;
pub mod storage;

pub use errors::{Error, Result};
pub use http_request::{HttpRequest, QueryValue};
pub use http_request_executor::{HttpResponse, ReqwestTransport, Transport};
pub use parameter::{BuiltinGenerator, FnGenerator, Generator, ParamValue, Parameter, ParameterType, ParameterValues};
pub use registration_hook::RegistrationHook;
pub use route::{Context, FnHandler, Group, Handler, NameToken, Route};
pub use script_loader::{load_file, ScriptLoader};
pub use storage::Storage;
