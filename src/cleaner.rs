mod engine;
pub mod paths;
pub mod platform;
pub mod registry;
pub mod rules;
pub mod safety;
mod script;
pub mod types;


pub use engine::ActionExecutor;
pub use paths::PathResolver;
pub use platform::Platform;
pub use rules::{load_rule_file, load_rule_files, parse_rules, VarExpansion, MAX_VAR_EXPANSIONS};
pub use safety::{system_whitelist, Whitelist};
pub use script::ScriptRunner;
pub use types::{
    ActionReport, ActionType, CleaningAction, CleaningOption, ExecutionResult,
    ProgressFn, ScriptHost, ScriptSpec, SearchType,
};
