//! Assembly of the game command line.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::authlib::AuthlibAgent;
use super::types::{LaunchCommand, LaunchOptions};
use super::version::{rules_allow, Argument, ResolvedVersion};

/// Placeholder for the access token of accounts that have none.
pub const OFFLINE_ACCESS_TOKEN: &str = "0";

pub struct CommandInput<'a> {
    pub options: &'a LaunchOptions,
    pub version: &'a ResolvedVersion,
    /// Root holding `versions/`, `libraries/` and `assets/`.
    pub root: &'a Path,
    pub access_token: Option<&'a str>,
    pub authlib: Option<&'a AuthlibAgent>,
    pub launcher_name: &'a str,
    pub launcher_brand: &'a str,
    pub min_memory: Option<u32>,
    pub max_memory: Option<u32>,
}

pub fn build_command(input: &CommandInput<'_>) -> LaunchCommand {
    let CommandInput {
        options, version, ..
    } = input;
    let variables = variables(input);
    let features = HashSet::new();
    let mut args = Vec::new();

    if let Some(min) = input.min_memory.filter(|m| *m > 0) {
        args.push(format!("-Xms{min}M"));
    }
    if let Some(max) = input.max_memory.filter(|m| *m > 0) {
        args.push(format!("-Xmx{max}M"));
    }
    if let Some(agent) = input.authlib {
        args.push(format!("-javaagent:{}={}", agent.jar.display(), agent.host));
        args.push("-Dauthlibinjector.side=client".to_string());
    }
    args.extend(non_empty(&options.vm_options));
    args.push(format!("-Dminecraft.launcher.brand={}", input.launcher_brand));
    args.push(format!("-Dminecraft.launcher.version={}", input.launcher_name));

    if version.jvm_arguments.is_empty() {
        args.push(format!(
            "-Djava.library.path={}",
            version.natives_directory.display()
        ));
        args.push("-cp".to_string());
        args.push(variables["classpath"].clone());
    } else {
        args.extend(expand_arguments(&version.jvm_arguments, &variables, &features));
    }

    args.push(version.main_class.clone());

    if version.game_arguments.is_empty() {
        if let Some(legacy) = &version.minecraft_arguments {
            let legacy: Vec<Argument> = legacy
                .split_whitespace()
                .map(|token| Argument::Simple(token.to_string()))
                .collect();
            args.extend(expand_arguments(&legacy, &variables, &features));
        }
    } else {
        args.extend(expand_arguments(&version.game_arguments, &variables, &features));
    }

    if let Some(server) = &options.server {
        args.push("--server".to_string());
        args.push(server.host.clone());
        if let Some(port) = server.port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
    }
    args.extend(non_empty(&options.mc_options));

    LaunchCommand {
        program: PathBuf::from(&options.java),
        args,
        cwd: options.game_directory.clone(),
        env: options.env.clone(),
    }
}

fn non_empty(values: &[String]) -> impl Iterator<Item = String> + '_ {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn classpath_separator() -> &'static str {
    if cfg!(windows) {
        ";"
    } else {
        ":"
    }
}

pub fn build_classpath(version: &ResolvedVersion) -> String {
    version
        .libraries
        .iter()
        .map(|library| library.path.display().to_string())
        .chain(std::iter::once(version.jar.display().to_string()))
        .collect::<Vec<_>>()
        .join(classpath_separator())
}

fn variables(input: &CommandInput<'_>) -> HashMap<String, String> {
    let CommandInput {
        options,
        version,
        root,
        ..
    } = input;
    let user = &options.user;
    let profile = user.selected_game_profile();
    let token = input
        .access_token
        .filter(|t| !t.is_empty())
        .unwrap_or(OFFLINE_ACCESS_TOKEN);
    let assets = root.join("assets");

    let mut vars = HashMap::new();
    let mut set = |key: &str, value: String| {
        vars.insert(key.to_string(), value);
    };
    set(
        "auth_player_name",
        profile.map_or_else(|| user.username.clone(), |p| p.name.clone()),
    );
    set(
        "auth_uuid",
        profile.map_or_else(|| user.id.clone(), |p| p.id.clone()),
    );
    set("auth_access_token", token.to_string());
    set("auth_session", token.to_string());
    set(
        "user_type",
        if user.auth_service == "microsoft" { "msa" } else { "mojang" }.to_string(),
    );
    set("user_properties", "{}".to_string());
    set("version_name", version.id.clone());
    set("version_type", version.version_type.clone());
    set("game_directory", options.game_directory.display().to_string());
    set("assets_root", assets.display().to_string());
    set(
        "game_assets",
        assets.join("virtual").join("legacy").display().to_string(),
    );
    set("assets_index_name", version.asset_index.clone());
    set("library_directory", root.join("libraries").display().to_string());
    set(
        "natives_directory",
        version.natives_directory.display().to_string(),
    );
    set("classpath", build_classpath(version));
    set("classpath_separator", classpath_separator().to_string());
    set("launcher_name", input.launcher_name.to_string());
    set("launcher_version", input.launcher_name.to_string());
    vars
}

/// Expand version arguments. Tokens whose placeholders are missing or
/// empty are dropped together with the `--flag` that precedes them.
pub fn expand_arguments(
    arguments: &[Argument],
    variables: &HashMap<String, String>,
    features: &HashSet<&str>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for argument in arguments {
        let tokens = match argument {
            Argument::Simple(token) => vec![token.as_str()],
            Argument::Conditional { rules, value } => {
                if !rules_allow(rules, features) {
                    continue;
                }
                value.parts()
            }
        };
        for token in tokens {
            if contains_empty_placeholder(token, variables) {
                if !token.starts_with('-') && out.last().is_some_and(|prev| prev.starts_with("--")) {
                    out.pop();
                }
                continue;
            }
            out.push(substitute_variables(token, variables));
        }
    }
    out
}

pub fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let mut result = text.to_string();
    for (key, value) in variables {
        result = result.replace(&format!("${{{key}}}"), value);
    }
    result
}

fn contains_empty_placeholder(text: &str, variables: &HashMap<String, String>) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return true;
        };
        match variables.get(&after[..end]) {
            Some(value) if !value.trim().is_empty() => {}
            _ => return true,
        }
        rest = &after[end + 1..];
    }
    false
}
