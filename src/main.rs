/// `main.rs` - scriptctl, manage and run restricted scripts stored in a local database

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as Json};
use std::sync::Arc;

use restricted_scripts::{
    db::local as db,
    host::SimpleObject,
    scripting::{engine::ScriptEngine, script::Invocation},
    security::{Principal, SecurityManager, MANAGER},
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the scripts database.
    #[arg(long, env = "SCRIPTCTL_DB", default_value = "scripts.db")]
    db: String,
    /// Name of the acting user.
    #[arg(long, default_value = "operator")]
    user: String,
    /// Comma separated roles of the acting user.
    #[arg(long, default_value = MANAGER)]
    roles: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored scripts
    List,

    /// Print a script with its header
    Read { id: String },

    /// Create or replace a script from a file (example text when omitted)
    Write {
        id: String,
        file: Option<String>,
        /// Print the stored source afterwards.
        #[arg(long)]
        print: bool,
    },

    /// Call a script
    Run {
        id: String,
        /// Positional argument as JSON, repeatable.
        #[arg(long = "arg", value_name = "JSON")]
        args: Vec<String>,
        /// Keyword argument as key=JSON, repeatable.
        #[arg(long = "kw", value_name = "KEY=JSON")]
        kwargs: Vec<String>,
        /// Physical path of the container, e.g. /site/docs.
        #[arg(long, default_value = "/")]
        container: String,
        /// Number of calls; repeated calls go through the result cache.
        #[arg(long, default_value_t = 1)]
        times: usize,
    },

    /// Execute a file once with the given variables as parameters
    Exec {
        file: String,
        /// Variable as key=JSON, repeatable.
        #[arg(long = "var", value_name = "KEY=JSON")]
        vars: Vec<String>,
        /// Physical path bound as context and container.
        #[arg(long, default_value = "/")]
        container: String,
    },

    /// Delete a script
    Delete { id: String },

    /// Persist every script whose artifact was rebuilt at load
    Recompile,

    /// Show the scripting config, or replace it with JSON
    Config {
        #[arg(long, value_name = "JSON")]
        set: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let pool = db::init_db(&args.db)
        .await
        .with_context(|| format!("failed to open {}", args.db))?;
    let config = db::load_scripting_config(&pool).await?;
    let engine = ScriptEngine::new(config);
    engine.load_from_db(&pool).await?;

    let roles: Vec<&str> = args.roles.split(',').map(str::trim).filter(|r| !r.is_empty()).collect();
    let security = SecurityManager::with_roles(Principal::new(&args.user, &roles));

    match args.command {
        Command::List => {
            for script in engine.get_scripts() {
                let state = if script.is_executable() { "ok" } else { "errors" };
                println!("{:<24} {:<7} {}", script.id(), state, script.title());
            }
        }
        Command::Read { id } => {
            let script = engine.get_script(&id).ok_or_else(|| anyhow!("script {id} not found"))?;
            print!("{}", script.read());
        }
        Command::Write { id, file, print } => {
            let source = match file {
                Some(path) => Some(
                    std::fs::read(&path).with_context(|| format!("failed to read {path}"))?,
                ),
                None => None,
            };
            let script = match (engine.get_script(&id), source) {
                (Some(script), Some(bytes)) => {
                    script.write_bytes(&bytes, engine.config().default_encoding, &security)?;
                    script
                }
                (None, Some(bytes)) => {
                    let script = engine.add_script(&id, Some(""), &security)?;
                    script.write_bytes(&bytes, engine.config().default_encoding, &security)?;
                    script
                }
                (_, None) => engine.add_script(&id, None, &security)?,
            };
            engine.save_script(&pool, &id).await?;
            for warning in script.warnings() {
                eprintln!("warning: {warning}");
            }
            for error in script.errors() {
                eprintln!("error: {error}");
            }
            if print {
                print!("{}", script.read());
            }
        }
        Command::Run {
            id,
            args: positional,
            kwargs,
            container,
            times,
        } => {
            let mut invocation = folder_invocation(&container);
            for raw in &positional {
                invocation = invocation.arg(parse_json(raw));
            }
            for (key, value) in parse_pairs(&kwargs)? {
                invocation = invocation.kwarg(&key, value);
            }
            if times > 1 {
                engine.set_caching(&id, true)?;
            }

            let mut failed = false;
            for _ in 0..times.max(1) {
                let result = engine.run_script(&id, Arc::clone(&security), invocation.clone()).await;
                match (result.value, result.error) {
                    (Some(value), _) => println!("{}", serde_json::to_string_pretty(&value)?),
                    (None, Some(error)) => {
                        eprintln!("{error}");
                        failed = true;
                    }
                    (None, None) => {}
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Command::Exec { file, vars, container } => {
            let body = std::fs::read_to_string(&file).with_context(|| format!("failed to read {file}"))?;
            let varmap: Map<String, Json> = parse_pairs(&vars)?.into_iter().collect();
            let invocation = folder_invocation(&container);
            let value = engine.restricted_exec(&body, &varmap, &invocation, &security)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Delete { id } => {
            engine.delete_script(&id);
            if !db::delete_script(&pool, &id).await? {
                return Err(anyhow!("script {id} not found"));
            }
        }
        Command::Recompile => {
            println!("{}", engine.recompile(&pool, &security).await?);
        }
        Command::Config { set } => match set {
            Some(json) => {
                let config = restricted_scripts::config::ScriptingConfig::from_json(&json)?;
                db::save_scripting_config(&pool, &config).await?;
            }
            None => println!("{}", serde_json::to_string_pretty(engine.config())?),
        },
    }
    Ok(())
}

/// A folder at `path`, bound as both context and container.
fn folder_invocation(path: &str) -> Invocation {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let folder = SimpleObject::new("Folder", &segments).into_shared();
    Invocation::new()
        .with_context(Arc::clone(&folder))
        .with_container(folder)
}

/// Bare words that are not JSON are taken as strings.
fn parse_json(raw: &str) -> Json {
    serde_json::from_str(raw).unwrap_or_else(|_| Json::String(raw.to_string()))
}

fn parse_pairs(raw: &[String]) -> Result<Vec<(String, Json)>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=JSON, got {pair:?}"))?;
            Ok((key.trim().to_string(), parse_json(value)))
        })
        .collect()
}
