//! cumulus CLI entry point.
//!
//! Usage:
//!   cumulus user add <username> [email]     # Create a user
//!   cumulus group create <owner>            # Create a group
//!   cumulus group join <group-uid> <user>   # Add a member
//!   cumulus perms check <user> <perm>       # Resolve a permission
//!   cumulus perms scan <user> <perm>        # Full evidence tree
//!   cumulus perms grant-user <issuer> <holder> <perm>

use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cumulus_kernel::{Actor, CoreConfig, Database, PermissionService, SqliteDatabase};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let first = args.first().cloned();
    let config = match first.as_deref() {
        Some(arg) if arg.starts_with("--config=") => {
            let path = arg["--config=".len()..].to_string();
            args.remove(0);
            CoreConfig::load_from(Path::new(&path))?
        }
        Some("--config") => {
            let path = args.get(1).cloned().context("--config requires a path")?;
            args.drain(..2);
            CoreConfig::load_from(Path::new(&path))?
        }
        _ => CoreConfig::load()?,
    };

    match args.first().map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!("cumulus {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }

        Some(unknown) if unknown.starts_with('-') => {
            eprintln!("Unknown option: {unknown}");
            eprintln!("Run 'cumulus --help' for usage.");
            Ok(ExitCode::FAILURE)
        }

        Some(_) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_command(config, &args))
        }
    }
}

fn print_help() {
    println!(r#"cumulus v{}

Usage:
  cumulus [OPTIONS] <command> [ARGS]

Commands:
  user add <username> [email]                      Create a user
  group create <owner>                             Create a group, print its uid
  group join <group-uid> <username>                Add a user to a group
  perms check <username> <permission>              First grant that satisfies the permission
  perms scan <username> <permission>               Every reading behind the permission
  perms grant-user <issuer> <holder> <perm>        Delegate a permission user-to-user
  perms revoke-user <issuer> <holder> <perm>       Revoke a user-to-user delegation
  perms grant-group <issuer> <group-uid> <perm>    Delegate a permission to a group
  perms issuers <username>                         Users who granted anything to <username>
  perms issued <username> <prefix>                 Grants <username> issued under a prefix

The issuer `system` grants as the system principal.

Options:
  --config=<path>              Config file (default: ~/.config/cumulus/core.toml)
  -h, --help                   Show this help
  -V, --version                Show version
"#, env!("CARGO_PKG_VERSION"));
}

fn open_service(config: CoreConfig) -> Result<Arc<PermissionService>> {
    let db: Arc<dyn Database> = match &config.database_path {
        Some(path) => Arc::new(
            SqliteDatabase::open(path)
                .with_context(|| format!("Failed to open database at {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no database_path configured, using an in-memory store");
            Arc::new(SqliteDatabase::in_memory()?)
        }
    };
    Ok(PermissionService::builder(db, config).build())
}

async fn actor(permissions: &PermissionService, username: &str) -> Result<Actor> {
    if username == permissions.config().system_username {
        return Ok(permissions.system_actor().await?);
    }
    let user = permissions.directory().require_user(username).await?;
    Ok(permissions.actor_for(user))
}

fn arg<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .with_context(|| format!("missing argument <{name}>"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(config: CoreConfig, args: &[String]) -> Result<ExitCode> {
    let permissions = open_service(config)?;
    let dir = permissions.directory();

    match args[0].as_str() {
        "user" => match arg(args, 1, "subcommand")? {
            "add" => {
                let user = dir
                    .create_user(arg(args, 2, "username")?, args.get(3).map(String::as_str))
                    .await?;
                print_json(&user)?;
            }
            other => bail!("unknown user subcommand: {other}"),
        },

        "group" => match arg(args, 1, "subcommand")? {
            "create" => {
                let owner = dir.require_user(arg(args, 2, "owner")?).await?;
                let (uid, _) = dir.create_group(Some(owner.id)).await?;
                print_json(&json!({ "uid": uid }))?;
            }
            "join" => {
                let group = dir.require_group(arg(args, 2, "group-uid")?).await?;
                let user = dir.require_user(arg(args, 3, "username")?).await?;
                dir.add_member(group, user.id).await?;
            }
            other => bail!("unknown group subcommand: {other}"),
        },

        "perms" => return run_perms(&permissions, &args[1..]).await,

        other => {
            eprintln!("Unknown command: {other}");
            eprintln!("Run 'cumulus --help' for usage.");
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_perms(permissions: &Arc<PermissionService>, args: &[String]) -> Result<ExitCode> {
    let dir = permissions.directory();

    match arg(args, 0, "subcommand")? {
        "check" => {
            let actor = actor(permissions, arg(args, 1, "username")?).await?;
            let grant = permissions.check(&actor, arg(args, 2, "permission")?).await?;
            print_json(&json!({ "granted": grant.is_some(), "data": grant }))?;
            if grant.is_none() {
                return Ok(ExitCode::FAILURE);
            }
        }

        "scan" => {
            let actor = actor(permissions, arg(args, 1, "username")?).await?;
            let reading = permissions.scan(&actor, arg(args, 2, "permission")?).await?;
            print_json(&reading)?;
        }

        "grant-user" => {
            let issuer = actor(permissions, arg(args, 1, "issuer")?).await?;
            permissions
                .grant_user_user_permission(
                    &issuer,
                    arg(args, 2, "holder")?,
                    arg(args, 3, "permission")?,
                    json!({}),
                    Some("cli"),
                )
                .await?;
        }

        "revoke-user" => {
            let issuer = actor(permissions, arg(args, 1, "issuer")?).await?;
            permissions
                .revoke_user_user_permission(&issuer, arg(args, 2, "holder")?, arg(args, 3, "permission")?, Some("cli"))
                .await?;
        }

        "grant-group" => {
            let issuer = actor(permissions, arg(args, 1, "issuer")?).await?;
            permissions
                .grant_user_group_permission(
                    &issuer,
                    arg(args, 2, "group-uid")?,
                    arg(args, 3, "permission")?,
                    json!({}),
                    Some("cli"),
                )
                .await?;
        }

        "issuers" => {
            let holder = dir.require_user(arg(args, 1, "username")?).await?;
            print_json(&permissions.list_user_permission_issuers(&holder).await?)?;
        }

        "issued" => {
            let issuer = dir.require_user(arg(args, 1, "username")?).await?;
            let issued = permissions
                .query_issuer_permissions_by_prefix(&issuer, arg(args, 2, "prefix")?)
                .await?;
            print_json(&issued)?;
        }

        other => bail!("unknown perms subcommand: {other}"),
    }

    Ok(ExitCode::SUCCESS)
}
