mod client;
mod config;
mod engine;
mod pattern;
mod report;
mod resource;
mod rules;

use crate::client::{ResourceClient, VtmClient};
use crate::config::{Overrides, Scope, resolve, save};
use crate::engine::{ChangeEngine, FailurePolicy, FieldChange, RuleChange, ScalarChange};
use crate::pattern::Matcher;
use crate::report::Reporter;
use crate::resource::{CONNECTION_TIMEOUT, MAX_REPLY_TIME};
use crate::rules::Direction;
use anyhow::{Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "vtmctl",
    version,
    about = "CLI for the Virtual Traffic Manager REST API"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Config file (default: ~/.vtmctl.yaml merged with ./.vtmctl.yaml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "VTM_API_URL",
        value_name = "URL",
        help = "REST API base URL (defaults to http://localhost:9070/)"
    )]
    api_url: Option<String>,

    #[arg(long, global = true, env = "VTM_API_USER", value_name = "USER")]
    api_user: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VTM_API_PASS",
        hide_env_values = true,
        value_name = "PASSWORD"
    )]
    api_pass: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VTM_API_VERSION",
        value_name = "VERSION",
        help = "REST API version segment (defaults to 3.8)"
    )]
    api_version: Option<String>,

    #[arg(long, global = true, help = "Verify the traffic manager's TLS certificate")]
    verify_tls: bool,

    #[arg(
        long,
        global = true,
        help = "Show what would change without writing anything"
    )]
    dry_run: bool,

    #[arg(
        long,
        global = true,
        help = "Continue with remaining resources after a failed write"
    )]
    keep_going: bool,

    #[arg(short, long, global = true, action = ArgAction::Count, help = "Log progress to stderr (-vv for debug)")]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Vserver(VserverCommand),
    #[command(flatten)]
    Pool(PoolCommand),
    /// Virtual server commands (same as the top-level ones)
    #[command(name = "vserver")]
    VserverGroup {
        #[command(subcommand)]
        command: VserverCommand,
    },
    /// Pool commands (same as the top-level ones)
    #[command(name = "pool")]
    PoolGroup {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Persist connection settings to the chosen scope
    Configure {
        #[arg(long, value_name = "URL")]
        url: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, value_name = "VERSION", help = "REST API version to store")]
        rest_version: Option<String>,
        #[arg(
            long,
            value_name = "BOOL",
            help = "Store whether TLS certificates should be verified"
        )]
        verify_certs: Option<bool>,
        #[arg(
            long,
            value_enum,
            default_value_t = ScopeArg::User,
            help = "Where to write the config (local project dir or home dir)"
        )]
        scope: ScopeArg,
    },
    /// Show current configuration (password masked)
    ConfigShow,
    /// Check that the API is reachable with the configured credentials
    Validate,
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum VserverCommand {
    /// Enable RULE on every virtual server (or those matching --vserver)
    #[command(name = "enableRule", alias = "enable-rule")]
    EnableRule {
        #[arg(value_name = "RULE", value_parser = NonEmptyStringValueParser::new())]
        rule: String,
        #[arg(long, value_name = "PATTERN", default_value = "*")]
        vserver: String,
    },
    /// Disable RULE on virtual servers matching VSERVER
    #[command(name = "disableRule", alias = "disable-rule")]
    DisableRule {
        #[arg(value_name = "VSERVER")]
        vserver: String,
        #[arg(value_name = "RULE", value_parser = NonEmptyStringValueParser::new())]
        rule: String,
    },
    /// Show the state of rules matching RULE_PATTERN on virtual servers matching VSERVER
    #[command(name = "getRuleState", alias = "get-rule-state")]
    GetRuleState {
        #[arg(value_name = "VSERVER")]
        vserver: String,
        #[arg(value_name = "RULE_PATTERN")]
        rule: String,
    },
    /// Show the connection timeout of virtual servers matching VSERVER
    #[command(name = "getTimeout", alias = "get-timeout")]
    GetTimeout {
        #[arg(value_name = "VSERVER")]
        vserver: String,
    },
    /// Set the connection timeout of virtual servers matching VSERVER
    #[command(name = "setTimeout", alias = "set-timeout")]
    SetTimeout {
        #[arg(value_name = "VSERVER")]
        vserver: String,
        #[arg(value_name = "SECONDS")]
        seconds: u64,
    },
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Show the maximum reply time of pools matching POOL
    #[command(name = "getMaxReplyTime", alias = "get-max-reply-time")]
    GetMaxReplyTime {
        #[arg(value_name = "POOL")]
        pool: String,
    },
    /// Set the maximum reply time of pools matching POOL
    #[command(name = "setMaxReplyTime", alias = "set-max-reply-time")]
    SetMaxReplyTime {
        #[arg(value_name = "POOL")]
        pool: String,
        #[arg(value_name = "SECONDS")]
        seconds: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    Local,
    User,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Local => Scope::Local,
            ScopeArg::User => Scope::User,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cwd = std::env::current_dir().context("reading current directory")?;

    let policy = if cli.keep_going {
        FailurePolicy::Continue
    } else {
        FailurePolicy::Abort
    };
    let dry_run = cli.dry_run;
    let overrides = Overrides {
        config_file: cli.config,
        url: cli.api_url,
        username: cli.api_user,
        password: cli.api_pass,
        api_version: cli.api_version,
        verify_tls: cli.verify_tls,
    };

    // Patterns are compiled before any remote call.
    let command = match cli.command {
        Commands::Configure {
            url,
            username,
            password,
            rest_version,
            verify_certs,
            scope,
        } => {
            let mut existing = config::load_scope(scope.into(), &cwd)?;
            existing.url = url.or(existing.url);
            existing.username = username.or(existing.username);
            existing.password = password.or(existing.password);
            existing.api_version = rest_version.or(existing.api_version);
            existing.verify_tls = verify_certs.or(existing.verify_tls);

            let path = save(scope.into(), &existing, &cwd)?;
            println!("Saved configuration to {}", path.display());
            return Ok(());
        }
        Commands::ConfigShow => {
            let merged = config::load(&cwd, overrides.config_file.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&merged.masked())?);
            return Ok(());
        }
        Commands::Completion { shell } => {
            use clap_complete::{generate, shells};
            let mut cmd = Cli::command();
            let bin = cmd.get_name().to_string();
            let out = &mut io::stdout();
            match shell {
                CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin, out),
                CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin, out),
                CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin, out),
                CompletionShell::PowerShell => generate(shells::PowerShell, &mut cmd, bin, out),
            }
            return Ok(());
        }
        Commands::Validate => Remote::Validate,
        Commands::Vserver(command) | Commands::VserverGroup { command } => {
            Remote::from_vserver(command)?
        }
        Commands::Pool(command) | Commands::PoolGroup { command } => Remote::from_pool(command)?,
    };

    run_remote(command, overrides, &cwd, dry_run, policy)
}

fn run_remote(
    command: Remote,
    overrides: Overrides,
    cwd: &Path,
    dry_run: bool,
    policy: FailurePolicy,
) -> Result<()> {
    let effective = resolve(cwd, overrides)?;
    let mut client = VtmClient::new(&effective)?;
    tracing::debug!(base = %client.base_url(), "client ready");

    let stdout = io::stdout();
    let mut reporter = Reporter::new(stdout.lock());

    match command {
        Remote::ToggleRule { vservers, change } => {
            run_change(&mut client, &mut reporter, &change, &vservers, dry_run, policy)
        }
        Remote::SetScalar { targets, change } => {
            run_change(&mut client, &mut reporter, &change, &targets, dry_run, policy)
        }
        Remote::RuleState { vservers, rules } => {
            let listings = ChangeEngine::new(&mut client, dry_run, policy)
                .rule_states(&vservers, &rules)
                .context("reading rule states")?;
            reporter.rule_listings(&listings)?;
            Ok(())
        }
        Remote::GetScalar { targets, field } => {
            let values = ChangeEngine::new(&mut client, dry_run, policy)
                .read_scalar(&field, &targets)
                .with_context(|| format!("reading {}", field.path()))?;
            reporter.seconds_table(&values)?;
            Ok(())
        }
        Remote::Validate => {
            println!("Validating traffic manager credentials...");
            match client.list_virtual_servers() {
                Ok(names) => {
                    println!("Traffic manager API: ok ({} virtual servers)", names.len());
                    Ok(())
                }
                Err(e) => {
                    println!("Traffic manager API: FAILED");
                    Err(e.into())
                }
            }
        }
    }
}

/// A command that talks to the traffic manager, with its patterns compiled.
enum Remote {
    ToggleRule {
        vservers: Matcher,
        change: RuleChange,
    },
    SetScalar {
        targets: Matcher,
        change: ScalarChange,
    },
    RuleState {
        vservers: Matcher,
        rules: Matcher,
    },
    GetScalar {
        targets: Matcher,
        field: resource::ScalarField,
    },
    Validate,
}

impl Remote {
    fn from_vserver(command: VserverCommand) -> Result<Self> {
        Ok(match command {
            VserverCommand::EnableRule { rule, vserver } => Remote::ToggleRule {
                vservers: Matcher::compile(&vserver)?,
                change: RuleChange {
                    target: rule,
                    direction: Direction::Enable,
                },
            },
            VserverCommand::DisableRule { vserver, rule } => Remote::ToggleRule {
                vservers: Matcher::compile(&vserver)?,
                change: RuleChange {
                    target: rule,
                    direction: Direction::Disable,
                },
            },
            VserverCommand::GetRuleState { vserver, rule } => Remote::RuleState {
                vservers: Matcher::compile(&vserver)?,
                rules: Matcher::compile(&rule)?,
            },
            VserverCommand::GetTimeout { vserver } => Remote::GetScalar {
                targets: Matcher::compile(&vserver)?,
                field: CONNECTION_TIMEOUT,
            },
            VserverCommand::SetTimeout { vserver, seconds } => Remote::SetScalar {
                targets: Matcher::compile(&vserver)?,
                change: ScalarChange {
                    field: CONNECTION_TIMEOUT,
                    desired: seconds,
                },
            },
        })
    }

    fn from_pool(command: PoolCommand) -> Result<Self> {
        Ok(match command {
            PoolCommand::GetMaxReplyTime { pool } => Remote::GetScalar {
                targets: Matcher::compile(&pool)?,
                field: MAX_REPLY_TIME,
            },
            PoolCommand::SetMaxReplyTime { pool, seconds } => Remote::SetScalar {
                targets: Matcher::compile(&pool)?,
                change: ScalarChange {
                    field: MAX_REPLY_TIME,
                    desired: seconds,
                },
            },
        })
    }
}

fn run_change<F, W>(
    client: &mut VtmClient,
    reporter: &mut Reporter<W>,
    change: &F,
    targets: &Matcher,
    dry_run: bool,
    policy: FailurePolicy,
) -> Result<()>
where
    F: FieldChange,
    W: Write,
{
    if dry_run {
        reporter.dry_run_notice()?;
    }
    ChangeEngine::new(client, dry_run, policy).run(change, targets, reporter)?;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("warn,vtmctl=info"),
        _ => EnvFilter::new("warn,vtmctl=debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
