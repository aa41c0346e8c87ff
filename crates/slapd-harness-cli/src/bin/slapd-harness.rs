use clap::{Args, Parser, Subcommand};
use log::info;
use slapd_harness::{
    BackendKind, ConfigLoader, ConfigMode, ConvergenceWaiter, Database, HarnessContext,
    HarnessError, Mesh, MeshSpec, ServerPool, telemetry,
};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "slapd-harness",
    version,
    about = "Launch and wire up slapd instances for testing"
)]
struct Cli {
    /// Harness configuration file (YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a flat slapd.conf instead of cn=config
    #[arg(long, global = true)]
    flat: bool,

    /// Directory to create the server pool in (default: system temp dir)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize and validate a server configuration
    Check,
    /// Start one server and keep it running until stdin closes
    Serve(ServeCmd),
    /// Start a replicated mesh and keep it running until stdin closes
    Mesh(MeshCmd),
}

#[derive(Args, Debug)]
struct ServeCmd {
    /// Create an MDB database for this suffix
    #[arg(long)]
    suffix: Option<String>,
    /// TCP port for the LDAP listener (0 = any)
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct MeshCmd {
    #[arg(long, default_value_t = 4)]
    servers: usize,
    /// Explicit server id (repeatable); overrides --servers
    #[arg(long = "server-id")]
    server_ids: Vec<u32>,
    #[arg(long, default_value = "dc=example,dc=com")]
    suffix: String,
    /// Run the convergence checker once the mesh is up
    #[arg(long)]
    wait: bool,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn mode(flat: bool) -> ConfigMode {
    if flat {
        ConfigMode::Flat
    } else {
        ConfigMode::Structured
    }
}

fn wait_for_stdin_close() {
    eprintln!("Press Ctrl-D to stop");
    for line in io::stdin().lock().lines() {
        if line.is_err() {
            break;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.as_deref())?;
    let context = HarnessContext::new(config);
    let mut pool = match &cli.workdir {
        Some(dir) => ServerPool::in_dir(context, dir)?,
        None => ServerPool::new(context)?,
    };

    match cli.command {
        Commands::Check => {
            let server = pool.new_server_with(mode(cli.flat), None)?;
            let schemas: Vec<_> = pool
                .config()
                .schemas
                .iter()
                .map(|name| name.as_str().into())
                .collect();
            server.synthesize_config(&schemas)?;
            server.validate()?;
            println!("configuration ok: {}", server.config_path().display());
        }
        Commands::Serve(args) => {
            let mut server = pool.new_server_with(mode(cli.flat), None)?;
            server.start(args.port)?;
            println!("uri: {}", server.uri());
            println!("config secret: {}", server.secret());
            if let Some(suffix) = args.suffix {
                let backend = BackendKind::Mdb {
                    max_size: pool.config().mdb_max_size,
                };
                let database = Database::create(&mut server, &suffix, backend, Vec::new())?;
                println!("database: {} ({})", database.dn(), database.suffix());
                println!("root dn: {}", database.root_dn());
                println!("root secret: {}", database.secret());
            }
            wait_for_stdin_close();
            server.stop()?;
        }
        Commands::Mesh(args) => {
            if cli.flat {
                return Err(HarnessError::UnsupportedMode {
                    operation: "mesh".to_string(),
                    mode: ConfigMode::Flat.to_string(),
                }
                .into());
            }
            let spec = MeshSpec {
                count: args.servers,
                server_ids: (!args.server_ids.is_empty()).then_some(args.server_ids),
                suffix: args.suffix,
                backend: BackendKind::Mdb {
                    max_size: pool.config().mdb_max_size,
                },
                ..MeshSpec::default()
            };
            let mesh = Mesh::build(&mut pool, spec)?;
            for (id, server) in mesh.servers() {
                println!("server {id}: {}", server.uri());
            }

            if args.wait {
                let timeout = args
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| pool.config().convergence_timeout());
                let waiter = ConvergenceWaiter::from_config(pool.config());
                mesh.wait_for_convergence(&waiter, timeout)?;
                info!("Mesh converged on {}", mesh.suffix());
                println!("converged");
            }
            wait_for_stdin_close();
            mesh.shutdown()?;
        }
    }
    Ok(())
}
