//! Command-line front end: export a directory, or poke at a running server.
//!
//! Usage:
//!   # Serve a directory read-only on the default 9P port
//!   ninep serve /srv/data --listen 0.0.0.0:564
//!
//!   # Inspect it from elsewhere
//!   ninep ls localhost /
//!   ninep cat unix:/tmp/9p.sock /notes/todo.txt

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use ninep::fs::{OsDir, Tree};
use ninep::stat::mode_string;
use ninep::{Addr, ClientConfig, Listener, Server, ServerConfig, Session, Stat};

#[derive(Parser)]
#[command(name = "ninep")]
#[command(about = "9P2000 file server and client")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Connection settings shared by the client commands.
#[derive(clap::Args)]
struct ClientArgs {
    /// Server address: host[:port], tcp:host:port or unix:/path
    addr: String,

    /// Proposed maximum message size
    #[arg(long, default_value_t = ninep::protocol::DEFAULT_MSIZE)]
    msize: u32,

    /// Maximum concurrent requests
    #[arg(long, default_value_t = ninep::client::DEFAULT_CONCURRENCY)]
    concurrency: u16,

    /// User name to attach as
    #[arg(long, default_value = "user")]
    uname: String,

    /// Tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    /// Per-operation timeout in seconds (0 = none)
    #[arg(long, default_value = "0")]
    timeout: u64,
}

impl ClientArgs {
    fn connect(&self) -> ninep::Result<Session> {
        let mut config = ClientConfig::new()
            .msize(self.msize)
            .concurrency(self.concurrency)
            .uname(self.uname.clone())
            .aname(self.aname.clone());
        if self.timeout > 0 {
            config = config.timeout(Duration::from_secs(self.timeout));
        }
        Session::connect(&self.addr, config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Export a directory read-only
    Serve {
        /// Directory to serve
        root: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:564")]
        listen: String,

        /// Upper bound for negotiated msize
        #[arg(long, default_value_t = ServerConfig::default().max_msize)]
        max_msize: u32,
    },

    /// Copy a file to stdout
    Cat {
        #[command(flatten)]
        client: ClientArgs,

        path: String,
    },

    /// List a directory
    Ls {
        #[command(flatten)]
        client: ClientArgs,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Show the metadata of a file
    Stat {
        #[command(flatten)]
        client: ClientArgs,

        path: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn serve(root: PathBuf, listen: &str, max_msize: u32) -> ninep::Result<()> {
    let tree = Tree::new(OsDir::new(&root)?);
    let addr: Addr = listen.parse()?;
    let listener = Listener::bind(&addr)?;
    log::info!("serving {} on {}", root.display(), listener.local_addr()?);
    Server::new(tree, ServerConfig::new().max_msize(max_msize)).listen(&listener)
}

fn cat(client: &ClientArgs, path: &str) -> ninep::Result<()> {
    let session = client.connect()?;
    let mut file = session.open(path, ninep::protocol::OREAD)?;
    let mut stdout = io::stdout().lock();
    io::copy(&mut file, &mut stdout)?;
    stdout.flush()?;
    file.close()?;
    session.close()
}

fn print_stat(out: &mut impl Write, st: &Stat) -> io::Result<()> {
    writeln!(
        out,
        "{} {:>8} {:>8} {:>10} {}",
        mode_string(st.mode),
        st.uid,
        st.gid,
        st.length,
        st.name
    )
}

fn ls(client: &ClientArgs, path: &str) -> ninep::Result<()> {
    let session = client.connect()?;
    let mut entries = session.list_dir(path)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let mut stdout = io::stdout().lock();
    for st in &entries {
        print_stat(&mut stdout, st)?;
    }
    session.close()
}

fn stat(client: &ClientArgs, path: &str) -> ninep::Result<()> {
    let session = client.connect()?;
    let st = session.stat(path)?;
    let mut stdout = io::stdout().lock();
    print_stat(&mut stdout, &st)?;
    writeln!(
        stdout,
        "qid {:?} version {} path {:#x} mtime {}",
        st.qid.kind, st.qid.version, st.qid.path, st.mtime
    )?;
    session.close()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let res = match &cli.command {
        Commands::Serve {
            root,
            listen,
            max_msize,
        } => serve(root.clone(), listen, *max_msize),
        Commands::Cat { client, path } => cat(client, path),
        Commands::Ls { client, path } => ls(client, path),
        Commands::Stat { client, path } => stat(client, path),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
