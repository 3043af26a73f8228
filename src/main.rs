//! Command line interface for the Blue Orb community: runs the HTTP API in
//! front of the configured Nostr relays and acts as a signing client for it.

mod api;
mod community;
mod config;
mod error;
mod event;
mod feed;
mod filter;
mod keys;
mod message;
mod projection;
mod relay;
mod server;
mod session;
mod tagging;
#[cfg(test)]
mod testing;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use config::Settings;

use crate::{
    api::{ApiClient, ApiError},
    community::{Community, QueryTimeouts},
    feed::{Feed, FeedError, FeedFilter, FeedSnapshot},
    keys::{mask_secret, Keys},
    projection::{Post, Thread},
    relay::{PoolOptions, PublishOutcome, PublishStatus, RelayPool},
    session::{AuthState, ProfileInput, Session, SessionStore},
    tagging::{
        Permission, QuestionForm, Role, Scope, GRADES, SUBJECTS, TAG_GRADE, TAG_PERM, TAG_ROLE, TAG_TOPIC,
    },
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "blueorb",
    author,
    version,
    about = "Community Q&A over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` file if none exists.
    Init,
    /// Run the community HTTP API.
    Serve,
    /// Print a freshly generated keypair without storing it.
    Keys,
    /// Generate a keypair and set up a local profile.
    Signup {
        #[arg(long, value_parser = parse_role, default_value = "student")]
        role: Role,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value = "")]
        bio: String,
    },
    /// Sign in with an existing hex secret key.
    Login {
        secret: String,
        #[arg(long, value_parser = parse_role)]
        role: Option<Role>,
    },
    /// Forget the local secret, profile and unread marker.
    Logout,
    /// Show the active profile.
    Whoami {
        /// Print the full secret key instead of a masked one.
        #[arg(long)]
        reveal: bool,
    },
    /// Ask a question.
    Ask {
        content: String,
        #[arg(long, value_parser = PossibleValuesParser::new(SUBJECTS))]
        subject: Option<String>,
        #[arg(long, value_parser = PossibleValuesParser::new(GRADES))]
        grade: Option<String>,
        /// Who may answer: both, teachers or students.
        #[arg(long, value_parser = parse_permission, default_value = "both")]
        allow: Permission,
    },
    /// Answer a question.
    Reply { question_id: String, content: String },
    /// Publish a new version of one of your posts.
    Edit { id: String, content: String },
    /// Retract one of your posts (every version of it).
    Delete { id: String },
    /// Show the feed, optionally refreshing until interrupted.
    Feed {
        #[arg(long, value_parser = PossibleValuesParser::new(SUBJECTS))]
        subject: Option<String>,
        #[arg(long, value_parser = PossibleValuesParser::new(GRADES))]
        grade: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        watch: bool,
    },
    /// List your own questions, or your replies with `--replies`.
    Mine {
        #[arg(long)]
        replies: bool,
    },
    /// Mark everything currently in the feed as read.
    MarkRead,
    /// Request deletion of every community event.
    ClearAll {
        /// Confirm the bulk deletion.
        #[arg(long)]
        yes: bool,
    },
    /// Manage the relays in the `.env` file.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
}

/// Operations available under `blueorb relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse().map_err(|e: tagging::ConventionError| e.to_string())
}

fn parse_permission(s: &str) -> Result<Permission, String> {
    s.parse().map_err(|e: tagging::ConventionError| e.to_string())
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = SessionStore::new(cfg.session_dir.clone());
    let scope = Scope::new(cfg.community_tag.clone());
    let feed = Feed::new(ApiClient::new(cfg.api_url.clone()), scope.clone(), store.clone());
    match cli.command {
        Commands::Init => {
            println!("configuration at {}", cli.env);
        }
        Commands::Serve => serve(&cfg).await?,
        Commands::Keys => {
            let pair = Keys::generate().to_pair();
            println!("nsec: {}", pair.nsec);
            println!("npub: {}", pair.npub);
        }
        Commands::Signup {
            role,
            username,
            bio,
        } => {
            if store.load()?.session().is_some() {
                bail!("already signed in; run `blueorb logout` first");
            }
            let state = AuthState::Unauthenticated
                .generate_keys()?
                .complete_setup(&store, ProfileInput { username, bio, role })?;
            let session = signed_in(state)?;
            println!("signed up as {} ({})", session.pubkey(), session.role());
            println!("secret: {}", session.keys.secret_hex());
            println!("keep the secret safe; it is the only way to log in again");
        }
        Commands::Login { secret, role } => {
            if store.load()?.session().is_some() {
                bail!("already signed in; run `blueorb logout` first");
            }
            let session = signed_in(AuthState::Unauthenticated.login(&store, &secret, role)?)?;
            println!("logged in as {} ({})", session.pubkey(), session.role());
        }
        Commands::Logout => {
            store.load()?.logout(&store)?;
            println!("logged out");
        }
        Commands::Whoami { reveal } => {
            let session = require_session(&store)?;
            let secret = session.keys.secret_hex();
            println!("npub:     {}", session.pubkey());
            println!("nsec:     {}", if reveal { secret } else { mask_secret(&secret) });
            println!("role:     {}", session.role());
            println!("username: {}", session.profile.username);
            println!("bio:      {}", session.profile.bio);
        }
        Commands::Ask {
            content,
            subject,
            grade,
            allow,
        } => {
            let session = require_session(&store)?;
            let form = QuestionForm {
                content,
                subject,
                grade,
                allow: Some(allow),
                role: None,
            };
            let outcome = hint(feed.ask(&session, form).await, &cfg)?;
            report("question", &outcome);
        }
        Commands::Reply {
            question_id,
            content,
        } => {
            let session = require_session(&store)?;
            let question = hint(feed.question(&question_id).await, &cfg)?;
            let outcome = hint(feed.reply(&session, &question, &content).await, &cfg)?;
            report("reply", &outcome);
        }
        Commands::Edit { id, content } => {
            let session = require_session(&store)?;
            let (original, _) = hint(feed.find_own(&session, &id).await, &cfg)?;
            let outcome = hint(feed.edit(&session, &original, &content).await, &cfg)?;
            report("edit", &outcome);
        }
        Commands::Delete { id } => {
            let session = require_session(&store)?;
            let (_, post) = hint(feed.find_own(&session, &id).await, &cfg)?;
            for outcome in hint(feed.delete(&session, &post).await, &cfg)? {
                report("deletion", &outcome);
            }
        }
        Commands::Feed {
            subject,
            grade,
            author,
            watch,
        } => {
            let session = require_session(&store)?;
            let filter = FeedFilter {
                subject,
                grade,
                author,
            };
            if watch {
                feed.poll(&session, &filter, cfg.poll_interval, shutdown_signal(), |result| {
                    match result {
                        Ok(snapshot) => print!("{}", render_feed(&snapshot, &scope)),
                        Err(e) => eprintln!("refresh failed: {e}"),
                    }
                })
                .await;
            } else {
                let snapshot = hint(feed.load(&session, &filter).await, &cfg)?;
                print!("{}", render_feed(&snapshot, &scope));
            }
        }
        Commands::Mine { replies } => {
            let session = require_session(&store)?;
            if replies {
                for post in hint(feed.my_replies(&session).await, &cfg)? {
                    print!("{}", render_post(&post, &scope, ""));
                }
            } else {
                for thread in hint(feed.my_questions(&session).await, &cfg)? {
                    print!("{}", render_thread(&thread, &scope));
                }
            }
        }
        Commands::MarkRead => {
            require_session(&store)?;
            let ts = feed.mark_all_read()?;
            println!("marked read up to {ts}");
        }
        Commands::ClearAll { yes } => {
            let session = require_session(&store)?;
            if !yes {
                bail!("refusing to delete every community event without --yes");
            }
            let report = hint(feed.clear_all(&session).await, &cfg)?;
            println!(
                "{} (deleted {}, failed {}, found {})",
                report.message, report.deleted_count, report.failed_count, report.total_found
            );
        }
        Commands::Relay { action } => match action {
            RelayAction::Add { url } => add_relay(&cli.env, &cfg, url).await?,
            RelayAction::Remove { url } => remove_relay(&cli.env, &cfg, url)?,
        },
    }
    Ok(())
}

/// Open the relay pool and serve the API until Ctrl-C.
async fn serve(cfg: &Settings) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg
        .bind_http
        .parse()
        .with_context(|| format!("parsing BIND_HTTP {}", cfg.bind_http))?;
    let pool = Arc::new(RelayPool::open(
        cfg.relays.clone(),
        PoolOptions {
            publish_timeout: cfg.publish_timeout,
            tor_socks: cfg.tor_socks.clone(),
        },
    ));
    tracing::info!(relays = ?pool.relays(), scope = %cfg.community_tag, "relay pool ready");
    let community = Arc::new(Community::new(
        pool.clone(),
        Scope::new(cfg.community_tag.clone()),
        QueryTimeouts::from_list(cfg.query_timeout),
    ));
    let result = server::serve_http(addr, community, shutdown_signal()).await;
    pool.close().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn signed_in(state: AuthState) -> anyhow::Result<Session> {
    match state {
        AuthState::Authenticated(session) => Ok(session),
        _ => bail!("sign-in did not complete"),
    }
}

fn require_session(store: &SessionStore) -> anyhow::Result<Session> {
    match store.load()? {
        AuthState::Authenticated(session) => Ok(session),
        _ => bail!("not signed in; run `blueorb signup` or `blueorb login <secret>`"),
    }
}

/// Attach a retry hint to errors caused by an unreachable API.
fn hint<T>(result: Result<T, FeedError>, cfg: &Settings) -> anyhow::Result<T> {
    result.map_err(|e| match e {
        FeedError::Api(ApiError::Transport(_)) => anyhow::Error::new(e).context(format!(
            "could not reach the community API at {}; check that `blueorb serve` is running and try again",
            cfg.api_url
        )),
        other => other.into(),
    })
}

fn report(what: &str, outcome: &PublishOutcome) {
    match &outcome.status {
        PublishStatus::Confirmed { relay } => println!("{what} {} accepted by {relay}", outcome.id),
        PublishStatus::Unconfirmed { .. } => {
            println!("{what} {} sent; no relay confirmed it yet", outcome.id)
        }
        PublishStatus::Rejected { reason } => println!("{what} {} rejected: {reason}", outcome.id),
    }
}

fn render_feed(snapshot: &FeedSnapshot, scope: &Scope) -> String {
    let mut out = String::new();
    if snapshot.threads.is_empty() {
        out.push_str("no questions yet\n");
    }
    if snapshot.unread {
        out.push_str("* new activity since you last marked the feed read\n");
    }
    for thread in &snapshot.threads {
        out.push_str(&render_thread(thread, scope));
    }
    out
}

fn render_thread(thread: &Thread, scope: &Scope) -> String {
    let mut out = render_post(&thread.question, scope, "");
    for reply in &thread.replies {
        out.push_str(&render_post(reply, scope, "    "));
    }
    out
}

fn render_post(post: &Post, scope: &Scope, indent: &str) -> String {
    let mut labels: Vec<String> = post
        .tags
        .iter()
        .filter(|t| t.key() == Some(TAG_TOPIC) || t.key() == Some(TAG_GRADE))
        .filter_map(|t| t.value())
        .filter(|v| *v != scope.marker())
        .map(str::to_string)
        .collect();
    if let Some(role) = post.first_tag(TAG_ROLE) {
        labels.push(role.to_string());
    }
    if let Some(perm) = post.first_tag(TAG_PERM).filter(|p| *p != "both") {
        labels.push(format!("{perm} only"));
    }
    if post.edited {
        labels.push("edited".into());
    }
    format!(
        "{indent}[{}] {} ({})\n{indent}  {}\n",
        post.id,
        post.updated_at,
        labels.join(", "),
        post.content.replace('\n', &format!("\n{indent}  "))
    )
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let session_dir = base_dir.join(config::DEFAULT_SESSION_DIR);
    let mut content = String::new();
    content.push_str(&format!("BIND_HTTP={}\n", config::DEFAULT_BIND_HTTP));
    content.push_str(&format!("NOSTR_RELAY={}\n", config::DEFAULT_RELAY));
    content.push_str(&format!("COMMUNITY_TAG={}\n", tagging::DEFAULT_SCOPE));
    content.push_str("PUBLISH_TIMEOUT_MS=3000\n");
    content.push_str("QUERY_TIMEOUT_MS=3000\n");
    content.push_str("POLL_INTERVAL_SECS=8\n");
    content.push_str(&format!("API_URL={}\n", config::DEFAULT_API_URL));
    content.push_str(&format!("SESSION_DIR={}\n", display_path(&session_dir)));
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    relay::probe(&url, cfg.tor_socks.as_deref())
        .await
        .with_context(|| format!("cannot connect to {url}"))?;
    let mut relays = cfg.relays.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    if relays.is_empty() {
        bail!("cannot remove the last relay");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("NOSTR_RELAY=") {
            new_content.push_str(&format!("NOSTR_RELAY={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("NOSTR_RELAY={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("NOSTR_RELAY", relays_joined);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("blueorb=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}
