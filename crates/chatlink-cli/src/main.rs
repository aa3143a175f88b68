use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chatlink_core::config::{
    ConfigError, API_ROUTE_VAR, APP_TOKEN_VAR, BACKEND_URL_VAR, CONFIG_DIR_VAR,
};
use chatlink_core::platform::memory::MemoryPlatform;
use chatlink_core::platform::PlatformConnector;
use chatlink_core::{
    ChatConfig, ChatWorkflow, ConversationSid, Identity, LiveSession, MessageView, SessionEvent,
    SessionToken,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const LOOPBACK_CONVERSATION: &str = "CHloopback";

#[derive(Parser, Debug)]
#[command(name = "chatlink")]
#[command(about = "Terminal client for chatlink conversations", long_about = None)]
struct Cli {
    /// Secret sent as X-App-Token-2 to the auth API
    #[arg(long, env = APP_TOKEN_VAR, global = true, hide_env_values = true)]
    app_token: Option<String>,

    /// Base URL of the session-token and conversation backend
    #[arg(long, env = BACKEND_URL_VAR, global = true)]
    backend_url: Option<String>,

    /// Base route of the auth API
    #[arg(long, env = API_ROUTE_VAR, global = true)]
    api_route: Option<String>,

    /// Directory holding the stored credential
    #[arg(long, env = CONFIG_DIR_VAR, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the credential
    Login {
        #[arg(long)]
        email: String,
        /// Read from stdin when omitted
        #[arg(long, env = "CHATLINK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored credential
    Logout,
    /// Show whether a credential is stored
    Status,
    /// Request a session token for the stored credential
    Token {
        #[arg(long)]
        identity: Option<String>,
    },
    /// Create or join a conversation through the backend
    Join {
        #[arg(long, env = "CHATLINK_CONVERSATION_SID")]
        conversation: Option<String>,
    },
    /// Chat in a conversation, reading messages from stdin
    Chat {
        #[arg(long, env = "CHATLINK_CONVERSATION_SID")]
        conversation: Option<String>,
        /// Use the in-process messaging platform instead of a hosted one
        #[arg(long)]
        loopback: bool,
        /// Identity to chat as in loopback mode
        #[arg(long, default_value = "me")]
        identity: String,
        /// Write a transcript to {log_dir}/{conversation}.log
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

/// Resolve configuration from flags, falling back to the environment.
fn build_config<F>(cli: &Cli, env: F) -> Result<ChatConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    ChatConfig::from_lookup(|key| {
        let flag = match key {
            APP_TOKEN_VAR => cli.app_token.clone(),
            BACKEND_URL_VAR => cli.backend_url.clone(),
            API_ROUTE_VAR => cli.api_route.clone(),
            CONFIG_DIR_VAR => cli
                .config_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            _ => None,
        };
        flag.or_else(|| env(key))
    })
}

/// Workflow for commands that only talk to the auth API and backend.
fn backend_workflow(config: ChatConfig) -> ChatWorkflow {
    ChatWorkflow::from_config(config, Arc::new(MemoryPlatform::new()))
}

fn conversation_arg(value: Option<&String>) -> Option<ConversationSid> {
    value
        .map(|sid| sid.trim())
        .filter(|sid| !sid.is_empty())
        .map(ConversationSid::new)
}

async fn read_password() -> Result<String, String> {
    eprint!("Password: ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    lines
        .next_line()
        .await
        .map_err(|e| format!("Failed to read password: {e}"))?
        .ok_or_else(|| "No password given".to_string())
}

fn print_view(view: &MessageView) {
    let marker = if view.is_mine { " (me)" } else { "" };
    println!("[{}] {}{}: {}", view.time, view.author, marker, view.body);
}

async fn chat_loop(session: LiveSession) -> Result<(), String> {
    for view in session.message_views() {
        print_view(&view);
    }
    println!("* connected to {} (Ctrl-C to quit)", session.conversation_sid());

    let mut events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.map_err(|e| format!("Failed to read stdin: {e}"))? {
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(e) = session.send(&line, None).await {
                            eprintln!("! {}", e);
                        }
                    }
                    None => break,
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::MessageAdded { message, is_mine }) => {
                    print_view(&MessageView::of(&message, is_mine));
                }
                Ok(SessionEvent::ConnectionState(state)) => println!("* {}", state),
                Ok(SessionEvent::ReauthRequired { reason }) => {
                    eprintln!("! {}. Run `chatlink login` again.", reason);
                }
                Ok(SessionEvent::MessageUpdated { .. }) | Ok(SessionEvent::TokenRefreshed) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("Skipped {} session events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.teardown();
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = build_config(&cli, |key| std::env::var(key).ok()).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => read_password().await?,
            };
            let workflow = backend_workflow(config);
            workflow
                .login(&email, &password)
                .await
                .map_err(|e| e.to_string())?;
            println!("Logged in as {}", email.trim());
        }
        Command::Logout => {
            let workflow = backend_workflow(config);
            workflow.logout().map_err(|e| e.to_string())?;
            println!("Logged out");
        }
        Command::Status => {
            let workflow = backend_workflow(config);
            if workflow.is_authenticated() {
                println!("Logged in");
            } else {
                println!("Not logged in");
            }
        }
        Command::Token { identity } => {
            let workflow = backend_workflow(config);
            let identity = identity.map(Identity::new);
            let grant = workflow
                .request_session_token(identity.as_ref())
                .await
                .map_err(|e| e.to_string())?;
            println!("identity: {}", grant.identity);
            if let Some(user_id) = &grant.user_id {
                println!("user id:  {}", user_id);
            }
            println!("token:    {}", grant.token.expose());
        }
        Command::Join { conversation } => {
            let workflow = backend_workflow(config);
            let requested = conversation_arg(conversation.as_ref());
            let (grant, target) = workflow
                .join(requested.as_ref())
                .await
                .map_err(|e| e.to_string())?;
            if let Some(sid) = &target.sid {
                println!("conversation: {}", sid);
            }
            println!("identity:     {}", grant.identity);
            println!("participant:  {:?}", target.participant);
        }
        Command::Chat {
            conversation,
            loopback,
            identity,
            log_dir,
        } => {
            if !loopback {
                return Err(
                    "No hosted messaging platform is bundled with this build; use --loopback"
                        .to_string(),
                );
            }
            let sid = conversation_arg(conversation.as_ref())
                .unwrap_or_else(|| ConversationSid::new(LOOPBACK_CONVERSATION));
            let platform = MemoryPlatform::new();
            platform.create_conversation(&sid, Value::Null);
            platform.add_participant(&sid, &Identity::new(identity.as_str()));

            let connector: Arc<dyn PlatformConnector> = Arc::new(platform);
            let workflow = ChatWorkflow::from_config(config, connector);
            let session = workflow
                .establish_with_token(&SessionToken::new(identity), Some(&sid), log_dir.as_deref())
                .await
                .map_err(|e| e.to_string())?;
            chat_loop(session).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
