use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use std::sync::Arc;

use gym_session::auth::{AuthFlows, AuthSessionContext, AuthStore, UpdateProfileRequest};
use gym_session::config::{Cli, Command, Config};
use gym_session::{ApiError, HttpClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_args(&cli.global)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Using session database: {}", config.db_file.display());

    // Restore the persisted session before anything needs authentication
    let store = AuthStore::open(&config.db_file)?;
    let context = Arc::new(AuthSessionContext::restore(store).await);
    let http = Arc::new(HttpClient::from_config(&config, context.clone())?);
    let flows = AuthFlows::new(http.clone());

    if let Err(e) = run(cli.command, &flows, &http).await {
        if let Some(api_error) = e.downcast_ref::<ApiError>() {
            if api_error.is_session_expired() {
                eprintln!("Your session has expired. Run `gym-session sign-in` again.");
            } else {
                eprintln!("Error: {}", api_error.user_message());
            }
            tracing::debug!(error = %api_error, "Command failed");
            std::process::exit(1);
        }
        return Err(e);
    }

    Ok(())
}

async fn run(command: Command, flows: &AuthFlows, http: &HttpClient) -> Result<()> {
    match command {
        Command::SignIn { email, password } => {
            let password = password_or_prompt(password, "Password")?;
            let user = flows.sign_in(&email, &password).await?;
            println!("Signed in as {} <{}>", user.name, user.email);
        }
        Command::SignUp {
            name,
            email,
            password,
        } => {
            let password = password_or_prompt(password, "Choose a password")?;
            flows.sign_up(&name, &email, &password).await?;
            println!("Account created. Sign in with `gym-session sign-in --email {}`", email);
        }
        Command::SignOut => {
            flows.sign_out().await;
            println!("Signed out");
        }
        Command::Whoami => match flows.context().user() {
            Some(user) => {
                println!("{}", serde_json::to_string_pretty(&user)?);
            }
            None => println!("Not signed in"),
        },
        Command::Get { path } => {
            let body: serde_json::Value = http.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Post { path, json } => {
            let payload: serde_json::Value =
                serde_json::from_str(&json).context("--json is not valid JSON")?;
            let body: serde_json::Value = http.post_json(&path, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::UpdateProfile {
            name,
            password,
            old_password,
        } => {
            let user = flows
                .update_profile(UpdateProfileRequest {
                    name,
                    password,
                    old_password,
                })
                .await?;
            println!("Profile updated: {} <{}>", user.name, user.email);
        }
    }

    Ok(())
}

fn password_or_prompt(password: Option<String>, prompt: &str) -> Result<String> {
    match password {
        Some(password) => Ok(password),
        None => Password::new()
            .with_prompt(prompt)
            .interact()
            .context("Failed to read password"),
    }
}
