use std::{sync::Arc, time::Duration};

use clap::Parser;
use latch::{
    bus::CrossInstanceBus, provider::HttpIdentityProvider, store::FileSessionStore, Credentials,
    Password, SessionConfig, SessionManager,
};
use latch_reqwest::{auth_error, SameOrigin, SessionMiddleware};
use reqwest_middleware::ClientBuilder;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The identity provider's base URL
    #[arg(short, long, env)]
    identity_url: reqwest::Url,

    /// The API resource to poll with the session's access token
    #[arg(short, long, env)]
    resource_url: reqwest::Url,

    /// The e-mail address to sign in with, if no session is persisted
    #[arg(short, long, env)]
    email: Option<String>,

    /// The password to sign in with
    #[arg(short, long, env, hide_env_values = true)]
    password: Option<Password>,

    /// The local file used to persist the session
    #[arg(short = 'f', long, env, value_name = "FILE", default_value = ".session.json")]
    session_file: std::path::PathBuf,

    /// Seconds between polls of the resource
    #[arg(long, env, default_value_t = 5)]
    interval: u64,

    /// Sign out after this many polls
    #[arg(long, env)]
    polls: Option<usize>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let provider = HttpIdentityProvider::new(reqwest::Client::new(), opts.identity_url);
    let store = FileSessionStore::new(opts.session_file);
    let bus = CrossInstanceBus::new();

    let manager = SessionManager::new(
        SessionConfig::default(),
        Arc::new(provider),
        Arc::new(store),
        &bus,
    );

    let restored = match manager.bootstrap().await {
        Ok(user) => user,
        Err(error) => {
            tracing::warn!(error = %error, "unable to restore persisted session");
            None
        }
    };

    match (restored, opts.email, opts.password) {
        (Some(user), _, _) => tracing::info!(email = %user.email, "restored session"),
        (None, Some(email), Some(password)) => {
            let landing = manager.sign_in(&Credentials::new(email, password)).await?;
            tracing::info!(
                path = manager.config().landing().path(landing),
                "signed in"
            );
        }
        (None, _, _) => {
            color_eyre::eyre::bail!("no persisted session; provide --email and --password")
        }
    }

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(
            SessionMiddleware::new(manager.coordinator().clone())
                .with_predicate(SameOrigin::new(&opts.resource_url)),
        )
        .build();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    let mut polls = 0;
    loop {
        interval.tick().await;

        match client.get(opts.resource_url.clone()).send().await {
            Ok(resp) => {
                tracing::info!(status = resp.status().as_u16(), "polled resource");
            }
            Err(error) => match auth_error(&error) {
                Some(session_error) if session_error.requires_sign_in() => {
                    tracing::error!("session expired, sign in again");
                    break;
                }
                _ => tracing::warn!(error = %error, "unable to poll resource"),
            },
        }

        polls += 1;
        if opts.polls.is_some_and(|max| polls >= max) {
            let landing = manager.sign_out().await?;
            tracing::info!(path = manager.config().landing().path(landing), "signed out");
            break;
        }
    }

    Ok(())
}
