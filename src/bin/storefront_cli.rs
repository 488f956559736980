use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use storefront_api::{
    auth::{AuthConfig, AuthService},
    config::{self, AppConfig},
    db::{self, DbPool},
    events::{self, EventSender},
    handlers::AppServices,
    notifications,
    payments::{PaymentGateway, StripeGateway},
};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "storefront", about = "Storefront operations CLI", version)]
struct Cli {
    #[arg(long, global = true, help = "Print machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Expire returns whose deadline passed without the parcel arriving
    ExpireReturns,
    /// Sign an access token, for support staff and local testing
    IssueToken {
        #[arg(long, help = "Subject (user id) of the token")]
        user_id: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long = "role", help = "Role to grant; repeatable")]
        roles: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&cfg.log_level, cfg.log_json);

    match cli.command {
        Commands::Migrate => {
            let pool = connect(&cfg).await?;
            db::run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            print(cli.json, json!({ "migrated": true }), "Migrations applied");
        }
        Commands::ExpireReturns => {
            let pool = Arc::new(connect(&cfg).await?);
            let (tx, rx) = mpsc::channel(256);
            let sweeper = tokio::spawn(events::process_events(rx));
            let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(
                &cfg.payment.secret_key,
                &cfg.payment.api_base,
            ));
            let services = AppServices::new(
                pool,
                &cfg,
                gateway,
                notifications::mailer_from_config(&cfg.email),
                EventSender::new(tx),
            );
            let expired = services
                .lifecycle
                .expire_overdue_returns(chrono::Utc::now())
                .await
                .context("return expiry sweep failed")?;
            // Dropping the services closes the channel so the event log drains.
            drop(services);
            let _ = sweeper.await;
            print(
                cli.json,
                json!({ "expired": expired }),
                &format!("{expired} return(s) expired"),
            );
        }
        Commands::IssueToken {
            user_id,
            email,
            roles,
        } => {
            let auth = AuthService::new(AuthConfig::from_app_config(&cfg));
            let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
            let token = auth
                .issue_token(&user_id, email.as_deref(), &roles)
                .context("failed to sign token")?;
            print(cli.json, json!({ "token": token }), &token);
        }
    }

    Ok(())
}

async fn connect(cfg: &AppConfig) -> Result<DbPool> {
    db::establish_connection_from_app_config(cfg)
        .await
        .context("failed to connect to the database")
}

fn print(json: bool, value: serde_json::Value, human: &str) {
    if json {
        println!("{value}");
    } else {
        println!("{human}");
    }
}
