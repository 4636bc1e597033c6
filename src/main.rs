//! referral - operate the referral reward system against a SQLite database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use referral_rewards::ledger::{SqliteRewardAuditLog, SqliteUserDirectory, UserDirectory};
use referral_rewards::model::{GroupId, PageRequest, UserId, DEFAULT_PAGE_SIZE};
use referral_rewards::settings::{SettingsStore, SqliteSettingsStore, KEY_API_BASE_URL};
use referral_rewards::{Database, ReferralService, ReferralSettings, Registration, Scope};

#[derive(Parser, Debug)]
#[command(name = "referral")]
#[command(version, about, long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "REFERRAL_DB", default_value = "referral.db")]
    db: PathBuf,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// User management
    #[command(subcommand)]
    User(UserCommands),

    /// Referral settings
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Record a signup made with a referral code
    Register {
        #[arg(long)]
        code: String,
        #[arg(long)]
        referee: UserId,
    },

    /// Credit a top-up and trigger the referral reward in one transaction
    Topup {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        amount: Decimal,
    },

    /// Trigger the referral reward for a referee
    Trigger {
        #[arg(long)]
        referee: UserId,
    },

    /// Referral code, link and stats for a user
    Info {
        #[arg(long)]
        user: UserId,
    },

    /// A user's referrals, with masked emails
    History {
        #[arg(long)]
        user: UserId,
        #[command(flatten)]
        page: PageArgs,
    },

    /// All referrals
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        page: PageArgs,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// Create a user
    Add { email: String },
    /// Show a user
    Show { id: UserId },
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print the current settings
    Show,
    /// Change some settings; anything not given keeps its value
    Set(SettingsArgs),
}

#[derive(Args, Debug)]
struct SettingsArgs {
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    referrer_balance: Option<Decimal>,
    /// 0 clears the group
    #[arg(long)]
    referrer_group: Option<GroupId>,
    #[arg(long)]
    referrer_days: Option<u32>,
    #[arg(long)]
    referee_balance: Option<Decimal>,
    /// 0 clears the group
    #[arg(long)]
    referee_group: Option<GroupId>,
    #[arg(long)]
    referee_days: Option<u32>,
    /// 0 means unlimited
    #[arg(long)]
    max_per_user: Option<u32>,
    /// Base URL referral links are built on
    #[arg(long)]
    base_url: Option<String>,
}

impl SettingsArgs {
    fn apply(&self, settings: &mut ReferralSettings) {
        let group = |id: GroupId| (id > 0).then_some(id);
        if let Some(v) = self.enabled {
            settings.enabled = v;
        }
        if let Some(v) = self.referrer_balance {
            settings.referrer_balance_reward = v;
        }
        if let Some(v) = self.referrer_group {
            settings.referrer_group_id = group(v);
        }
        if let Some(v) = self.referrer_days {
            settings.referrer_subscription_days = v;
        }
        if let Some(v) = self.referee_balance {
            settings.referee_balance_reward = v;
        }
        if let Some(v) = self.referee_group {
            settings.referee_group_id = group(v);
        }
        if let Some(v) = self.referee_days {
            settings.referee_subscription_days = v;
        }
        if let Some(v) = self.max_per_user {
            settings.max_per_user = v;
        }
    }
}

#[derive(Args, Debug)]
struct PageArgs {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

struct App {
    db: Database,
    users: SqliteUserDirectory,
    settings: SqliteSettingsStore,
    audit: SqliteRewardAuditLog,
    service: ReferralService,
}

impl App {
    fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Ok(Self {
            users: SqliteUserDirectory::new(db.clone()),
            settings: SqliteSettingsStore::new(db.clone()),
            audit: SqliteRewardAuditLog::new(db.clone()),
            service: ReferralService::sqlite(&db),
            db,
        })
    }

    fn base_url(&self) -> Result<String> {
        match self.settings.get_value(&Scope::detached(), KEY_API_BASE_URL) {
            Ok(url) => Ok(url),
            Err(err) if err.is_not_found() => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let app = App::open(&cli.db)?;
    let scope = Scope::detached();

    match cli.command {
        Commands::User(UserCommands::Add { email }) => {
            let user = app
                .users
                .create(&scope, email.trim())
                .with_context(|| format!("failed to create user {email}"))?;
            info!(user_id = user.id, "user created");
            print_json(&user)
        }
        Commands::User(UserCommands::Show { id }) => {
            let user = app.users.get_by_id(&scope, id)?;
            let rewards = app.audit.list_by_beneficiary(&scope, id)?;
            print_json(&json!({ "user": user, "reward_records": rewards }))
        }
        Commands::Settings(SettingsCommands::Show) => {
            let settings = app.service.get_referral_settings(&scope);
            print_json(&json!({ "referral": settings, "api_base_url": app.base_url()? }))
        }
        Commands::Settings(SettingsCommands::Set(args)) => {
            let mut settings = app.service.get_referral_settings(&scope);
            args.apply(&mut settings);
            app.service
                .update_referral_settings(&scope, &settings)
                .context("failed to update referral settings")?;
            if let Some(url) = &args.base_url {
                let values = BTreeMap::from([(KEY_API_BASE_URL.to_string(), url.trim().to_string())]);
                app.settings.set_multiple(&scope, &values)?;
            }
            print_json(&json!({ "referral": settings, "api_base_url": app.base_url()? }))
        }
        Commands::Register { code, referee } => {
            app.users
                .get_by_id(&scope, referee)
                .with_context(|| format!("unknown referee {referee}"))?;
            let output = match app.service.register_referral(&scope, &code, referee) {
                Registration::NoCode => json!({ "recorded": false, "reason": "no referral code" }),
                Registration::Recorded(referral) => json!({ "recorded": true, "referral": referral }),
                Registration::Skipped(err) => json!({ "recorded": false, "reason": err.to_string() }),
            };
            print_json(&output)
        }
        Commands::Topup { user, amount } => {
            if amount <= Decimal::ZERO {
                bail!("top-up amount must be positive");
            }
            let outcome = app.db.run_in_tx(&scope, |tx| {
                app.users.update_balance(tx, user, amount)?;
                Ok(app.service.trigger_referral_reward(tx, user))
            })?;
            info!(user_id = user, amount = %amount, "top-up credited");
            let balance = app.users.get_by_id(&scope, user)?.balance;
            print_json(&json!({ "user_id": user, "balance": balance, "reward": outcome }))
        }
        Commands::Trigger { referee } => {
            print_json(&app.service.trigger_referral_reward(&scope, referee))
        }
        Commands::Info { user } => print_json(&app.service.get_referral_info(&scope, user)?),
        Commands::History { user, page } => {
            print_json(&app.service.get_referral_history(&scope, user, page.request())?)
        }
        Commands::List { page } => print_json(&app.service.get_all_referrals(&scope, page.request())?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    run(cli)
}
