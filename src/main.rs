use adotrack::azure::{AzureClient, RestCatalog};
use adotrack::cascade::SelectionCascade;
use adotrack::config::Config;
use adotrack::detector::{parse_work_item_url, Detector, PageSnapshot};
use adotrack::popup::Popup;
use adotrack::reconciler::Outcome;
use adotrack::relay::{Relay, RelayHandle};
use adotrack::storage::{Credential, Store};
use adotrack::timelog::{self, EntryFilter};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "adotrack", version, about = "Log time against the Azure DevOps work item you are looking at")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what a page URL is recognized as
    Detect { url: String },
    /// Save a personal access token for an organization
    Login {
        organization: String,
        pat: String,
        /// Expiry date of the token (YYYY-MM-DD)
        #[arg(long)]
        expires: NaiveDate,
    },
    /// Forget the token for an organization, or all of them
    Logout {
        organization: Option<String>,
        #[arg(long, conflicts_with = "organization")]
        all: bool,
    },
    /// List configured organizations
    Orgs {
        /// Also list organizations the first token can reach
        #[arg(long)]
        remote: bool,
    },
    /// Open a page and auto-select its work item
    Pick {
        url: String,
        /// Title rendered on the page, if any
        #[arg(long)]
        title: Option<String>,
    },
    /// Auto-select the work item for a page and log time against it
    Log {
        url: String,
        #[arg(long, default_value_t = 0)]
        hours: u32,
        #[arg(long, default_value_t = 0)]
        minutes: u32,
        /// Day to log on (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show logged time for a day
    List {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        item: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adotrack=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load();
    let data_dir = config
        .data_dir()
        .context("No data directory available; set settings.data_dir in config.toml")?;
    let store = Arc::new(Store::open(&data_dir));
    tracing::debug!(path = %store.path().display(), "using store");

    match cli.command {
        Command::Detect { url } => match parse_work_item_url(&url, &config.host) {
            Some(found) => println!(
                "Work item {} in {}/{}",
                found.id, found.organization, found.project
            ),
            None => println!("Not an Azure DevOps work item page"),
        },
        Command::Login {
            organization,
            pat,
            expires,
        } => {
            let midnight = expires.and_hms_opt(0, 0, 0).context("Invalid expiry date")?;
            let expires_at = Utc.from_utc_datetime(&midnight);
            if expires_at <= Utc::now() {
                anyhow::bail!("Expiry date {expires} is already past");
            }
            store.save_credential(Credential::new(&organization, &pat, expires_at))?;
            println!("Saved credential for {organization} (expires {expires})");
        }
        Command::Logout { organization, all } => {
            if all {
                store.clear_credentials()?;
                println!("Removed all credentials");
            } else if let Some(organization) = organization {
                if store.remove_credential(&organization)? {
                    println!("Removed credential for {organization}");
                } else {
                    println!("No credential for {organization}");
                }
            } else {
                anyhow::bail!("Name an organization or pass --all");
            }
        }
        Command::Orgs { remote } => {
            let credentials = store.credentials()?;
            if credentials.is_empty() {
                println!("No organizations configured. Run: adotrack login <organization> <pat> --expires <date>");
            }
            let now = Utc::now();
            for credential in &credentials {
                let status = if credential.is_expired_at(now) { "expired" } else { "valid" };
                println!(
                    "{}  ({} until {})",
                    credential.organization,
                    status,
                    credential.expires_at.format("%Y-%m-%d")
                );
            }
            if let (true, Some(credential)) = (remote, credentials.first()) {
                let client = AzureClient::new(&config);
                for account in client.list_organizations(&credential.credential, None).await? {
                    println!("  reachable: {}", account.account_name);
                }
            }
        }
        Command::Pick { url, title } => {
            let (_relay, popup) = open_page(&config, &store, &url, title.as_deref()).await;
            let outcome = popup.open().await;
            report(&popup, &outcome);
        }
        Command::Log {
            url,
            hours,
            minutes,
            date,
        } => {
            let (_relay, popup) = open_page(&config, &store, &url, None).await;
            let outcome = popup.open().await;
            report(&popup, &outcome);
            if !outcome.is_selected() {
                std::process::exit(1);
            }
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let entry = popup.add_entry(date, hours, minutes)?;
            println!(
                "Logged {} on {} to #{} {}",
                timelog::format_time(entry.hours, entry.minutes),
                date,
                entry.work_item.id,
                entry.task
            );
            let logged = popup.entries(date, &popup.selection_filter())?;
            let (hours, minutes) = timelog::daily_total(&logged);
            println!(
                "Total for {} on {date}: {}",
                entry.work_item.project,
                timelog::format_time(hours, minutes)
            );
        }
        Command::List {
            date,
            org,
            project,
            item,
        } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let filter = EntryFilter {
                organization: org,
                project_id: project,
                work_item_id: item,
            };
            let entries = timelog::entries_for_date(&store, date, &filter)?;
            if entries.is_empty() {
                println!("No tasks logged for {date}");
            }
            for entry in &entries {
                println!(
                    "{:>7}  #{} {} ({}/{})",
                    timelog::format_time(entry.hours, entry.minutes),
                    entry.work_item.id,
                    entry.task,
                    entry.work_item.organization,
                    entry.work_item.project
                );
            }
            let (hours, minutes) = timelog::daily_total(&entries);
            println!("Total: {}", timelog::format_time(hours, minutes));
        }
    }

    Ok(())
}

/// Run a page's detector against a fresh relay and open a popup on it.
async fn open_page(config: &Config, store: &Arc<Store>, url: &str, title: Option<&str>) -> (RelayHandle, Popup) {
    let (relay, _relay_task) = Relay::new(&config.host).spawn();

    let page = Arc::new(PageSnapshot::new(url));
    page.set_title(title);
    let mut detector = Detector::new(page, relay.port(), &config.host, config.timing.title_settle());
    detector.evaluate().delivered().await;

    let catalog = RestCatalog::new(AzureClient::new(config), Arc::clone(store));
    let cascade = Arc::new(SelectionCascade::new(Arc::new(catalog)));
    let popup = Popup::new(
        &config.host,
        relay.clone(),
        Arc::clone(store),
        cascade,
        config.timing.load_timeout(),
    );
    (relay, popup)
}

fn report(popup: &Popup, outcome: &Outcome) {
    match popup.status() {
        Some(notice) if popup.status_is_error() => eprintln!("✗ {}", notice.text),
        Some(notice) => println!("✓ {}", notice.text),
        None => println!("Nothing detected; select manually"),
    }
    let state = popup.cascade().snapshot();
    if let Some(organization) = &state.organization {
        println!("  Organization: {organization}");
    }
    if let Some(project) = state.selected_project() {
        println!("  Project:      {} ({})", project.name, project.id);
    }
    if let Some(item) = state.selected_work_item() {
        println!("  Work item:    {} {}", item.type_icon(), item.option_label());
    }
    tracing::debug!(?outcome, "pick finished");
}
