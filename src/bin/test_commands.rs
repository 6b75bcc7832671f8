//! Test binary to verify the REST endpoints answer with the stored credentials
//! Run with: cargo run --bin test_commands

use adotrack::azure::{AzureClient, WorkItemFilter};
use adotrack::config::Config;
use adotrack::storage::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== adotrack REST Tests ===\n");

    let config = Config::load();
    let Some(data_dir) = config.data_dir() else {
        eprintln!("ERROR: No data directory available");
        std::process::exit(1);
    };
    let store = Store::open(&data_dir);
    let credentials = store.credentials()?;
    if credentials.is_empty() {
        eprintln!("ERROR: No credentials saved. Run: adotrack login <organization> <pat>");
        std::process::exit(1);
    }

    let client = AzureClient::new(&config);
    let credential = &credentials[0];
    println!("Host: {}", config.host);
    println!("Org: {}\n", credential.organization);

    // Test 1: organizations
    println!("--- Test 1: list_organizations ---");
    match client.list_organizations(&credential.credential, None).await {
        Ok(accounts) => println!("✓ Loaded {} organizations", accounts.len()),
        Err(e) => println!("✗ Failed: {e:#}"),
    }

    // Test 2: projects, then work items for the first one
    println!("\n--- Test 2: list_projects ---");
    match client
        .list_projects(&credential.organization, &credential.credential)
        .await
    {
        Ok(projects) => {
            println!("✓ Loaded {} projects", projects.len());
            if let Some(project) = projects.first() {
                println!("  First project: {} ({})", project.name, project.id);

                for filter in [WorkItemFilter::Assigned, WorkItemFilter::Backlog] {
                    println!("\n--- Test 3: list_work_items ({filter:?}) ---");
                    match client
                        .list_work_items(
                            &credential.organization,
                            &project.id,
                            filter,
                            &credential.credential,
                        )
                        .await
                    {
                        Ok(items) => {
                            println!("✓ Loaded {} work items", items.len());
                            for item in items.iter().take(10) {
                                println!(
                                    "  {} #{} {}",
                                    item.type_icon(),
                                    item.id,
                                    truncate(&item.option_label(), 50)
                                );
                            }
                        }
                        Err(e) => println!("✗ Failed: {e:#}"),
                    }
                }
            }
        }
        Err(e) => println!("✗ Failed: {e:#}"),
    }

    println!("\n=== Tests Complete ===");
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 3).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}
