use tunnelsup::config::{InMemoryConfigStore, TunnelConfig};
use tunnelsup::{StatusBroadcaster, Supervisor};

/// Example: seed the config store from a JSON file and connect every tunnel
/// in it, printing status transitions as they arrive.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tunnelsup::init_logging("tunnelsup=info")?;

    let configs = TunnelConfig::load_file("tunnels.json")?;
    println!("Loaded {} tunnel config(s)", configs.len());

    let broadcaster = std::sync::Arc::new(StatusBroadcaster::new());
    let mut updates = broadcaster.subscribe();
    let supervisor = Supervisor::new(std::sync::Arc::new(InMemoryConfigStore::new()), broadcaster);

    for config in configs {
        println!("Connecting {}...", config.name);
        supervisor.connect(config);
    }

    println!("Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) => println!("{}: {}", update.name, update.record.status),
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
