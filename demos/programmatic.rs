use std::sync::Arc;

use tunnelsup::config::{HostConfig, InMemoryConfigStore, RetryPolicy, SshAuth, TunnelConfig};
use tunnelsup::{StatusBroadcaster, Supervisor};

/// Example: build a single tunnel config programmatically, connect it, and
/// issue a manual disconnect after a short delay.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tunnelsup::init_logging("tunnelsup=info")?;

    let config = TunnelConfig {
        name: "example".to_string(),
        source: HostConfig {
            host: "source.example.com".to_string(),
            ssh_port: 22,
            user: "deploy".to_string(),
            auth: SshAuth::PrivateKey { path: "~/.ssh/id_ed25519".to_string(), passphrase: None },
            port: 8080,
        },
        endpoint: HostConfig {
            host: "endpoint.example.com".to_string(),
            ssh_port: 22,
            user: "deploy".to_string(),
            auth: SshAuth::PrivateKey { path: "~/.ssh/id_ed25519".to_string(), passphrase: None },
            port: 9090,
        },
        retry_policy: RetryPolicy { max_retries: 3, retry_interval_ms: 5_000 },
        refresh_interval_ms: 30_000,
    };

    let supervisor = Supervisor::new(Arc::new(InMemoryConfigStore::new()), Arc::new(StatusBroadcaster::new()));

    println!("Connecting {}...", config.name);
    supervisor.connect(config.clone());

    tokio::time::sleep(std::time::Duration::from_secs(10)).await;

    let diag = supervisor.diagnose(&config.name).await;
    println!("diagnostic: {diag:?}");

    println!("Disconnecting...");
    supervisor.disconnect(&config.name);

    Ok(())
}
