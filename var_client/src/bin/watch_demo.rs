//! Watch Demo
//!
//! Subscribes to a variable and prints every change until interrupted.
//! Point it at a running server:
//!
//! ```text
//! VARSERVER_PORT=22099 watch_demo /sys/temp
//! ```

use std::net::SocketAddr;

use var_client::VarClient;
use var_protocol::{ChangeRecord, NotifyKind};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/varserver/stats/rps".to_string());
    let host = std::env::var("VARSERVER_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("VARSERVER_PORT").unwrap_or_else(|_| "22099".to_string());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let mut client = VarClient::connect(addr, 4096, 0).await?;
    log::debug!("session {} open to {}", client.id(), addr);

    let handle = client.find(name.as_str()).await?;
    println!("watching {} (handle {})", name, handle.id());

    let mut channel = client.open_notify_channel().await?;
    client.notify(handle, NotifyKind::ModifiedQueue).await?;

    loop {
        let event = channel.recv().await?;
        match serde_json::from_slice::<ChangeRecord>(&event.payload) {
            Ok(change) => println!("{} = {:?}", change.name, change.value),
            Err(_) => println!("{} changed", name),
        }
    }
}
