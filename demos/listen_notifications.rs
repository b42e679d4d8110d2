use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use splitkit_realtime::realtime::{ChannelOptions, NotificationEvent, RealtimeChannel};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct AppNotification {
    id: String,
    #[serde(default)]
    kind: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let token = "REPLACE_WITH_SESSION_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let channel = RealtimeChannel::new(ChannelOptions::default().with_local_mode(true))?;

        let subscription = channel.subscribe(|event: &NotificationEvent| {
            match event.decode::<AppNotification>() {
                Ok(notification) => println!(
                    "notification id={} kind={}",
                    notification.id,
                    notification.kind.as_deref().unwrap_or("unknown")
                ),
                Err(_) => println!("notification payload={}", event.data()),
            }
        });

        channel.connect(SecretString::new(token))?;

        let mut states = channel.watch_state();
        let listen_for = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(listen_for);
        loop {
            tokio::select! {
                _ = &mut listen_for => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("state={:?}", *states.borrow_and_update());
                }
            }
        }

        subscription.unsubscribe();
        channel.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
