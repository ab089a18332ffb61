//! Two local clients exchanging messages through an in-process directory.
//!
//! `averi-demo [--data-dir DIR] [--config FILE]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use averi_client::{
    ChatMessage, Client, ClientConfig, Delivery, EventOutcome, Forward, Payload, ServerEvent,
    StaticDirectory,
};
use averi_store::{timestamp_now, SqliteStore};
use tracing_subscriber::EnvFilter;

struct Args {
    data_dir: PathBuf,
    config: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut data_dir = None;
    let mut config = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => data_dir = args.next().map(PathBuf::from),
            "--config" => config = args.next().map(PathBuf::from),
            _ => {}
        }
    }

    Args {
        data_dir: data_dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("averi-demo-{}", std::process::id()))
        }),
        config,
    }
}

/// Push `forward` through the wire encoding to `to`, as the relay would.
fn relay(from: &Client, to: &Client, forward: &Forward) -> anyhow::Result<Delivery> {
    let wire = forward.to_bytes()?;
    println!(
        "{} -> {}: {} bytes on the wire",
        from.handle(),
        to.handle(),
        wire.len()
    );
    let delivered = Forward::from_bytes(&wire)?.relayed_from(from.handle());
    match to.handle_server_event(&ServerEvent::Forward(delivered))? {
        EventOutcome::Message(delivery) => Ok(delivery),
        EventOutcome::Replenished(_) => anyhow::bail!("expected a message event"),
    }
}

fn open_client(
    args: &Args,
    config: &ClientConfig,
    directory: &Arc<StaticDirectory>,
    handle: &str,
) -> anyhow::Result<Client> {
    let path = args.data_dir.join(format!("{handle}.db"));
    let store = Arc::new(
        SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))?,
    );
    let config = ClientConfig {
        database_path: path,
        ..config.clone()
    };

    if Client::open(store.clone(), Arc::clone(directory), config.clone()).is_ok() {
        anyhow::bail!(
            "{} already holds an identity; pass an empty --data-dir",
            args.data_dir.display()
        );
    }
    let (client, upload) = Client::register(store, Arc::clone(directory), config, handle)?;
    directory.publish(&upload)?;
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args();
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;

    let directory = Arc::new(StaticDirectory::new());
    let alice = open_client(&args, &config, &directory, "alice")?;
    let bob = open_client(&args, &config, &directory, "bob")?;

    let script: [(&Client, &Client, &str); 4] = [
        (&alice, &bob, "hi bob"),
        (&bob, &alice, "hey alice"),
        (&alice, &bob, "new keys on both sides now"),
        (&alice, &bob, "and a second one on the same chain"),
    ];

    for (id, (from, to, text)) in (0u64..).zip(script) {
        let payload = Payload::MsgNew(ChatMessage {
            id,
            text: Some(text.to_string()),
            reply_to: None,
            timestamp: timestamp_now() * 1000,
            attachments: Vec::new(),
        });
        let forward = from
            .send_payload(to.handle(), &payload, std::future::pending())
            .await?;
        let delivery = relay(from, to, &forward)?;
        if let Payload::MsgNew(ChatMessage { text: Some(body), .. }) = &delivery.payload {
            println!("  {} read: {body}", to.handle());
            to.store_local(from.handle(), &delivery.from, body.as_bytes())?;
        }
        from.store_local(to.handle(), from.handle(), text.as_bytes())?;

        if let Some(receipt) = &delivery.receipt {
            let ack = relay(to, from, receipt)?;
            println!("  {} got {:?}", from.handle(), ack.payload);
        }
    }

    println!("alice's local history with bob:");
    for message in alice.load_local("bob")? {
        println!(
            "  [{}] {}: {}",
            message.timestamp,
            message.sender,
            String::from_utf8_lossy(&message.plaintext)
        );
    }
    Ok(())
}
